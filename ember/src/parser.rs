//! Incremental HTTP/1.1 request parser.
//!
//! The state machine consumes CRLF-terminated lines from the connection's
//! read buffer and survives partial input: `Incomplete` leaves all state in
//! place for the next readable event, `BadRequest` is terminal.

use std::collections::HashMap;

use crate::buffer::Buffer;
use crate::sqlpool::SqlPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// More bytes are needed; parser state is retained.
    Incomplete,
    /// The request line or a header is malformed.
    BadRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    RequestLine,
    Headers,
    Body,
    Finish,
}

/// Pages reachable without an extension; `/login` becomes `/login.html`.
const DEFAULT_HTML: [&str; 6] = [
    "/index",
    "/register",
    "/login",
    "/welcome",
    "/video",
    "/picture",
];

/// Form targets wired to account verification.
fn html_tag(path: &str) -> Option<u8> {
    match path {
        "/register.html" => Some(0),
        "/login.html" => Some(1),
        _ => None,
    }
}

pub struct HttpRequest {
    state: ParseState,
    method: String,
    path: String,
    version: String,
    headers: HashMap<String, String>,
    body: String,
    post: HashMap<String, String>,
}

impl HttpRequest {
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            method: String::new(),
            path: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            body: String::new(),
            post: HashMap::new(),
        }
    }

    /// Resets for the next request on a kept-alive connection.
    pub fn init(&mut self) {
        self.state = ParseState::RequestLine;
        self.method.clear();
        self.path.clear();
        self.version.clear();
        self.headers.clear();
        self.body.clear();
        self.post.clear();
    }

    /// Drives the state machine over whatever `buff` holds. `Ok(())` means a
    /// complete request was parsed (and, for form posts, verified).
    pub fn parse(&mut self, buff: &mut Buffer, pool: &SqlPool) -> Result<(), ParseError> {
        loop {
            match self.state {
                ParseState::RequestLine | ParseState::Headers => {
                    let Some(line_len) = find_crlf(buff.peek()) else {
                        return Err(ParseError::Incomplete);
                    };
                    let line = String::from_utf8_lossy(&buff.peek()[..line_len]).into_owned();
                    buff.retrieve(line_len + 2);

                    if self.state == ParseState::RequestLine {
                        self.parse_request_line(&line)?;
                        self.parse_path();
                        self.state = ParseState::Headers;
                    } else if line.is_empty() {
                        self.state = if self.method == "POST" {
                            ParseState::Body
                        } else {
                            ParseState::Finish
                        };
                    } else {
                        self.parse_header(&line)?;
                    }
                }
                ParseState::Body => {
                    if buff.readable() == 0 {
                        return Err(ParseError::Incomplete);
                    }
                    // Everything buffered is taken as the body; Content-Length
                    // is not consulted.
                    self.body = buff.take_string();
                    self.parse_post(pool);
                    self.state = ParseState::Finish;
                }
                ParseState::Finish => return Ok(()),
            }
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn post(&self, key: &str) -> Option<&str> {
        self.post.get(key).map(String::as_str)
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn is_keep_alive(&self) -> bool {
        self.version == "1.1" && self.header("Connection") == Some("keep-alive")
    }

    fn parse_request_line(&mut self, line: &str) -> Result<(), ParseError> {
        let mut parts = line.split(' ');
        let method = parts.next().unwrap_or("");
        let path = parts.next().unwrap_or("");
        let proto = parts.next().unwrap_or("");
        if method.is_empty() || path.is_empty() || parts.next().is_some() {
            return Err(ParseError::BadRequest);
        }
        let Some(version) = proto.strip_prefix("HTTP/") else {
            return Err(ParseError::BadRequest);
        };
        if version.is_empty() {
            return Err(ParseError::BadRequest);
        }
        self.method = method.to_string();
        self.path = path.to_string();
        self.version = version.to_string();
        Ok(())
    }

    fn parse_path(&mut self) {
        if self.path == "/" {
            self.path = "/index.html".to_string();
        } else if DEFAULT_HTML.contains(&self.path.as_str()) {
            self.path.push_str(".html");
        }
    }

    fn parse_header(&mut self, line: &str) -> Result<(), ParseError> {
        let Some((key, value)) = line.split_once(':') else {
            return Err(ParseError::BadRequest);
        };
        if key.is_empty() {
            return Err(ParseError::BadRequest);
        }
        let value = value.strip_prefix(' ').unwrap_or(value);
        self.headers.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn parse_post(&mut self, pool: &SqlPool) {
        if self.method != "POST"
            || self.header("Content-Type") != Some("application/x-www-form-urlencoded")
        {
            return;
        }
        self.parse_from_urlencoded();

        if let Some(tag) = html_tag(&self.path) {
            let is_login = tag == 1;
            let username = self.post("username").unwrap_or("").to_string();
            let password = self.post("password").unwrap_or("").to_string();
            if user_verify(pool, &username, &password, is_login) {
                self.path = "/welcome.html".to_string();
            } else {
                self.path = "/error.html".to_string();
            }
        }
    }

    fn parse_from_urlencoded(&mut self) {
        if self.body.is_empty() {
            return;
        }
        for pair in self.body.clone().split('&') {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            self.post.insert(decode_url(key), decode_url(value));
        }
    }
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte offset of the first CRLF in `data`, if any.
fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

/// Decodes one `application/x-www-form-urlencoded` component:
/// `+` is a space, `%XX` the byte with hex value XX.
pub fn decode_url(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => match hex_pair(bytes.get(i + 1).copied(), bytes.get(i + 2).copied()) {
                Some(b) => {
                    out.push(b);
                    i += 3;
                }
                None => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_pair(hi: Option<u8>, lo: Option<u8>) -> Option<u8> {
    let hi = (hi? as char).to_digit(16)?;
    let lo = (lo? as char).to_digit(16)?;
    Some((hi * 16 + lo) as u8)
}

fn escape_sql(value: &str) -> String {
    value.replace('\'', "''")
}

/// Looks the user up and, for registration, claims a free username. The pool
/// guard releases the handle on every path; an empty handle fails closed.
pub fn user_verify(pool: &SqlPool, name: &str, pwd: &str, is_login: bool) -> bool {
    if name.is_empty() || pwd.is_empty() {
        return false;
    }
    let mut guard = pool.acquire();
    let Some(conn) = guard.get() else {
        log::error!("user verify for '{}': no database handle available", name);
        return false;
    };

    let sql = format!(
        "SELECT username,password FROM user WHERE username='{}' LIMIT 1",
        escape_sql(name)
    );
    let rows = match conn.query(&sql) {
        Ok(rows) => rows,
        Err(e) => {
            log::error!("user lookup failed: {}", e);
            return false;
        }
    };

    if is_login {
        match rows.first() {
            Some(row) => row.get(1).and_then(|v| v.as_deref()) == Some(pwd),
            None => false,
        }
    } else if rows.is_empty() {
        let sql = format!(
            "INSERT INTO user(username,password) VALUES('{}','{}')",
            escape_sql(name),
            escape_sql(pwd)
        );
        match conn.execute(&sql) {
            Ok(_) => true,
            Err(e) => {
                log::error!("user insert failed: {}", e);
                false
            }
        }
    } else {
        false
    }
}
