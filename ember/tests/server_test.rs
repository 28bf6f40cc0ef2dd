//! End-to-end scenarios against a running reactor on loopback sockets.

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use ember::sqlpool::{DbConn, DbPool};
use ember::{EmberResult, ServerConfig, ShutdownHandle, SqlPool, WebServer};

struct MockConn {
    users: Arc<Mutex<HashMap<String, String>>>,
}

fn quoted_values(sql: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut rest = sql;
    while let Some(start) = rest.find('\'') {
        let after = &rest[start + 1..];
        let Some(end) = after.find('\'') else { break };
        values.push(after[..end].replace("''", "'"));
        rest = &after[end + 1..];
    }
    values
}

impl DbConn for MockConn {
    fn query(&mut self, sql: &str) -> EmberResult<Vec<Vec<Option<String>>>> {
        let name = quoted_values(sql).into_iter().next().unwrap_or_default();
        let users = self.users.lock().unwrap();
        Ok(match users.get(&name) {
            Some(pwd) => vec![vec![Some(name), Some(pwd.clone())]],
            None => Vec::new(),
        })
    }

    fn execute(&mut self, sql: &str) -> EmberResult<u64> {
        let mut values = quoted_values(sql).into_iter();
        let name = values.next().unwrap_or_default();
        let pwd = values.next().unwrap_or_default();
        self.users.lock().unwrap().insert(name, pwd);
        Ok(1)
    }
}

fn mock_pool(users: &[(&str, &str)]) -> SqlPool {
    let table: HashMap<String, String> = users
        .iter()
        .map(|(u, p)| (u.to_string(), p.to_string()))
        .collect();
    let table = Arc::new(Mutex::new(table));
    DbPool::init(2, move || {
        Some(Box::new(MockConn {
            users: table.clone(),
        }) as Box<dyn DbConn>)
    })
}

fn temp_tree(tag: &str) -> PathBuf {
    static SEQ: AtomicU32 = AtomicU32::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "ember-e2e-{}-{}-{}",
        tag,
        std::process::id(),
        seq
    ));
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("index.html"), "<html>index page</html>").unwrap();
    fs::write(dir.join("welcome.html"), "<html>welcome page</html>").unwrap();
    fs::write(dir.join("error.html"), "<html>error page</html>").unwrap();
    fs::write(dir.join("404.html"), "<html>not found page</html>").unwrap();
    fs::write(dir.join("400.html"), "<html>bad request page</html>").unwrap();
    dir
}

struct TestServer {
    port: u16,
    handle: ShutdownHandle,
    thread: Option<JoinHandle<()>>,
    dir: PathBuf,
}

impl TestServer {
    fn start(tag: &str, timeout_ms: u64, pool: SqlPool) -> TestServer {
        let dir = temp_tree(tag);
        let config = ServerConfig {
            port: 0,
            trig_mode: 3,
            timeout_ms,
            open_linger: false,
            thread_num: 2,
            src_dir: dir.clone(),
        };
        let mut server = WebServer::new(&config, pool).expect("server init");
        let port = server.port();
        let handle = server.shutdown_handle();
        let thread = std::thread::spawn(move || server.start());
        TestServer {
            port,
            handle,
            thread: Some(thread),
            dir,
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", self.port)).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        fs::remove_dir_all(&self.dir).ok();
    }
}

/// Reads one response off a kept-alive stream: headers, then exactly
/// Content-length body bytes.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(1) => raw.push(byte[0]),
            Ok(_) => break,
            Err(e) => panic!("reading headers: {}", e),
        }
    }
    let head = String::from_utf8_lossy(&raw).into_owned();
    let content_length = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-length: "))
        .map(|v| v.trim().parse::<usize>().unwrap())
        .unwrap_or(0);
    let mut body = vec![0u8; content_length];
    stream.read_exact(&mut body).expect("reading body");
    (head, body)
}

#[test]
fn get_root_serves_index_and_keeps_the_connection() {
    let server = TestServer::start("root", 60_000, SqlPool::empty());
    let mut stream = server.connect();

    stream
        .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Content-type: text/html\r\n"));
    assert!(head.contains("Connection: keep-alive\r\n"));
    assert!(head.contains("keep-alive: max=6, timeout=120\r\n"));
    assert_eq!(body, b"<html>index page</html>");

    // the connection is still usable
    stream
        .write_all(b"GET /index HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"<html>index page</html>");
}

#[test]
fn missing_asset_returns_the_404_page() {
    let server = TestServer::start("missing", 60_000, SqlPool::empty());
    let mut stream = server.connect();

    stream
        .write_all(b"GET /missing.jpg HTTP/1.1\r\n\r\n")
        .unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).unwrap();
    let reply = String::from_utf8_lossy(&reply);
    assert!(reply.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(reply.contains("Connection: close\r\n"));
    assert!(reply.ends_with("<html>not found page</html>"));
}

#[test]
fn malformed_request_line_gets_400_then_close() {
    let server = TestServer::start("badreq", 60_000, SqlPool::empty());
    let mut stream = server.connect();

    stream.write_all(b"GET HTTP/1.1\r\n\r\n").unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).unwrap();
    let reply = String::from_utf8_lossy(&reply);
    assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(reply.ends_with("<html>bad request page</html>"));

    // server closed the connection after the write
    let mut probe = [0u8; 1];
    assert_eq!(stream.read(&mut probe).unwrap(), 0);
}

#[test]
fn login_with_matching_row_serves_welcome() {
    let server = TestServer::start("login-ok", 60_000, mock_pool(&[("alice", "secret")]));
    let mut stream = server.connect();

    let body = "username=alice&password=secret";
    let request = format!(
        "POST /login.html HTTP/1.1\r\n\
         Content-Type: application/x-www-form-urlencoded\r\n\
         Connection: keep-alive\r\n\
         Content-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"<html>welcome page</html>");
}

#[test]
fn login_without_matching_row_serves_error() {
    let server = TestServer::start("login-bad", 60_000, mock_pool(&[("alice", "secret")]));
    let mut stream = server.connect();

    let body = "username=mallory&password=guess";
    let request = format!(
        "POST /login.html HTTP/1.1\r\n\
         Content-Type: application/x-www-form-urlencoded\r\n\
         Connection: keep-alive\r\n\
         Content-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"<html>error page</html>");
}

#[test]
fn registration_then_login_round_trip() {
    let server = TestServer::start("register", 60_000, mock_pool(&[]));

    let mut stream = server.connect();
    let body = "username=bob&password=pw";
    let request = format!(
        "POST /register.html HTTP/1.1\r\n\
         Content-Type: application/x-www-form-urlencoded\r\n\
         Connection: keep-alive\r\n\
         Content-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).unwrap();
    let (_, reply) = read_response(&mut stream);
    assert_eq!(reply, b"<html>welcome page</html>");

    let mut stream = server.connect();
    let request = format!(
        "POST /login.html HTTP/1.1\r\n\
         Content-Type: application/x-www-form-urlencoded\r\n\
         Connection: keep-alive\r\n\
         Content-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).unwrap();
    let (_, reply) = read_response(&mut stream);
    assert_eq!(reply, b"<html>welcome page</html>");
}

#[test]
fn idle_connection_is_expired_by_the_timer() {
    let server = TestServer::start("timeout", 200, SqlPool::empty());
    let mut stream = server.connect();

    // stay silent past the deadline; the server should close on us
    let mut probe = [0u8; 1];
    match stream.read(&mut probe) {
        Ok(0) => {}
        Ok(n) => panic!("unexpected {} byte(s) from an idle server", n),
        Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
            panic!("connection was not expired")
        }
        Err(e) => panic!("read failed: {}", e),
    }
}

#[test]
fn request_split_across_many_segments_still_parses() {
    let server = TestServer::start("split", 60_000, SqlPool::empty());
    let mut stream = server.connect();

    let raw = b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n";
    for chunk in raw.chunks(5) {
        stream.write_all(chunk).unwrap();
        stream.flush().unwrap();
        std::thread::sleep(Duration::from_millis(10));
    }
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"<html>index page</html>");
}
