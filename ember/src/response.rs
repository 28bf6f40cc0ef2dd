//! HTTP response assembly: status/header emission into the write buffer and
//! a memory-mapped file body.

use std::path::PathBuf;
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::syscalls;

/// A private read-only mapping of a served file. Dropping the value releases
/// the mapping, so it is released exactly once.
pub struct FileMap {
    ptr: *mut u8,
    len: usize,
}

// The mapping is private, read-only, and owned by one connection at a time.
unsafe impl Send for FileMap {}

impl FileMap {
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for FileMap {
    fn drop(&mut self) {
        syscalls::unmap_file(self.ptr, self.len);
    }
}

fn code_status(code: i32) -> Option<&'static str> {
    match code {
        200 => Some("OK"),
        400 => Some("Bad Request"),
        403 => Some("Forbidden"),
        404 => Some("Not Found"),
        _ => None,
    }
}

fn code_path(code: i32) -> Option<&'static str> {
    match code {
        400 => Some("/400.html"),
        403 => Some("/403.html"),
        404 => Some("/404.html"),
        _ => None,
    }
}

fn suffix_type(path: &str) -> &'static str {
    let suffix = match path.rfind('.') {
        Some(i) => &path[i..],
        None => "",
    };
    match suffix {
        ".html" => "text/html",
        ".xml" => "text/xml",
        ".xhtml" => "application/xhtml+xml",
        ".txt" => "text/plain",
        ".rtf" => "application/rtf",
        ".pdf" => "application/pdf",
        ".word" => "application/nsword",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".au" => "audio/basic",
        ".mpeg" | ".mpg" => "video/mpeg",
        ".avi" => "video/x-msvideo",
        ".gz" => "application/x-gzip",
        ".tar" => "application/x-tar",
        ".css" => "text/css",
        ".js" => "text/javascript",
        _ => "text/plain",
    }
}

pub struct HttpResponse {
    code: i32,
    is_keep_alive: bool,
    path: String,
    src_dir: Arc<str>,
    file: Option<FileMap>,
    file_size: usize,
}

impl HttpResponse {
    pub fn new() -> Self {
        Self {
            code: -1,
            is_keep_alive: false,
            path: String::new(),
            src_dir: Arc::from(""),
            file: None,
            file_size: 0,
        }
    }

    /// Resets the response for a new request. `code < 0` lets the asset
    /// lookup decide.
    pub fn init(&mut self, src_dir: Arc<str>, path: &str, is_keep_alive: bool, code: i32) {
        self.unmap();
        self.code = code;
        self.is_keep_alive = is_keep_alive;
        self.path = path.to_string();
        self.src_dir = src_dir;
        self.file_size = 0;
    }

    pub fn make_response(&mut self, buff: &mut Buffer) {
        match syscalls::stat_path(&self.full_path()) {
            Err(_) => self.code = 404,
            Ok(st) => {
                let fmt = st.st_mode & libc::S_IFMT;
                if fmt != libc::S_IFREG {
                    self.code = 400;
                } else if st.st_mode & libc::S_IROTH == 0 {
                    self.code = 403;
                } else {
                    if self.code < 0 {
                        self.code = 200;
                    }
                    self.file_size = st.st_size as usize;
                }
            }
        }
        self.error_html();
        self.add_state_line(buff);
        self.add_header(buff);
        self.add_content(buff);
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The mapped body, when one exists.
    pub fn file(&self) -> Option<&[u8]> {
        self.file.as_ref().map(FileMap::as_slice)
    }

    pub fn file_len(&self) -> usize {
        self.file.as_ref().map_or(0, FileMap::len)
    }

    /// Releases the mapped region. Safe to call any number of times.
    pub fn unmap(&mut self) {
        self.file = None;
    }

    /// Writes an inline error page, used when the asset cannot be served.
    pub fn error_content(&self, buff: &mut Buffer, message: &str) {
        let status = code_status(self.code).unwrap_or("Bad Request");
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{} : {}\n\
             <p>{}</p><hr><em>Ember Server</em></body></html>",
            self.code, status, message
        );
        buff.append_str(&format!("Content-length: {}\r\n\r\n", body.len()));
        buff.append_str(&body);
    }

    fn full_path(&self) -> PathBuf {
        PathBuf::from(format!("{}{}", self.src_dir, self.path))
    }

    /// Swaps in the canned page for error codes, when the tree carries one.
    fn error_html(&mut self) {
        if let Some(page) = code_path(self.code) {
            self.path = page.to_string();
            self.file_size = match syscalls::stat_path(&self.full_path()) {
                Ok(st) => st.st_size as usize,
                Err(_) => 0,
            };
        }
    }

    fn add_state_line(&mut self, buff: &mut Buffer) {
        let status = match code_status(self.code) {
            Some(s) => s,
            None => {
                self.code = 400;
                "Bad Request"
            }
        };
        buff.append_str(&format!("HTTP/1.1 {} {}\r\n", self.code, status));
    }

    fn add_header(&mut self, buff: &mut Buffer) {
        buff.append_str("Connection: ");
        if self.is_keep_alive {
            buff.append_str("keep-alive\r\n");
            buff.append_str("keep-alive: max=6, timeout=120\r\n");
        } else {
            buff.append_str("close\r\n");
        }
        buff.append_str(&format!("Content-type: {}\r\n", suffix_type(&self.path)));
    }

    fn add_content(&mut self, buff: &mut Buffer) {
        let fd = match syscalls::open_read(&self.full_path()) {
            Ok(fd) => fd,
            Err(_) => {
                self.error_content(buff, "File NotFound!");
                return;
            }
        };
        let mapped = syscalls::map_file(fd, self.file_size);
        syscalls::close_fd(fd);
        match mapped {
            Ok(ptr) => {
                self.file = Some(FileMap {
                    ptr,
                    len: self.file_size,
                });
                buff.append_str(&format!("Content-length: {}\r\n\r\n", self.file_size));
            }
            Err(_) => {
                self.error_content(buff, "File NotFound!");
            }
        }
    }
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn temp_tree(tag: &str) -> PathBuf {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "ember-resp-{}-{}-{}",
            tag,
            std::process::id(),
            seq
        ));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("index.html"), "<html>welcome home</html>").unwrap();
        fs::write(dir.join("404.html"), "<html>lost</html>").unwrap();
        fs::write(dir.join("400.html"), "<html>bad</html>").unwrap();
        fs::write(dir.join("403.html"), "<html>forbidden</html>").unwrap();
        fs::create_dir_all(dir.join("sub")).unwrap();
        dir
    }

    fn src_dir(dir: &Path) -> Arc<str> {
        Arc::from(dir.to_str().unwrap())
    }

    fn build(dir: &Path, path: &str, keep_alive: bool, code: i32) -> (HttpResponse, String) {
        let mut resp = HttpResponse::new();
        resp.init(src_dir(dir), path, keep_alive, code);
        let mut buff = Buffer::new();
        resp.make_response(&mut buff);
        let head = buff.take_string();
        (resp, head)
    }

    #[test]
    fn serves_an_existing_page() {
        let dir = temp_tree("ok");
        let (resp, head) = build(&dir, "/index.html", true, -1);
        assert_eq!(resp.code(), 200);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(head.contains("keep-alive: max=6, timeout=120\r\n"));
        assert!(head.contains("Content-type: text/html\r\n"));
        assert!(head.contains("Content-length: 25\r\n"));
        assert_eq!(resp.file().unwrap(), b"<html>welcome home</html>");
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_file_serves_the_404_page() {
        let dir = temp_tree("missing");
        let (resp, head) = build(&dir, "/missing.jpg", false, -1);
        assert_eq!(resp.code(), 404);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert_eq!(resp.file().unwrap(), b"<html>lost</html>");
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn directory_request_is_bad_request() {
        let dir = temp_tree("dir");
        let (resp, head) = build(&dir, "/sub", false, -1);
        assert_eq!(resp.code(), 400);
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert_eq!(resp.file().unwrap(), b"<html>bad</html>");
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn unreadable_file_is_forbidden() {
        let dir = temp_tree("forbidden");
        let secret = dir.join("secret.html");
        fs::write(&secret, "hidden").unwrap();
        fs::set_permissions(&secret, fs::Permissions::from_mode(0o600)).unwrap();

        let (resp, head) = build(&dir, "/secret.html", false, -1);
        assert_eq!(resp.code(), 403);
        assert!(head.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_error_page_falls_back_to_inline_body() {
        let dir = std::env::temp_dir().join(format!("ember-resp-bare-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let (resp, head) = build(&dir, "/nothing.html", false, -1);
        assert_eq!(resp.code(), 404);
        assert!(head.contains("File NotFound!"));
        assert!(resp.file().is_none());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn mime_types_follow_the_suffix() {
        for (path, mime) in [
            ("/a.html", "text/html"),
            ("/a.css", "text/css"),
            ("/a.js", "text/javascript"),
            ("/a.jpg", "image/jpeg"),
            ("/a.mpg", "video/mpeg"),
            ("/a.unknown", "text/plain"),
            ("/noext", "text/plain"),
        ] {
            assert_eq!(suffix_type(path), mime);
        }
    }

    #[test]
    fn unmap_is_idempotent() {
        let dir = temp_tree("unmap");
        let (mut resp, _head) = build(&dir, "/index.html", false, -1);
        assert!(resp.file().is_some());
        resp.unmap();
        assert!(resp.file().is_none());
        resp.unmap();
        assert_eq!(resp.file_len(), 0);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn explicit_code_wins_over_lookup() {
        let dir = temp_tree("explicit");
        let (resp, head) = build(&dir, "/index.html", false, 400);
        assert_eq!(resp.code(), 400);
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert_eq!(resp.file().unwrap(), b"<html>bad</html>");
        fs::remove_dir_all(&dir).ok();
    }
}
