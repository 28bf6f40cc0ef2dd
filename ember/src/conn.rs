//! Per-connection state: read/write buffers, parser and response, and the
//! gather-write drain that ships headers and the mapped file together.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::metrics::ServerMetrics;
use crate::parser::{HttpRequest, ParseError};
use crate::response::HttpResponse;
use crate::sqlpool::SqlPool;
use crate::syscalls;

/// Under level-triggered mode a write pass normally stops after one syscall;
/// above this backlog it keeps going to spare round trips through the poller.
const LOOP_WRITE_THRESHOLD: usize = 10240;

pub struct HttpConn {
    fd: RawFd,
    addr: SocketAddr,
    is_close: bool,
    is_et: bool,
    src_dir: Arc<str>,
    metrics: Arc<ServerMetrics>,
    read_buf: Buffer,
    write_buf: Buffer,
    file_sent: usize,
    request: HttpRequest,
    response: HttpResponse,
}

impl HttpConn {
    pub fn new(
        fd: RawFd,
        addr: SocketAddr,
        is_et: bool,
        src_dir: Arc<str>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        let count = metrics.inc_conn();
        log::info!("client[{}]({}) in, user count: {}", fd, addr, count);
        Self {
            fd,
            addr,
            is_close: false,
            is_et,
            src_dir,
            metrics,
            read_buf: Buffer::new(),
            write_buf: Buffer::new(),
            file_sent: 0,
            request: HttpRequest::new(),
            response: HttpResponse::new(),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_keep_alive(&self) -> bool {
        self.request.is_keep_alive()
    }

    pub fn to_write_bytes(&self) -> usize {
        self.write_buf.readable() + self.response.file_len().saturating_sub(self.file_sent)
    }

    /// Pulls whatever the socket holds into the read buffer: once under
    /// level-triggered mode, until EOF or `WouldBlock` under edge-triggered.
    /// `Ok(0)` means the peer closed.
    pub fn read(&mut self) -> io::Result<usize> {
        loop {
            let n = self.read_buf.read_fd(self.fd)?;
            if n == 0 || !self.is_et {
                return Ok(n);
            }
        }
    }

    /// Gather-writes the response head and the mapped file. The loop runs to
    /// completion under edge-triggered mode and keeps going under LT while a
    /// large backlog remains.
    pub fn write(&mut self) -> io::Result<usize> {
        let mut sent;
        loop {
            let head_len = self.write_buf.readable();
            let file = self.response.file().unwrap_or(&[]);
            let file_rest = &file[self.file_sent.min(file.len())..];
            sent = syscalls::writev2(self.fd, self.write_buf.peek(), file_rest)?;
            self.metrics.add_bytes(sent as u64);

            if sent > head_len {
                self.file_sent += sent - head_len;
                if head_len > 0 {
                    self.write_buf.retrieve_all();
                }
            } else {
                self.write_buf.retrieve(sent);
            }

            let remaining = self.to_write_bytes();
            if remaining == 0 {
                break;
            }
            if !self.is_et && remaining <= LOOP_WRITE_THRESHOLD {
                break;
            }
        }
        Ok(sent)
    }

    /// Runs the parser over buffered bytes and, when a request is complete
    /// (or malformed), builds the response. `false` means more data is
    /// needed first.
    pub fn process(&mut self, pool: &SqlPool) -> bool {
        if self.read_buf.readable() == 0 {
            return false;
        }
        match self.request.parse(&mut self.read_buf, pool) {
            Ok(()) => {
                log::debug!("request for {}", self.request.path());
                let keep_alive = self.request.is_keep_alive();
                self.response
                    .init(self.src_dir.clone(), self.request.path(), keep_alive, 200);
                self.metrics.inc_request();
            }
            Err(ParseError::Incomplete) => return false,
            Err(ParseError::BadRequest) => {
                self.response
                    .init(self.src_dir.clone(), self.request.path(), false, 400);
            }
        }

        self.write_buf.retrieve_all();
        self.response.make_response(&mut self.write_buf);
        self.file_sent = 0;
        true
    }

    /// Readies the parser for the next request on a kept-alive connection.
    pub fn restart(&mut self) {
        self.request.init();
    }

    /// Idempotent teardown: release the mapping, close the fd, drop the
    /// connection from the live count.
    pub fn close(&mut self) {
        self.response.unmap();
        if !self.is_close {
            self.is_close = true;
            syscalls::close_fd(self.fd);
            let count = self.metrics.dec_conn();
            log::info!("client[{}]({}) quit, user count: {}", self.fd, self.addr, count);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.is_close
    }
}

impl Drop for HttpConn {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::ErrorKind;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::path::PathBuf;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        syscalls::set_nonblocking(fds[0]).unwrap();
        syscalls::set_nonblocking(fds[1]).unwrap();
        (fds[0], fds[1])
    }

    fn peer_addr() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 40000))
    }

    fn temp_tree() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "ember-conn-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("index.html"), "<html>conn test body</html>").unwrap();
        dir
    }

    fn drain_peer(fd: RawFd) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match syscalls::readv2(fd, &mut chunk, &mut []) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => panic!("peer read failed: {}", e),
            }
        }
        out
    }

    #[test]
    fn serves_a_request_end_to_end_over_a_socketpair() {
        let dir = temp_tree();
        let pool = SqlPool::empty();
        let metrics = Arc::new(ServerMetrics::new());
        let (server_fd, client_fd) = socketpair();

        let mut conn = HttpConn::new(
            server_fd,
            peer_addr(),
            true,
            Arc::from(dir.to_str().unwrap()),
            metrics.clone(),
        );
        assert_eq!(metrics.active_conns(), 1);

        let request = b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n";
        assert_eq!(syscalls::write_fd(client_fd, request).unwrap(), request.len());

        match conn.read() {
            Ok(n) => assert!(n > 0),
            Err(e) => assert_eq!(e.kind(), ErrorKind::WouldBlock),
        }
        assert!(conn.process(&pool));
        assert!(conn.to_write_bytes() > 0);
        assert!(conn.is_keep_alive());

        conn.write().unwrap();
        assert_eq!(conn.to_write_bytes(), 0);

        let reply = drain_peer(client_fd);
        let reply = String::from_utf8_lossy(&reply);
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(reply.contains("Content-type: text/html\r\n"));
        assert!(reply.ends_with("<html>conn test body</html>"));

        conn.close();
        assert_eq!(metrics.active_conns(), 0);
        conn.close();
        assert_eq!(metrics.active_conns(), 0);

        syscalls::close_fd(client_fd);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn process_without_data_reports_nothing_to_do() {
        let dir = temp_tree();
        let pool = SqlPool::empty();
        let metrics = Arc::new(ServerMetrics::new());
        let (server_fd, client_fd) = socketpair();

        let mut conn = HttpConn::new(
            server_fd,
            peer_addr(),
            true,
            Arc::from(dir.to_str().unwrap()),
            metrics,
        );
        assert!(!conn.process(&pool));

        conn.close();
        syscalls::close_fd(client_fd);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn malformed_request_builds_a_400_response() {
        let dir = temp_tree();
        let pool = SqlPool::empty();
        let metrics = Arc::new(ServerMetrics::new());
        let (server_fd, client_fd) = socketpair();

        let mut conn = HttpConn::new(
            server_fd,
            peer_addr(),
            true,
            Arc::from(dir.to_str().unwrap()),
            metrics,
        );

        let request = b"GET HTTP/1.1\r\n\r\n";
        syscalls::write_fd(client_fd, request).unwrap();
        let _ = conn.read();
        assert!(conn.process(&pool));
        assert!(!conn.is_keep_alive());

        conn.write().unwrap();
        let reply = drain_peer(client_fd);
        assert!(reply.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));

        conn.close();
        syscalls::close_fd(client_fd);
        fs::remove_dir_all(&dir).ok();
    }
}
