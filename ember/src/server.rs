//! The reactor: accept loop, event dispatch, timer ticks, and delegation of
//! per-connection work to the worker pool.
//!
//! Poller registration uses ONESHOT, so at most one job is in flight per
//! connection; the job re-arms interest itself when it finishes. Timer
//! deadlines are extended on the reactor thread only, before submission, so
//! the timer lock and a connection lock never nest in opposite orders.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use crate::config::ServerConfig;
use crate::conn::HttpConn;
use crate::epoll::{
    EpollEvent, Epoller, EV_ERR, EV_ET, EV_HUP, EV_ONESHOT, EV_RDHUP, EV_READ, EV_WRITE,
};
use crate::error::{EmberError, EmberResult};
use crate::metrics::ServerMetrics;
use crate::sqlpool::SqlPool;
use crate::syscalls;
use crate::timer::HeapTimer;
use crate::worker::WorkerPool;

const MAX_FD: i64 = 65536;
const MAX_EVENTS: usize = 1024;

/// What a worker job needs to finish a connection's read/write leg.
struct Ctx {
    epoller: Arc<Epoller>,
    sql_pool: Arc<SqlPool>,
    conn_event: u32,
}

impl Ctx {
    fn rearm(&self, fd: RawFd, mask: u32) {
        if let Err(e) = self.epoller.modify(fd, mask | self.conn_event) {
            log::debug!("re-arm of fd {} failed: {}", fd, e);
        }
    }
}

/// Wakes the reactor out of `epoll_wait` and stops it. Cloneable and safe to
/// trigger from signal handlers and other threads.
#[derive(Clone)]
pub struct ShutdownHandle {
    fd: RawFd,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = syscalls::write_fd(self.fd, &[1]);
    }
}

pub struct WebServer {
    port: u16,
    timeout_ms: u64,
    is_close: bool,
    listen_fd: RawFd,
    listen_event: u32,
    conn_event: u32,
    src_dir: Arc<str>,
    timer: Mutex<HeapTimer>,
    workers: Option<WorkerPool>,
    epoller: Arc<Epoller>,
    users: HashMap<RawFd, Arc<Mutex<HttpConn>>>,
    sql_pool: Arc<SqlPool>,
    metrics: Arc<ServerMetrics>,
    ctx: Arc<Ctx>,
    shutdown_rd: RawFd,
    shutdown_wr: RawFd,
}

impl WebServer {
    pub fn new(config: &ServerConfig, sql_pool: SqlPool) -> EmberResult<WebServer> {
        let src_dir = config
            .src_dir
            .canonicalize()
            .map_err(|e| EmberError::Init(format!("asset root {:?}: {}", config.src_dir, e)))?;
        let src_dir: Arc<str> = Arc::from(
            src_dir
                .to_str()
                .ok_or_else(|| EmberError::Init("asset root is not valid UTF-8".into()))?,
        );

        let (listen_event, conn_event) = trig_mode_events(config.trig_mode);

        syscalls::ignore_sigpipe();

        let listen_fd = syscalls::create_listen_socket(config.port, config.open_linger)
            .map_err(|e| EmberError::Init(format!("bind port {}: {}", config.port, e)))?;
        syscalls::set_nonblocking(listen_fd)?;
        let port = syscalls::local_port(listen_fd)?;

        let epoller = Arc::new(Epoller::new()?);
        epoller.add(listen_fd, EV_READ | listen_event)?;

        let (shutdown_rd, shutdown_wr) = syscalls::create_pipe()?;
        epoller.add(shutdown_rd, EV_READ)?;

        let sql_pool = Arc::new(sql_pool);
        let ctx = Arc::new(Ctx {
            epoller: epoller.clone(),
            sql_pool: sql_pool.clone(),
            conn_event,
        });

        let server = WebServer {
            port,
            timeout_ms: config.timeout_ms,
            is_close: false,
            listen_fd,
            listen_event,
            conn_event,
            src_dir,
            timer: Mutex::new(HeapTimer::new()),
            workers: Some(WorkerPool::new(config.thread_num)),
            epoller,
            users: HashMap::new(),
            sql_pool,
            metrics: Arc::new(ServerMetrics::new()),
            ctx,
            shutdown_rd,
            shutdown_wr,
        };

        log::info!("========== server init ==========");
        log::info!(
            "port: {}, linger: {}, listen ET: {}, conn ET: {}",
            port,
            config.open_linger,
            listen_event & EV_ET != 0,
            conn_event & EV_ET != 0
        );
        log::info!(
            "asset root: {}, db pool: {}, workers: {}",
            server.src_dir,
            server.sql_pool.size(),
            server.workers.as_ref().map_or(0, WorkerPool::thread_count)
        );

        Ok(server)
    }

    /// The bound port (useful when configured with port 0).
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            fd: self.shutdown_wr,
        }
    }

    /// Runs the reactor until a shutdown byte arrives.
    pub fn start(&mut self) {
        let mut events = vec![EpollEvent::zeroed(); MAX_EVENTS];
        log::info!("server listening on port {}", self.port);

        while !self.is_close {
            let timeout = if self.timeout_ms > 0 {
                clip_timeout(self.timer.lock().unwrap().next_tick_ms())
            } else {
                -1
            };

            let n = match self.epoller.wait(&mut events, timeout) {
                Ok(n) => n,
                Err(e) => {
                    log::error!("poll wait failed: {}", e);
                    break;
                }
            };

            for ev in &events[..n] {
                let fd = ev.fd();
                let mask = ev.mask();
                if fd == self.listen_fd {
                    self.deal_listen();
                } else if fd == self.shutdown_rd {
                    self.drain_shutdown();
                } else if mask & (EV_RDHUP | EV_HUP | EV_ERR) != 0 {
                    self.close_conn(fd);
                } else if mask & EV_READ != 0 {
                    self.deal_read(fd);
                } else if mask & EV_WRITE != 0 {
                    self.deal_write(fd);
                } else {
                    log::error!("unexpected event {:#x} on fd {}", mask, fd);
                }
            }

            if self.timeout_ms > 0 {
                self.timer.lock().unwrap().tick();
            }
        }

        self.teardown();
    }

    fn deal_listen(&mut self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, addr))) => {
                    if self.metrics.active_conns() >= MAX_FD {
                        self.send_error(fd, "Server busy!");
                        log::warn!("clients are full");
                        return;
                    }
                    self.add_client(fd, addr);
                }
                Ok(None) => return,
                Err(e) => {
                    log::error!("accept failed: {}", e);
                    return;
                }
            }
            if self.listen_event & EV_ET == 0 {
                return;
            }
        }
    }

    fn add_client(&mut self, fd: RawFd, addr: SocketAddr) {
        if let Err(e) = syscalls::set_nonblocking(fd) {
            log::error!("set nonblocking on fd {} failed: {}", fd, e);
            syscalls::close_fd(fd);
            return;
        }

        let conn = Arc::new(Mutex::new(HttpConn::new(
            fd,
            addr,
            self.conn_event & EV_ET != 0,
            self.src_dir.clone(),
            self.metrics.clone(),
        )));
        self.users.insert(fd, conn.clone());

        if self.timeout_ms > 0 {
            let epoller = self.epoller.clone();
            let timer_conn = conn.clone();
            self.timer.lock().unwrap().add(
                fd,
                self.timeout_ms,
                Box::new(move || {
                    let _ = epoller.remove(fd);
                    timer_conn.lock().unwrap().close();
                }),
            );
        }

        if let Err(e) = self.epoller.add(fd, EV_READ | self.conn_event) {
            log::error!("register fd {} failed: {}", fd, e);
            conn.lock().unwrap().close();
        }
    }

    fn send_error(&self, fd: RawFd, info: &str) {
        if syscalls::write_fd(fd, info.as_bytes()).is_err() {
            log::warn!("error reply to fd {} failed", fd);
        }
        syscalls::close_fd(fd);
    }

    fn extend_time(&self, fd: RawFd) {
        if self.timeout_ms > 0 {
            self.timer.lock().unwrap().adjust(fd, self.timeout_ms);
        }
    }

    fn deal_read(&mut self, fd: RawFd) {
        let Some(conn) = self.users.get(&fd).cloned() else {
            return;
        };
        self.extend_time(fd);
        let ctx = self.ctx.clone();
        if let Some(workers) = &self.workers {
            workers.submit(move || Self::on_read(&ctx, &conn));
        }
    }

    fn deal_write(&mut self, fd: RawFd) {
        let Some(conn) = self.users.get(&fd).cloned() else {
            return;
        };
        self.extend_time(fd);
        let ctx = self.ctx.clone();
        if let Some(workers) = &self.workers {
            workers.submit(move || Self::on_write(&ctx, &conn));
        }
    }

    fn on_read(ctx: &Ctx, conn: &Mutex<HttpConn>) {
        let mut conn = conn.lock().unwrap();
        match conn.read() {
            Ok(0) => {
                Self::close_locked(ctx, &mut conn);
                return;
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                log::debug!("read on fd {} failed: {}", conn.fd(), e);
                Self::close_locked(ctx, &mut conn);
                return;
            }
        }
        Self::on_process(ctx, &mut conn);
    }

    fn on_process(ctx: &Ctx, conn: &mut HttpConn) {
        if conn.process(&ctx.sql_pool) {
            ctx.rearm(conn.fd(), EV_WRITE);
        } else {
            ctx.rearm(conn.fd(), EV_READ);
        }
    }

    fn on_write(ctx: &Ctx, conn: &Mutex<HttpConn>) {
        let mut conn = conn.lock().unwrap();
        match conn.write() {
            Ok(_) => {
                if conn.to_write_bytes() == 0 && conn.is_keep_alive() {
                    conn.restart();
                    Self::on_process(ctx, &mut conn);
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                ctx.rearm(conn.fd(), EV_WRITE);
                return;
            }
            Err(e) => {
                log::debug!("write on fd {} failed: {}", conn.fd(), e);
            }
        }
        Self::close_locked(ctx, &mut conn);
    }

    fn close_locked(ctx: &Ctx, conn: &mut HttpConn) {
        let _ = ctx.epoller.remove(conn.fd());
        conn.close();
    }

    fn close_conn(&mut self, fd: RawFd) {
        if let Some(conn) = self.users.get(&fd).cloned() {
            let _ = self.epoller.remove(fd);
            conn.lock().unwrap().close();
        }
    }

    fn drain_shutdown(&mut self) {
        let mut sink = [0u8; 16];
        let mut empty: [u8; 0] = [];
        while matches!(syscalls::readv2(self.shutdown_rd, &mut sink, &mut empty), Ok(n) if n > 0) {}
        self.is_close = true;
    }

    fn teardown(&mut self) {
        log::info!(
            "server stopping: {} request(s) served, {} bytes sent",
            self.metrics.total_requests(),
            self.metrics.bytes_sent()
        );
        syscalls::close_fd(self.listen_fd);

        // Join the workers before tearing down connections so no job races a
        // close below.
        self.workers.take();

        self.timer.lock().unwrap().clear();
        for conn in self.users.values() {
            let conn = conn.clone();
            let mut conn = conn.lock().unwrap();
            if !conn.is_closed() {
                let _ = self.epoller.remove(conn.fd());
                conn.close();
            }
        }
        self.users.clear();

        self.sql_pool.close_all();
        syscalls::close_fd(self.shutdown_rd);
        syscalls::close_fd(self.shutdown_wr);
        log::info!("server stopped");
    }
}

/// Bit 0 selects edge-triggered connections, bit 1 an edge-triggered
/// listener. Every connection also carries ONESHOT and peer-HUP detection.
fn trig_mode_events(trig_mode: u8) -> (u32, u32) {
    let mut listen_event = EV_RDHUP;
    let mut conn_event = EV_ONESHOT | EV_RDHUP;
    if trig_mode & 0b01 != 0 {
        conn_event |= EV_ET;
    }
    if trig_mode & 0b10 != 0 {
        listen_event |= EV_ET;
    }
    (listen_event, conn_event)
}

fn clip_timeout(next_ms: i64) -> i32 {
    if next_ms < 0 {
        -1
    } else {
        next_ms.min(i32::MAX as i64) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trig_mode_bitmask_controls_edge_triggering() {
        let (l0, c0) = trig_mode_events(0);
        assert_eq!(l0 & EV_ET, 0);
        assert_eq!(c0 & EV_ET, 0);

        let (l1, c1) = trig_mode_events(1);
        assert_eq!(l1 & EV_ET, 0);
        assert_ne!(c1 & EV_ET, 0);

        let (l2, c2) = trig_mode_events(2);
        assert_ne!(l2 & EV_ET, 0);
        assert_eq!(c2 & EV_ET, 0);

        let (l3, c3) = trig_mode_events(3);
        assert_ne!(l3 & EV_ET, 0);
        assert_ne!(c3 & EV_ET, 0);

        assert_ne!(c3 & EV_ONESHOT, 0);
        assert_ne!(c3 & EV_RDHUP, 0);
    }

    #[test]
    fn timeout_clipping() {
        assert_eq!(clip_timeout(-1), -1);
        assert_eq!(clip_timeout(0), 0);
        assert_eq!(clip_timeout(250), 250);
        assert_eq!(clip_timeout(i64::MAX), i32::MAX);
    }
}
