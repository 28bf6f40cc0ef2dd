use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Shared server counters. The live-connection count gates `accept` against
/// the descriptor budget; the rest feed the shutdown summary.
#[derive(Default)]
pub struct ServerMetrics {
    active_conns: AtomicI64,
    total_requests: AtomicU64,
    bytes_sent: AtomicU64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_conn(&self) -> i64 {
        self.active_conns.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn dec_conn(&self) -> i64 {
        self.active_conns.fetch_sub(1, Ordering::Relaxed) - 1
    }

    pub fn active_conns(&self) -> i64 {
        self.active_conns.load(Ordering::Relaxed)
    }

    pub fn inc_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}
