use std::path::PathBuf;

/// Reactor configuration. The CLI layer in `main.rs` fills this in; tests
/// build it directly.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Bit 0 puts connection sockets in edge-triggered mode, bit 1 the
    /// listener.
    pub trig_mode: u8,
    /// Idle-connection deadline in milliseconds; 0 disables expiry.
    pub timeout_ms: u64,
    /// Lingering close on the listener.
    pub open_linger: bool,
    /// Worker threads; 0 means one per core.
    pub thread_num: usize,
    /// Static asset root.
    pub src_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 1316,
            trig_mode: 3,
            timeout_ms: 60_000,
            open_linger: false,
            thread_num: 6,
            src_dir: PathBuf::from("./resources"),
        }
    }
}
