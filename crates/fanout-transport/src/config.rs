use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for an overlay host ([`TcpOverlay`](crate::TcpOverlay) or
/// [`MemoryOverlay`](crate::MemoryOverlay)).
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use fanout_transport::HostConfig;
/// use std::time::Duration;
///
/// let config = HostConfig::new()
///     .listen_addr("127.0.0.1:0".parse().unwrap())
///     .dial_timeout(Duration::from_secs(2));
/// ```
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Address the TCP listener binds to.
    pub(crate) listen_addr: SocketAddr,
    /// Upper bound on TCP connect per candidate address.
    pub(crate) dial_timeout: Duration,
    /// Upper bound on the one-line stream handshake.
    pub(crate) handshake_timeout: Duration,
    /// Longest handshake line accepted, in bytes.
    pub(crate) max_handshake_len: usize,
    /// Per-direction buffer of an in-memory stream.
    pub(crate) memory_buffer: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl HostConfig {
    /// Create a new config with defaults.
    ///
    /// If the `FANOUT_LISTEN_ADDR` environment variable is set to a valid
    /// socket address it is used as the listen address. This can be
    /// overridden with [`.listen_addr()`](Self::listen_addr).
    pub fn new() -> Self {
        let listen_addr = std::env::var("FANOUT_LISTEN_ADDR")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 0)));

        Self {
            listen_addr,
            dial_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            max_handshake_len: 512,
            memory_buffer: 64 * 1024,
        }
    }

    /// Set the TCP listen address (default: `127.0.0.1:0`).
    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Set the connect timeout per dialed address (default: 5 s).
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Set the handshake timeout (default: 5 s).
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the in-memory stream buffer size (default: 64 KiB).
    pub fn memory_buffer(mut self, bytes: usize) -> Self {
        self.memory_buffer = bytes;
        self
    }
}
