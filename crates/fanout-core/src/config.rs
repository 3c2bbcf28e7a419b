use fanout_transport::ProtocolId;
use std::time::Duration;

/// Protocol the engine opens eagerly and the binary broadcasts on.
pub const DEFAULT_PROTOCOL: &str = "/broadcast/1.0.0";

/// What the discovery bridge does with a newly found peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryMode {
    /// Open an outbound stream on the default protocol right away.
    #[default]
    Eager,
    /// Only record the address; the next broadcast opens the stream.
    Deferred,
}

/// Configuration for the fan-out engine.
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Channel used for eager opens.
    pub default_protocol: ProtocolId,
    /// Eager or deferred stream opening on discovery.
    pub discovery_mode: DiscoveryMode,
    /// Upper bound on one outbound stream open.
    pub open_timeout: Duration,
    /// How long a peer whose open failed is skipped by later broadcasts.
    /// Rediscovering the peer lifts it early.
    pub open_backoff: Duration,
    /// Upper bound on writing and flushing one payload to one handle.
    pub write_timeout: Duration,
    /// Upper bound on closing one handle.
    pub close_timeout: Duration,
    /// How long shutdown waits for in-flight broadcasts and read loops.
    pub drain_timeout: Duration,
    /// Longest inbound line accepted, excluding the terminator.
    pub max_frame_len: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            default_protocol: ProtocolId::new(DEFAULT_PROTOCOL),
            discovery_mode: DiscoveryMode::Eager,
            open_timeout: Duration::from_secs(10),
            open_backoff: Duration::from_secs(30),
            write_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(5),
            max_frame_len: 64 * 1024,
        }
    }
}
