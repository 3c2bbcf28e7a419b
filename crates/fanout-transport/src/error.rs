use crate::{PeerId, ProtocolId};

/// Errors returned by the fanout transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind overlay host: {0}")]
    Bind(#[source] std::io::Error),

    #[error("dial to {peer} failed: {source}")]
    Dial {
        peer: PeerId,
        #[source]
        source: anyhow::Error,
    },

    #[error("no known address for {0}")]
    NoAddress(PeerId),

    #[error("{peer} does not support {protocol}")]
    UnsupportedProtocol { peer: PeerId, protocol: ProtocolId },

    #[error("handshake with {peer} failed: {reason}")]
    Handshake { peer: PeerId, reason: String },

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("i/o error: {0}")]
    Io(#[source] std::io::Error),

    #[error("overlay host is shut down")]
    Shutdown,

    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),

    #[error("invalid peer address: {0} (expected <peer-hex>@<ip:port>)")]
    InvalidPeerAddr(String),
}
