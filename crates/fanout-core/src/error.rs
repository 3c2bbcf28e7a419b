use fanout_transport::{PeerId, ProtocolId, TransportError};
use std::time::Duration;

/// Errors of the fan-out engine.
///
/// Wraps transport errors and adds the per-handle failure variants a
/// broadcast records for each peer.
#[derive(Debug, thiserror::Error)]
pub enum FanoutError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("no channel registered for {0}")]
    UnknownProtocol(ProtocolId),

    #[error("stream to {peer} is closed")]
    StreamClosed { peer: PeerId },

    #[error("write to {peer} failed: {source}")]
    Write {
        peer: PeerId,
        #[source]
        source: std::io::Error,
    },

    #[error("flush to {peer} failed: {source}")]
    Flush {
        peer: PeerId,
        #[source]
        source: std::io::Error,
    },

    #[error("{peer} timed out after {after:?}")]
    Timeout { peer: PeerId, after: Duration },

    #[error("refusing to open a stream to ourselves")]
    SelfStream,

    #[error("broadcast on {protocol} failed for {} peer(s): {}", .failed.len(), join_peers(.failed))]
    Broadcast {
        protocol: ProtocolId,
        failed: Vec<PeerId>,
    },

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("fan-out engine is shut down")]
    Shutdown,
}

fn join_peers(peers: &[PeerId]) -> String {
    peers
        .iter()
        .map(|p| p.short())
        .collect::<Vec<_>>()
        .join(", ")
}
