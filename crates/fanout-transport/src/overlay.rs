use crate::{ConnectionState, PeerId, ProtocolId, Stream, StreamHandler, TransportError};

use std::net::SocketAddr;
use std::sync::Arc;

/// The overlay host the fan-out engine runs on.
///
/// In production: [`TcpOverlay`](crate::TcpOverlay).
/// In tests: [`MemoryOverlay`](crate::MemoryOverlay), whose links can be
/// partitioned and healed.
#[async_trait::async_trait]
pub trait Overlay: Send + Sync + 'static {
    /// This host's identity.
    fn local_peer_id(&self) -> PeerId;

    /// Open a new duplex stream to `peer` for `protocol`.
    async fn open_stream(&self, peer: PeerId, protocol: &ProtocolId)
        -> Result<Stream, TransportError>;

    /// Install the accept handler for `protocol`, replacing any previous one.
    fn set_stream_handler(&self, protocol: ProtocolId, handler: Arc<dyn StreamHandler>);

    /// Remove the accept handler for `protocol`.
    fn remove_stream_handler(&self, protocol: &ProtocolId);

    /// Whether a live connection to `peer` currently exists.
    fn connection_state(&self, peer: &PeerId) -> ConnectionState;

    /// Every peer in the peer directory, excluding ourselves.
    fn known_peers(&self) -> Vec<PeerId>;

    /// Record addresses for a peer in the peer directory.
    async fn add_peer_addrs(&self, peer: PeerId, addrs: Vec<SocketAddr>);

    /// Stop accepting streams and release the host.
    async fn close(&self);
}
