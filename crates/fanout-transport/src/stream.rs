use crate::{PeerId, ProtocolId};
use tokio::io::{AsyncRead, AsyncWrite};

/// Read half of a stream, type-erased over the host implementation.
pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a stream, type-erased over the host implementation.
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Whether the overlay currently holds a live connection to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    NotConnected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::NotConnected => write!(f, "NOT_CONNECTED"),
        }
    }
}

/// One duplex byte stream to one peer for one protocol.
///
/// The halves are independent: the read side can be moved into a reader
/// task while another task writes.
pub struct Stream {
    peer: PeerId,
    protocol: ProtocolId,
    reader: BoxedRead,
    writer: BoxedWrite,
}

impl Stream {
    pub fn new<R, W>(peer: PeerId, protocol: ProtocolId, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            peer,
            protocol,
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// The remote peer.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn protocol(&self) -> &ProtocolId {
        &self.protocol
    }

    /// Split into the read and write halves.
    pub fn into_split(self) -> (BoxedRead, BoxedWrite) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("peer", &self.peer)
            .field("protocol", &self.protocol)
            .finish()
    }
}
