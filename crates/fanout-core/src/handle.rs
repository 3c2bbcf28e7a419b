//! One duplex stream to one peer for one protocol.

use crate::error::FanoutError;

use fanout_transport::{BoxedRead, BoxedWrite, PeerId, ProtocolId, Stream};
use std::sync::Mutex;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio_util::sync::CancellationToken;

/// Which side opened the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    /// Accepted from the remote peer.
    Inbound,
    /// Opened by us.
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

/// A stream with independently buffered read and write sides.
///
/// The read side is taken once by the read loop. The write side sits
/// behind an async lock so frames from overlapping broadcasts never
/// interleave, and so [`close`](Self::close) waits for an in-flight write.
/// After close every write fails with [`FanoutError::StreamClosed`].
pub struct StreamHandle {
    peer: PeerId,
    protocol: ProtocolId,
    direction: Direction,
    reader: Mutex<Option<BufReader<BoxedRead>>>,
    writer: tokio::sync::Mutex<Option<BufWriter<BoxedWrite>>>,
    closed: CancellationToken,
}

impl StreamHandle {
    pub fn new(stream: Stream, direction: Direction) -> Self {
        let peer = stream.peer();
        let protocol = stream.protocol().clone();
        let (reader, writer) = stream.into_split();
        Self {
            peer,
            protocol,
            direction,
            reader: Mutex::new(Some(BufReader::new(reader))),
            writer: tokio::sync::Mutex::new(Some(BufWriter::new(writer))),
            closed: CancellationToken::new(),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn protocol(&self) -> &ProtocolId {
        &self.protocol
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Fires once the handle is closed.
    pub(crate) fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Move the read side out. Returns `None` after the first call or
    /// once the handle is closed.
    pub fn take_reader(&self) -> Option<BufReader<BoxedRead>> {
        if self.is_closed() {
            return None;
        }
        self.reader.lock().ok()?.take()
    }

    /// Write the whole payload, then flush.
    pub async fn write_frame(&self, payload: &[u8]) -> Result<(), FanoutError> {
        let mut guard = self.writer.lock().await;
        let writer = match guard.as_mut() {
            Some(w) if !self.is_closed() => w,
            _ => return Err(FanoutError::StreamClosed { peer: self.peer }),
        };
        writer
            .write_all(payload)
            .await
            .map_err(|source| FanoutError::Write {
                peer: self.peer,
                source,
            })?;
        writer.flush().await.map_err(|source| FanoutError::Flush {
            peer: self.peer,
            source,
        })
    }

    /// Reject further writes without waiting for one already in flight.
    /// [`close`](Self::close) still has to run to release the stream.
    pub(crate) fn mark_closed(&self) {
        self.closed.cancel();
    }

    /// Flush what is buffered, then release both sides. Idempotent.
    ///
    /// A write already in progress finishes first; close never cuts a
    /// frame short.
    pub async fn close(&self) -> Result<(), FanoutError> {
        self.closed.cancel();
        if let Ok(mut reader) = self.reader.lock() {
            reader.take();
        }
        let Some(mut writer) = self.writer.lock().await.take() else {
            return Ok(());
        };
        writer.shutdown().await.map_err(|source| FanoutError::Flush {
            peer: self.peer,
            source,
        })
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("peer", &self.peer)
            .field("protocol", &self.protocol)
            .field("direction", &self.direction)
            .field("closed", &self.is_closed())
            .finish()
    }
}
