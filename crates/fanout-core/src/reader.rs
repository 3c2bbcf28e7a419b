//! Per-handle inbound read loop.

use crate::handle::{Direction, StreamHandle};
use crate::table::PeerStreamTable;

use fanout_transport::{BoxedRead, PeerId, ProtocolId};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One newline-delimited unit received from a peer, terminator stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub peer: PeerId,
    pub protocol: ProtocolId,
    pub direction: Direction,
    pub text: String,
}

/// Where received frames go.
pub trait FrameSink: Send + Sync + 'static {
    fn deliver(&self, frame: InboundFrame);
}

impl FrameSink for mpsc::UnboundedSender<InboundFrame> {
    fn deliver(&self, frame: InboundFrame) {
        let _ = self.send(frame);
    }
}

/// Sink that drops everything.
pub struct NullSink;

impl FrameSink for NullSink {
    fn deliver(&self, _frame: InboundFrame) {}
}

enum Unit {
    Eof,
    Line,
    Oversized,
}

/// Read the next unit into `buf`. The terminator, if any, stays in `buf`.
async fn read_unit<R>(reader: &mut R, buf: &mut Vec<u8>, max_len: usize) -> std::io::Result<Unit>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let n = (&mut *reader)
        .take(max_len as u64 + 1)
        .read_until(b'\n', buf)
        .await?;
    if n == 0 {
        return Ok(Unit::Eof);
    }
    let terminated = buf.last() == Some(&b'\n');
    if !terminated && n > max_len {
        discard_line(reader).await?;
        return Ok(Unit::Oversized);
    }
    Ok(Unit::Line)
}

/// Skip through the next `\n`, or to EOF.
async fn discard_line<R>(reader: &mut R) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            return Ok(());
        }
        if let Some(i) = chunk.iter().position(|b| *b == b'\n') {
            reader.consume(i + 1);
            return Ok(());
        }
        let len = chunk.len();
        reader.consume(len);
    }
}

/// Deliver newline-delimited frames from `handle` to `sink` until EOF,
/// a read error, the handle closing, or `shutdown`.
///
/// On EOF or error the handle is removed from `table` and closed. On
/// shutdown it is left for the shutdown path to close.
pub async fn read_loop(
    handle: Arc<StreamHandle>,
    table: Arc<PeerStreamTable>,
    sink: Arc<dyn FrameSink>,
    max_frame_len: usize,
    shutdown: CancellationToken,
) {
    let Some(reader) = handle.take_reader() else {
        return;
    };
    run(reader, &handle, sink.as_ref(), max_frame_len, &shutdown).await;
    if !shutdown.is_cancelled() {
        table.remove_handle(&handle).await;
    }
}

async fn run(
    mut reader: BufReader<BoxedRead>,
    handle: &StreamHandle,
    sink: &dyn FrameSink,
    max_frame_len: usize,
    shutdown: &CancellationToken,
) {
    let peer = handle.peer();
    let closed = handle.closed_token();
    let mut buf = Vec::new();

    loop {
        let unit = tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = closed.cancelled() => return,
            unit = read_unit(&mut reader, &mut buf, max_frame_len) => unit,
        };

        match unit {
            Ok(Unit::Eof) => {
                debug!(peer = %peer.short(), protocol = %handle.protocol(), direction = %handle.direction(), "stream ended");
                return;
            }
            Err(e) => {
                debug!(peer = %peer.short(), protocol = %handle.protocol(), error = %e, "stream read failed");
                return;
            }
            Ok(Unit::Oversized) => {
                debug!(peer = %peer.short(), max = max_frame_len, "discarding oversized frame");
            }
            Ok(Unit::Line) => {
                let body = buf.strip_suffix(b"\n").unwrap_or(&buf[..]);
                if body.is_empty() {
                    continue;
                }
                match std::str::from_utf8(body) {
                    Ok(text) => sink.deliver(InboundFrame {
                        peer,
                        protocol: handle.protocol().clone(),
                        direction: handle.direction(),
                        text: text.to_string(),
                    }),
                    Err(_) => {
                        debug!(peer = %peer.short(), len = body.len(), "discarding non-utf8 frame");
                    }
                }
            }
        }
    }
}
