use crate::{ConnectionState, PeerId};

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

/// Tracks live TCP streams per peer. A peer is connected while at least
/// one of its streams is alive: not dropped, no EOF seen, no I/O error.
#[derive(Default)]
pub(crate) struct ConnectionTracker {
    conns: Mutex<HashMap<PeerId, Vec<CancellationToken>>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new stream to `peer`; the lease dies with the stream.
    pub fn register(&self, peer: PeerId) -> Arc<Lease> {
        let token = CancellationToken::new();
        if let Ok(mut conns) = self.conns.lock() {
            let entry = conns.entry(peer).or_default();
            entry.retain(|t| !t.is_cancelled());
            entry.push(token.clone());
        }
        Arc::new(Lease { token })
    }

    pub fn state(&self, peer: &PeerId) -> ConnectionState {
        let Ok(mut conns) = self.conns.lock() else {
            return ConnectionState::NotConnected;
        };
        let alive = match conns.get_mut(peer) {
            Some(tokens) => {
                tokens.retain(|t| !t.is_cancelled());
                !tokens.is_empty()
            }
            None => false,
        };
        if !alive {
            conns.remove(peer);
        }
        if alive {
            ConnectionState::Connected
        } else {
            ConnectionState::NotConnected
        }
    }

    /// Mark every stream dead (host shutdown).
    pub fn clear(&self) {
        if let Ok(mut conns) = self.conns.lock() {
            for token in conns.values().flatten() {
                token.cancel();
            }
            conns.clear();
        }
    }
}

/// Liveness of one stream, shared by its two halves.
pub(crate) struct Lease {
    token: CancellationToken,
}

impl Lease {
    pub fn mark_dead(&self) {
        self.token.cancel();
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Stream half that reports EOF and I/O errors to its [`Lease`].
pub(crate) struct Tracked<T> {
    inner: T,
    lease: Arc<Lease>,
}

impl<T> Tracked<T> {
    pub fn new(inner: T, lease: Arc<Lease>) -> Self {
        Self { inner, lease }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Tracked<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let had_room = buf.remaining() > 0;
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        match &poll {
            // Zero bytes into a non-empty buffer is EOF
            Poll::Ready(Ok(())) if had_room && buf.filled().len() == before => {
                this.lease.mark_dead()
            }
            Poll::Ready(Err(_)) => this.lease.mark_dead(),
            _ => {}
        }
        poll
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Tracked<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Err(_)) = &poll {
            this.lease.mark_dead();
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_flush(cx);
        if let Poll::Ready(Err(_)) = &poll {
            this.lease.mark_dead();
        }
        poll
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
