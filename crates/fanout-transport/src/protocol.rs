use crate::{PeerId, ProtocolId, Stream};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Handler invoked for every stream a remote peer opens to us on a
/// registered protocol.
#[async_trait::async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    async fn on_stream(&self, stream: Stream);
}

/// Dispatch table from protocol to accept handler.
///
/// Shared by every host implementation so several protocols can register
/// through the same mechanism.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<ProtocolId, Arc<dyn StreamHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) the handler for a protocol.
    pub fn set(&self, protocol: ProtocolId, handler: Arc<dyn StreamHandler>) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.insert(protocol, handler);
        }
    }

    pub fn remove(&self, protocol: &ProtocolId) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.remove(protocol);
        }
    }

    pub fn get(&self, protocol: &str) -> Option<Arc<dyn StreamHandler>> {
        self.handlers.read().ok()?.get(protocol).cloned()
    }

    pub fn supports(&self, protocol: &str) -> bool {
        self.get(protocol).is_some()
    }

    /// Registered protocols, sorted.
    pub fn protocols(&self) -> Vec<ProtocolId> {
        let mut protocols: Vec<_> = self
            .handlers
            .read()
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default();
        protocols.sort();
        protocols
    }

    pub fn clear(&self) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.clear();
        }
    }

    /// Hand an accepted stream to its protocol handler on a fresh task.
    ///
    /// Returns `false` (and drops the stream) if no handler is registered.
    pub fn dispatch(&self, stream: Stream) -> bool {
        let Some(handler) = self.get(stream.protocol().as_str()) else {
            tracing::debug!(
                peer = %stream.peer().short(),
                protocol = %stream.protocol(),
                "no handler for accepted stream"
            );
            return false;
        };
        tokio::spawn(async move {
            handler.on_stream(stream).await;
        });
        true
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("protocols", &self.protocols())
            .finish()
    }
}

// ── Stream handshake (TCP host) ─────────────────────────────────────
//
// Dialer:   "<dialer-peer> <dialer-listen-addr|-> <protocol>\n"
// Listener: "ok <listener-peer>\n" | "na\n"

/// Opening line sent by the dialer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Hello {
    pub peer: PeerId,
    pub listen: Option<SocketAddr>,
    pub protocol: ProtocolId,
}

impl Hello {
    pub fn encode(&self) -> String {
        let listen = self
            .listen
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string());
        format!("{} {} {}\n", self.peer, listen, self.protocol)
    }

    pub fn parse(line: &str) -> Result<Self, String> {
        let mut parts = line.trim_end().split(' ');
        let (Some(peer), Some(listen), Some(protocol), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(format!("malformed hello: {line:?}"));
        };
        let peer = peer.parse::<PeerId>().map_err(|e| format!("{e}"))?;
        let listen = match listen {
            "-" => None,
            addr => Some(
                addr.parse::<SocketAddr>()
                    .map_err(|_| format!("bad listen address {addr:?}"))?,
            ),
        };
        if protocol.is_empty() {
            return Err("empty protocol".to_string());
        }
        Ok(Self {
            peer,
            listen,
            protocol: ProtocolId::new(protocol),
        })
    }
}

/// Listener's answer to a [`Hello`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reply {
    Accept(PeerId),
    Reject,
}

impl Reply {
    pub fn encode(&self) -> String {
        match self {
            Reply::Accept(peer) => format!("ok {peer}\n"),
            Reply::Reject => "na\n".to_string(),
        }
    }

    pub fn parse(line: &str) -> Result<Self, String> {
        match line.trim_end() {
            "na" => Ok(Reply::Reject),
            other => {
                let peer = other
                    .strip_prefix("ok ")
                    .ok_or_else(|| format!("malformed reply: {line:?}"))?;
                Ok(Reply::Accept(
                    peer.parse::<PeerId>().map_err(|e| format!("{e}"))?,
                ))
            }
        }
    }
}

/// Read one `\n`-terminated line of at most `max_len` bytes.
pub(crate) async fn read_line_bounded<R>(reader: &mut R, max_len: usize) -> std::io::Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(max_len as u64)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Err(std::io::ErrorKind::UnexpectedEof.into());
    }
    if buf.last() != Some(&b'\n') {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "handshake line too long or truncated",
        ));
    }
    String::from_utf8(buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
