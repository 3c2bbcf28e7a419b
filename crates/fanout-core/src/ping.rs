//! Request/response ping over two one-shot stream protocols.
//!
//! A request stream carries one JSON [`PingMessage`] terminated by
//! end-of-stream. The receiver reports it and answers on a fresh
//! response stream with `{"msg":"pong"}`.

use crate::config::FanoutConfig;
use crate::error::FanoutError;
use crate::handle::Direction;
use crate::reader::{FrameSink, InboundFrame};

use fanout_transport::{Overlay, PeerId, ProtocolId, Stream, StreamHandler};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

pub const PING_REQUEST: &str = "/ping/req/1.0.0";
pub const PING_RESPONSE: &str = "/ping/rsp/1.0.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingMessage {
    #[serde(alias = "Msg")]
    pub msg: String,
}

struct PingShared<O> {
    overlay: Arc<O>,
    sink: Arc<dyn FrameSink>,
    open_timeout: Duration,
    max_body: usize,
}

/// Ping sender plus the two accept handlers.
pub struct PingService<O: Overlay> {
    inner: Arc<PingShared<O>>,
}

impl<O: Overlay> Clone for PingService<O> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct PingHandler<O> {
    shared: Weak<PingShared<O>>,
    answer: bool,
}

#[async_trait::async_trait]
impl<O: Overlay> StreamHandler for PingHandler<O> {
    async fn on_stream(&self, stream: Stream) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let peer = stream.peer();
        let protocol = stream.protocol().clone();
        let (reader, _writer) = stream.into_split();

        let mut body = Vec::new();
        if let Err(e) = reader.take(shared.max_body as u64).read_to_end(&mut body).await {
            debug!(peer = %peer.short(), protocol = %protocol, error = %e, "ping read failed");
            return;
        }
        let msg: PingMessage = match serde_json::from_slice(&body) {
            Ok(m) => m,
            Err(e) => {
                debug!(peer = %peer.short(), protocol = %protocol, error = %e, "undecodable ping body");
                return;
            }
        };
        shared.sink.deliver(InboundFrame {
            peer,
            protocol,
            direction: Direction::Inbound,
            text: msg.msg,
        });

        if self.answer {
            if let Err(e) = shared.send(peer, PING_RESPONSE, "pong").await {
                warn!(peer = %peer.short(), error = %e, "failed to send pong");
            }
        }
    }
}

impl<O: Overlay> PingShared<O> {
    async fn send(&self, peer: PeerId, protocol: &str, text: &str) -> Result<(), FanoutError> {
        let body = serde_json::to_vec(&PingMessage {
            msg: text.to_string(),
        })?;
        let protocol = ProtocolId::new(protocol);
        let stream = tokio::time::timeout(self.open_timeout, self.overlay.open_stream(peer, &protocol))
            .await
            .map_err(|_| FanoutError::Timeout {
                peer,
                after: self.open_timeout,
            })??;

        // Dropping the halves on error resets the stream
        let (_reader, mut writer) = stream.into_split();
        writer
            .write_all(&body)
            .await
            .map_err(|source| FanoutError::Write { peer, source })?;
        writer
            .shutdown()
            .await
            .map_err(|source| FanoutError::Flush { peer, source })
    }
}

impl<O: Overlay> PingService<O> {
    /// Install the request and response handlers on `overlay`.
    pub fn register(overlay: Arc<O>, sink: Arc<dyn FrameSink>, config: &FanoutConfig) -> Self {
        let inner = Arc::new(PingShared {
            overlay,
            sink,
            open_timeout: config.open_timeout,
            max_body: config.max_frame_len,
        });
        for (protocol, answer) in [(PING_REQUEST, true), (PING_RESPONSE, false)] {
            let handler = PingHandler {
                shared: Arc::downgrade(&inner),
                answer,
            };
            inner
                .overlay
                .set_stream_handler(ProtocolId::new(protocol), Arc::new(handler));
        }
        Self { inner }
    }

    /// Send one ping request to `peer`.
    pub async fn ping(&self, peer: PeerId, msg: &str) -> Result<(), FanoutError> {
        self.inner.send(peer, PING_REQUEST, msg).await
    }

    /// Ping every known peer concurrently; returns the peers that failed.
    pub async fn ping_all(&self, msg: &str) -> Vec<(PeerId, FanoutError)> {
        let mut pings = tokio::task::JoinSet::new();
        for peer in self.inner.overlay.known_peers() {
            let svc = self.clone();
            let msg = msg.to_string();
            pings.spawn(async move { (peer, svc.ping(peer, &msg).await) });
        }
        let mut failed = Vec::new();
        while let Some(joined) = pings.join_next().await {
            if let Ok((peer, Err(e))) = joined {
                failed.push((peer, e));
            }
        }
        failed
    }
}
