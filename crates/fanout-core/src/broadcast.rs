//! Broadcast engine: prune dead peers, open missing streams, then write to every handle.

use crate::channels::Channels;
use crate::config::FanoutConfig;
use crate::error::FanoutError;
use crate::handle::{Direction, StreamHandle};
use crate::reader::{read_loop, FrameSink};
use crate::result::{BroadcastResult, Delivery, OpenFailure, PeerDelivery};
use crate::table::{Ensured, PeerStreamTable};

use bytes::Bytes;
use fanout_transport::{Overlay, PeerId, ProtocolId, Stream, StreamHandler};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Per-protocol peer stream tables plus the fan-out path over them.
///
/// Cheap to clone; clones share the same tables.
pub struct BroadcastService<O: Overlay> {
    inner: Arc<Shared<O>>,
}

impl<O: Overlay> Clone for BroadcastService<O> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Shared<O> {
    overlay: Arc<O>,
    channels: Channels,
    config: FanoutConfig,
    sink: Arc<dyn FrameSink>,
    shutdown: CancellationToken,
    readers: TaskTracker,
    /// Peers whose last open failed, with when to try them again.
    backoff: Mutex<HashMap<PeerId, Instant>>,
}

impl<O> Shared<O> {
    fn spawn_reader(&self, handle: Arc<StreamHandle>, table: Arc<PeerStreamTable>) {
        self.readers.spawn(read_loop(
            handle,
            table,
            self.sink.clone(),
            self.config.max_frame_len,
            self.shutdown.clone(),
        ));
    }
}

/// Accept handler installed for every channel.
struct InboundChannel<O> {
    shared: Weak<Shared<O>>,
    table: Arc<PeerStreamTable>,
}

#[async_trait::async_trait]
impl<O: Overlay> StreamHandler for InboundChannel<O> {
    async fn on_stream(&self, stream: Stream) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if shared.shutdown.is_cancelled() {
            return;
        }
        debug!(peer = %stream.peer().short(), protocol = %stream.protocol(), "accepted inbound stream");
        let handle = Arc::new(StreamHandle::new(stream, Direction::Inbound));
        self.table.insert_inbound(handle.clone()).await;
        shared.spawn_reader(handle, self.table.clone());
    }
}

impl<O: Overlay> BroadcastService<O> {
    pub fn new(
        overlay: Arc<O>,
        config: FanoutConfig,
        sink: Arc<dyn FrameSink>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Shared {
                overlay,
                channels: Channels::new(config.close_timeout),
                config,
                sink,
                shutdown,
                readers: TaskTracker::new(),
                backoff: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn overlay(&self) -> &Arc<O> {
        &self.inner.overlay
    }

    pub fn config(&self) -> &FanoutConfig {
        &self.inner.config
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.inner.overlay.local_peer_id()
    }

    /// Register a channel: create its table and accept streams on it.
    pub fn add_channel(&self, protocol: ProtocolId) -> Arc<PeerStreamTable> {
        let table = self.inner.channels.register(&protocol);
        let handler = InboundChannel {
            shared: Arc::downgrade(&self.inner),
            table: table.clone(),
        };
        self.inner
            .overlay
            .set_stream_handler(protocol.clone(), Arc::new(handler));
        info!(protocol = %protocol, "channel registered");
        table
    }

    pub fn channel(&self, protocol: &ProtocolId) -> Option<Arc<PeerStreamTable>> {
        self.inner.channels.get(protocol)
    }

    fn table(&self, protocol: &ProtocolId) -> Result<Arc<PeerStreamTable>, FanoutError> {
        self.channel(protocol)
            .ok_or_else(|| FanoutError::UnknownProtocol(protocol.clone()))
    }

    /// Ensure an outbound stream to `peer` on `protocol`, bounded by the
    /// open timeout. A newly opened stream gets a read loop.
    pub async fn connect_peer(
        &self,
        protocol: &ProtocolId,
        peer: PeerId,
    ) -> Result<Ensured, FanoutError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(FanoutError::Shutdown);
        }
        if peer == self.local_peer_id() {
            return Err(FanoutError::SelfStream);
        }
        let table = self.table(protocol)?;
        let overlay = self.inner.overlay.clone();
        let open_timeout = self.inner.config.open_timeout;
        let proto = protocol.clone();

        let ensured = table
            .ensure_outbound(peer, move || async move {
                match tokio::time::timeout(open_timeout, overlay.open_stream(peer, &proto)).await {
                    Ok(opened) => opened.map_err(FanoutError::from),
                    Err(_) => Err(FanoutError::Timeout {
                        peer,
                        after: open_timeout,
                    }),
                }
            })
            .await?;

        if let Ensured::Opened(handle) = &ensured {
            self.inner.spawn_reader(handle.clone(), table);
        }
        self.clear_backoff(&peer);
        Ok(ensured)
    }

    /// Let the next broadcast try `peer` again even if its last open failed.
    pub fn clear_backoff(&self, peer: &PeerId) {
        if let Ok(mut backoff) = self.inner.backoff.lock() {
            backoff.remove(peer);
        }
    }

    fn backing_off(&self, peer: &PeerId, now: Instant) -> bool {
        self.inner
            .backoff
            .lock()
            .is_ok_and(|backoff| backoff.get(peer).is_some_and(|until| *until > now))
    }

    fn back_off(&self, peer: PeerId) {
        let until = Instant::now() + self.inner.config.open_backoff;
        if let Ok(mut backoff) = self.inner.backoff.lock() {
            backoff.insert(peer, until);
        }
    }

    /// Send `payload` verbatim to every stream on `protocol`.
    ///
    /// Prunes disconnected peers, opens streams to known peers that lack
    /// one (skipping peers still backing off from a failed open), then
    /// writes to every inbound and outbound handle concurrently. One peer
    /// failing never stops delivery to the rest.
    pub async fn broadcast(
        &self,
        protocol: &ProtocolId,
        payload: impl Into<Bytes>,
    ) -> Result<BroadcastResult, FanoutError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(FanoutError::Shutdown);
        }
        let table = self.table(protocol)?;
        let payload: Bytes = payload.into();

        let pruned = table.prune(&*self.inner.overlay).await;
        let open_failures = self.open_missing(protocol, &table).await;

        let write_timeout = self.inner.config.write_timeout;
        let mut writes = JoinSet::new();
        for handle in table.snapshot().await {
            let payload = payload.clone();
            let table = table.clone();
            writes.spawn(async move {
                let outcome =
                    match tokio::time::timeout(write_timeout, handle.write_frame(&payload)).await {
                        Ok(written) => Delivery::from(written),
                        Err(_) => {
                            // The frame may be half on the wire
                            table.remove_handle(&handle).await;
                            Delivery::WriteFailed(
                                FanoutError::Timeout {
                                    peer: handle.peer(),
                                    after: write_timeout,
                                }
                                .to_string(),
                            )
                        }
                    };
                PeerDelivery {
                    peer: handle.peer(),
                    direction: handle.direction(),
                    outcome,
                }
            });
        }

        let mut deliveries = Vec::with_capacity(writes.len());
        while let Some(joined) = writes.join_next().await {
            match joined {
                Ok(delivery) => {
                    if !delivery.outcome.is_delivered() {
                        warn!(peer = %delivery.peer.short(), direction = %delivery.direction, outcome = %delivery.outcome, "broadcast to peer failed");
                    }
                    deliveries.push(delivery);
                }
                Err(e) => warn!(error = %e, "broadcast write task failed"),
            }
        }
        deliveries.sort_by_key(|d| (d.peer, d.direction));

        debug!(
            protocol = %protocol,
            handles = deliveries.len(),
            pruned = pruned.len(),
            open_failures = open_failures.len(),
            "broadcast complete"
        );

        Ok(BroadcastResult {
            protocol: protocol.clone(),
            pruned,
            open_failures,
            deliveries,
        })
    }

    /// Broadcast on the configured default protocol.
    pub async fn broadcast_default(
        &self,
        payload: impl Into<Bytes>,
    ) -> Result<BroadcastResult, FanoutError> {
        let protocol = self.inner.config.default_protocol.clone();
        self.broadcast(&protocol, payload).await
    }

    async fn open_missing(
        &self,
        protocol: &ProtocolId,
        table: &PeerStreamTable,
    ) -> Vec<OpenFailure> {
        let me = self.local_peer_id();
        let now = Instant::now();
        let mut opens = JoinSet::new();
        for peer in self.inner.overlay.known_peers() {
            if peer == me || table.outbound(&peer).await.is_some() {
                continue;
            }
            if self.backing_off(&peer, now) {
                debug!(peer = %peer.short(), protocol = %protocol, "skipping peer after failed open");
                continue;
            }
            let service = self.clone();
            let protocol = protocol.clone();
            opens.spawn(async move { (peer, service.connect_peer(&protocol, peer).await) });
        }

        let mut failures = Vec::new();
        while let Some(joined) = opens.join_next().await {
            match joined {
                Ok((peer, Err(e))) => {
                    warn!(peer = %peer.short(), protocol = %protocol, error = %e, "failed to open stream");
                    self.back_off(peer);
                    failures.push(OpenFailure {
                        peer,
                        reason: e.to_string(),
                    });
                }
                Ok((_, Ok(_))) => {}
                Err(e) => warn!(error = %e, "open task failed"),
            }
        }
        failures.sort_by_key(|f| f.peer);
        failures
    }

    /// Stop read loops, close every handle, then close the overlay.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for table in self.inner.channels.all() {
            table.close_all().await;
        }
        self.inner.overlay.close().await;

        self.inner.readers.close();
        let drain = self.inner.config.drain_timeout;
        if tokio::time::timeout(drain, self.inner.readers.wait())
            .await
            .is_err()
        {
            warn!(after = ?drain, "read loops still running at shutdown");
        }
        info!(peer = %self.local_peer_id().short(), "fan-out engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{InboundFrame, NullSink};
    use fanout_transport::{MemoryNetwork, MemoryOverlay};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn proto() -> ProtocolId {
        ProtocolId::new("/broadcast/1.0.0")
    }

    fn service(host: Arc<MemoryOverlay>) -> BroadcastService<MemoryOverlay> {
        BroadcastService::new(
            host,
            FanoutConfig::default(),
            Arc::new(NullSink),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn unknown_protocol_is_error() {
        let net = MemoryNetwork::new();
        let svc = service(net.host());
        let err = svc.broadcast(&proto(), "x\n").await.unwrap_err();
        assert!(matches!(err, FanoutError::UnknownProtocol(p) if p == proto()));
    }

    #[tokio::test]
    async fn broadcast_without_peers_succeeds() {
        let net = MemoryNetwork::new();
        let svc = service(net.host());
        svc.add_channel(proto());
        let result = svc.broadcast(&proto(), "x\n").await.unwrap();
        assert!(result.deliveries.is_empty());
        assert!(result.ok().is_ok());
    }

    #[tokio::test]
    async fn self_is_never_dialed() {
        let net = MemoryNetwork::new();
        let host = net.host();
        let svc = service(host.clone());
        svc.add_channel(proto());
        assert!(matches!(
            svc.connect_peer(&proto(), host.local_peer_id()).await,
            Err(FanoutError::SelfStream)
        ));
    }

    #[tokio::test]
    async fn connect_then_broadcast_reaches_peer() {
        let net = MemoryNetwork::new();
        let a = service(net.host());
        let (tx, mut rx) = mpsc::unbounded_channel::<InboundFrame>();
        let b = BroadcastService::new(
            net.host(),
            FanoutConfig::default(),
            Arc::new(tx),
            CancellationToken::new(),
        );
        a.add_channel(proto());
        b.add_channel(proto());

        let ensured = a.connect_peer(&proto(), b.local_peer_id()).await.unwrap();
        assert!(ensured.is_new());
        let again = a.connect_peer(&proto(), b.local_peer_id()).await.unwrap();
        assert!(!again.is_new());

        let result = a.broadcast(&proto(), "hello\n").await.unwrap();
        assert_eq!(result.delivered_peers(), vec![b.local_peer_id()]);

        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.text, "hello");
        assert_eq!(frame.peer, a.local_peer_id());
        assert_eq!(frame.direction, Direction::Inbound);
    }

    #[tokio::test]
    async fn broadcast_after_shutdown_is_error() {
        let net = MemoryNetwork::new();
        let svc = service(net.host());
        svc.add_channel(proto());
        svc.shutdown().await;
        assert!(matches!(
            svc.broadcast(&proto(), "x\n").await,
            Err(FanoutError::Shutdown)
        ));
    }
}
