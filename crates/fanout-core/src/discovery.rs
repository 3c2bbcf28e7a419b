//! Bridge from discovery events to the stream tables.

use crate::broadcast::BroadcastService;
use crate::config::DiscoveryMode;

use fanout_transport::{Overlay, PeerFound, ProtocolId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What the bridge did with one discovery event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discovered {
    /// The event named this host.
    SelfIgnored,
    /// Address recorded; no stream opened.
    Recorded,
    /// An outbound stream exists (newly opened or already there).
    Connected,
    /// Address recorded but the eager open failed.
    OpenFailed,
}

/// Feeds [`PeerFound`] events into the overlay's peer directory and,
/// in eager mode, opens an outbound stream on the default protocol.
pub struct DiscoveryBridge<O: Overlay> {
    service: BroadcastService<O>,
    mode: DiscoveryMode,
    protocol: ProtocolId,
}

impl<O: Overlay> DiscoveryBridge<O> {
    pub fn new(service: BroadcastService<O>) -> Self {
        let mode = service.config().discovery_mode;
        let protocol = service.config().default_protocol.clone();
        Self {
            service,
            mode,
            protocol,
        }
    }

    pub fn mode(&self) -> DiscoveryMode {
        self.mode
    }

    /// Handle one discovered peer. Open failures are logged, not
    /// retried; the next broadcast tries again.
    pub async fn on_peer_found(&self, found: PeerFound) -> Discovered {
        let PeerFound { peer, addrs } = found;
        if peer == self.service.local_peer_id() {
            return Discovered::SelfIgnored;
        }
        debug!(peer = %peer.short(), addrs = ?addrs, "peer found");
        self.service.overlay().add_peer_addrs(peer, addrs).await;
        self.service.clear_backoff(&peer);

        if self.mode == DiscoveryMode::Deferred {
            return Discovered::Recorded;
        }
        match self.service.connect_peer(&self.protocol, peer).await {
            Ok(ensured) => {
                if ensured.is_new() {
                    info!(peer = %peer.short(), protocol = %self.protocol, "connected to discovered peer");
                }
                Discovered::Connected
            }
            Err(e) => {
                warn!(peer = %peer.short(), protocol = %self.protocol, error = %e, "failed to open stream to discovered peer");
                Discovered::OpenFailed
            }
        }
    }

    /// Drain `events` until the channel closes or `shutdown` fires.
    pub async fn run(self, mut events: mpsc::Receiver<PeerFound>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(found) => {
                        self.on_peer_found(found).await;
                    }
                    None => break,
                },
            }
        }
        debug!("discovery bridge stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FanoutConfig;
    use crate::reader::NullSink;
    use fanout_transport::{MemoryNetwork, MemoryOverlay, PeerId};
    use std::sync::Arc;

    fn service(host: Arc<MemoryOverlay>, mode: DiscoveryMode) -> BroadcastService<MemoryOverlay> {
        let config = FanoutConfig {
            discovery_mode: mode,
            ..FanoutConfig::default()
        };
        let svc = BroadcastService::new(host, config, Arc::new(NullSink), CancellationToken::new());
        svc.add_channel(svc.config().default_protocol.clone());
        svc
    }

    fn found(peer: PeerId) -> PeerFound {
        PeerFound {
            peer,
            addrs: vec!["127.0.0.1:4001".parse().unwrap()],
        }
    }

    #[tokio::test]
    async fn ignores_self() {
        let net = MemoryNetwork::new();
        let host = net.host();
        let bridge = DiscoveryBridge::new(service(host.clone(), DiscoveryMode::Eager));
        assert_eq!(
            bridge.on_peer_found(found(host.local_peer_id())).await,
            Discovered::SelfIgnored
        );
        assert!(host.known_peers().is_empty());
    }

    #[tokio::test]
    async fn deferred_only_records() {
        let net = MemoryNetwork::new();
        let a = net.host();
        let b = service(net.host(), DiscoveryMode::Eager);
        let svc = service(a.clone(), DiscoveryMode::Deferred);
        let bridge = DiscoveryBridge::new(svc.clone());

        assert_eq!(bridge.on_peer_found(found(b.local_peer_id())).await, Discovered::Recorded);
        assert_eq!(a.known_peers(), vec![b.local_peer_id()]);
        let table = svc.channel(&svc.config().default_protocol).unwrap();
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn eager_opens_outbound() {
        let net = MemoryNetwork::new();
        let b = service(net.host(), DiscoveryMode::Eager);
        let svc = service(net.host(), DiscoveryMode::Eager);
        let bridge = DiscoveryBridge::new(svc.clone());

        assert_eq!(bridge.on_peer_found(found(b.local_peer_id())).await, Discovered::Connected);
        let table = svc.channel(&svc.config().default_protocol).unwrap();
        assert_eq!(table.outbound_peers().await, vec![b.local_peer_id()]);
    }

    #[tokio::test]
    async fn eager_failure_is_reported_not_fatal() {
        let net = MemoryNetwork::new();
        let svc = service(net.host(), DiscoveryMode::Eager);
        let bridge = DiscoveryBridge::new(svc);
        let ghost = PeerId::random();
        assert_eq!(bridge.on_peer_found(found(ghost)).await, Discovered::OpenFailed);
    }

    #[tokio::test]
    async fn run_stops_when_channel_closes() {
        let net = MemoryNetwork::new();
        let b = service(net.host(), DiscoveryMode::Eager);
        let svc = service(net.host(), DiscoveryMode::Eager);
        let (tx, rx) = mpsc::channel(4);
        tx.send(found(b.local_peer_id())).await.unwrap();
        drop(tx);

        DiscoveryBridge::new(svc.clone())
            .run(rx, CancellationToken::new())
            .await;
        let table = svc.channel(&svc.config().default_protocol).unwrap();
        assert_eq!(table.outbound_peers().await, vec![b.local_peer_id()]);
    }
}
