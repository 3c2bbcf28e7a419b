/// Integration tests: broadcast fan-out over an in-memory overlay.
///
/// Several hosts on one MemoryNetwork, each running a BroadcastService.
/// Links are partitioned to simulate peers dropping off.
use fanout_core::{
    BroadcastService, Delivery, Direction, DiscoveryBridge, DiscoveryMode, FanoutConfig,
    FanoutError, InboundFrame, StreamHandle,
};
use fanout_transport::{MemoryNetwork, MemoryOverlay, Overlay, PeerFound, PeerId, ProtocolId, Stream};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Node {
    host: Arc<MemoryOverlay>,
    svc: BroadcastService<MemoryOverlay>,
    rx: mpsc::UnboundedReceiver<InboundFrame>,
}

impl Node {
    fn id(&self) -> PeerId {
        self.host.local_peer_id()
    }

    async fn next_text(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .expect("no frame arrived")
            .expect("sink closed")
            .text
    }
}

fn proto() -> ProtocolId {
    ProtocolId::new(fanout_core::DEFAULT_PROTOCOL)
}

fn node(net: &MemoryNetwork, config: FanoutConfig) -> Node {
    let host = net.host();
    let (tx, rx) = mpsc::unbounded_channel();
    let svc = BroadcastService::new(host.clone(), config, Arc::new(tx), CancellationToken::new());
    svc.add_channel(proto());
    Node { host, svc, rx }
}

fn found(peer: PeerId) -> PeerFound {
    PeerFound {
        peer,
        addrs: Vec::new(),
    }
}

/// Writer that fails every write.
struct BrokenWriter;

impl AsyncWrite for BrokenWriter {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
    }
    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Writer that never makes progress.
struct HungWriter;

impl AsyncWrite for HungWriter {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Pending
    }
    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Pending
    }
    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

fn fake_inbound<W>(peer: PeerId, writer: W) -> Arc<StreamHandle>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let stream = Stream::new(peer, proto(), tokio::io::empty(), writer);
    Arc::new(StreamHandle::new(stream, Direction::Inbound))
}

/// A, B, C connected; B drops off; broadcast reaches A and C only.
#[tokio::test]
async fn broadcast_skips_disconnected_peer() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .try_init();

    let net = MemoryNetwork::new();
    let origin = node(&net, FanoutConfig::default());
    let mut a = node(&net, FanoutConfig::default());
    let mut b = node(&net, FanoutConfig::default());
    let mut c = node(&net, FanoutConfig::default());

    // ── Step 1: discover everyone, eager open ───────────────────────────
    let bridge = DiscoveryBridge::new(origin.svc.clone());
    for peer in [a.id(), b.id(), c.id()] {
        bridge.on_peer_found(found(peer)).await;
    }
    let table = origin.svc.channel(&proto()).unwrap();
    assert_eq!(table.outbound_peers().await.len(), 3);

    // ── Step 2: B drops off ─────────────────────────────────────────────
    net.disconnect(origin.id(), b.id());

    // ── Step 3: broadcast ───────────────────────────────────────────────
    let result = origin.svc.broadcast(&proto(), "hello\n").await.unwrap();
    let mut expected = vec![a.id(), c.id()];
    expected.sort();
    assert_eq!(result.delivered_peers(), expected);
    assert!(!result.delivered_peers().contains(&b.id()));
    assert!(result.open_failures.iter().any(|f| f.peer == b.id()));

    assert_eq!(a.next_text().await, "hello");
    assert_eq!(c.next_text().await, "hello");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(b.rx.try_recv().is_err());

    // ── Step 4: a following prune leaves no B outbound ──────────────────
    table.prune(&*origin.host).await;
    assert!(!table.outbound_peers().await.contains(&b.id()));
    for peer in table.outbound_peers().await {
        assert!(origin.host.connection_state(&peer) == fanout_transport::ConnectionState::Connected);
    }
}

/// A peer found after startup receives the next broadcast.
#[tokio::test]
async fn peer_found_then_broadcast() {
    let net = MemoryNetwork::new();
    let origin = node(&net, FanoutConfig::default());
    let mut d = node(&net, FanoutConfig::default());

    DiscoveryBridge::new(origin.svc.clone())
        .on_peer_found(found(d.id()))
        .await;
    let result = origin.svc.broadcast(&proto(), "x\n").await.unwrap();
    assert!(result.is_success());
    assert_eq!(d.next_text().await, "x");
}

/// Deferred discovery opens on the next broadcast instead.
#[tokio::test]
async fn deferred_peer_opened_by_broadcast() {
    let net = MemoryNetwork::new();
    let config = FanoutConfig {
        discovery_mode: DiscoveryMode::Deferred,
        ..FanoutConfig::default()
    };
    let origin = node(&net, config);
    let mut d = node(&net, FanoutConfig::default());

    let bridge = DiscoveryBridge::new(origin.svc.clone());
    bridge.on_peer_found(found(d.id())).await;
    let table = origin.svc.channel(&proto()).unwrap();
    assert!(table.outbound_peers().await.is_empty());

    origin.svc.broadcast(&proto(), "late\n").await.unwrap().ok().unwrap();
    assert_eq!(table.outbound_peers().await, vec![d.id()]);
    assert_eq!(d.next_text().await, "late");
}

/// One broken writer among four: one failure, three deliveries.
#[tokio::test]
async fn one_broken_peer_does_not_block_the_rest() {
    let net = MemoryNetwork::new();
    let origin = node(&net, FanoutConfig::default());
    let table = origin.svc.channel(&proto()).unwrap();

    let healthy: Vec<PeerId> = (1..=3).map(|b| PeerId::from_bytes([b; 32])).collect();
    for &peer in &healthy {
        table.insert_inbound(fake_inbound(peer, tokio::io::sink())).await;
    }
    let broken = PeerId::from_bytes([9; 32]);
    table.insert_inbound(fake_inbound(broken, BrokenWriter)).await;

    let result = origin.svc.broadcast(&proto(), "hello\n").await.unwrap();
    assert_eq!(result.deliveries.len(), 4);
    assert_eq!(result.delivered_peers(), healthy);
    assert_eq!(result.failed_peers(), vec![broken]);
    let failure = result.failures().next().unwrap();
    assert!(matches!(
        failure.outcome,
        Delivery::WriteFailed(_) | Delivery::FlushFailed(_)
    ));

    match result.ok() {
        Err(FanoutError::Broadcast { failed, .. }) => assert_eq!(failed, vec![broken]),
        other => panic!("expected partial failure, got {other:?}"),
    }
}

/// A hung peer times out, is dropped from the table, and does not hold
/// up delivery to the others.
#[tokio::test]
async fn hung_peer_times_out_and_is_removed() {
    let net = MemoryNetwork::new();
    let config = FanoutConfig {
        write_timeout: Duration::from_millis(100),
        close_timeout: Duration::from_millis(100),
        ..FanoutConfig::default()
    };
    let origin = node(&net, config);
    let table = origin.svc.channel(&proto()).unwrap();

    let fine = PeerId::from_bytes([1; 32]);
    let hung = PeerId::from_bytes([2; 32]);
    table.insert_inbound(fake_inbound(fine, tokio::io::sink())).await;
    table.insert_inbound(fake_inbound(hung, HungWriter)).await;

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        origin.svc.broadcast(&proto(), "hello\n"),
    )
    .await
    .expect("broadcast gated by hung peer")
    .unwrap();

    assert_eq!(result.delivered_peers(), vec![fine]);
    assert_eq!(result.failed_peers(), vec![hung]);
    assert!(table.inbound(&hung).await.is_none());
    assert!(table.inbound(&fine).await.is_some());
}

/// Successive broadcasts reach a peer in invocation order.
#[tokio::test]
async fn successive_broadcasts_arrive_in_order() {
    let net = MemoryNetwork::new();
    let origin = node(&net, FanoutConfig::default());
    let mut a = node(&net, FanoutConfig::default());
    origin.svc.connect_peer(&proto(), a.id()).await.unwrap();

    for i in 0..5 {
        origin.svc.broadcast(&proto(), format!("msg {i}\n")).await.unwrap();
    }
    for i in 0..5 {
        assert_eq!(a.next_text().await, format!("msg {i}"));
    }
}

/// Concurrent broadcasts never interleave bytes within a frame.
#[tokio::test]
async fn overlapping_broadcasts_keep_frames_intact() {
    let net = MemoryNetwork::new();
    let origin = node(&net, FanoutConfig::default());
    let mut a = node(&net, FanoutConfig::default());
    origin.svc.connect_peer(&proto(), a.id()).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..10 {
        let svc = origin.svc.clone();
        tasks.push(tokio::spawn(async move {
            let line = format!("{}\n", i.to_string().repeat(500));
            svc.broadcast(&proto(), line).await.unwrap()
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().is_success());
    }

    let mut got = Vec::new();
    for _ in 0..10 {
        got.push(a.next_text().await);
    }
    got.sort();
    let mut want: Vec<String> = (0..10).map(|i: i32| i.to_string().repeat(500)).collect();
    want.sort();
    assert_eq!(got, want);
}

/// Streams both ways: A's own outbound to origin is an inbound handle there.
#[tokio::test]
async fn inbound_handles_are_written_too() {
    let net = MemoryNetwork::new();
    let origin = node(&net, FanoutConfig::default());
    let mut a = node(&net, FanoutConfig::default());

    a.svc.connect_peer(&proto(), origin.id()).await.unwrap();
    let table = origin.svc.channel(&proto()).unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while table.inbound(&a.id()).await.is_none() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("inbound never installed");

    let result = origin
        .svc
        .broadcast(&proto(), "back at you\n")
        .await
        .unwrap();
    assert!(result
        .deliveries
        .iter()
        .any(|d| d.peer == a.id() && d.direction == Direction::Inbound && d.outcome.is_delivered()));
    assert_eq!(a.next_text().await, "back at you");
}

/// Shutdown closes every handle and the overlay.
#[tokio::test]
async fn shutdown_closes_everything() {
    let net = MemoryNetwork::new();
    let origin = node(&net, FanoutConfig::default());
    let a = node(&net, FanoutConfig::default());
    origin.svc.connect_peer(&proto(), a.id()).await.unwrap();
    let table = origin.svc.channel(&proto()).unwrap();
    let handle = table.outbound(&a.id()).await.unwrap();

    origin.svc.shutdown().await;
    assert!(table.is_empty().await);
    assert!(handle.is_closed());
    assert!(matches!(
        origin.svc.broadcast(&proto(), "x\n").await,
        Err(FanoutError::Shutdown)
    ));
}

/// Replacing a stuck inbound stream must not hold the table while the
/// old stream's write drains; the next broadcast to healthy peers runs
/// straight through.
#[tokio::test]
async fn replacing_hung_inbound_does_not_stall_broadcast() {
    let net = MemoryNetwork::new();
    let config = FanoutConfig {
        write_timeout: Duration::from_secs(5),
        close_timeout: Duration::from_secs(2),
        ..FanoutConfig::default()
    };
    let origin = node(&net, config);
    let table = origin.svc.channel(&proto()).unwrap();

    let fine = PeerId::from_bytes([1; 32]);
    let hung = PeerId::from_bytes([2; 32]);
    table.insert_inbound(fake_inbound(fine, tokio::io::sink())).await;
    let stuck = fake_inbound(hung, HungWriter);
    table.insert_inbound(stuck.clone()).await;

    // ── Step 1: a large broadcast parks on the hung writer ──
    let svc = origin.svc.clone();
    let first = tokio::spawn(async move { svc.broadcast(&proto(), vec![b'x'; 20 * 1024]).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!first.is_finished());

    // ── Step 2: the peer reconnects; its old stream is replaced ──
    let replacement = fake_inbound(hung, tokio::io::sink());
    let t = table.clone();
    let r = replacement.clone();
    let replacing = tokio::spawn(async move { t.insert_inbound(r).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(stuck.is_closed());

    // ── Step 3: the next broadcast is not gated by the old close ──
    let started = std::time::Instant::now();
    let result = origin.svc.broadcast(&proto(), "hi\n").await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(result.delivered_peers(), vec![fine, hung]);
    let installed = table.inbound(&hung).await.unwrap();
    assert!(Arc::ptr_eq(&installed, &replacement));

    replacing.await.unwrap();
    first.abort();
}

/// Shutdown lets an in-flight broadcast finish its frame before the
/// handle is closed.
#[tokio::test]
async fn shutdown_waits_for_in_flight_write() {
    let net = MemoryNetwork::new();
    let origin = node(&net, FanoutConfig::default());
    let table = origin.svc.channel(&proto()).unwrap();

    // The remote end only drains when we read it
    let (ours, mut theirs) = tokio::io::duplex(16);
    let peer = PeerId::from_bytes([3; 32]);
    table.insert_inbound(fake_inbound(peer, ours)).await;

    let frame = format!("{}\n", "y".repeat(1023));
    let svc = origin.svc.clone();
    let payload = frame.clone();
    let sending = tokio::spawn(async move { svc.broadcast(&proto(), payload).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!sending.is_finished());

    let svc = origin.svc.clone();
    let stopping = tokio::spawn(async move { svc.shutdown().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!stopping.is_finished());

    let mut got = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), theirs.read_to_end(&mut got))
        .await
        .expect("stream never closed")
        .unwrap();
    assert_eq!(got, frame.as_bytes());

    let result = sending.await.unwrap().unwrap();
    assert_eq!(result.delivered_peers(), vec![peer]);
    stopping.await.unwrap();
    assert!(table.is_empty().await);
}

/// A peer that cannot be opened is skipped by the next broadcasts until
/// its back-off runs out or discovery reports it again.
#[tokio::test]
async fn failed_open_backs_off_until_rediscovered() {
    let net = MemoryNetwork::new();
    let config = FanoutConfig {
        discovery_mode: DiscoveryMode::Deferred,
        open_backoff: Duration::from_millis(200),
        ..FanoutConfig::default()
    };
    let origin = node(&net, config);
    let bridge = DiscoveryBridge::new(origin.svc.clone());
    let gone = PeerId::from_bytes([7; 32]);
    bridge.on_peer_found(found(gone)).await;

    let open_failures = |r: fanout_core::BroadcastResult| -> Vec<PeerId> {
        r.open_failures.iter().map(|f| f.peer).collect()
    };

    // ── Step 1: first broadcast tries and fails ──
    let r = origin.svc.broadcast(&proto(), "a\n").await.unwrap();
    assert_eq!(open_failures(r), vec![gone]);

    // ── Step 2: the next one skips it ──
    let r = origin.svc.broadcast(&proto(), "b\n").await.unwrap();
    assert!(open_failures(r).is_empty());

    // ── Step 3: rediscovery lifts the back-off ──
    bridge.on_peer_found(found(gone)).await;
    let r = origin.svc.broadcast(&proto(), "c\n").await.unwrap();
    assert_eq!(open_failures(r), vec![gone]);

    // ── Step 4: so does waiting it out ──
    let r = origin.svc.broadcast(&proto(), "d\n").await.unwrap();
    assert!(open_failures(r).is_empty());
    tokio::time::sleep(Duration::from_millis(250)).await;
    let r = origin.svc.broadcast(&proto(), "e\n").await.unwrap();
    assert_eq!(open_failures(r), vec![gone]);
}
