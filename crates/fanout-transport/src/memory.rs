//! Process-local overlay: hosts on one [`MemoryNetwork`] reach each other
//! over `tokio::io::duplex` pipes, with links that can be partitioned and
//! healed to simulate peers dropping off.

use crate::{
    ConnectionState, HandlerRegistry, HostConfig, Overlay, PeerId, ProtocolId, Stream,
    StreamHandler, TransportError,
};

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::debug;

type LinkKey = (PeerId, PeerId);

fn link_key(a: PeerId, b: PeerId) -> LinkKey {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

struct Link {
    partitioned: bool,
    /// Cancelled when the link is cut; every stream over it fails.
    cut: CancellationToken,
}

impl Link {
    fn new() -> Self {
        Self {
            partitioned: false,
            cut: CancellationToken::new(),
        }
    }

    fn is_up(&self) -> bool {
        !self.partitioned && !self.cut.is_cancelled()
    }
}

#[derive(Default)]
struct Fabric {
    hosts: HashMap<PeerId, Weak<HostShared>>,
    links: HashMap<LinkKey, Link>,
}

struct NetInner {
    fabric: Mutex<Fabric>,
    config: HostConfig,
}

/// A simulated network of [`MemoryOverlay`] hosts.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetInner>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::with_config(HostConfig::new())
    }

    pub fn with_config(config: HostConfig) -> Self {
        Self {
            inner: Arc::new(NetInner {
                fabric: Mutex::new(Fabric::default()),
                config,
            }),
        }
    }

    /// Add a host with a fresh random identity.
    pub fn host(&self) -> Arc<MemoryOverlay> {
        self.host_with_id(PeerId::random())
    }

    /// Add a host with a fixed identity.
    pub fn host_with_id(&self, peer: PeerId) -> Arc<MemoryOverlay> {
        let shared = Arc::new(HostShared {
            peer,
            handlers: HandlerRegistry::new(),
            peerstore: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        });
        if let Ok(mut fabric) = self.inner.fabric.lock() {
            fabric.hosts.insert(peer, Arc::downgrade(&shared));
        }
        Arc::new(MemoryOverlay {
            shared,
            net: self.inner.clone(),
        })
    }

    /// Bring up a fresh link between two hosts and introduce them to
    /// each other. Heals a partition.
    pub fn connect(&self, a: PeerId, b: PeerId) {
        let Ok(mut fabric) = self.inner.fabric.lock() else {
            return;
        };
        if let Some(old) = fabric.links.insert(link_key(a, b), Link::new()) {
            old.cut.cancel();
        }
        for (host, other) in [(a, b), (b, a)] {
            if let Some(shared) = fabric.hosts.get(&host).and_then(Weak::upgrade) {
                shared.learn(other, Vec::new());
            }
        }
    }

    /// Partition the link between two hosts: open streams fail, new
    /// dials fail, and both sides report `NotConnected`.
    pub fn disconnect(&self, a: PeerId, b: PeerId) {
        let Ok(mut fabric) = self.inner.fabric.lock() else {
            return;
        };
        let link = fabric.links.entry(link_key(a, b)).or_insert_with(Link::new);
        link.partitioned = true;
        link.cut.cancel();
        debug!(a = %a.short(), b = %b.short(), "memory link partitioned");
    }

    pub fn is_partitioned(&self, a: PeerId, b: PeerId) -> bool {
        self.inner
            .fabric
            .lock()
            .map(|f| f.links.get(&link_key(a, b)).is_some_and(|l| l.partitioned))
            .unwrap_or(false)
    }
}

struct HostShared {
    peer: PeerId,
    handlers: HandlerRegistry,
    peerstore: Mutex<HashMap<PeerId, Vec<SocketAddr>>>,
    closed: CancellationToken,
}

impl HostShared {
    fn learn(&self, peer: PeerId, addrs: Vec<SocketAddr>) {
        if peer == self.peer {
            return;
        }
        if let Ok(mut store) = self.peerstore.lock() {
            let known = store.entry(peer).or_default();
            for addr in addrs {
                if !known.contains(&addr) {
                    known.push(addr);
                }
            }
        }
    }
}

/// One host on a [`MemoryNetwork`].
pub struct MemoryOverlay {
    shared: Arc<HostShared>,
    net: Arc<NetInner>,
}

impl MemoryOverlay {
    /// Registered protocols on this host.
    pub fn protocols(&self) -> Vec<ProtocolId> {
        self.shared.handlers.protocols()
    }

    fn dial_error(&self, peer: PeerId, reason: &'static str) -> TransportError {
        TransportError::Dial {
            peer,
            source: anyhow::anyhow!(reason),
        }
    }
}

#[async_trait::async_trait]
impl Overlay for MemoryOverlay {
    fn local_peer_id(&self) -> PeerId {
        self.shared.peer
    }

    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: &ProtocolId,
    ) -> Result<Stream, TransportError> {
        if self.shared.closed.is_cancelled() {
            return Err(TransportError::Shutdown);
        }
        if peer == self.shared.peer {
            return Err(self.dial_error(peer, "cannot dial self"));
        }

        let (remote, cut) = {
            let mut fabric = self
                .net
                .fabric
                .lock()
                .map_err(|_| TransportError::Shutdown)?;
            let remote = fabric
                .hosts
                .get(&peer)
                .and_then(Weak::upgrade)
                .filter(|h| !h.closed.is_cancelled())
                .ok_or_else(|| self.dial_error(peer, "no such host on this network"))?;
            let link = fabric
                .links
                .entry(link_key(self.shared.peer, peer))
                .or_insert_with(Link::new);
            if link.partitioned {
                return Err(self.dial_error(peer, "link partitioned"));
            }
            if link.cut.is_cancelled() {
                *link = Link::new();
            }
            (remote, link.cut.clone())
        };

        if !remote.handlers.supports(protocol.as_str()) {
            return Err(TransportError::UnsupportedProtocol {
                peer,
                protocol: protocol.clone(),
            });
        }

        let (ours, theirs) = tokio::io::duplex(self.net.config.memory_buffer);
        let (our_r, our_w) = tokio::io::split(ours);
        let (their_r, their_w) = tokio::io::split(theirs);

        remote.learn(self.shared.peer, Vec::new());
        self.shared.learn(peer, Vec::new());

        let accepted = Stream::new(
            self.shared.peer,
            protocol.clone(),
            LinkGuarded::new(their_r, cut.clone()),
            LinkGuarded::new(their_w, cut.clone()),
        );
        if !remote.handlers.dispatch(accepted) {
            return Err(TransportError::UnsupportedProtocol {
                peer,
                protocol: protocol.clone(),
            });
        }

        debug!(peer = %peer.short(), protocol = %protocol, "memory stream opened");
        Ok(Stream::new(
            peer,
            protocol.clone(),
            LinkGuarded::new(our_r, cut.clone()),
            LinkGuarded::new(our_w, cut),
        ))
    }

    fn set_stream_handler(&self, protocol: ProtocolId, handler: Arc<dyn StreamHandler>) {
        self.shared.handlers.set(protocol, handler);
    }

    fn remove_stream_handler(&self, protocol: &ProtocolId) {
        self.shared.handlers.remove(protocol);
    }

    fn connection_state(&self, peer: &PeerId) -> ConnectionState {
        let Ok(fabric) = self.net.fabric.lock() else {
            return ConnectionState::NotConnected;
        };
        let link_up = fabric
            .links
            .get(&link_key(self.shared.peer, *peer))
            .is_some_and(Link::is_up);
        let remote_up = fabric
            .hosts
            .get(peer)
            .and_then(Weak::upgrade)
            .is_some_and(|h| !h.closed.is_cancelled());
        if link_up && remote_up && !self.shared.closed.is_cancelled() {
            ConnectionState::Connected
        } else {
            ConnectionState::NotConnected
        }
    }

    fn known_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .shared
            .peerstore
            .lock()
            .map(|s| s.keys().copied().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    async fn add_peer_addrs(&self, peer: PeerId, addrs: Vec<SocketAddr>) {
        self.shared.learn(peer, addrs);
    }

    async fn close(&self) {
        self.shared.closed.cancel();
        self.shared.handlers.clear();
        let me = self.shared.peer;
        if let Ok(mut fabric) = self.net.fabric.lock() {
            fabric.hosts.remove(&me);
            fabric.links.retain(|(a, b), link| {
                let ours = *a == me || *b == me;
                if ours {
                    link.cut.cancel();
                }
                !ours
            });
        }
        debug!(peer = %me.short(), "memory host closed");
    }
}

/// Stream half that fails once its link is cut.
struct LinkGuarded<T> {
    inner: T,
    cut: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<T> LinkGuarded<T> {
    fn new(inner: T, token: CancellationToken) -> Self {
        Self {
            inner,
            cut: Box::pin(token.cancelled_owned()),
        }
    }

    fn is_cut(&mut self, cx: &mut Context<'_>) -> bool {
        self.cut.as_mut().poll(cx).is_ready()
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for LinkGuarded<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.is_cut(cx) {
            return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for LinkGuarded<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.is_cut(cx) {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.is_cut(cx) {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.is_cut(cx) {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
