use crate::config::HostConfig;
use crate::connection::{ConnectionTracker, Tracked};
use crate::protocol::{read_line_bounded, Hello, Reply};
use crate::{
    ConnectionState, HandlerRegistry, Overlay, PeerAddr, PeerId, ProtocolId, Stream,
    StreamHandler, TransportError,
};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// An overlay host over plain TCP, one connection per stream.
///
/// Every stream is its own TCP connection. The dialer opens with a
/// one-line [`Hello`] naming itself and the protocol; the listener answers
/// with its own identity or rejects protocols it has no handler for.
pub struct TcpOverlay {
    inner: Arc<Inner>,
}

struct Inner {
    id: PeerId,
    listen_addr: SocketAddr,
    config: HostConfig,
    handlers: HandlerRegistry,
    peerstore: Mutex<HashMap<PeerId, Vec<SocketAddr>>>,
    tracker: ConnectionTracker,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl TcpOverlay {
    /// Create and bind a new host with a fresh random identity.
    pub async fn bind(config: HostConfig) -> Result<Self, TransportError> {
        Self::bind_with_id(PeerId::random(), config).await
    }

    /// Create and bind a new host with a fixed identity.
    pub async fn bind_with_id(id: PeerId, config: HostConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(TransportError::Bind)?;
        let listen_addr = listener.local_addr().map_err(TransportError::Bind)?;

        let inner = Arc::new(Inner {
            id,
            listen_addr,
            config,
            handlers: HandlerRegistry::new(),
            peerstore: Mutex::new(HashMap::new()),
            tracker: ConnectionTracker::new(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });

        inner.tasks.spawn(accept_loop(inner.clone(), listener));
        info!(peer = %id.short(), addr = %listen_addr, "tcp overlay listening");

        Ok(Self { inner })
    }

    /// The bound listen address.
    pub fn listen_addr(&self) -> SocketAddr {
        self.inner.listen_addr
    }

    /// Our identity plus listen address, in the form other hosts bootstrap from.
    pub fn peer_addr(&self) -> PeerAddr {
        PeerAddr {
            peer: self.inner.id,
            addr: self.inner.listen_addr,
        }
    }

    /// Addresses currently recorded for `peer`.
    pub fn peer_addrs(&self, peer: &PeerId) -> Vec<SocketAddr> {
        self.inner
            .peerstore
            .lock()
            .ok()
            .and_then(|s| s.get(peer).cloned())
            .unwrap_or_default()
    }

    async fn dial(&self, peer: PeerId) -> Result<TcpStream, TransportError> {
        let addrs = self.peer_addrs(&peer);
        if addrs.is_empty() {
            return Err(TransportError::NoAddress(peer));
        }

        let mut last_err = anyhow::anyhow!("no address answered");
        for addr in addrs {
            match tokio::time::timeout(self.inner.config.dial_timeout, TcpStream::connect(addr))
                .await
            {
                Ok(Ok(socket)) => {
                    let _ = socket.set_nodelay(true);
                    return Ok(socket);
                }
                Ok(Err(e)) => {
                    debug!(peer = %peer.short(), %addr, error = %e, "dial attempt failed");
                    last_err = e.into();
                }
                Err(_) => {
                    debug!(peer = %peer.short(), %addr, "dial attempt timed out");
                    last_err = anyhow::anyhow!("connect to {addr} timed out");
                }
            }
        }
        Err(TransportError::Dial {
            peer,
            source: last_err,
        })
    }
}

#[async_trait::async_trait]
impl Overlay for TcpOverlay {
    fn local_peer_id(&self) -> PeerId {
        self.inner.id
    }

    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: &ProtocolId,
    ) -> Result<Stream, TransportError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(TransportError::Shutdown);
        }

        let socket = self.dial(peer).await?;
        let (read, mut write) = socket.into_split();
        let mut reader = BufReader::new(read);

        let hello = Hello {
            peer: self.inner.id,
            listen: Some(self.inner.listen_addr),
            protocol: protocol.clone(),
        };
        let handshake = async {
            write.write_all(hello.encode().as_bytes()).await?;
            write.flush().await?;
            read_line_bounded(&mut reader, self.inner.config.max_handshake_len).await
        };
        let line = tokio::time::timeout(self.inner.config.handshake_timeout, handshake)
            .await
            .map_err(|_| TransportError::Timeout(self.inner.config.handshake_timeout))?
            .map_err(|e| TransportError::Handshake {
                peer,
                reason: e.to_string(),
            })?;

        match Reply::parse(&line).map_err(|reason| TransportError::Handshake { peer, reason })? {
            Reply::Reject => Err(TransportError::UnsupportedProtocol {
                peer,
                protocol: protocol.clone(),
            }),
            Reply::Accept(remote) if remote != peer => Err(TransportError::Handshake {
                peer,
                reason: format!("listener identified as {remote}"),
            }),
            Reply::Accept(_) => {
                let lease = self.inner.tracker.register(peer);
                debug!(peer = %peer.short(), protocol = %protocol, "stream opened");
                Ok(Stream::new(
                    peer,
                    protocol.clone(),
                    Tracked::new(reader, lease.clone()),
                    Tracked::new(write, lease),
                ))
            }
        }
    }

    fn set_stream_handler(&self, protocol: ProtocolId, handler: Arc<dyn StreamHandler>) {
        self.inner.handlers.set(protocol, handler);
    }

    fn remove_stream_handler(&self, protocol: &ProtocolId) {
        self.inner.handlers.remove(protocol);
    }

    fn connection_state(&self, peer: &PeerId) -> ConnectionState {
        self.inner.tracker.state(peer)
    }

    fn known_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .inner
            .peerstore
            .lock()
            .map(|s| s.keys().copied().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    async fn add_peer_addrs(&self, peer: PeerId, addrs: Vec<SocketAddr>) {
        self.inner.record(peer, addrs);
    }

    async fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.handlers.clear();
        self.inner.tracker.clear();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!(peer = %self.inner.id.short(), "tcp overlay closed");
    }
}

impl Inner {
    fn record(&self, peer: PeerId, addrs: Vec<SocketAddr>) {
        if peer == self.id {
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

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, remote)) => {
                    let inner2 = inner.clone();
                    inner.tasks.spawn(async move {
                        if let Err(e) = accept_one(&inner2, socket, remote).await {
                            debug!(%remote, error = %e, "inbound handshake failed");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }
    }
    debug!("accept loop stopped");
}

async fn accept_one(
    inner: &Inner,
    socket: TcpStream,
    remote: SocketAddr,
) -> Result<(), TransportError> {
    let _ = socket.set_nodelay(true);
    let (read, mut write) = socket.into_split();
    let mut reader = BufReader::new(read);

    let timeout = inner.config.handshake_timeout;
    let line = tokio::time::timeout(
        timeout,
        read_line_bounded(&mut reader, inner.config.max_handshake_len),
    )
    .await
    .map_err(|_| TransportError::Timeout(timeout))?
    .map_err(TransportError::Io)?;

    let hello = Hello::parse(&line).map_err(|reason| {
        TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, reason))
    })?;

    if !inner.handlers.supports(hello.protocol.as_str()) {
        debug!(peer = %hello.peer.short(), protocol = %hello.protocol, "rejecting unsupported protocol");
        write
            .write_all(Reply::Reject.encode().as_bytes())
            .await
            .map_err(TransportError::Io)?;
        let _ = write.shutdown().await;
        return Ok(());
    }

    write
        .write_all(Reply::Accept(inner.id).encode().as_bytes())
        .await
        .map_err(TransportError::Io)?;
    write.flush().await.map_err(TransportError::Io)?;

    if let Some(mut listen) = hello.listen {
        // A wildcard bind advertises 0.0.0.0; dial back on the source IP
        if listen.ip().is_unspecified() {
            listen.set_ip(remote.ip());
        }
        inner.record(hello.peer, vec![listen]);
    }

    let lease = inner.tracker.register(hello.peer);
    let stream = Stream::new(
        hello.peer,
        hello.protocol,
        Tracked::new(reader, lease.clone()),
        Tracked::new(write, lease),
    );
    inner.handlers.dispatch(stream);
    Ok(())
}
