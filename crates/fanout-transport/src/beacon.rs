//! LAN peer discovery over UDP multicast.
//!
//! Every host periodically multicasts a small JSON announcement naming its
//! identity and listen addresses. Announcements from other hosts in the
//! same namespace become [`PeerFound`] events.

use crate::{PeerId, TransportError};

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A peer reported by discovery, with the addresses it can be dialed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerFound {
    pub peer: PeerId,
    pub addrs: Vec<SocketAddr>,
}

/// Configuration for the multicast [`Beacon`].
#[derive(Debug, Clone)]
pub struct BeaconConfig {
    pub(crate) namespace: String,
    pub(crate) group: Ipv4Addr,
    pub(crate) port: u16,
    pub(crate) interface: Ipv4Addr,
    pub(crate) interval: Duration,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl BeaconConfig {
    pub fn new() -> Self {
        Self {
            namespace: "fanout".to_string(),
            group: Ipv4Addr::new(239, 255, 70, 77),
            port: 47474,
            interface: Ipv4Addr::UNSPECIFIED,
            interval: Duration::from_secs(2),
        }
    }

    /// Only hosts announcing the same namespace discover each other.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Multicast group and port (default: `239.255.70.77:47474`).
    pub fn group(mut self, group: Ipv4Addr, port: u16) -> Self {
        self.group = group;
        self.port = port;
        self
    }

    /// Local interface to join the group on (default: any).
    pub fn interface(mut self, interface: Ipv4Addr) -> Self {
        self.interface = interface;
        self
    }

    /// Announcement period (default: 2 s).
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Announcement {
    namespace: String,
    peer: PeerId,
    addrs: Vec<SocketAddr>,
}

impl Announcement {
    fn decode(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }

    /// Replace wildcard IPs with the IP the datagram came from.
    fn resolve(mut self, source: SocketAddr) -> Self {
        for addr in &mut self.addrs {
            if addr.ip().is_unspecified() {
                addr.set_ip(source.ip());
            }
        }
        self
    }
}

/// Remembers what has already been reported so each (peer, addrs) pair
/// is emitted once.
#[derive(Default)]
struct Seen(HashMap<PeerId, Vec<SocketAddr>>);

impl Seen {
    fn observe(&mut self, peer: PeerId, addrs: &[SocketAddr]) -> bool {
        let mut sorted = addrs.to_vec();
        sorted.sort();
        match self.0.get(&peer) {
            Some(known) if *known == sorted => false,
            _ => {
                self.0.insert(peer, sorted);
                true
            }
        }
    }
}

/// Periodic multicast announcer and listener.
pub struct Beacon {
    config: BeaconConfig,
    announcement: Announcement,
    socket: UdpSocket,
}

impl Beacon {
    /// Join the multicast group. Must be called within a tokio runtime.
    pub fn bind(
        config: BeaconConfig,
        peer: PeerId,
        addrs: Vec<SocketAddr>,
    ) -> Result<Self, TransportError> {
        let socket = Self::socket(&config).map_err(TransportError::Bind)?;
        let announcement = Announcement {
            namespace: config.namespace.clone(),
            peer,
            addrs,
        };
        Ok(Self {
            config,
            announcement,
            socket,
        })
    }

    fn socket(config: &BeaconConfig) -> std::io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.bind(&SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port)).into())?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_multicast_ttl_v4(1)?;
        socket.join_multicast_v4(&config.group, &config.interface)?;
        socket.set_nonblocking(true)?;
        UdpSocket::from_std(socket.into())
    }

    /// Announce and listen until `shutdown` fires or `events` is closed.
    pub async fn run(self, events: mpsc::Sender<PeerFound>, shutdown: CancellationToken) {
        let target = SocketAddr::from(SocketAddrV4::new(self.config.group, self.config.port));
        let payload = match serde_json::to_vec(&self.announcement) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "cannot encode beacon announcement");
                return;
            }
        };
        let mut ticker = tokio::time::interval(self.config.interval);
        let mut seen = Seen::default();
        let mut buf = vec![0u8; 2048];

        info!(namespace = %self.config.namespace, group = %target, "beacon started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.socket.send_to(&payload, target).await {
                        debug!(error = %e, "beacon send failed");
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (n, source) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            debug!(error = %e, "beacon recv failed");
                            continue;
                        }
                    };
                    let Some(found) = self.accept(&buf[..n], source, &mut seen) else {
                        continue;
                    };
                    debug!(peer = %found.peer.short(), addrs = ?found.addrs, "beacon discovered peer");
                    if events.send(found).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("beacon stopped");
    }

    fn accept(&self, bytes: &[u8], source: SocketAddr, seen: &mut Seen) -> Option<PeerFound> {
        let Some(ann) = Announcement::decode(bytes) else {
            debug!(%source, "ignoring undecodable beacon");
            return None;
        };
        if ann.namespace != self.announcement.namespace || ann.peer == self.announcement.peer {
            return None;
        }
        let ann = ann.resolve(source);
        if !seen.observe(ann.peer, &ann.addrs) {
            return None;
        }
        Some(PeerFound {
            peer: ann.peer,
            addrs: ann.addrs,
        })
    }
}
