//! fanout transport layer.
//!
//! Provides the overlay host abstraction the fan-out engine runs on:
//! addressed, per-protocol duplex byte streams between peers, a handler
//! dispatch table for accepted streams, and connection-state queries.
//!
//! Two hosts implement [`Overlay`]: [`TcpOverlay`] (one TCP connection per
//! stream, with a one-line handshake) and [`MemoryOverlay`] (process-local
//! links over `tokio::io::duplex`, used by tests and simulations).
//!
//! # Quick start
//!
//! ```rust,no_run
//! use fanout_transport::{HostConfig, Overlay, ProtocolId, TcpOverlay};
//! use tokio::io::AsyncWriteExt;
//!
//! # async fn example() -> Result<(), fanout_transport::TransportError> {
//! let host = TcpOverlay::bind(HostConfig::new()).await?;
//! println!("We are {} on {}", host.local_peer_id(), host.listen_addr());
//!
//! let peer = "aa".repeat(32).parse()?;
//! host.add_peer_addrs(peer, vec!["127.0.0.1:4001".parse().unwrap()]).await;
//!
//! let stream = host.open_stream(peer, &ProtocolId::new("/broadcast/1.0.0")).await?;
//! let (_reader, mut writer) = stream.into_split();
//! writer.write_all(b"hello\n").await.map_err(fanout_transport::TransportError::Io)?;
//!
//! host.close().await;
//! # Ok(())
//! # }
//! ```

mod beacon;
mod config;
mod connection;
mod error;
mod memory;
mod node;
mod overlay;
mod protocol;
mod stream;

pub use beacon::{Beacon, BeaconConfig, PeerFound};
pub use config::HostConfig;
pub use error::TransportError;
pub use memory::{MemoryNetwork, MemoryOverlay};
pub use node::TcpOverlay;
pub use overlay::Overlay;
pub use protocol::{HandlerRegistry, StreamHandler};
pub use stream::{BoxedRead, BoxedWrite, ConnectionState, Stream};

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Peer identity: 32 random bytes.
///
/// Displayed and parsed as a lowercase hex string.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Generate a fresh random identity.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw 32 bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({}...)", self.short())
    }
}

impl FromStr for PeerId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|_| TransportError::InvalidPeerId(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl serde::Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Name of a logical channel multiplexed over the overlay,
/// e.g. `/broadcast/1.0.0`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolId(Arc<str>);

impl ProtocolId {
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProtocolId({})", self.0)
    }
}

impl From<&str> for ProtocolId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl Borrow<str> for ProtocolId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A peer identity paired with a dialable address: `<peer-hex>@<ip:port>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr {
    pub peer: PeerId,
    pub addr: std::net::SocketAddr,
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.peer, self.addr)
    }
}

impl FromStr for PeerAddr {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (peer, addr) = s
            .split_once('@')
            .ok_or_else(|| TransportError::InvalidPeerAddr(s.to_string()))?;
        let peer = peer.parse()?;
        let addr = addr
            .parse()
            .map_err(|_| TransportError::InvalidPeerAddr(s.to_string()))?;
        Ok(Self { peer, addr })
    }
}
