use crate::error::FanoutError;
use crate::handle::Direction;

use fanout_transport::{PeerId, ProtocolId};

/// What happened to one handle during a broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    WriteFailed(String),
    FlushFailed(String),
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Delivery::Delivered)
    }
}

impl std::fmt::Display for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Delivery::Delivered => write!(f, "delivered"),
            Delivery::WriteFailed(reason) => write!(f, "write failed: {reason}"),
            Delivery::FlushFailed(reason) => write!(f, "flush failed: {reason}"),
        }
    }
}

impl From<Result<(), FanoutError>> for Delivery {
    fn from(result: Result<(), FanoutError>) -> Self {
        match result {
            Ok(()) => Delivery::Delivered,
            Err(e @ FanoutError::Flush { .. }) => Delivery::FlushFailed(e.to_string()),
            Err(e) => Delivery::WriteFailed(e.to_string()),
        }
    }
}

/// Outcome for one attempted handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDelivery {
    pub peer: PeerId,
    pub direction: Direction,
    pub outcome: Delivery,
}

/// A peer whose outbound stream could not be opened during the pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFailure {
    pub peer: PeerId,
    pub reason: String,
}

/// Aggregated outcome of one broadcast.
///
/// Every handle in the snapshot is attempted; the broadcast succeeds iff
/// every attempt delivered. Failed open attempts are reported but do not
/// count against success: those peers had no handle to attempt.
#[derive(Debug, Clone)]
pub struct BroadcastResult {
    pub protocol: ProtocolId,
    /// Outbound peers dropped by the pre-write prune.
    pub pruned: Vec<PeerId>,
    pub open_failures: Vec<OpenFailure>,
    /// Sorted by peer, then direction.
    pub deliveries: Vec<PeerDelivery>,
}

impl BroadcastResult {
    pub fn is_success(&self) -> bool {
        self.deliveries.iter().all(|d| d.outcome.is_delivered())
    }

    /// Attempts that did not deliver.
    pub fn failures(&self) -> impl Iterator<Item = &PeerDelivery> {
        self.deliveries.iter().filter(|d| !d.outcome.is_delivered())
    }

    /// Peers that received the payload on at least one handle.
    pub fn delivered_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .deliveries
            .iter()
            .filter(|d| d.outcome.is_delivered())
            .map(|d| d.peer)
            .collect();
        peers.dedup();
        peers
    }

    pub fn failed_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.failures().map(|d| d.peer).collect();
        peers.dedup();
        peers
    }

    /// Turn a partial failure into an error naming the failed peers.
    /// Peers that succeeded still received the payload.
    pub fn ok(self) -> Result<Self, FanoutError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(FanoutError::Broadcast {
                failed: self.failed_peers(),
                protocol: self.protocol,
            })
        }
    }
}
