//! Per-protocol registry of inbound and outbound stream handles.

use crate::error::FanoutError;
use crate::handle::{Direction, StreamHandle};
use crate::liveness::LivenessProber;

use fanout_transport::{PeerId, ProtocolId, Stream};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Outcome of [`PeerStreamTable::ensure_outbound`].
#[derive(Debug, Clone)]
pub enum Ensured {
    /// A handle was already installed.
    Existing(Arc<StreamHandle>),
    /// The opener ran and its handle was installed.
    Opened(Arc<StreamHandle>),
}

impl Ensured {
    pub fn handle(&self) -> &Arc<StreamHandle> {
        match self {
            Ensured::Existing(h) | Ensured::Opened(h) => h,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Ensured::Opened(_))
    }
}

#[derive(Default)]
struct Entries {
    inbound: HashMap<PeerId, Arc<StreamHandle>>,
    outbound: HashMap<PeerId, Arc<StreamHandle>>,
}

impl Entries {
    fn side(&mut self, direction: Direction) -> &mut HashMap<PeerId, Arc<StreamHandle>> {
        match direction {
            Direction::Inbound => &mut self.inbound,
            Direction::Outbound => &mut self.outbound,
        }
    }
}

/// At most one handle per peer per direction for one protocol.
///
/// All mutation happens under one async lock. Handles are closed after
/// they leave the maps, outside the lock, so a peer with a stuck write
/// never holds up the others. A replaced inbound handle is marked closed
/// before its successor is installed.
pub struct PeerStreamTable {
    protocol: ProtocolId,
    entries: Mutex<Entries>,
    close_timeout: Duration,
}

impl PeerStreamTable {
    pub fn new(protocol: ProtocolId, close_timeout: Duration) -> Self {
        Self {
            protocol,
            entries: Mutex::new(Entries::default()),
            close_timeout,
        }
    }

    pub fn protocol(&self) -> &ProtocolId {
        &self.protocol
    }

    /// Drop every outbound handle whose peer the prober reports as
    /// not connected. Returns the pruned peers.
    pub async fn prune(&self, prober: &dyn LivenessProber) -> Vec<PeerId> {
        let removed: Vec<Arc<StreamHandle>> = {
            let mut entries = self.entries.lock().await;
            let dead: Vec<PeerId> = entries
                .outbound
                .keys()
                .filter(|peer| !prober.is_connected(peer))
                .copied()
                .collect();
            dead.iter()
                .filter_map(|peer| entries.outbound.remove(peer))
                .collect()
        };

        let mut pruned = Vec::with_capacity(removed.len());
        for handle in removed {
            debug!(peer = %handle.peer().short(), protocol = %self.protocol, "pruning disconnected peer");
            pruned.push(handle.peer());
            self.teardown(handle).await;
        }
        pruned
    }

    /// Return the outbound handle for `peer`, opening one with `open` if
    /// none is installed. On failure the table is unchanged.
    ///
    /// The lock is not held while opening. If a concurrent caller
    /// installed a handle in the meantime, ours is closed and theirs wins.
    pub async fn ensure_outbound<F, Fut>(&self, peer: PeerId, open: F) -> Result<Ensured, FanoutError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Stream, FanoutError>>,
    {
        if let Some(existing) = self.entries.lock().await.outbound.get(&peer) {
            return Ok(Ensured::Existing(existing.clone()));
        }

        let stream = open().await?;
        let fresh = Arc::new(StreamHandle::new(stream, Direction::Outbound));

        let winner = {
            let mut entries = self.entries.lock().await;
            match entries.outbound.get(&peer) {
                Some(installed) => Some(installed.clone()),
                None => {
                    entries.outbound.insert(peer, fresh.clone());
                    None
                }
            }
        };

        match winner {
            Some(installed) => {
                debug!(peer = %peer.short(), protocol = %self.protocol, "lost outbound open race");
                self.teardown(fresh).await;
                Ok(Ensured::Existing(installed))
            }
            None => {
                debug!(peer = %peer.short(), protocol = %self.protocol, "outbound stream installed");
                Ok(Ensured::Opened(fresh))
            }
        }
    }

    /// Install an accepted stream, closing the handle it replaces.
    ///
    /// The replaced handle rejects writes before its successor becomes
    /// visible. Its close runs after the lock is released, since it waits
    /// out any write still in progress.
    pub async fn insert_inbound(&self, handle: Arc<StreamHandle>) {
        let replaced = {
            let mut entries = self.entries.lock().await;
            let old = entries
                .inbound
                .insert(handle.peer(), handle.clone())
                .filter(|old| !Arc::ptr_eq(old, &handle));
            if let Some(old) = &old {
                old.mark_closed();
            }
            old
        };
        if let Some(old) = replaced {
            debug!(peer = %handle.peer().short(), protocol = %self.protocol, "replacing inbound stream");
            self.teardown(old).await;
        }
    }

    /// Drop and close both handles for `peer`. Returns how many were removed.
    pub async fn remove(&self, peer: &PeerId) -> usize {
        let removed: Vec<Arc<StreamHandle>> = {
            let mut entries = self.entries.lock().await;
            [entries.inbound.remove(peer), entries.outbound.remove(peer)]
                .into_iter()
                .flatten()
                .collect()
        };
        let count = removed.len();
        for handle in removed {
            self.teardown(handle).await;
        }
        count
    }

    /// Drop `handle` if it is still the installed one, then close it.
    /// A replacement installed under the same peer is left alone.
    pub async fn remove_handle(&self, handle: &Arc<StreamHandle>) -> bool {
        let removed = {
            let mut entries = self.entries.lock().await;
            let side = entries.side(handle.direction());
            let current = side
                .get(&handle.peer())
                .is_some_and(|installed| Arc::ptr_eq(installed, handle));
            if current {
                side.remove(&handle.peer());
            }
            current
        };
        self.teardown(handle.clone()).await;
        removed
    }

    /// Point-in-time references to every inbound and outbound handle.
    pub async fn snapshot(&self) -> Vec<Arc<StreamHandle>> {
        let entries = self.entries.lock().await;
        entries
            .inbound
            .values()
            .chain(entries.outbound.values())
            .cloned()
            .collect()
    }

    /// Close everything. Shutdown path.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<StreamHandle>> = {
            let mut entries = self.entries.lock().await;
            let mut all: Vec<_> = entries.inbound.drain().map(|(_, h)| h).collect();
            all.extend(entries.outbound.drain().map(|(_, h)| h));
            all
        };
        for handle in drained {
            self.teardown(handle).await;
        }
    }

    pub async fn outbound(&self, peer: &PeerId) -> Option<Arc<StreamHandle>> {
        self.entries.lock().await.outbound.get(peer).cloned()
    }

    pub async fn inbound(&self, peer: &PeerId) -> Option<Arc<StreamHandle>> {
        self.entries.lock().await.inbound.get(peer).cloned()
    }

    /// Peers with an outbound handle, sorted.
    pub async fn outbound_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self.entries.lock().await.outbound.keys().copied().collect();
        peers.sort();
        peers
    }

    /// Peers with an inbound handle, sorted.
    pub async fn inbound_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self.entries.lock().await.inbound.keys().copied().collect();
        peers.sort();
        peers
    }

    /// Total handles across both directions.
    pub async fn len(&self) -> usize {
        let entries = self.entries.lock().await;
        entries.inbound.len() + entries.outbound.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn teardown(&self, handle: Arc<StreamHandle>) {
        match tokio::time::timeout(self.close_timeout, handle.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(peer = %handle.peer().short(), protocol = %self.protocol, error = %e, "error closing stream");
            }
            Err(_) => {
                warn!(peer = %handle.peer().short(), protocol = %self.protocol, "stream close timed out");
            }
        }
    }
}
