use crate::table::PeerStreamTable;

use fanout_transport::ProtocolId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// One [`PeerStreamTable`] per registered protocol.
pub struct Channels {
    tables: RwLock<HashMap<ProtocolId, Arc<PeerStreamTable>>>,
    close_timeout: Duration,
}

impl Channels {
    pub fn new(close_timeout: Duration) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            close_timeout,
        }
    }

    /// Table for `protocol`, created on first use.
    pub fn register(&self, protocol: &ProtocolId) -> Arc<PeerStreamTable> {
        if let Some(table) = self.get(protocol) {
            return table;
        }
        let fresh = Arc::new(PeerStreamTable::new(protocol.clone(), self.close_timeout));
        match self.tables.write() {
            Ok(mut tables) => tables.entry(protocol.clone()).or_insert(fresh).clone(),
            Err(_) => fresh,
        }
    }

    pub fn get(&self, protocol: &ProtocolId) -> Option<Arc<PeerStreamTable>> {
        self.tables.read().ok()?.get(protocol).cloned()
    }

    /// Every table, sorted by protocol.
    pub fn all(&self) -> Vec<Arc<PeerStreamTable>> {
        let mut tables: Vec<_> = self
            .tables
            .read()
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default();
        tables.sort_by(|a: &Arc<PeerStreamTable>, b| a.protocol().cmp(b.protocol()));
        tables
    }

    pub fn protocols(&self) -> Vec<ProtocolId> {
        self.all().iter().map(|t| t.protocol().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent() {
        let channels = Channels::new(Duration::from_secs(1));
        let p = ProtocolId::new("/broadcast/1.0.0");
        let first = channels.register(&p);
        let second = channels.register(&p);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(channels.get(&ProtocolId::new("/other/1.0.0")).is_none());
    }

    #[test]
    fn protocols_sorted() {
        let channels = Channels::new(Duration::from_secs(1));
        channels.register(&ProtocolId::new("/b/1"));
        channels.register(&ProtocolId::new("/a/1"));
        assert_eq!(
            channels.protocols(),
            vec![ProtocolId::new("/a/1"), ProtocolId::new("/b/1")]
        );
    }
}
