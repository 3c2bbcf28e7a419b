use fanout_transport::{ConnectionState, Overlay, PeerId};

/// Answers whether a peer is currently reachable.
///
/// Every overlay host is a prober. Tests script one directly.
pub trait LivenessProber: Send + Sync {
    fn state(&self, peer: &PeerId) -> ConnectionState;

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.state(peer) == ConnectionState::Connected
    }
}

impl<O: Overlay> LivenessProber for O {
    fn state(&self, peer: &PeerId) -> ConnectionState {
        self.connection_state(peer)
    }
}

#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Prober whose answers are set by the test.
    #[derive(Default)]
    pub struct ScriptedProber {
        connected: Mutex<HashSet<PeerId>>,
    }

    impl ScriptedProber {
        pub fn connected(peers: &[PeerId]) -> Self {
            Self {
                connected: Mutex::new(peers.iter().copied().collect()),
            }
        }

        pub fn drop_peer(&self, peer: PeerId) {
            self.connected.lock().unwrap().remove(&peer);
        }
    }

    impl LivenessProber for ScriptedProber {
        fn state(&self, peer: &PeerId) -> ConnectionState {
            if self.connected.lock().unwrap().contains(peer) {
                ConnectionState::Connected
            } else {
                ConnectionState::NotConnected
            }
        }
    }
}
