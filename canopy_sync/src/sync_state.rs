use canopy_core::{CoreEvent, Namespace, NamespaceMap, PeerId};
use canopy_cores::{CoreManagerEvent, CoreRecord};

use crate::{
    core_state::PeerStatus,
    namespace_state::{NamespaceState, NamespaceSyncState},
};

pub type NamespaceStates = NamespaceMap<NamespaceState>;

/// Sync state of every namespace, kept current from core manager events.
#[derive(Debug)]
pub struct SyncState {
    namespaces: NamespaceMap<NamespaceSyncState>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncState {
    pub fn new() -> Self {
        Self {
            namespaces: NamespaceMap::from_fn(NamespaceSyncState::new),
        }
    }

    pub fn namespace(&self, namespace: Namespace) -> &NamespaceSyncState {
        &self.namespaces[namespace]
    }

    pub fn add_core(&mut self, record: &CoreRecord) -> bool {
        self.namespaces[record.namespace].add_core(record.core.clone())
    }

    /// Applies an event. Returns whether the state may have changed.
    pub fn handle_event(&mut self, event: &CoreManagerEvent) -> bool {
        match event {
            CoreManagerEvent::AddCore(record) => self.add_core(record),
            CoreManagerEvent::PeerHave(have) => {
                self.namespaces[have.namespace].apply_peer_bitfield(
                    &have.discovery_key,
                    have.peer,
                    have.start,
                    have.length,
                    &have.bitfield,
                );
                true
            }
            CoreManagerEvent::Core {
                namespace,
                discovery_key,
                event,
            } => {
                let ns = &mut self.namespaces[*namespace];
                match event {
                    CoreEvent::Append { .. } | CoreEvent::Download { .. } => ns.invalidate(),
                    CoreEvent::PeerAdd(peer) => {
                        ns.set_peer_status(discovery_key, *peer, PeerStatus::Connected)
                    }
                    CoreEvent::PeerRemove(peer) => {
                        ns.set_peer_status(discovery_key, *peer, PeerStatus::Disconnected)
                    }
                    CoreEvent::PeerBitfield {
                        peer,
                        start,
                        length,
                        bitfield,
                    } => ns.apply_peer_bitfield(discovery_key, *peer, *start, *length, bitfield),
                }
                true
            }
        }
    }

    /// Drops every cached namespace state.
    pub fn invalidate(&mut self) {
        for ns in Namespace::ALL {
            self.namespaces[ns].invalidate();
        }
    }

    pub fn remove_peer(&mut self, peer: &PeerId) {
        for ns in Namespace::ALL {
            self.namespaces[ns].remove_peer(peer);
        }
    }

    pub fn state(&mut self) -> NamespaceStates {
        NamespaceMap::from_fn(|ns| self.namespaces[ns].state())
    }
}
