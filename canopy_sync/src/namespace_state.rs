use std::{collections::HashMap, sync::Arc};

use canopy_core::{Bitfield, Core, DiscoveryKey, Namespace, PeerId};
use tracing::trace;

use crate::core_state::{CoreSyncState, PeerState, PeerStatus, SyncCounts};

/// Counters of every core in a namespace, summed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NamespaceState {
    pub core_count: usize,
    pub local: SyncCounts,
    /// A peer is connected if it replicates any core of the namespace.
    pub remote: HashMap<PeerId, PeerState>,
}

impl NamespaceState {
    /// Whether any party is still waiting for blocks another one has.
    pub fn data_to_sync(&self) -> bool {
        self.local.want > 0
            || self.local.wanted > 0
            || self
                .remote
                .values()
                .any(|p| p.counts.want > 0 || p.counts.wanted > 0)
    }

    /// Whether neither we nor `peer` wants anything the other has, as far
    /// as we know. Stays true after the peer disconnects.
    pub fn is_caught_up_with(&self, peer: &PeerId) -> bool {
        self.remote
            .get(peer)
            .is_some_and(|p| p.counts.want == 0 && p.counts.wanted == 0)
    }

    /// Whether we and `peer` have exchanged everything, over a live
    /// connection.
    pub fn is_synced_with(&self, peer: &PeerId) -> bool {
        self.is_caught_up_with(peer)
            && self.remote[peer].status == PeerStatus::Connected
    }
}

#[derive(Debug, Clone)]
struct PendingBitfield {
    peer: PeerId,
    start: u64,
    length: u64,
    bitfield: Bitfield,
}

/// Sync state of all cores of one namespace.
///
/// Bitfields reported for cores that are not known yet are kept and applied
/// once the core is added. The derived state is cached until something
/// changes.
#[derive(Debug)]
pub struct NamespaceSyncState {
    namespace: Namespace,
    cores: HashMap<DiscoveryKey, CoreSyncState>,
    pending: HashMap<DiscoveryKey, Vec<PendingBitfield>>,
    cached: Option<NamespaceState>,
}

impl NamespaceSyncState {
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            cores: HashMap::new(),
            pending: HashMap::new(),
            cached: None,
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn has_core(&self, discovery_key: &DiscoveryKey) -> bool {
        self.cores.contains_key(discovery_key)
    }

    /// Starts tracking a core. Adding a known core does nothing.
    pub fn add_core(&mut self, core: Arc<dyn Core>) -> bool {
        let discovery_key = core.discovery_key();
        if self.cores.contains_key(&discovery_key) {
            return false;
        }
        let mut state = CoreSyncState::new(self.namespace, core);
        for p in self.pending.remove(&discovery_key).unwrap_or_default() {
            state.apply_peer_bitfield(p.peer, p.start, p.length, &p.bitfield);
        }
        self.cores.insert(discovery_key, state);
        self.cached = None;
        true
    }

    pub fn apply_peer_bitfield(
        &mut self,
        discovery_key: &DiscoveryKey,
        peer: PeerId,
        start: u64,
        length: u64,
        bitfield: &Bitfield,
    ) {
        match self.cores.get_mut(discovery_key) {
            Some(core) => {
                core.apply_peer_bitfield(peer, start, length, bitfield);
                self.cached = None;
            }
            None => {
                trace!(namespace = %self.namespace, "queueing bitfield of unknown core");
                self.pending
                    .entry(*discovery_key)
                    .or_default()
                    .push(PendingBitfield {
                        peer,
                        start,
                        length,
                        bitfield: bitfield.clone(),
                    });
            }
        }
    }

    pub fn set_peer_status(&mut self, discovery_key: &DiscoveryKey, peer: PeerId, status: PeerStatus) {
        if let Some(core) = self.cores.get_mut(discovery_key) {
            core.set_peer_status(peer, status);
            self.cached = None;
        }
    }

    pub fn remove_peer(&mut self, peer: &PeerId) {
        for core in self.cores.values_mut() {
            core.remove_peer(peer);
        }
        for pending in self.pending.values_mut() {
            pending.retain(|p| p.peer != *peer);
        }
        self.cached = None;
    }

    /// Marks the cached state stale, after a local append or download.
    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    pub fn state(&mut self) -> NamespaceState {
        if let Some(state) = &self.cached {
            return state.clone();
        }
        let mut state = NamespaceState {
            core_count: self.cores.len(),
            ..Default::default()
        };
        for core in self.cores.values() {
            let core_state = core.derive();
            state.local += core_state.local;
            for (peer, peer_state) in core_state.remote {
                let entry = state.remote.entry(peer).or_default();
                entry.counts += peer_state.counts;
                if peer_state.status == PeerStatus::Connected {
                    entry.status = PeerStatus::Connected;
                }
            }
        }
        self.cached = Some(state.clone());
        state
    }
}
