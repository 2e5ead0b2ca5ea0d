//! Decides, per connected peer, which namespaces are replicated.

use std::collections::HashSet;

use canopy_auth::SyncCapability;
use canopy_core::{DeviceId, DiscoveryKey, Namespace, NamespaceMap, PRESYNC_NAMESPACES, PeerId};
use canopy_cores::CoreManager;
use tracing::{debug, warn};

use crate::sync_state::NamespaceStates;

/// Which namespaces sync at all.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SyncEnabledState {
    None,
    /// Only `auth`, `config` and `blobIndex`.
    #[default]
    Presync,
    All,
}

/// Derives the enabled state from what the user asked for.
///
/// A requested full stop only takes effect once everything is synced;
/// until then the previous intent keeps syncing.
pub fn sync_enabled_state(
    wants_data: bool,
    full_stop: bool,
    fully_synced: bool,
) -> SyncEnabledState {
    match (wants_data, full_stop, fully_synced) {
        (_, true, true) => SyncEnabledState::None,
        (true, _, _) => SyncEnabledState::All,
        (false, _, _) => SyncEnabledState::Presync,
    }
}

/// Replication state towards a single peer.
///
/// Owned by the sync actor, one per connection, and only touched when that
/// connection or the shared sync state changes.
#[derive(Debug)]
pub struct PeerSyncController {
    peer: PeerId,
    core_manager: CoreManager,
    capability: NamespaceMap<SyncCapability>,
    enabled: NamespaceMap<bool>,
    replicated: HashSet<DiscoveryKey>,
    /// Once set, stays set until a capability is withdrawn.
    presync_done: bool,
    /// Namespaces whose haves were already resent after becoming allowed.
    haves_resent: NamespaceMap<bool>,
    pending_haves: Vec<Namespace>,
}

impl PeerSyncController {
    pub fn new(peer: PeerId, core_manager: CoreManager) -> Self {
        Self {
            peer,
            core_manager,
            capability: NamespaceMap::from_fn(|_| SyncCapability::Unknown),
            enabled: NamespaceMap::default(),
            replicated: HashSet::new(),
            presync_done: false,
            haves_resent: NamespaceMap::default(),
            pending_haves: Vec::new(),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer
    }

    pub fn device_id(&self) -> DeviceId {
        DeviceId::from(&self.peer)
    }

    pub fn capability(&self) -> &NamespaceMap<SyncCapability> {
        &self.capability
    }

    pub fn is_enabled(&self, namespace: Namespace) -> bool {
        self.enabled[namespace]
    }

    pub fn presync_done(&self) -> bool {
        self.presync_done
    }

    pub fn replicated(&self) -> &HashSet<DiscoveryKey> {
        &self.replicated
    }

    /// Whether the peer is expected to sync `namespace` with us at all.
    pub fn may_sync(&self, namespace: Namespace) -> bool {
        match self.capability[namespace] {
            SyncCapability::Allowed => true,
            SyncCapability::Blocked => false,
            SyncCapability::Unknown => namespace == Namespace::Auth,
        }
    }

    /// Records the peer's current capability. Takes effect on the next
    /// [`update`](Self::update).
    pub fn set_sync_capability(&mut self, capability: NamespaceMap<SyncCapability>) {
        for (ns, &next) in capability.iter() {
            let prev = self.capability[ns];
            if prev == next {
                continue;
            }
            debug!(peer = %self.peer.fmt_short(), namespace = %ns, ?prev, ?next, "sync capability changed");
            if prev == SyncCapability::Allowed {
                self.presync_done = false;
            }
            if next == SyncCapability::Allowed && !self.haves_resent[ns] {
                self.haves_resent[ns] = true;
                self.pending_haves.push(ns);
            }
        }
        self.capability = capability;
    }

    fn check_presync(&self, states: &NamespaceStates) -> bool {
        PRESYNC_NAMESPACES
            .iter()
            .all(|&ns| match self.capability[ns] {
                SyncCapability::Blocked => true,
                SyncCapability::Allowed => states[ns].is_synced_with(&self.peer),
                SyncCapability::Unknown => false,
            })
    }

    fn wants_enabled(&self, namespace: Namespace, enabled_state: SyncEnabledState) -> bool {
        if enabled_state == SyncEnabledState::None {
            return false;
        }
        match self.capability[namespace] {
            SyncCapability::Blocked => false,
            SyncCapability::Unknown => namespace == Namespace::Auth,
            SyncCapability::Allowed => {
                namespace.is_presync()
                    || (enabled_state == SyncEnabledState::All && self.presync_done)
            }
        }
    }

    /// Brings replication in line with the current sync state. Failures to
    /// replicate single cores are logged and retried on the next update.
    pub async fn update(&mut self, states: &NamespaceStates, enabled_state: SyncEnabledState) {
        for ns in std::mem::take(&mut self.pending_haves) {
            if let Err(e) = self.core_manager.send_haves(&self.peer, Some(ns)).await {
                warn!(peer = %self.peer.fmt_short(), namespace = %ns, "failed to resend haves: {e}");
            }
        }

        if !self.presync_done && self.check_presync(states) {
            debug!(peer = %self.peer.fmt_short(), "presync done");
            self.presync_done = true;
        }

        for ns in Namespace::ALL {
            let enable = self.wants_enabled(ns, enabled_state);
            if enable != self.enabled[ns] {
                debug!(peer = %self.peer.fmt_short(), namespace = %ns, enable, "toggling namespace");
            }
            self.enabled[ns] = enable;
            if enable {
                self.replicate_namespace(ns).await;
            } else {
                self.unreplicate_namespace(ns).await;
            }
        }
    }

    async fn replicate_namespace(&mut self, namespace: Namespace) {
        for record in self.core_manager.get_cores(namespace) {
            if self.replicated.contains(&record.discovery_key) {
                continue;
            }
            match self
                .core_manager
                .replicate(&self.peer, &record.discovery_key)
                .await
            {
                Ok(()) => {
                    self.replicated.insert(record.discovery_key);
                }
                Err(e) => {
                    warn!(peer = %self.peer.fmt_short(), core = %record.key.fmt_short(), "failed to replicate: {e}")
                }
            }
        }
    }

    async fn unreplicate_namespace(&mut self, namespace: Namespace) {
        for record in self.core_manager.get_cores(namespace) {
            if !self.replicated.remove(&record.discovery_key) {
                continue;
            }
            if let Err(e) = self
                .core_manager
                .unreplicate(&self.peer, &record.discovery_key)
                .await
            {
                warn!(peer = %self.peer.fmt_short(), core = %record.key.fmt_short(), "failed to unreplicate: {e}");
            }
        }
    }
}
