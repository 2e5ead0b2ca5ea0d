//! Sync counters of a single core.
//!
//! Counters are derived from bitfields on demand with range set
//! operations, so their cost depends on the number of runs, not on the
//! number of blocks.

use std::{
    collections::HashMap,
    ops::{AddAssign, Range},
    sync::Arc,
};

use canopy_core::{Bitfield, Core, DiscoveryKey, Namespace, PeerId};

/// Every block, for a party that wants all of them.
pub const WANT_ALL: Range<u64> = 0..u64::MAX;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PeerStatus {
    /// Known from haves only, or no longer replicating.
    #[default]
    Disconnected,
    Connected,
}

/// Block counts from the point of view of one party.
///
/// - `have`: blocks the party has
/// - `want`: blocks the party wants and lacks that someone else has
/// - `wanted`: blocks the party has that someone else wants and lacks
/// - `missing`: blocks below the core length the party lacks
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncCounts {
    pub have: u64,
    pub want: u64,
    pub wanted: u64,
    pub missing: u64,
}

impl AddAssign for SyncCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.have += rhs.have;
        self.want += rhs.want;
        self.wanted += rhs.wanted;
        self.missing += rhs.missing;
    }
}

/// Counts of a remote peer, relative to the local device only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerState {
    pub counts: SyncCounts,
    pub status: PeerStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CoreState {
    pub length: u64,
    pub local: SyncCounts,
    pub remote: HashMap<PeerId, PeerState>,
}

/// What we know about one party's view of a core.
#[derive(Clone, Debug)]
pub struct RemoteBitfield {
    pub have: Bitfield,
    pub want: Bitfield,
    pub status: PeerStatus,
}

impl Default for RemoteBitfield {
    fn default() -> Self {
        Self {
            have: Bitfield::new(),
            want: Bitfield::from_range(WANT_ALL),
            status: PeerStatus::Disconnected,
        }
    }
}

/// Local and remote bitfields of one core.
#[derive(Debug)]
pub struct CoreSyncState {
    namespace: Namespace,
    core: Arc<dyn Core>,
    local_want: Bitfield,
    remote: HashMap<PeerId, RemoteBitfield>,
}

impl CoreSyncState {
    pub fn new(namespace: Namespace, core: Arc<dyn Core>) -> Self {
        Self {
            namespace,
            core,
            local_want: Bitfield::from_range(WANT_ALL),
            remote: HashMap::new(),
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn discovery_key(&self) -> DiscoveryKey {
        self.core.discovery_key()
    }

    /// Blocks we request from peers. Everything by default.
    pub fn set_local_want(&mut self, want: Bitfield) {
        self.local_want = want;
    }

    /// Records the blocks `[start, start + length)` of `peer`, `bitfield`
    /// being relative to `start`.
    pub fn apply_peer_bitfield(&mut self, peer: PeerId, start: u64, length: u64, bitfield: &Bitfield) {
        self.remote
            .entry(peer)
            .or_default()
            .have
            .overwrite(start, length, bitfield);
    }

    pub fn set_peer_want(&mut self, peer: PeerId, want: Bitfield) {
        self.remote.entry(peer).or_default().want = want;
    }

    pub fn set_peer_status(&mut self, peer: PeerId, status: PeerStatus) {
        self.remote.entry(peer).or_default().status = status;
    }

    pub fn peer_status(&self, peer: &PeerId) -> Option<PeerStatus> {
        self.remote.get(peer).map(|r| r.status)
    }

    /// Forgets a peer entirely.
    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.remote.remove(peer);
    }

    pub fn derive(&self) -> CoreState {
        let local = RemoteBitfield {
            have: self.core.bitfield(),
            want: self.local_want.clone(),
            status: PeerStatus::Connected,
        };
        derive_state(self.core.length(), &local, &self.remote)
    }
}

/// Derives the counters of every party from their bitfields.
///
/// `length` is the known core length; it is extended to cover every set
/// bit.
pub fn derive_state(
    length: u64,
    local: &RemoteBitfield,
    remote: &HashMap<PeerId, RemoteBitfield>,
) -> CoreState {
    let length = remote
        .values()
        .map(|r| r.have.len())
        .chain([length, local.have.len()])
        .max()
        .unwrap_or(0);
    let window = Bitfield::from_range(0..length);

    let local_have = local.have.intersection(&window);
    let local_wants = window.difference(&local.have).intersection(&local.want);
    // blocks some peer can give us, and blocks some peer wants from us
    let mut offered = Bitfield::new();
    let mut requested = Bitfield::new();

    let remote = remote
        .iter()
        .map(|(peer, bits)| {
            let peer_have = bits.have.intersection(&window);
            let peer_wants = local_have.difference(&bits.have).intersection(&bits.want);
            let gives = local_wants.intersection(&peer_have);
            let have = peer_have.count();
            let counts = SyncCounts {
                have,
                want: peer_wants.count(),
                wanted: gives.count(),
                missing: length - have,
            };
            offered.union_with(&gives);
            requested.union_with(&peer_wants);
            (
                *peer,
                PeerState {
                    counts,
                    status: bits.status,
                },
            )
        })
        .collect();

    let have = local_have.count();
    CoreState {
        length,
        local: SyncCounts {
            have,
            want: offered.count(),
            wanted: requested.count(),
            missing: length - have,
        },
        remote,
    }
}
