//! Sync state and replication control for canopy projects.
//!
//! [`SyncState`] aggregates block counts per namespace from the bitfields
//! of every core, for the local device and each peer. [`SyncApi`] runs on
//! top of it: it decides per peer which namespaces to replicate, first the
//! presync namespaces (`auth`, `config`, `blobIndex`) and then data once
//! those are synced and data sync was started. Data sync can stop by itself
//! after being idle for a while.

mod api;
pub mod capability;
pub mod controller;
pub mod core_state;
pub mod namespace_state;
pub mod sync_state;

pub use api::{
    DEFAULT_STATE_THROTTLE, RemoteSyncState, RemoteTypeState, SyncApi, SyncApiState, SyncConfig,
    SyncError, SyncType, SyncTypeState,
};
pub use capability::SyncCapabilities;
pub use controller::{PeerSyncController, SyncEnabledState, sync_enabled_state};
pub use core_state::{CoreState, CoreSyncState, PeerState, PeerStatus, SyncCounts, derive_state};
pub use namespace_state::{NamespaceState, NamespaceSyncState};
pub use sync_state::{NamespaceStates, SyncState};
