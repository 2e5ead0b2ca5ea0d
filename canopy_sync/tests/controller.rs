use std::{collections::HashSet, sync::Arc};

use canopy_auth::SyncCapability;
use canopy_core::{DATA_NAMESPACES, Keypair, Namespace, NamespaceMap, PRESYNC_NAMESPACES, PeerId};
use canopy_core_memory::{MemoryCoreStorage, MemorySession};
use canopy_cores::{CoreManager, CoreManagerOptions, MemoryCoreKeyStore};
use canopy_sync::{
    NamespaceState, NamespaceStates, PeerState, PeerStatus, PeerSyncController, SyncCounts,
    SyncEnabledState,
};

fn peer(seed: u8) -> PeerId {
    iroh::SecretKey::from_bytes(&[seed; 32]).public()
}

async fn controller() -> (PeerSyncController, Arc<MemorySession>, CoreManager) {
    let storage = Arc::new(MemoryCoreStorage::new());
    let manager = CoreManager::open(CoreManagerOptions::new(
        Keypair::from_secret_bytes([42; 32]).core_key(),
        [1; 32],
        storage.clone(),
        Arc::new(MemoryCoreKeyStore::new()),
    ))
    .await
    .unwrap();
    let session = Arc::new(MemorySession::new(peer(2), storage));
    manager.add_peer(session.clone()).await;
    (
        PeerSyncController::new(peer(2), manager.clone()),
        session,
        manager,
    )
}

/// Namespace states where the peer is connected everywhere and has
/// `want` blocks of ours outstanding in `lagging`.
fn states(lagging: Option<Namespace>, want: u64) -> NamespaceStates {
    NamespaceMap::from_fn(|ns| {
        let mut state = NamespaceState::default();
        let counts = SyncCounts {
            want: if Some(ns) == lagging { want } else { 0 },
            ..Default::default()
        };
        state.remote.insert(
            peer(2),
            PeerState {
                counts,
                status: PeerStatus::Connected,
            },
        );
        state
    })
}

fn namespaces(manager: &CoreManager, list: &[Namespace]) -> HashSet<canopy_core::DiscoveryKey> {
    list.iter()
        .flat_map(|&ns| manager.get_cores(ns))
        .map(|r| r.discovery_key)
        .collect()
}

#[tokio::test]
async fn test_presync_done_is_sticky() {
    let (mut c, session, manager) = controller().await;
    c.set_sync_capability(NamespaceMap::from_fn(|_| SyncCapability::Allowed));

    c.update(&states(Some(Namespace::Config), 3), SyncEnabledState::All)
        .await;
    assert!(!c.presync_done());
    assert!(!c.is_enabled(Namespace::Data));

    c.update(&states(None, 0), SyncEnabledState::All).await;
    assert!(c.presync_done());
    assert!(c.is_enabled(Namespace::Data));
    assert!(session.replicating().is_superset(&namespaces(&manager, &Namespace::ALL)));

    // new local config blocks do not take data away again
    c.update(&states(Some(Namespace::Config), 5), SyncEnabledState::All)
        .await;
    assert!(c.presync_done());
    assert!(c.is_enabled(Namespace::Data));

    // withdrawing a capability does
    c.set_sync_capability(NamespaceMap::from_fn(|ns| match ns {
        Namespace::Config => SyncCapability::Unknown,
        _ => SyncCapability::Allowed,
    }));
    assert!(!c.presync_done());
    c.update(&states(None, 0), SyncEnabledState::All).await;
    assert!(!c.is_enabled(Namespace::Config));
    assert!(!c.is_enabled(Namespace::Data));
    assert!(session.replicating().is_disjoint(&namespaces(
        &manager,
        &[Namespace::Config, Namespace::Data, Namespace::Blob]
    )));
}

#[tokio::test]
async fn test_enablement_follows_state_and_capability() {
    let (mut c, session, manager) = controller().await;
    c.set_sync_capability(NamespaceMap::from_fn(|ns| match ns {
        Namespace::BlobIndex => SyncCapability::Blocked,
        _ => SyncCapability::Allowed,
    }));

    // a blocked presync namespace does not hold back presync
    c.update(&states(None, 0), SyncEnabledState::Presync).await;
    assert!(c.presync_done());
    for ns in Namespace::ALL {
        assert_eq!(
            c.is_enabled(ns),
            matches!(ns, Namespace::Auth | Namespace::Config),
            "{ns}"
        );
    }
    assert!(DATA_NAMESPACES.iter().all(|&ns| !c.is_enabled(ns)));
    assert!(
        PRESYNC_NAMESPACES
            .iter()
            .all(|&ns| c.is_enabled(ns) || ns == Namespace::BlobIndex)
    );

    c.update(&states(None, 0), SyncEnabledState::All).await;
    assert!(c.is_enabled(Namespace::Data));
    assert!(c.is_enabled(Namespace::Blob));
    assert!(!c.is_enabled(Namespace::BlobIndex));

    c.update(&states(None, 0), SyncEnabledState::None).await;
    assert!(Namespace::ALL.iter().all(|&ns| !c.is_enabled(ns)));
    assert!(c.replicated().is_empty());
    assert!(session.replicating().is_disjoint(&namespaces(
        &manager,
        &[Namespace::Config, Namespace::Data, Namespace::Blob]
    )));
}

#[tokio::test]
async fn test_disconnected_peer_is_not_presynced() {
    let (mut c, _session, _manager) = controller().await;
    c.set_sync_capability(NamespaceMap::from_fn(|_| SyncCapability::Allowed));
    let mut disconnected = states(None, 0);
    disconnected[Namespace::BlobIndex]
        .remote
        .get_mut(&peer(2))
        .unwrap()
        .status = PeerStatus::Disconnected;

    c.update(&disconnected, SyncEnabledState::All).await;
    assert!(!c.presync_done());
    assert!(!c.is_enabled(Namespace::Data));
}
