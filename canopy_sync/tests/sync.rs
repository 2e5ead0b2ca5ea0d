use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use canopy_auth::{RolesEvent, SyncCapability};
use canopy_core::{
    Bitfield, DeviceId, DiscoveryKey, ExtensionMessage, Keypair, Namespace, NamespaceMap, PeerId,
    wire::WireNamespace,
};
use canopy_core_memory::{MemoryCoreStorage, MemorySession};
use canopy_cores::{CoreManager, CoreManagerOptions, MemoryCoreKeyStore};
use canopy_sync::{SyncApi, SyncCapabilities, SyncConfig, SyncEnabledState, SyncType};
use tokio::sync::broadcast;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn peer(seed: u8) -> PeerId {
    iroh::SecretKey::from_bytes(&[seed; 32]).public()
}

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Capabilities set by the test instead of resolved from roles.
#[derive(Debug)]
struct FixedCapabilities {
    capability: Mutex<NamespaceMap<SyncCapability>>,
    updates: broadcast::Sender<RolesEvent>,
}

impl FixedCapabilities {
    fn new(capability: NamespaceMap<SyncCapability>) -> Arc<Self> {
        let (updates, _) = broadcast::channel(16);
        Arc::new(Self {
            capability: Mutex::new(capability),
            updates,
        })
    }

    fn set(&self, capability: NamespaceMap<SyncCapability>, device_id: DeviceId) {
        *self.capability.lock().unwrap() = capability;
        let _ = self.updates.send(RolesEvent::Updated { device_id });
    }
}

#[async_trait]
impl SyncCapabilities for FixedCapabilities {
    async fn sync_capability(&self, _device_id: &DeviceId) -> NamespaceMap<SyncCapability> {
        self.capability.lock().unwrap().clone()
    }

    fn updates(&self) -> broadcast::Receiver<RolesEvent> {
        self.updates.subscribe()
    }
}

fn all(capability: SyncCapability) -> NamespaceMap<SyncCapability> {
    NamespaceMap::from_fn(|_| capability)
}

fn data_blocked() -> NamespaceMap<SyncCapability> {
    NamespaceMap::from_fn(|ns| {
        if ns.is_presync() {
            SyncCapability::Allowed
        } else {
            SyncCapability::Blocked
        }
    })
}

struct Fixture {
    manager: CoreManager,
    storage: Arc<MemoryCoreStorage>,
    session: Arc<MemorySession>,
    capabilities: Arc<FixedCapabilities>,
    sync: SyncApi,
}

async fn fixture(capability: NamespaceMap<SyncCapability>, config: SyncConfig) -> Fixture {
    let project = Keypair::from_secret_bytes([42; 32]);
    let storage = Arc::new(MemoryCoreStorage::new());
    let mut options = CoreManagerOptions::new(
        project.core_key(),
        [1; 32],
        storage.clone(),
        Arc::new(MemoryCoreKeyStore::new()),
    );
    options.project_secret_key = Some(project);
    // keep the have actor out of the way
    options.have_debounce = Duration::from_secs(3600);
    let manager = CoreManager::open(options).await.unwrap();

    let capabilities = FixedCapabilities::new(capability);
    let sync = SyncApi::spawn(manager.clone(), capabilities.clone(), config);
    let session = Arc::new(MemorySession::new(peer(2), storage.clone()));
    Fixture {
        manager,
        storage,
        session,
        capabilities,
        sync,
    }
}

fn fast() -> SyncConfig {
    SyncConfig {
        throttle: Duration::from_millis(10),
        autostop_data_sync_after: None,
    }
}

fn writer_keys(manager: &CoreManager, namespaces: &[Namespace]) -> HashSet<DiscoveryKey> {
    namespaces
        .iter()
        .map(|&ns| manager.writer_core(ns).discovery_key)
        .collect()
}

fn have_namespaces(sent: &[ExtensionMessage]) -> Vec<Namespace> {
    sent.iter()
        .filter_map(|m| match m {
            ExtensionMessage::Have(h) => match h.namespace {
                WireNamespace::Known(ns) => Some(ns),
                WireNamespace::Unrecognized(_) => None,
            },
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_blocked_namespaces_never_replicate() {
    init_tracing();
    let f = fixture(data_blocked(), fast()).await;
    f.sync.add_peer(f.session.clone()).await.unwrap();
    f.sync.start().await.unwrap();
    sleep_ms(100).await;

    let presync = writer_keys(
        &f.manager,
        &[Namespace::Auth, Namespace::Config, Namespace::BlobIndex],
    );
    assert_eq!(f.session.replicating(), presync);
    let state = f.sync.state();
    assert_eq!(state.enabled_state, SyncEnabledState::All);
    assert!(state.is_synced(SyncType::Full));
    let remote = state.remote[&DeviceId::from(&peer(2))];
    assert!(remote.initial.is_enabled);
    assert!(!remote.data.is_enabled);

    f.manager
        .writer_core(Namespace::Data)
        .core
        .append(Bytes::from_static(b"obs"))
        .await
        .unwrap();
    sleep_ms(100).await;
    assert!(f.session.replicating().is_disjoint(&writer_keys(
        &f.manager,
        &[Namespace::Data, Namespace::Blob]
    )));
    assert!(!have_namespaces(&f.session.take_sent()).contains(&Namespace::Data));

    // a role change opens up data, and our haves are resent right away
    f.capabilities
        .set(all(SyncCapability::Allowed), DeviceId::from(&peer(2)));
    sleep_ms(100).await;
    assert_eq!(
        f.session.replicating(),
        writer_keys(&f.manager, &Namespace::ALL)
    );
    let resent = have_namespaces(&f.session.take_sent());
    assert_eq!(
        resent.iter().filter(|&&ns| ns == Namespace::Data).count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_unknown_capability_only_syncs_auth() {
    init_tracing();
    let f = fixture(all(SyncCapability::Unknown), fast()).await;
    f.sync.add_peer(f.session.clone()).await.unwrap();
    f.sync.start().await.unwrap();
    sleep_ms(100).await;

    assert_eq!(
        f.session.replicating(),
        writer_keys(&f.manager, &[Namespace::Auth])
    );
    // nothing else is expected of the peer, so it counts as synced
    assert!(f.sync.state().is_synced(SyncType::Full));
}

#[tokio::test(start_paused = true)]
async fn test_data_waits_for_presync() {
    init_tracing();
    let f = fixture(all(SyncCapability::Allowed), fast()).await;

    // a peer's config block we do not have yet holds back presync
    let remote_config = Keypair::from_secret_bytes([77; 32]).core_key();
    f.manager
        .add_core(remote_config, Namespace::Config)
        .await
        .unwrap();
    let remote = f.storage.get(&remote_config).unwrap();
    remote.set_remote_length(1);
    remote.peer_bitfield(peer(2), Bitfield::from_range(0..1));

    f.sync.add_peer(f.session.clone()).await.unwrap();
    f.sync.start().await.unwrap();
    sleep_ms(100).await;

    let state = f.sync.state();
    assert_eq!(state.enabled_state, SyncEnabledState::All);
    assert!(!state.is_synced(SyncType::Initial));
    assert_eq!(state.remote[&DeviceId::from(&peer(2))].initial.wanted, 1);
    assert!(f.session.replicating().is_disjoint(&writer_keys(
        &f.manager,
        &[Namespace::Data, Namespace::Blob]
    )));

    remote.put_remote(0, Bytes::from_static(b"preset"));
    f.sync.wait_for_sync(SyncType::Initial).await.unwrap();
    sleep_ms(100).await;
    assert!(
        f.session
            .replicating()
            .is_superset(&writer_keys(&f.manager, &Namespace::ALL))
    );
    f.sync.wait_for_sync(SyncType::Full).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_data_sync_stops_when_idle() {
    init_tracing();
    let f = fixture(all(SyncCapability::Allowed), fast()).await;
    f.sync.add_peer(f.session.clone()).await.unwrap();
    f.sync
        .set_autostop_data_sync_timeout(Some(Duration::from_millis(500)))
        .await
        .unwrap();
    f.sync.start().await.unwrap();

    sleep_ms(450).await;
    assert_eq!(f.sync.state().enabled_state, SyncEnabledState::All);
    sleep_ms(150).await;
    assert_eq!(f.sync.state().enabled_state, SyncEnabledState::Presync);
    assert!(f.session.replicating().is_disjoint(&writer_keys(
        &f.manager,
        &[Namespace::Data, Namespace::Blob]
    )));
}

#[tokio::test(start_paused = true)]
async fn test_new_data_resets_autostop() {
    init_tracing();
    let f = fixture(all(SyncCapability::Allowed), fast()).await;
    let remote_data = Keypair::from_secret_bytes([78; 32]).core_key();
    f.manager
        .add_core(remote_data, Namespace::Data)
        .await
        .unwrap();
    let remote = f.storage.get(&remote_data).unwrap();

    f.sync.add_peer(f.session.clone()).await.unwrap();
    f.sync
        .set_autostop_data_sync_timeout(Some(Duration::from_millis(500)))
        .await
        .unwrap();
    f.sync.start().await.unwrap();

    sleep_ms(400).await;
    remote.peer_bitfield(peer(2), Bitfield::from_range(0..1));
    remote.put_remote(0, Bytes::from_static(b"late"));

    sleep_ms(200).await;
    assert_eq!(f.sync.state().enabled_state, SyncEnabledState::All);
    sleep_ms(400).await;
    assert_eq!(f.sync.state().enabled_state, SyncEnabledState::Presync);
}

#[tokio::test(start_paused = true)]
async fn test_full_stop_waits_for_sync() {
    init_tracing();
    let f = fixture(all(SyncCapability::Allowed), fast()).await;
    let remote_auth = Keypair::from_secret_bytes([79; 32]).core_key();
    f.manager
        .add_core(remote_auth, Namespace::Auth)
        .await
        .unwrap();
    let remote = f.storage.get(&remote_auth).unwrap();

    f.sync.add_peer(f.session.clone()).await.unwrap();
    f.sync.start().await.unwrap();
    sleep_ms(50).await;
    remote.peer_bitfield(peer(2), Bitfield::from_range(0..2));
    sleep_ms(50).await;

    f.sync.stop().await.unwrap();
    sleep_ms(50).await;
    // still two auth blocks to fetch
    assert_eq!(f.sync.state().enabled_state, SyncEnabledState::Presync);

    remote.put_remote(0, Bytes::from_static(b"a"));
    remote.put_remote(1, Bytes::from_static(b"b"));
    sleep_ms(50).await;
    assert_eq!(f.sync.state().enabled_state, SyncEnabledState::None);
    assert!(f.session.replicating().is_disjoint(&writer_keys(
        &f.manager,
        &[Namespace::Config, Namespace::BlobIndex, Namespace::Data]
    )));
}

#[tokio::test(start_paused = true)]
async fn test_without_peers_autostop_fires() {
    init_tracing();
    let f = fixture(
        all(SyncCapability::Allowed),
        SyncConfig {
            throttle: Duration::from_millis(10),
            autostop_data_sync_after: Some(Duration::from_millis(100)),
        },
    )
    .await;
    f.sync.start().await.unwrap();
    assert!(f.sync.state().is_synced(SyncType::Full));
    assert_eq!(f.sync.state().enabled_state, SyncEnabledState::All);
    sleep_ms(150).await;
    assert_eq!(f.sync.state().enabled_state, SyncEnabledState::Presync);
}

#[tokio::test(start_paused = true)]
async fn test_remove_peer_and_discovery_keys() {
    init_tracing();
    let f = fixture(all(SyncCapability::Allowed), fast()).await;
    f.sync.add_peer(f.session.clone()).await.unwrap();
    sleep_ms(50).await;
    f.session.take_sent();

    let unknown = Keypair::from_secret_bytes([80; 32]).core_key().discovery_key();
    f.sync.handle_discovery_key(peer(2), unknown).await.unwrap();
    let known = f.manager.writer_core(Namespace::Data).discovery_key;
    f.sync.handle_discovery_key(peer(2), known).await.unwrap();
    let wanted: Vec<_> = f
        .session
        .take_sent()
        .into_iter()
        .filter_map(|m| match m {
            ExtensionMessage::Project(p) => Some(p.want_core_keys),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(wanted, vec![unknown]);

    let device = DeviceId::from(&peer(2));
    assert!(f.sync.state().remote.contains_key(&device));
    f.sync.remove_peer(peer(2)).await.unwrap();
    assert!(!f.sync.state().remote.contains_key(&device));
    assert!(f.session.replicating().is_empty());

    f.sync.shutdown().await;
    assert!(f.sync.start().await.is_err());
}
