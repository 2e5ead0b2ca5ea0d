use std::{sync::Arc, time::Duration};

use canopy_auth::{
    AuthBlock, AuthIndexerHandle, CoreOwnership, CoreOwnershipDoc, MemoryRecordStore, Record,
    RecordStore, RoleBlock, RoleError, RoleId, RoleValue, Roles, RolesEvent, SyncCapability,
    records::append_block,
};
use canopy_core::{DeviceId, Keypair, Namespace, VersionId};
use canopy_core_memory::MemoryCoreStorage;
use canopy_cores::{CoreManager, CoreManagerOptions, MemoryCoreKeyStore};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn project() -> Keypair {
    Keypair::from_secret_bytes([42; 32])
}

/// Stores shared by every device of a test, as if all of them had synced
/// everything.
#[derive(Clone, Default)]
struct Network {
    storage: Arc<MemoryCoreStorage>,
    ownership: Arc<MemoryRecordStore<CoreOwnershipDoc>>,
    roles: Arc<MemoryRecordStore<RoleValue>>,
}

struct Device {
    identity: Keypair,
    manager: CoreManager,
    ownership: CoreOwnership,
    roles: Roles,
}

impl Device {
    fn id(&self) -> DeviceId {
        self.identity.device_id()
    }
}

/// Opens a device and writes its core ownership. The creator must be
/// opened first so it holds the writable project core.
async fn device(network: &Network, seed: u8, creator: bool) -> Device {
    let identity = Keypair::from_secret_bytes([seed; 32]);
    let mut options = CoreManagerOptions::new(
        project().core_key(),
        [seed.wrapping_add(100); 32],
        network.storage.clone(),
        Arc::new(MemoryCoreKeyStore::default()),
    );
    if creator {
        options.project_secret_key = Some(project());
    }
    let manager = CoreManager::open(options).await.unwrap();
    let ownership = CoreOwnership::new(network.ownership.clone(), manager.clone());
    let roles = Roles::new(
        network.roles.clone(),
        ownership.clone(),
        manager.clone(),
        identity.device_id(),
    );
    ownership.write_own(&identity).await.unwrap();
    Device {
        identity,
        manager,
        ownership,
        roles,
    }
}

/// Appends a role record with an explicit `from_index`, bypassing the
/// checks of `assign_role`.
async fn write_role(
    assigner: &Device,
    target: DeviceId,
    role_id: RoleId,
    from_index: u64,
    links: Vec<VersionId>,
) -> VersionId {
    let block = RoleBlock {
        doc_id: target,
        links: links.clone(),
        role_id,
        from_index,
    };
    let auth = assigner.manager.writer_core(Namespace::Auth);
    let version_id = append_block(&auth.core, &AuthBlock::Role(block))
        .await
        .unwrap();
    assigner
        .roles
        .index_role_record(Record {
            doc_id: target,
            version_id,
            links,
            value: RoleValue {
                role_id,
                from_index,
            },
        })
        .await
        .unwrap();
    version_id
}

async fn role_of(observer: &Device, device: &Device) -> RoleId {
    observer.roles.get_role(&device.id()).await.unwrap().role_id
}

#[tokio::test]
async fn test_defaults_without_records() {
    init_tracing();
    let network = Network::default();
    let a = device(&network, 1, true).await;
    let b = device(&network, 2, false).await;

    assert_eq!(role_of(&a, &a).await, RoleId::Creator);
    assert_eq!(role_of(&b, &a).await, RoleId::Creator);
    assert_eq!(role_of(&a, &b).await, RoleId::NoRole);

    let all = b.roles.get_all().await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[&a.id()].role_id, RoleId::Creator);
    assert_eq!(all[&b.id()].role_id, RoleId::NoRole);
}

#[tokio::test]
async fn test_assignment_chain_and_retroactive_revocation() {
    init_tracing();
    let network = Network::default();
    let a = device(&network, 1, true).await;
    let b = device(&network, 2, false).await;
    let c = device(&network, 3, false).await;

    // b's auth core: ownership at 0
    let coordinator = write_role(&a, b.id(), RoleId::Coordinator, 1, vec![]).await;
    let member = b.roles.assign_role(&c.id(), RoleId::Member).await.unwrap();
    assert_eq!(member.index, 1);

    assert_eq!(role_of(&a, &b).await, RoleId::Coordinator);
    assert_eq!(role_of(&a, &c).await, RoleId::Member);
    assert_eq!(role_of(&c, &c).await, RoleId::Member);

    // a blocks b, effective from before b assigned c
    write_role(&a, b.id(), RoleId::Blocked, 1, vec![coordinator]).await;
    assert_eq!(role_of(&a, &b).await, RoleId::Blocked);
    assert_eq!(role_of(&a, &c).await, RoleId::NoRole);
    assert_eq!(role_of(&c, &c).await, RoleId::NoRole);
}

#[tokio::test]
async fn test_revocation_from_unsynced_assigner() {
    init_tracing();
    let network = Network::default();
    let a = device(&network, 1, true).await;
    let b = device(&network, 2, false).await;
    let c = device(&network, 3, false).await;

    let coordinator = write_role(&a, b.id(), RoleId::Coordinator, 1, vec![]).await;
    let member = b.roles.assign_role(&c.id(), RoleId::Member).await.unwrap();
    assert_eq!(member.index, 1);
    assert_eq!(role_of(&c, &c).await, RoleId::Member);

    // written without b's auth core, so it applies from the start
    write_role(&a, b.id(), RoleId::Blocked, 0, vec![coordinator]).await;
    assert_eq!(role_of(&a, &b).await, RoleId::Blocked);
    assert_eq!(role_of(&a, &c).await, RoleId::NoRole);
    assert_eq!(role_of(&c, &c).await, RoleId::NoRole);
    assert_eq!(
        c.roles.sync_capability(&c.id()).await.unwrap()[Namespace::Data],
        SyncCapability::Unknown
    );
}

#[tokio::test]
async fn test_superseded_record_never_applies() {
    init_tracing();
    let network = Network::default();
    let a = device(&network, 1, true).await;
    let b = device(&network, 2, false).await;
    let c = device(&network, 3, false).await;
    let d = device(&network, 4, false).await;

    // b is demoted to member, the demotion applying from index 1 on
    let coordinator = write_role(&a, b.id(), RoleId::Coordinator, 2, vec![]).await;
    write_role(&a, b.id(), RoleId::Member, 1, vec![coordinator]).await;
    // b's auth core: ownership at 0, these at 1 and 2
    write_role(&b, c.id(), RoleId::Member, 0, vec![]).await;
    write_role(&b, d.id(), RoleId::Member, 0, vec![]).await;
    assert_eq!(role_of(&a, &b).await, RoleId::Member);
    assert_eq!(role_of(&a, &c).await, RoleId::NoRole);
    assert_eq!(role_of(&a, &d).await, RoleId::NoRole);
}

#[tokio::test]
async fn test_later_revocation_keeps_earlier_assignments() {
    init_tracing();
    let network = Network::default();
    let a = device(&network, 1, true).await;
    let b = device(&network, 2, false).await;
    let c = device(&network, 3, false).await;

    let coordinator = write_role(&a, b.id(), RoleId::Coordinator, 1, vec![]).await;
    b.roles.assign_role(&c.id(), RoleId::Member).await.unwrap();

    // b's auth core now holds two blocks; the block applies from there on
    write_role(&a, b.id(), RoleId::Blocked, 2, vec![coordinator]).await;
    assert_eq!(role_of(&a, &b).await, RoleId::Blocked);
    assert_eq!(role_of(&a, &c).await, RoleId::Member);

    // but b can not assign anything any more
    let d = device(&network, 4, false).await;
    assert!(matches!(
        b.roles.assign_role(&d.id(), RoleId::Member).await,
        Err(RoleError::NotAllowed {
            own: RoleId::Blocked,
            requested: RoleId::Member
        })
    ));
}

#[tokio::test]
async fn test_assign_role_uses_target_auth_length() {
    init_tracing();
    let network = Network::default();
    let a = device(&network, 1, true).await;
    let b = device(&network, 2, false).await;

    // a does not know b's cores yet
    a.roles.assign_role(&b.id(), RoleId::Member).await.unwrap();
    let first = network.roles.versions(&b.id()).await.unwrap();
    assert_eq!(first[0].value.from_index, 0);

    let b_auth = b.manager.writer_core(Namespace::Auth).key;
    a.manager.add_core(b_auth, Namespace::Auth).await.unwrap();
    let second = a
        .roles
        .assign_role(&b.id(), RoleId::Coordinator)
        .await
        .unwrap();
    let record = network.roles.get(&second).await.unwrap().unwrap();
    assert_eq!(record.value.from_index, 1);
    assert_eq!(record.links, vec![first[0].version_id]);
    assert_eq!(role_of(&b, &b).await, RoleId::Coordinator);
}

#[tokio::test]
async fn test_forged_assignment_is_no_role() {
    init_tracing();
    let network = Network::default();
    let a = device(&network, 1, true).await;
    let b = device(&network, 2, false).await;
    let c = device(&network, 3, false).await;

    a.roles.assign_role(&b.id(), RoleId::Member).await.unwrap();
    assert!(matches!(
        b.roles.assign_role(&c.id(), RoleId::Member).await,
        Err(RoleError::NotAllowed { .. })
    ));

    // members can still write records, they just do not validate
    write_role(&b, c.id(), RoleId::Coordinator, 0, vec![]).await;
    assert_eq!(role_of(&a, &c).await, RoleId::NoRole);
    // and a device can not promote itself
    write_role(&b, b.id(), RoleId::Coordinator, 0, vec![]).await;
    assert_eq!(role_of(&a, &b).await, RoleId::Member);
}

#[tokio::test]
async fn test_invalid_head_falls_back_to_linked_version() {
    init_tracing();
    let network = Network::default();
    let a = device(&network, 1, true).await;
    let b = device(&network, 2, false).await;
    let c = device(&network, 3, false).await;

    write_role(&a, b.id(), RoleId::Coordinator, 0, vec![]).await;
    let member = b.roles.assign_role(&c.id(), RoleId::Member).await.unwrap();
    // left can only be self-assigned, so this head is ignored
    write_role(&b, c.id(), RoleId::Left, 0, vec![member]).await;
    assert_eq!(role_of(&a, &c).await, RoleId::Member);

    c.roles.assign_role(&c.id(), RoleId::Left).await.unwrap();
    assert_eq!(role_of(&a, &c).await, RoleId::Left);
}

#[tokio::test]
async fn test_long_chain_and_iteration_limit() {
    init_tracing();
    let network = Network::default();
    let a = device(&network, 1, true).await;
    let mut devices = Vec::new();
    for seed in 2..8 {
        devices.push(device(&network, seed, false).await);
    }

    write_role(&a, devices[0].id(), RoleId::Coordinator, 0, vec![]).await;
    for pair in devices.windows(2) {
        pair[0]
            .roles
            .assign_role(&pair[1].id(), RoleId::Coordinator)
            .await
            .unwrap();
    }
    let last = devices.last().unwrap();
    for device in &devices {
        assert_eq!(role_of(&a, device).await, RoleId::Coordinator);
    }

    let limited = Roles::new(
        network.roles.clone(),
        a.ownership.clone(),
        a.manager.clone(),
        a.id(),
    )
    .with_iteration_limit(3);
    assert_eq!(
        limited.get_role(&devices[1].id()).await.unwrap().role_id,
        RoleId::Coordinator
    );
    assert_eq!(
        limited.get_role(&last.id()).await.unwrap().role_id,
        RoleId::NoRole
    );
}

#[tokio::test]
async fn test_cyclic_chain_does_not_validate() {
    init_tracing();
    let network = Network::default();
    let _a = device(&network, 1, true).await;
    let d = device(&network, 4, false).await;
    let e = device(&network, 5, false).await;

    write_role(&d, e.id(), RoleId::Coordinator, 0, vec![]).await;
    write_role(&e, d.id(), RoleId::Coordinator, 0, vec![]).await;
    assert_eq!(role_of(&d, &d).await, RoleId::NoRole);
    assert_eq!(role_of(&d, &e).await, RoleId::NoRole);
}

#[tokio::test]
async fn test_assign_role_restrictions() {
    init_tracing();
    let network = Network::default();
    let a = device(&network, 1, true).await;
    let b = device(&network, 2, false).await;
    let c = device(&network, 3, false).await;
    a.roles.assign_role(&b.id(), RoleId::Coordinator).await.unwrap();

    assert!(matches!(
        a.roles.assign_role(&b.id(), RoleId::Left).await,
        Err(RoleError::LeftSelfOnly)
    ));
    assert!(matches!(
        b.roles.assign_role(&c.id(), RoleId::Creator).await,
        Err(RoleError::CreatorOnly)
    ));
    assert!(matches!(
        a.roles.assign_role(&b.id(), RoleId::Creator).await,
        Err(RoleError::CreatorOnly)
    ));
    assert!(matches!(
        b.roles.assign_role(&a.id(), RoleId::Blocked).await,
        Err(RoleError::CreatorOnly)
    ));
    assert!(matches!(
        b.roles.assign_role(&c.id(), RoleId::NoRole).await,
        Err(RoleError::NotAllowed { .. })
    ));

    // a blocked record for the creator written by anyone else is ignored
    write_role(&b, a.id(), RoleId::Blocked, 0, vec![]).await;
    assert_eq!(role_of(&c, &a).await, RoleId::Creator);

    a.roles.assign_role(&a.id(), RoleId::Creator).await.unwrap();
    b.roles.assign_role(&c.id(), RoleId::Blocked).await.unwrap();
    assert_eq!(role_of(&a, &c).await, RoleId::Blocked);
}

#[tokio::test]
async fn test_sync_capability() {
    init_tracing();
    let network = Network::default();
    let a = device(&network, 1, true).await;
    let b = device(&network, 2, false).await;
    let c = device(&network, 3, false).await;

    let unknown = a.roles.sync_capability(&b.id()).await.unwrap();
    assert!(unknown.values().all(|c| *c == SyncCapability::Unknown));

    a.roles.assign_role(&b.id(), RoleId::Member).await.unwrap();
    a.roles.assign_role(&c.id(), RoleId::Blocked).await.unwrap();
    let member = a.roles.sync_capability(&b.id()).await.unwrap();
    assert!(member.values().all(|c| *c == SyncCapability::Allowed));
    let blocked = a.roles.sync_capability(&c.id()).await.unwrap();
    assert!(blocked.values().all(|c| *c == SyncCapability::Blocked));

    b.roles.assign_role(&b.id(), RoleId::Left).await.unwrap();
    let left = a.roles.sync_capability(&b.id()).await.unwrap();
    assert_eq!(left[Namespace::Auth], SyncCapability::Allowed);
    assert_eq!(left[Namespace::Data], SyncCapability::Blocked);
}

#[tokio::test(start_paused = true)]
async fn test_indexer_reads_auth_cores() {
    init_tracing();
    let network = Network::default();
    let a = device(&network, 1, true).await;
    a.roles.assign_role(&a.id(), RoleId::Creator).await.unwrap();

    // b has its own indexes, filled only from the cores it can read
    let identity = Keypair::from_secret_bytes([2; 32]);
    let manager = CoreManager::open(CoreManagerOptions::new(
        project().core_key(),
        [102; 32],
        network.storage.clone(),
        Arc::new(MemoryCoreKeyStore::default()),
    ))
    .await
    .unwrap();
    let ownership = CoreOwnership::new(Arc::new(MemoryRecordStore::new()), manager.clone());
    let roles = Roles::new(
        Arc::new(MemoryRecordStore::new()),
        ownership.clone(),
        manager.clone(),
        identity.device_id(),
    );
    let mut events = roles.subscribe();
    let indexer = AuthIndexerHandle::spawn(manager.clone(), ownership.clone(), roles.clone());
    indexer.idle().await.unwrap();

    assert_eq!(
        ownership
            .get_owner(&project().core_key())
            .await
            .unwrap(),
        a.id()
    );
    assert!(
        manager
            .get_core_by_key(&a.manager.writer_core(Namespace::Data).key)
            .is_some()
    );

    a.roles
        .assign_role(&identity.device_id(), RoleId::Member)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    indexer.idle().await.unwrap();
    assert_eq!(
        roles
            .get_role(&identity.device_id())
            .await
            .unwrap()
            .role_id,
        RoleId::Member
    );
    let mut updated = Vec::new();
    while let Ok(RolesEvent::Updated { device_id }) = events.try_recv() {
        updated.push(device_id);
    }
    assert!(updated.contains(&identity.device_id()));

    indexer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_indexer_retries_unreadable_blocks() {
    init_tracing();
    let network = Network::default();
    let a = device(&network, 1, true).await;

    let identity = Keypair::from_secret_bytes([2; 32]);
    let manager = CoreManager::open(CoreManagerOptions::new(
        project().core_key(),
        [102; 32],
        network.storage.clone(),
        Arc::new(MemoryCoreKeyStore::default()),
    ))
    .await
    .unwrap();
    let ownership = CoreOwnership::new(Arc::new(MemoryRecordStore::new()), manager.clone());
    let roles = Roles::new(
        Arc::new(MemoryRecordStore::new()),
        ownership.clone(),
        manager.clone(),
        identity.device_id(),
    );
    let indexer = AuthIndexerHandle::spawn(manager.clone(), ownership.clone(), roles.clone());
    indexer.idle().await.unwrap();

    let project_core = network.storage.get(&project().core_key()).unwrap();
    project_core.fail_next_reads(1);
    a.roles
        .assign_role(&identity.device_id(), RoleId::Blocked)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    indexer.idle().await.unwrap();
    assert_eq!(
        roles
            .get_role(&identity.device_id())
            .await
            .unwrap()
            .role_id,
        RoleId::Blocked
    );

    // a failure while scanning on append is retried by the next append
    project_core.fail_next_reads(1);
    a.roles
        .assign_role(&identity.device_id(), RoleId::Member)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        roles
            .get_role(&identity.device_id())
            .await
            .unwrap()
            .role_id,
        RoleId::Blocked
    );
    a.roles.assign_role(&a.id(), RoleId::Creator).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        roles
            .get_role(&identity.device_id())
            .await
            .unwrap()
            .role_id,
        RoleId::Member
    );
    indexer.shutdown().await;
}
