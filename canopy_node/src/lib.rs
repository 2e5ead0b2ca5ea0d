//! Runs a canopy project on a host device.
//!
//! [`Project::open`] composes the core manager, core ownership, roles, the
//! auth indexer and the sync API. [`Project::open_with_config`] does the
//! same from a [`NodeConfig`], persisting remote core keys with redb.

use std::{path::Path, sync::Arc, time::Duration};

use anyhow::{Context, anyhow};
use canopy_auth::{
    AuthIndexerHandle, CoreOwnership, CoreOwnershipDoc, MemoryRecordStore, OwnershipError,
    RoleValue, Roles,
};
use canopy_core::{CoreKey, CoreStorage, DeviceId, Keypair, keys::KEY_SIZE};
use canopy_cores::{CoreKeyStore, CoreManager, CoreManagerOptions};
use canopy_store_redb::RedbCoreKeyStore;
use canopy_sync::{SyncApi, SyncConfig};
use tracing::{debug, info};

use crate::{
    config::{NodeConfig, NodeConfigSync},
    identity::{load_secret_key, parse_key_string},
};

pub mod config;
pub mod identity;

pub struct ProjectOptions {
    /// The device's long-term identity.
    pub identity: Keypair,
    pub project_key: CoreKey,
    pub project_secret_key: Option<Keypair>,
    pub root_key: [u8; KEY_SIZE],
    pub storage: Arc<dyn CoreStorage>,
    pub key_store: Arc<dyn CoreKeyStore>,
    pub sync: NodeConfigSync,
}

/// A project opened on this device.
#[derive(Clone, Debug)]
pub struct Project {
    identity: Keypair,
    pub core_manager: CoreManager,
    pub ownership: CoreOwnership,
    pub roles: Roles,
    pub indexer: AuthIndexerHandle,
    pub sync: SyncApi,
}

impl Project {
    pub async fn open(options: ProjectOptions) -> anyhow::Result<Self> {
        let ProjectOptions {
            identity,
            project_key,
            project_secret_key,
            root_key,
            storage,
            key_store,
            sync,
        } = options;

        let mut manager_options = CoreManagerOptions::new(project_key, root_key, storage, key_store);
        manager_options.project_secret_key = project_secret_key;
        manager_options.have_debounce = Duration::from_millis(sync.have_debounce_ms);
        let core_manager = CoreManager::open(manager_options).await?;

        let device_id = identity.device_id();
        let ownership = CoreOwnership::new(
            Arc::new(MemoryRecordStore::<CoreOwnershipDoc>::new()),
            core_manager.clone(),
        );
        let roles = Roles::new(
            Arc::new(MemoryRecordStore::<RoleValue>::new()),
            ownership.clone(),
            core_manager.clone(),
            device_id,
        )
        .with_iteration_limit(sync.role_chain_iteration_limit);

        // record stores are rebuilt from the auth cores on every start
        let indexer =
            AuthIndexerHandle::spawn(core_manager.clone(), ownership.clone(), roles.clone());
        indexer.idle().await?;
        match ownership.get(&device_id).await {
            Ok(_) => debug!(device = %device_id.fmt_short(), "core ownership already written"),
            Err(OwnershipError::NotFound) => {
                let version = ownership.write_own(&identity).await?;
                info!(device = %device_id.fmt_short(), %version, "wrote core ownership");
            }
            Err(e) => return Err(e.into()),
        }

        let sync = SyncApi::spawn(
            core_manager.clone(),
            Arc::new(roles.clone()),
            SyncConfig {
                throttle: Duration::from_millis(sync.sync_state_throttle_ms),
                autostop_data_sync_after: sync.autostop_data_sync_after_ms.map(Duration::from_millis),
            },
        );
        info!(
            project = %core_manager.project_key().fmt_short(),
            device = %device_id.fmt_short(),
            creator = core_manager.is_creator(),
            "project opened"
        );
        Ok(Self {
            identity,
            core_manager,
            ownership,
            roles,
            indexer,
            sync,
        })
    }

    /// Opens the project described by `config`. Relative paths are resolved
    /// against `config_dir`.
    pub async fn open_with_config(
        config: &NodeConfig,
        config_dir: Option<&Path>,
        storage: Arc<dyn CoreStorage>,
    ) -> anyhow::Result<Self> {
        let secret_key = load_secret_key(&config.identity, config_dir)
            .ok_or_else(|| anyhow!("no usable secret key in identity config"))?;
        let project_key = parse_key_string(&config.project.project_key)
            .map(CoreKey::from_bytes)
            .context("invalid project key")?;
        let project_secret_key = config
            .project
            .project_secret_key
            .as_deref()
            .map(|s| {
                parse_key_string(s)
                    .map(Keypair::from_secret_bytes)
                    .context("invalid project secret key")
            })
            .transpose()?;
        let root_key = parse_key_string(&config.project.root_key).context("invalid root key")?;

        let path = config.resolve_path(&config.storage.path, config_dir);
        let key_store = tokio::task::spawn_blocking(move || -> anyhow::Result<RedbCoreKeyStore> {
            std::fs::create_dir_all(&path)?;
            RedbCoreKeyStore::open(&path)
        })
        .await?
        .context("failed to open core key store")?;

        Self::open(ProjectOptions {
            identity: Keypair::from(&secret_key),
            project_key,
            project_secret_key,
            root_key,
            storage,
            key_store: Arc::new(key_store),
            sync: config.sync.clone(),
        })
        .await
    }

    pub fn device_id(&self) -> DeviceId {
        self.identity.device_id()
    }

    /// Stops sync, indexing and every core task.
    pub async fn close(&self) {
        self.sync.shutdown().await;
        self.indexer.shutdown().await;
        self.core_manager.close();
        debug!(device = %self.device_id().fmt_short(), "project closed");
    }
}
