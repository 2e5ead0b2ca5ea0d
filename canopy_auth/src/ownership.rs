//! Core ownership: which device owns which cores.
//!
//! Each device writes one ownership document to its own auth core, naming
//! its five writer cores. Every core signs its own key and the device
//! identity signs its id, so a document proves control of all six keys.
//! Documents that fail verification are rejected outright.
//!
//! Ownership cannot be changed once written: of several versions for one
//! device, the one appended earliest in its core wins.

use std::sync::Arc;

use canopy_core::{
    CoreKey, DeviceId, DiscoveryKey, Keypair, Namespace, NamespaceMap, Signature, VersionId,
};
use canopy_cores::CoreManager;
use minicbor::{Decode, Encode};
use tracing::{debug, warn};

use crate::{
    block::AuthBlock,
    records::{Record, RecordStore, append_block},
};

#[derive(Encode, Decode, Clone, Debug, PartialEq, Eq)]
#[cbor(map)]
pub struct SignedCoreOwnership {
    #[n(0)]
    pub device_id: DeviceId,
    #[n(1)]
    pub core_ids: NamespaceMap<CoreKey>,
    /// Signature of each core key by that core's own keypair.
    #[n(2)]
    pub core_signatures: NamespaceMap<Signature>,
    /// Signature of the device id by the identity keypair.
    #[n(3)]
    pub identity_signature: Signature,
}

/// A verified ownership document, signatures stripped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoreOwnershipDoc {
    pub core_ids: NamespaceMap<CoreKey>,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum VerificationError {
    #[error("document is in core {actual:?}, its auth core is {expected:?}")]
    WrongHomeCore {
        expected: DiscoveryKey,
        actual: DiscoveryKey,
    },
    #[error("invalid signature for the {0} core")]
    InvalidCoreSignature(Namespace),
    #[error("invalid identity signature")]
    InvalidIdentitySignature,
}

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum OwnershipError {
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error("record store: {0:#}")]
    Store(anyhow::Error),
    #[error("core: {0:#}")]
    Core(anyhow::Error),
}

/// Verifies an ownership document found at `version` and turns it into an
/// indexable record.
///
/// The record has no links: every version is a separate candidate, so
/// ownership can not be revised through an update chain.
pub fn map_and_validate(
    raw: &SignedCoreOwnership,
    version: &VersionId,
) -> Result<Record<CoreOwnershipDoc>, VerificationError> {
    let expected = raw.core_ids[Namespace::Auth].discovery_key();
    if expected != version.core_discovery_key {
        return Err(VerificationError::WrongHomeCore {
            expected,
            actual: version.core_discovery_key,
        });
    }
    for (ns, key) in raw.core_ids.iter() {
        key.verify(key.as_bytes(), &raw.core_signatures[ns])
            .map_err(|_| VerificationError::InvalidCoreSignature(ns))?;
    }
    raw.device_id
        .verify(raw.device_id.as_bytes(), &raw.identity_signature)
        .map_err(|_| VerificationError::InvalidIdentitySignature)?;

    Ok(Record {
        doc_id: raw.device_id,
        version_id: *version,
        links: Vec::new(),
        value: CoreOwnershipDoc {
            core_ids: raw.core_ids.clone(),
        },
    })
}

/// Picks the winner of two versions of the same document: the one with the
/// lower index, then the lower version id.
pub fn get_winner<'a, T>(a: &'a Record<T>, b: &'a Record<T>) -> &'a Record<T> {
    if winner_key(b) < winner_key(a) { b } else { a }
}

fn winner_key<T>(record: &Record<T>) -> (u64, VersionId) {
    (record.version_id.index, record.version_id)
}

/// Core ownership lookups over a record store. Cheap to clone.
#[derive(Clone, Debug)]
pub struct CoreOwnership {
    store: Arc<dyn RecordStore<CoreOwnershipDoc>>,
    core_manager: CoreManager,
}

impl CoreOwnership {
    pub fn new(store: Arc<dyn RecordStore<CoreOwnershipDoc>>, core_manager: CoreManager) -> Self {
        Self {
            store,
            core_manager,
        }
    }

    /// The winning ownership record of `device_id`.
    pub async fn get(
        &self,
        device_id: &DeviceId,
    ) -> Result<Record<CoreOwnershipDoc>, OwnershipError> {
        let versions = self
            .store
            .versions(device_id)
            .await
            .map_err(OwnershipError::Store)?;
        versions
            .iter()
            .reduce(|a, b| get_winner(a, b))
            .cloned()
            .ok_or(OwnershipError::NotFound)
    }

    pub async fn get_owner(&self, core_id: &CoreKey) -> Result<DeviceId, OwnershipError> {
        self.find_owner(|key| key == core_id).await
    }

    /// Like [`get_owner`](Self::get_owner), for a core only known by its
    /// discovery key.
    pub async fn get_owner_by_discovery_key(
        &self,
        discovery_key: &DiscoveryKey,
    ) -> Result<DeviceId, OwnershipError> {
        self.find_owner(|key| key.discovery_key() == *discovery_key)
            .await
    }

    async fn find_owner(
        &self,
        matches: impl Fn(&CoreKey) -> bool,
    ) -> Result<DeviceId, OwnershipError> {
        let doc_ids = self.store.doc_ids().await.map_err(OwnershipError::Store)?;
        for device_id in doc_ids {
            let record = match self.get(&device_id).await {
                Ok(record) => record,
                Err(OwnershipError::NotFound) => continue,
                Err(e) => return Err(e),
            };
            if record.value.core_ids.values().any(&matches) {
                return Ok(device_id);
            }
        }
        Err(OwnershipError::NotFound)
    }

    pub async fn get_core_id(
        &self,
        device_id: &DeviceId,
        namespace: Namespace,
    ) -> Result<CoreKey, OwnershipError> {
        Ok(self.get(device_id).await?.value.core_ids[namespace])
    }

    /// Verifies and indexes a document read from an auth core, then opens
    /// the cores it names.
    pub async fn ingest(
        &self,
        raw: &SignedCoreOwnership,
        version: &VersionId,
    ) -> Result<Record<CoreOwnershipDoc>, OwnershipError> {
        let record = match map_and_validate(raw, version) {
            Ok(record) => record,
            Err(e) => {
                warn!(device = %raw.device_id.fmt_short(), %version, "rejected core ownership: {e}");
                return Err(e.into());
            }
        };
        self.store
            .index(record.clone())
            .await
            .map_err(OwnershipError::Store)?;
        for (ns, key) in record.value.core_ids.iter() {
            if let Err(e) = self.core_manager.add_core(*key, ns).await {
                warn!(core = %key.fmt_short(), namespace = %ns, "failed to add owned core: {e}");
            }
        }
        debug!(device = %record.doc_id.fmt_short(), %version, "indexed core ownership");
        Ok(record)
    }

    /// Signs and appends the local device's ownership document to its auth
    /// writer core.
    pub async fn write_own(&self, identity: &Keypair) -> Result<VersionId, OwnershipError> {
        let device_id = identity.device_id();
        let core_ids = NamespaceMap::from_fn(|ns| self.core_manager.writer_core(ns).key);
        let core_signatures =
            NamespaceMap::from_fn(|ns| self.core_manager.sign_with_writer(ns, core_ids[ns].as_bytes()));
        let raw = SignedCoreOwnership {
            device_id,
            identity_signature: identity.sign(device_id.as_bytes()),
            core_ids,
            core_signatures,
        };
        let auth = self.core_manager.writer_core(Namespace::Auth);
        let version = append_block(&auth.core, &AuthBlock::CoreOwnership(raw.clone()))
            .await
            .map_err(OwnershipError::Core)?;
        self.ingest(&raw, &version).await?;
        Ok(version)
    }
}
