//! Role resolution.
//!
//! A device's role is never stored as a fact. It is derived every time from
//! the role records visible so far, by walking each candidate's chain of
//! assigners back to the project creator. Every step must be an assignment
//! the assigner's role allowed at the time it was made. A chain that breaks
//! anywhere resolves to [`RoleId::NoRole`].

use std::{
    collections::{BTreeMap, BTreeSet, HashSet, VecDeque},
    sync::Arc,
};

use canopy_core::{DeviceId, Namespace, NamespaceMap, VersionId};
use canopy_cores::CoreManager;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::{
    block::{AuthBlock, RoleBlock, RoleValue},
    ownership::{CoreOwnership, OwnershipError},
    records::{Record, RecordStore, append_block, heads},
    role::{Role, RoleId, SyncCapability},
};

/// Upper bound on the records visited while resolving one role.
pub const ROLE_CHAIN_ITERATION_LIMIT: usize = 1000;

const EVENT_CAPACITY: usize = 256;

pub type RoleRecord = Record<RoleValue>;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum RoleError {
    #[error("only the project creator can do this")]
    CreatorOnly,
    #[error("the left role can only be assigned to oneself")]
    LeftSelfOnly,
    #[error("role {own} can not assign {requested}")]
    NotAllowed { own: RoleId, requested: RoleId },
    #[error("record store: {0:#}")]
    Store(anyhow::Error),
    #[error("core: {0:#}")]
    Core(anyhow::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RolesEvent {
    /// Role records of `device_id` changed; its role may have too.
    Updated { device_id: DeviceId },
}

#[derive(Clone, Debug)]
pub struct Roles {
    store: Arc<dyn RecordStore<RoleValue>>,
    ownership: CoreOwnership,
    core_manager: CoreManager,
    device_id: DeviceId,
    iteration_limit: usize,
    events: broadcast::Sender<RolesEvent>,
}

impl Roles {
    pub fn new(
        store: Arc<dyn RecordStore<RoleValue>>,
        ownership: CoreOwnership,
        core_manager: CoreManager,
        device_id: DeviceId,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            ownership,
            core_manager,
            device_id,
            iteration_limit: ROLE_CHAIN_ITERATION_LIMIT,
            events,
        }
    }

    pub fn with_iteration_limit(mut self, limit: usize) -> Self {
        self.iteration_limit = limit;
        self
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RolesEvent> {
        self.events.subscribe()
    }

    /// The device that created the project, if known yet.
    pub async fn creator_device_id(&self) -> Option<DeviceId> {
        if self.core_manager.is_creator() {
            return Some(self.device_id);
        }
        self.ownership
            .get_owner(&self.core_manager.project_key())
            .await
            .ok()
    }

    fn is_project_core(&self, version_id: &VersionId) -> bool {
        version_id.core_discovery_key == self.core_manager.project_key().discovery_key()
    }

    pub async fn get_role(&self, device_id: &DeviceId) -> Result<&'static Role, RoleError> {
        Ok(self.resolve(device_id).await?.role())
    }

    async fn resolve(&self, device_id: &DeviceId) -> Result<RoleId, RoleError> {
        let is_creator = self.creator_device_id().await.as_ref() == Some(device_id);
        let mut versions = self
            .store
            .versions(device_id)
            .await
            .map_err(RoleError::Store)?;
        if is_creator {
            // nobody but the creator itself can change the creator's role
            versions.retain(|r| self.is_project_core(&r.version_id));
        }
        let fallback = if is_creator {
            RoleId::Creator
        } else {
            RoleId::NoRole
        };
        if versions.is_empty() {
            return Ok(fallback);
        }

        let mut candidates: Vec<&RoleRecord> = heads(&versions);
        candidates.sort_by(|a, b| tie_break(a, b));
        let mut queue: VecDeque<VersionId> = candidates.iter().map(|r| r.version_id).collect();
        let mut visited = HashSet::new();
        let mut iterations = 0;

        while let Some(version_id) = queue.pop_front() {
            if iterations >= self.iteration_limit {
                debug!(device = %device_id.fmt_short(), "role candidate limit reached");
                break;
            }
            iterations += 1;
            if !visited.insert(version_id) {
                continue;
            }
            let Some(record) = versions.iter().find(|r| r.version_id == version_id) else {
                continue;
            };
            if self.is_role_chain_valid(record).await? {
                return Ok(record.value.role_id);
            }
            trace!(device = %device_id.fmt_short(), version = %version_id, "invalid role chain");
            queue.extend(record.links.iter().copied());
        }
        Ok(fallback)
    }

    /// Walks the assigners of `record` back to the project creator.
    ///
    /// At each step the assigner's role is taken from its own records that
    /// were in effect when the assignment was appended: those with a
    /// `from_index` not past the assignment's index in the assigner's auth
    /// core. A record superseded by another one in effect never applies,
    /// whatever its `from_index`. Forked heads resolve least permissive
    /// first.
    pub async fn is_role_chain_valid(&self, record: &RoleRecord) -> Result<bool, RoleError> {
        let mut current = record.clone();
        let mut visited = HashSet::new();

        for _ in 0..self.iteration_limit {
            if !visited.insert(current.version_id) {
                return Ok(false);
            }
            let assigner = match self
                .ownership
                .get_owner_by_discovery_key(&current.version_id.core_discovery_key)
                .await
            {
                Ok(device_id) => Some(device_id),
                Err(OwnershipError::NotFound) => None,
                Err(e) => return Err(RoleError::Store(e.into())),
            };

            if current.value.role_id == RoleId::Left {
                return Ok(assigner == Some(current.doc_id));
            }
            if self.is_project_core(&current.version_id) {
                return Ok(true);
            }
            let Some(assigner) = assigner else {
                return Ok(false);
            };

            let assigner_versions = self
                .store
                .versions(&assigner)
                .await
                .map_err(RoleError::Store)?;
            let in_effect: Vec<RoleRecord> = assigner_versions
                .into_iter()
                .filter(|r| r.value.from_index <= current.version_id.index)
                .collect();
            let Some(assigner_record) = heads(&in_effect).into_iter().min_by(|a, b| tie_break(a, b))
            else {
                return Ok(false);
            };
            if !assigner_record
                .value
                .role_id
                .role()
                .can_assign(current.value.role_id)
            {
                return Ok(false);
            }
            current = assigner_record.clone();
        }
        Ok(false)
    }

    /// Assigns `role_id` to `device_id`, appending a record to our own auth
    /// core.
    pub async fn assign_role(
        &self,
        device_id: &DeviceId,
        role_id: RoleId,
    ) -> Result<VersionId, RoleError> {
        let is_self = *device_id == self.device_id;
        let creator = self.creator_device_id().await;
        let we_are_creator = creator == Some(self.device_id);

        match role_id {
            RoleId::Creator if !(we_are_creator && is_self) => return Err(RoleError::CreatorOnly),
            RoleId::Left if !is_self => return Err(RoleError::LeftSelfOnly),
            _ => {}
        }
        if creator.as_ref() == Some(device_id) && !we_are_creator {
            return Err(RoleError::CreatorOnly);
        }
        if !matches!(role_id, RoleId::Creator | RoleId::Left) {
            let own = self.resolve(&self.device_id).await?;
            if !own.role().can_assign(role_id) {
                return Err(RoleError::NotAllowed {
                    own,
                    requested: role_id,
                });
            }
        }

        let from_index = self.auth_core_length(device_id).await;
        let versions = self
            .store
            .versions(device_id)
            .await
            .map_err(RoleError::Store)?;
        let links: Vec<VersionId> = heads(&versions).iter().map(|r| r.version_id).collect();
        let block = RoleBlock {
            doc_id: *device_id,
            links,
            role_id,
            from_index,
        };

        let auth = self.core_manager.writer_core(Namespace::Auth);
        let version_id = append_block(&auth.core, &AuthBlock::Role(block.clone()))
            .await
            .map_err(RoleError::Core)?;
        self.index_role_record(role_record(block, version_id))
            .await?;
        debug!(device = %device_id.fmt_short(), role = %role_id, from_index, "assigned role");
        Ok(version_id)
    }

    async fn auth_core_length(&self, device_id: &DeviceId) -> u64 {
        let Ok(key) = self
            .ownership
            .get_core_id(device_id, Namespace::Auth)
            .await
        else {
            return 0;
        };
        self.core_manager
            .get_core_by_key(&key)
            .map_or(0, |record| record.core.length())
    }

    /// Indexes a role record read from an auth core.
    pub async fn index_role_record(&self, record: RoleRecord) -> Result<(), RoleError> {
        let device_id = record.doc_id;
        self.store.index(record).await.map_err(RoleError::Store)?;
        self.notify(device_id);
        Ok(())
    }

    pub fn notify(&self, device_id: DeviceId) {
        let _ = self.events.send(RolesEvent::Updated { device_id });
    }

    /// The role of every device with a role record, plus the creator and
    /// the local device.
    pub async fn get_all(&self) -> Result<BTreeMap<DeviceId, &'static Role>, RoleError> {
        let mut devices: BTreeSet<DeviceId> = self
            .store
            .doc_ids()
            .await
            .map_err(RoleError::Store)?
            .into_iter()
            .collect();
        devices.insert(self.device_id);
        if let Some(creator) = self.creator_device_id().await {
            devices.insert(creator);
        }
        let mut roles = BTreeMap::new();
        for device_id in devices {
            roles.insert(device_id, self.get_role(&device_id).await?);
        }
        Ok(roles)
    }

    /// How the sync layer should treat `device_id` per namespace. A device
    /// without a role has not synced one yet, so nothing is known.
    pub async fn sync_capability(
        &self,
        device_id: &DeviceId,
    ) -> Result<NamespaceMap<SyncCapability>, RoleError> {
        let role_id = self.resolve(device_id).await?;
        if role_id == RoleId::NoRole {
            return Ok(NamespaceMap::from_fn(|_| SyncCapability::Unknown));
        }
        Ok(role_id.role().sync.map(|_, policy| (*policy).into()))
    }
}

pub(crate) fn role_record(block: RoleBlock, version_id: VersionId) -> RoleRecord {
    Record {
        doc_id: block.doc_id,
        version_id,
        links: block.links,
        value: RoleValue {
            role_id: block.role_id,
            from_index: block.from_index,
        },
    }
}

/// Orders competing records: least permissive role first, then the larger
/// version.
fn tie_break(a: &RoleRecord, b: &RoleRecord) -> std::cmp::Ordering {
    a.value
        .role_id
        .permissiveness()
        .cmp(&b.value.role_id.permissiveness())
        .then_with(|| b.version_id.cmp(&a.version_id))
}

#[cfg(test)]
mod tests {
    use canopy_core::DiscoveryKey;

    use super::*;

    fn record(role_id: RoleId, index: u64) -> RoleRecord {
        Record {
            doc_id: DeviceId::from_bytes([1; 32]),
            version_id: VersionId::new(DiscoveryKey::from_bytes([2; 32]), index),
            links: Vec::new(),
            value: RoleValue {
                role_id,
                from_index: 0,
            },
        }
    }

    #[test]
    fn test_tie_break_prefers_least_permissive() {
        let mut records = [
            record(RoleId::Coordinator, 1),
            record(RoleId::Blocked, 0),
            record(RoleId::Member, 3),
            record(RoleId::Member, 5),
        ];
        records.sort_by(tie_break);
        let order: Vec<_> = records
            .iter()
            .map(|r| (r.value.role_id, r.version_id.index))
            .collect();
        assert_eq!(
            order,
            vec![
                (RoleId::Blocked, 0),
                (RoleId::Member, 5),
                (RoleId::Member, 3),
                (RoleId::Coordinator, 1),
            ]
        );
    }
}
