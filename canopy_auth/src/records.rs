//! Versioned records and the store they are indexed into.
//!
//! A record is one version of a document. Versions are identified by where
//! they were appended ([`VersionId`]) and point at the versions they
//! supersede through `links`. Versions of a doc that no other version links
//! to are its heads; more than one head means the doc has forked.

use std::{collections::HashSet, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use canopy_core::{Core, DeviceId, VersionId};
use dashmap::DashMap;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record<T> {
    pub doc_id: DeviceId,
    pub version_id: VersionId,
    pub links: Vec<VersionId>,
    pub value: T,
}

#[async_trait]
pub trait RecordStore<T>: Debug + Send + Sync + 'static {
    /// Indexes a version. Indexing the same version twice is a no-op.
    async fn index(&self, record: Record<T>) -> anyhow::Result<()>;

    async fn get(&self, version_id: &VersionId) -> anyhow::Result<Option<Record<T>>>;

    /// Every indexed version of `doc_id`, superseded ones and forks
    /// included, in indexing order.
    async fn versions(&self, doc_id: &DeviceId) -> anyhow::Result<Vec<Record<T>>>;

    async fn doc_ids(&self) -> anyhow::Result<Vec<DeviceId>>;
}

#[derive(Debug)]
pub struct MemoryRecordStore<T> {
    records: DashMap<VersionId, Record<T>>,
    by_doc: DashMap<DeviceId, Vec<VersionId>>,
}

impl<T> MemoryRecordStore<T> {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            by_doc: DashMap::new(),
        }
    }
}

impl<T> Default for MemoryRecordStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> RecordStore<T> for MemoryRecordStore<T>
where
    T: Clone + Debug + Send + Sync + 'static,
{
    async fn index(&self, record: Record<T>) -> anyhow::Result<()> {
        if self.records.contains_key(&record.version_id) {
            return Ok(());
        }
        self.by_doc
            .entry(record.doc_id)
            .or_default()
            .push(record.version_id);
        self.records.insert(record.version_id, record);
        Ok(())
    }

    async fn get(&self, version_id: &VersionId) -> anyhow::Result<Option<Record<T>>> {
        Ok(self.records.get(version_id).map(|r| r.clone()))
    }

    async fn versions(&self, doc_id: &DeviceId) -> anyhow::Result<Vec<Record<T>>> {
        let ids = self
            .by_doc
            .get(doc_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| self.records.get(id).map(|r| r.clone()))
            .collect())
    }

    async fn doc_ids(&self) -> anyhow::Result<Vec<DeviceId>> {
        let mut ids: Vec<_> = self.by_doc.iter().map(|e| *e.key()).collect();
        ids.sort();
        Ok(ids)
    }
}

/// Versions not superseded by any other version in `versions`.
pub fn heads<T>(versions: &[Record<T>]) -> Vec<&Record<T>> {
    let linked: HashSet<&VersionId> = versions.iter().flat_map(|r| r.links.iter()).collect();
    versions
        .iter()
        .filter(|r| !linked.contains(&r.version_id))
        .collect()
}

/// Encodes `block` and appends it to `core`, returning the version it
/// became.
pub async fn append_block<T: minicbor::Encode<()>>(
    core: &Arc<dyn Core>,
    block: &T,
) -> anyhow::Result<VersionId> {
    let bytes = canopy_core::wire::encode(block)?;
    let index = core.append(Bytes::from(bytes)).await?;
    Ok(VersionId::new(core.discovery_key(), index))
}
