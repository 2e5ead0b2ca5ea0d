use std::{collections::HashMap, sync::Arc};

use canopy_core::{Core, CoreKey, DiscoveryKey, Namespace, NamespaceMap};

/// A core known to the manager.
#[derive(Clone, Debug)]
pub struct CoreRecord {
    pub core: Arc<dyn Core>,
    pub key: CoreKey,
    pub discovery_key: DiscoveryKey,
    pub namespace: Namespace,
    pub is_local_writer: bool,
}

impl CoreRecord {
    pub fn new(core: Arc<dyn Core>, namespace: Namespace, is_local_writer: bool) -> Self {
        let key = core.key();
        Self {
            discovery_key: key.discovery_key(),
            core,
            key,
            namespace,
            is_local_writer,
        }
    }
}

/// Cores by discovery key and by namespace. Insertion order within a
/// namespace is kept.
#[derive(Debug, Default)]
pub(crate) struct CoreIndex {
    by_discovery_key: HashMap<DiscoveryKey, CoreRecord>,
    by_namespace: NamespaceMap<Vec<DiscoveryKey>>,
}

impl CoreIndex {
    /// Adds the record unless a core with the same key is known. Returns
    /// whether it was added.
    pub fn insert(&mut self, record: CoreRecord) -> bool {
        if self.by_discovery_key.contains_key(&record.discovery_key) {
            return false;
        }
        self.by_namespace[record.namespace].push(record.discovery_key);
        self.by_discovery_key.insert(record.discovery_key, record);
        true
    }

    pub fn get(&self, discovery_key: &DiscoveryKey) -> Option<&CoreRecord> {
        self.by_discovery_key.get(discovery_key)
    }

    pub fn get_by_key(&self, key: &CoreKey) -> Option<&CoreRecord> {
        self.get(&key.discovery_key())
    }

    pub fn namespace(&self, namespace: Namespace) -> Vec<CoreRecord> {
        self.by_namespace[namespace]
            .iter()
            .filter_map(|dk| self.by_discovery_key.get(dk))
            .cloned()
            .collect()
    }

    pub fn all(&self) -> impl Iterator<Item = &CoreRecord> {
        Namespace::ALL.into_iter().flat_map(move |ns| {
            self.by_namespace[ns]
                .iter()
                .filter_map(|dk| self.by_discovery_key.get(dk))
        })
    }

    pub fn len(&self) -> usize {
        self.by_discovery_key.len()
    }
}
