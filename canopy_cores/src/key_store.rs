use std::fmt::Debug;

use async_trait::async_trait;
use canopy_core::{CoreKey, Namespace};
use dashmap::DashMap;

/// Persistence of remote core keys, so known cores are reopened after a
/// restart. Writer cores are derived and never stored here.
#[async_trait]
pub trait CoreKeyStore: Debug + Send + Sync + 'static {
    /// Stores `key` under `namespace` unless the key is already stored.
    /// Returns whether the key was new.
    async fn insert(&self, namespace: Namespace, key: CoreKey) -> anyhow::Result<bool>;

    async fn list(&self) -> anyhow::Result<Vec<(Namespace, CoreKey)>>;
}

#[derive(Debug, Default)]
pub struct MemoryCoreKeyStore {
    keys: DashMap<CoreKey, Namespace>,
}

impl MemoryCoreKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoreKeyStore for MemoryCoreKeyStore {
    async fn insert(&self, namespace: Namespace, key: CoreKey) -> anyhow::Result<bool> {
        let mut inserted = false;
        self.keys.entry(key).or_insert_with(|| {
            inserted = true;
            namespace
        });
        Ok(inserted)
    }

    async fn list(&self) -> anyhow::Result<Vec<(Namespace, CoreKey)>> {
        let mut keys: Vec<_> = self.keys.iter().map(|e| (*e.value(), *e.key())).collect();
        keys.sort();
        Ok(keys)
    }
}
