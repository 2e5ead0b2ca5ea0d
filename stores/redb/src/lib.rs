//! RedbCoreKeyStore - remote core keys persisted in a redb database.

use canopy_core::{CoreKey, Namespace};
use canopy_cores::CoreKeyStore;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::{path::Path, sync::Arc};

/// core key -> namespace wire value
const TABLE: TableDefinition<&[u8], u8> = TableDefinition::new("core_keys");

#[derive(Clone)]
pub struct RedbCoreKeyStore {
    db: Arc<Database>,
}

impl RedbCoreKeyStore {
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let db = Database::create(path.join("core_keys.redb"))?;

        // Create the table up front so a first `list` on a fresh database
        // does not fail.
        {
            let write_txn = db.begin_write()?;
            {
                let _ = write_txn.open_table(TABLE)?;
            }
            write_txn.commit()?;
        }

        Ok(Self { db: Arc::new(db) })
    }
}

impl std::fmt::Debug for RedbCoreKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbCoreKeyStore").finish()
    }
}

#[async_trait::async_trait]
impl CoreKeyStore for RedbCoreKeyStore {
    async fn insert(&self, namespace: Namespace, key: CoreKey) -> anyhow::Result<bool> {
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
            let write_txn = db.begin_write()?;
            let inserted = {
                let mut table = write_txn.open_table(TABLE)?;
                if table.get(key.as_bytes().as_slice())?.is_some() {
                    false
                } else {
                    table.insert(key.as_bytes().as_slice(), namespace.to_wire() as u8)?;
                    true
                }
            };
            write_txn.commit()?;
            Ok(inserted)
        })
        .await
        .map_err(|e| anyhow::anyhow!("redb write task failed: {}", e))?
    }

    async fn list(&self) -> anyhow::Result<Vec<(Namespace, CoreKey)>> {
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<(Namespace, CoreKey)>> {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(TABLE)?;

            let mut keys = Vec::new();
            for entry in table.iter()? {
                let (key, namespace) = entry?;
                let key = CoreKey::try_from(key.value())?;
                let namespace = Namespace::from_wire(u32::from(namespace.value()))
                    .ok_or_else(|| anyhow::anyhow!("unknown namespace {}", namespace.value()))?;
                keys.push((namespace, key));
            }
            keys.sort();
            Ok(keys)
        })
        .await
        .map_err(|e| anyhow::anyhow!("redb read task failed: {}", e))?
    }
}
