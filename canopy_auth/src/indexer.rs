//! Indexes the blocks of every auth core as they appear.

use std::collections::{HashMap, HashSet};

use canopy_core::{Bitfield, CoreEvent, DiscoveryKey, Namespace, VersionId, wire};
use canopy_cores::{CoreManager, CoreManagerEvent, CoreRecord};
use tokio::sync::{
    broadcast::{self, error::TryRecvError},
    mpsc, oneshot,
};
use tracing::{debug, warn};

use crate::{
    block::AuthBlock,
    ownership::CoreOwnership,
    roles::{Roles, role_record},
};

#[derive(Debug)]
enum IndexerMessage {
    /// Answered once every core event received so far has been indexed.
    Idle { responder: oneshot::Sender<()> },
    Shutdown { responder: oneshot::Sender<()> },
}

struct AuthIndexer {
    core_manager: CoreManager,
    ownership: CoreOwnership,
    roles: Roles,
    receiver: mpsc::Receiver<IndexerMessage>,
    events: broadcast::Receiver<CoreManagerEvent>,
    /// Blocks already handled, per auth core.
    indexed: HashMap<DiscoveryKey, Bitfield>,
    /// Cores with blocks that could not be read yet.
    unread: HashSet<DiscoveryKey>,
}

impl AuthIndexer {
    async fn run(&mut self) {
        self.scan_all().await;
        loop {
            tokio::select! {
                msg = self.receiver.recv() => match msg {
                    Some(IndexerMessage::Idle { responder }) => {
                        self.drain().await;
                        self.retry_unread().await;
                        let _ = responder.send(());
                    }
                    Some(IndexerMessage::Shutdown { responder }) => {
                        let _ = responder.send(());
                        break;
                    }
                    None => break,
                },
                event = self.events.recv() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("auth indexer missed {n} events, rescanning");
                        self.scan_all().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("auth indexer stopped");
    }

    async fn drain(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.handle_event(event).await,
                Err(TryRecvError::Lagged(_)) => self.scan_all().await,
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }

    async fn handle_event(&mut self, event: CoreManagerEvent) {
        match event {
            CoreManagerEvent::AddCore(record) if record.namespace == Namespace::Auth => {
                self.scan(&record).await;
            }
            CoreManagerEvent::Core {
                namespace: Namespace::Auth,
                discovery_key,
                event: CoreEvent::Append { .. } | CoreEvent::Download { .. },
            } => {
                if let Some(record) = self.core_manager.get_core_by_discovery_key(&discovery_key) {
                    self.scan(&record).await;
                }
            }
            _ => {}
        }
    }

    async fn retry_unread(&mut self) {
        let unread: Vec<DiscoveryKey> = self.unread.drain().collect();
        for discovery_key in unread {
            if let Some(record) = self.core_manager.get_core_by_discovery_key(&discovery_key) {
                self.scan(&record).await;
            }
        }
    }

    async fn scan_all(&mut self) {
        for record in self.core_manager.get_cores(Namespace::Auth) {
            self.scan(&record).await;
        }
    }

    async fn scan(&mut self, record: &CoreRecord) {
        let present = record.core.bitfield();
        let indexed = self.indexed.entry(record.discovery_key).or_default();
        let pending: Vec<u64> = present
            .ranges()
            .flatten()
            .filter(|&index| !indexed.get(index))
            .collect();

        let mut unread = false;
        for index in pending {
            // blocks stay pending until read, so a later scan retries them
            let block = match record.core.get(index).await {
                Ok(Some(block)) => block,
                Ok(None) => {
                    unread = true;
                    continue;
                }
                Err(e) => {
                    warn!(core = %record.key.fmt_short(), index, "failed to read auth block: {e:#}");
                    unread = true;
                    continue;
                }
            };
            self.indexed
                .entry(record.discovery_key)
                .or_default()
                .set(index, true);
            let version_id = VersionId::new(record.discovery_key, index);
            match wire::decode::<AuthBlock>(&block) {
                Ok(block) => self.index_block(block, version_id).await,
                Err(e) => warn!(version = %version_id, "skipping undecodable auth block: {e}"),
            }
        }
        if unread {
            self.unread.insert(record.discovery_key);
        }
    }

    async fn index_block(&self, block: AuthBlock, version_id: VersionId) {
        match block {
            AuthBlock::CoreOwnership(raw) => {
                // rejections are logged by ingest
                if self.ownership.ingest(&raw, &version_id).await.is_ok() {
                    self.roles.notify(raw.device_id);
                }
            }
            AuthBlock::Role(block) => {
                if let Err(e) = self
                    .roles
                    .index_role_record(role_record(block, version_id))
                    .await
                {
                    warn!(version = %version_id, "failed to index role record: {e}");
                }
            }
        }
    }
}

/// Handle to the task indexing auth cores into [`CoreOwnership`] and
/// [`Roles`].
#[derive(Clone, Debug)]
pub struct AuthIndexerHandle {
    sender: mpsc::Sender<IndexerMessage>,
}

impl AuthIndexerHandle {
    pub fn spawn(core_manager: CoreManager, ownership: CoreOwnership, roles: Roles) -> Self {
        let (sender, receiver) = mpsc::channel(64);
        let mut actor = AuthIndexer {
            events: core_manager.subscribe(),
            core_manager,
            ownership,
            roles,
            receiver,
            indexed: HashMap::new(),
            unread: HashSet::new(),
        };
        tokio::spawn(async move {
            actor.run().await;
        });
        Self { sender }
    }

    /// Waits until everything the core manager reported so far is indexed.
    pub async fn idle(&self) -> anyhow::Result<()> {
        let (responder, recv) = oneshot::channel();
        self.sender
            .send(IndexerMessage::Idle { responder })
            .await
            .map_err(|_| anyhow::anyhow!("auth indexer has stopped"))?;
        recv.await?;
        Ok(())
    }

    pub async fn shutdown(&self) {
        let (responder, recv) = oneshot::channel();
        if self
            .sender
            .send(IndexerMessage::Shutdown { responder })
            .await
            .is_ok()
        {
            let _ = recv.await;
        }
    }
}
