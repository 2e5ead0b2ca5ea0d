use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, RwLock, Weak},
    time::Duration,
};

use canopy_core::{
    Bitfield, CoreEvent, CoreKey, CoreStorage, DiscoveryKey, ExtensionMessage, Keypair,
    Namespace, NamespaceMap, PeerId, ReplicationSession, Signature,
    keys::{KEY_SIZE, derive_writer_keypair},
    wire::{HaveExtension, ProjectExtension, WireNamespace},
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    have::HaveActorHandle,
    index::{CoreIndex, CoreRecord},
    key_store::CoreKeyStore,
};

/// Debounce of the incremental have broadcast for local writer cores.
pub const DEFAULT_HAVE_DEBOUNCE: Duration = Duration::from_millis(1000);

const EVENT_CAPACITY: usize = 1024;

pub(crate) type Sessions = Arc<Mutex<HashMap<PeerId, Arc<dyn ReplicationSession>>>>;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum CoreManagerError {
    #[error("project secret key does not match the project key")]
    ProjectKeyMismatch,
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("unknown core {0:?}")]
    UnknownCore(DiscoveryKey),
    #[error("core storage: {0:#}")]
    Storage(anyhow::Error),
    #[error("replication session: {0:#}")]
    Session(anyhow::Error),
}

#[derive(Debug)]
pub struct CoreManagerOptions {
    pub project_key: CoreKey,
    /// Only known to the device that created the project.
    pub project_secret_key: Option<Keypair>,
    /// Per-device secret all writer keys are derived from.
    pub root_key: [u8; KEY_SIZE],
    pub storage: Arc<dyn CoreStorage>,
    pub key_store: Arc<dyn CoreKeyStore>,
    pub have_debounce: Duration,
}

impl CoreManagerOptions {
    pub fn new(
        project_key: CoreKey,
        root_key: [u8; KEY_SIZE],
        storage: Arc<dyn CoreStorage>,
        key_store: Arc<dyn CoreKeyStore>,
    ) -> Self {
        Self {
            project_key,
            project_secret_key: None,
            root_key,
            storage,
            key_store,
            have_debounce: DEFAULT_HAVE_DEBOUNCE,
        }
    }
}

/// A have received from a peer, decoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerHave {
    pub namespace: Namespace,
    pub peer: PeerId,
    pub discovery_key: DiscoveryKey,
    pub start: u64,
    /// Relative to `start`.
    pub bitfield: Bitfield,
    pub length: u64,
}

#[derive(Clone, Debug)]
pub enum CoreManagerEvent {
    AddCore(CoreRecord),
    PeerHave(PeerHave),
    /// An event of one of the managed cores.
    Core {
        namespace: Namespace,
        discovery_key: DiscoveryKey,
        event: CoreEvent,
    },
}

#[derive(Debug)]
struct Inner {
    project_key: CoreKey,
    creator: CoreRecord,
    writers: NamespaceMap<CoreRecord>,
    writer_keypairs: NamespaceMap<Keypair>,
    have_actors: NamespaceMap<HaveActorHandle>,
    index: RwLock<CoreIndex>,
    storage: Arc<dyn CoreStorage>,
    key_store: Arc<dyn CoreKeyStore>,
    events: broadcast::Sender<CoreManagerEvent>,
    sessions: Sessions,
    /// Discovery keys whose core key we asked peers for.
    requested: Mutex<HashSet<DiscoveryKey>>,
    cancel: CancellationToken,
}

/// Owns every core of a project: the local writer of each namespace, the
/// creator's core, and all remote cores learned about since.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone, Debug)]
pub struct CoreManager {
    inner: Arc<Inner>,
}

impl CoreManager {
    pub async fn open(options: CoreManagerOptions) -> Result<Self, CoreManagerError> {
        let CoreManagerOptions {
            project_key,
            project_secret_key,
            root_key,
            storage,
            key_store,
            have_debounce,
        } = options;

        if let Some(kp) = &project_secret_key
            && kp.core_key() != project_key
        {
            return Err(CoreManagerError::ProjectKeyMismatch);
        }

        let writer_keypairs = NamespaceMap::from_fn(|ns| match (ns, &project_secret_key) {
            (Namespace::Auth, Some(kp)) => kp.clone(),
            _ => derive_writer_keypair(&root_key, &project_key, ns),
        });
        let writers = NamespaceMap::try_from_fn(|ns| {
            let keypair = writer_keypairs[ns].clone();
            let core = storage
                .open(keypair.core_key(), Some(keypair))
                .map_err(CoreManagerError::Storage)?;
            Ok(CoreRecord::new(core, ns, true))
        })?;
        for record in writers.values() {
            record.core.ready().await.map_err(CoreManagerError::Storage)?;
        }

        let creator = if project_secret_key.is_some() {
            writers[Namespace::Auth].clone()
        } else {
            let core = storage
                .open(project_key, None)
                .map_err(CoreManagerError::Storage)?;
            core.ready().await.map_err(CoreManagerError::Storage)?;
            CoreRecord::new(core, Namespace::Auth, false)
        };

        let mut index = CoreIndex::default();
        for record in writers.values() {
            index.insert(record.clone());
        }
        index.insert(creator.clone());

        let sessions: Sessions = Default::default();
        let cancel = CancellationToken::new();
        let have_actors = writers.map(|ns, record| {
            HaveActorHandle::spawn(
                ns,
                record.core.clone(),
                sessions.clone(),
                have_debounce,
                cancel.child_token(),
            )
        });
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Arc::new(Inner {
            project_key,
            creator,
            writers,
            writer_keypairs,
            have_actors,
            index: RwLock::new(index),
            storage,
            key_store,
            events,
            sessions,
            requested: Default::default(),
            cancel,
        });
        let initial: Vec<_> = inner.index.read().unwrap().all().cloned().collect();
        for record in &initial {
            watch_core(&inner, record);
        }

        let manager = Self { inner };
        let persisted = manager
            .inner
            .key_store
            .list()
            .await
            .map_err(CoreManagerError::Storage)?;
        for (namespace, key) in persisted {
            if let Err(e) = manager.add_core_inner(key, namespace, false).await {
                warn!(core = %key.fmt_short(), %namespace, "failed to reopen core: {e}");
            }
        }
        debug!(
            project = %project_key.fmt_short(),
            cores = manager.inner.index.read().unwrap().len(),
            "core manager opened"
        );
        Ok(manager)
    }

    pub fn project_key(&self) -> CoreKey {
        self.inner.project_key
    }

    /// Whether the local device created the project.
    pub fn is_creator(&self) -> bool {
        self.inner.creator.is_local_writer
    }

    pub fn creator_core(&self) -> CoreRecord {
        self.inner.creator.clone()
    }

    pub fn writer_core(&self, namespace: Namespace) -> CoreRecord {
        self.inner.writers[namespace].clone()
    }

    /// Signs `message` with the writer key of `namespace`, proving control
    /// of that core.
    pub fn sign_with_writer(&self, namespace: Namespace, message: &[u8]) -> Signature {
        self.inner.writer_keypairs[namespace].sign(message)
    }

    pub fn get_core_by_key(&self, key: &CoreKey) -> Option<CoreRecord> {
        self.inner.index.read().unwrap().get_by_key(key).cloned()
    }

    pub fn get_core_by_discovery_key(&self, discovery_key: &DiscoveryKey) -> Option<CoreRecord> {
        self.inner.index.read().unwrap().get(discovery_key).cloned()
    }

    pub fn get_cores(&self, namespace: Namespace) -> Vec<CoreRecord> {
        self.inner.index.read().unwrap().namespace(namespace)
    }

    pub fn all_cores(&self) -> Vec<CoreRecord> {
        self.inner.index.read().unwrap().all().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreManagerEvent> {
        self.inner.events.subscribe()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.sessions.lock().unwrap().keys().copied().collect()
    }

    /// Registers a remote core. Known cores are returned as they are.
    pub async fn add_core(
        &self,
        key: CoreKey,
        namespace: Namespace,
    ) -> Result<CoreRecord, CoreManagerError> {
        self.add_core_inner(key, namespace, true).await
    }

    async fn add_core_inner(
        &self,
        key: CoreKey,
        namespace: Namespace,
        persist: bool,
    ) -> Result<CoreRecord, CoreManagerError> {
        if let Some(record) = self.get_core_by_key(&key) {
            return Ok(record);
        }
        let core = self
            .inner
            .storage
            .open(key, None)
            .map_err(CoreManagerError::Storage)?;
        core.ready().await.map_err(CoreManagerError::Storage)?;
        let record = CoreRecord::new(core, namespace, false);

        let existing = {
            let mut index = self.inner.index.write().unwrap();
            if index.insert(record.clone()) {
                None
            } else {
                index.get(&record.discovery_key).cloned()
            }
        };
        if let Some(existing) = existing {
            return Ok(existing);
        }

        if persist && let Err(e) = self.inner.key_store.insert(namespace, key).await {
            warn!(core = %key.fmt_short(), %namespace, "failed to persist core key: {e:#}");
        }
        watch_core(&self.inner, &record);
        debug!(core = %key.fmt_short(), %namespace, "added core");
        let _ = self
            .inner
            .events
            .send(CoreManagerEvent::AddCore(record.clone()));
        Ok(record)
    }

    /// Starts tracking a connection. The peer is sent our auth core keys and
    /// the creator core is replicated, which kicks off the have exchange.
    pub async fn add_peer(&self, session: Arc<dyn ReplicationSession>) {
        let peer = session.peer_id();
        self.inner
            .sessions
            .lock()
            .unwrap()
            .insert(peer, session.clone());

        let mut keys = ProjectExtension::default();
        for record in self.get_cores(Namespace::Auth) {
            keys.push_key(Namespace::Auth, record.key);
        }
        if let Err(e) = session.send(ExtensionMessage::Project(keys)).await {
            warn!(peer = %peer.fmt_short(), "failed to send auth core keys: {e:#}");
        }
        if let Err(e) = session.replicate(self.inner.creator.core.clone()).await {
            warn!(peer = %peer.fmt_short(), "failed to replicate creator core: {e:#}");
        }
        debug!(peer = %peer.fmt_short(), "peer added");
    }

    pub async fn remove_peer(&self, peer: &PeerId) {
        let session = self.inner.sessions.lock().unwrap().remove(peer);
        let Some(session) = session else {
            return;
        };
        for record in self.all_cores() {
            if let Err(e) = session.unreplicate(&record.discovery_key).await {
                debug!(peer = %peer.fmt_short(), "unreplicate on disconnect failed: {e:#}");
            }
        }
        debug!(peer = %peer.fmt_short(), "peer removed");
    }

    fn session(&self, peer: &PeerId) -> Result<Arc<dyn ReplicationSession>, CoreManagerError> {
        self.inner
            .sessions
            .lock()
            .unwrap()
            .get(peer)
            .cloned()
            .ok_or(CoreManagerError::UnknownPeer(*peer))
    }

    pub async fn replicate(
        &self,
        peer: &PeerId,
        discovery_key: &DiscoveryKey,
    ) -> Result<(), CoreManagerError> {
        let session = self.session(peer)?;
        let record = self
            .get_core_by_discovery_key(discovery_key)
            .ok_or(CoreManagerError::UnknownCore(*discovery_key))?;
        session
            .replicate(record.core)
            .await
            .map_err(CoreManagerError::Session)
    }

    pub async fn unreplicate(
        &self,
        peer: &PeerId,
        discovery_key: &DiscoveryKey,
    ) -> Result<(), CoreManagerError> {
        let session = self.session(peer)?;
        session
            .unreplicate(discovery_key)
            .await
            .map_err(CoreManagerError::Session)
    }

    /// Sends a have for every non-empty core, optionally restricted to one
    /// namespace. Stops at the first failed send.
    pub async fn send_haves(
        &self,
        peer: &PeerId,
        namespace: Option<Namespace>,
    ) -> Result<(), CoreManagerError> {
        let session = self.session(peer)?;
        let records = match namespace {
            Some(ns) => self.get_cores(ns),
            None => self.all_cores(),
        };
        let mut sent = 0usize;
        for record in records {
            let bitfield = record.core.bitfield();
            if bitfield.is_empty() {
                continue;
            }
            let have = HaveExtension::new(record.namespace, record.discovery_key, 0, &bitfield);
            if let Err(e) = session.send(ExtensionMessage::Have(have)).await {
                warn!(peer = %peer.fmt_short(), "failed to send haves: {e:#}");
                return Ok(());
            }
            sent += 1;
        }
        debug!(peer = %peer.fmt_short(), sent, "sent haves");
        Ok(())
    }

    /// Asks `peer` for the core key behind `discovery_key`. The answer is
    /// accepted whatever its namespace.
    pub async fn request_core_key(
        &self,
        peer: &PeerId,
        discovery_key: DiscoveryKey,
    ) -> Result<(), CoreManagerError> {
        if self.get_core_by_discovery_key(&discovery_key).is_some() {
            return Ok(());
        }
        let session = self.session(peer)?;
        self.inner.requested.lock().unwrap().insert(discovery_key);
        let msg = ExtensionMessage::Project(ProjectExtension {
            want_core_keys: vec![discovery_key],
            ..Default::default()
        });
        if let Err(e) = session.send(msg).await {
            warn!(peer = %peer.fmt_short(), "failed to request core key: {e:#}");
        }
        Ok(())
    }

    /// Handles an extension message received from `peer`.
    pub async fn handle_extension(&self, peer: &PeerId, message: ExtensionMessage) {
        match message {
            ExtensionMessage::Project(ext) => self.handle_project_extension(peer, ext).await,
            ExtensionMessage::Have(have) => self.handle_have(peer, have),
        }
    }

    async fn handle_project_extension(&self, peer: &PeerId, ext: ProjectExtension) {
        for (namespace, keys) in ext.by_namespace().iter() {
            for &key in *keys {
                if namespace != Namespace::Auth {
                    let requested = self
                        .inner
                        .requested
                        .lock()
                        .unwrap()
                        .remove(&key.discovery_key());
                    if !requested {
                        debug!(peer = %peer.fmt_short(), %namespace, "ignoring unrequested core key");
                        continue;
                    }
                }
                if let Err(e) = self.add_core(key, namespace).await {
                    warn!(peer = %peer.fmt_short(), core = %key.fmt_short(), "failed to add core: {e}");
                }
            }
        }

        if ext.want_core_keys.is_empty() {
            return;
        }
        let mut response = ProjectExtension::default();
        for dk in &ext.want_core_keys {
            if let Some(record) = self.get_core_by_discovery_key(dk) {
                response.push_key(record.namespace, record.key);
            }
        }
        if response.is_empty() {
            return;
        }
        match self.session(peer) {
            Ok(session) => {
                if let Err(e) = session.send(ExtensionMessage::Project(response)).await {
                    warn!(peer = %peer.fmt_short(), "failed to send core keys: {e:#}");
                }
            }
            Err(e) => debug!("{e}"),
        }
    }

    fn handle_have(&self, peer: &PeerId, have: HaveExtension) {
        let namespace = match have.namespace {
            WireNamespace::Known(ns) => ns,
            WireNamespace::Unrecognized(value) => {
                debug!(peer = %peer.fmt_short(), value, "dropping have for unrecognized namespace");
                return;
            }
        };
        let (bitfield, length) = match have.bitfield() {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(peer = %peer.fmt_short(), "dropping malformed have: {e}");
                return;
            }
        };
        let _ = self.inner.events.send(CoreManagerEvent::PeerHave(PeerHave {
            namespace,
            peer: *peer,
            discovery_key: have.discovery_key,
            start: u64::from(have.start),
            bitfield,
            length,
        }));
    }

    async fn handle_core_event(&self, record: &CoreRecord, event: &CoreEvent) {
        match event {
            CoreEvent::Append { start, .. } if record.is_local_writer => {
                self.inner.have_actors[record.namespace]
                    .appended(*start)
                    .await;
            }
            CoreEvent::PeerAdd(peer) => {
                let session = self.inner.sessions.lock().unwrap().get(peer).cloned();
                if let Some(session) = session {
                    // A peer's bitfield is only revealed once we want its
                    // blocks, so want everything right away.
                    if let Err(e) = session.want_all(&record.discovery_key).await {
                        warn!(peer = %peer.fmt_short(), "failed to request blocks: {e:#}");
                    }
                    if record.discovery_key == self.inner.creator.discovery_key
                        && let Err(e) = self.send_haves(peer, None).await
                    {
                        debug!("{e}");
                    }
                }
            }
            _ => {}
        }
    }

    /// Stops every background task. Connected sessions are dropped.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.sessions.lock().unwrap().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

fn watch_core(inner: &Arc<Inner>, record: &CoreRecord) {
    let weak: Weak<Inner> = Arc::downgrade(inner);
    let mut events = record.core.subscribe();
    let cancel = inner.cancel.child_token();
    let record = record.clone();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            let event = match event {
                Ok(event) => event,
                Err(RecvError::Lagged(n)) => {
                    warn!(core = %record.key.fmt_short(), "missed {n} core events");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let manager = CoreManager { inner };
            manager.handle_core_event(&record, &event).await;
            let _ = manager.inner.events.send(CoreManagerEvent::Core {
                namespace: record.namespace,
                discovery_key: record.discovery_key,
                event,
            });
        }
    });
}
