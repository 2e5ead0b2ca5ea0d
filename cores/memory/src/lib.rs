//! In-memory cores, core storage and replication sessions.
//!
//! Nothing here touches the network. [`MemorySession`] records what would
//! have been sent to the peer, and [`MemoryCore::put_remote`] stands in for a
//! block arriving from one.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex, RwLock},
};

use anyhow::{anyhow, bail};
use bytes::{Bytes, BytesMut};
use canopy_core::{
    Bitfield, Core, CoreEvent, CoreKey, CoreStorage, DiscoveryKey, ExtensionMessage, Keypair,
    PeerId, ReplicationSession, wire::ExtensionCodec,
};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_util::codec::{Decoder, Encoder};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct CoreState {
    blocks: BTreeMap<u64, Bytes>,
    bitfield: Bitfield,
    length: u64,
    failing_reads: usize,
}

#[derive(Debug)]
pub struct MemoryCore {
    key: CoreKey,
    keypair: Option<Keypair>,
    state: RwLock<CoreState>,
    events: broadcast::Sender<CoreEvent>,
}

impl MemoryCore {
    pub fn new(key: CoreKey, keypair: Option<Keypair>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            key,
            keypair,
            state: RwLock::new(CoreState::default()),
            events,
        }
    }

    /// Stores a block as if it had been downloaded from a peer.
    pub fn put_remote(&self, index: u64, block: Bytes) {
        {
            let mut state = self.state.write().unwrap();
            state.blocks.insert(index, block);
            state.bitfield.set(index, true);
            state.length = state.length.max(index + 1);
        }
        let _ = self.events.send(CoreEvent::Download { index });
    }

    /// Records that the core is known to have at least `length` blocks.
    pub fn set_remote_length(&self, length: u64) {
        let mut state = self.state.write().unwrap();
        state.length = state.length.max(length);
    }

    /// Makes the next `count` reads fail.
    pub fn fail_next_reads(&self, count: usize) {
        self.state.write().unwrap().failing_reads = count;
    }

    pub fn peer_add(&self, peer: PeerId) {
        let _ = self.events.send(CoreEvent::PeerAdd(peer));
    }

    pub fn peer_remove(&self, peer: PeerId) {
        let _ = self.events.send(CoreEvent::PeerRemove(peer));
    }

    /// Reports the blocks a replicating peer has, starting at block 0.
    pub fn peer_bitfield(&self, peer: PeerId, bitfield: Bitfield) {
        let _ = self.events.send(CoreEvent::PeerBitfield {
            peer,
            start: 0,
            length: bitfield.len(),
            bitfield,
        });
    }
}

#[async_trait::async_trait]
impl Core for MemoryCore {
    fn key(&self) -> CoreKey {
        self.key
    }

    fn writable(&self) -> bool {
        self.keypair.is_some()
    }

    fn length(&self) -> u64 {
        self.state.read().unwrap().length
    }

    fn bitfield(&self) -> Bitfield {
        self.state.read().unwrap().bitfield.clone()
    }

    async fn ready(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn append(&self, block: Bytes) -> anyhow::Result<u64> {
        if self.keypair.is_none() {
            bail!("core {} is not writable", self.key.fmt_short());
        }
        let index = {
            let mut state = self.state.write().unwrap();
            let index = state.length;
            state.blocks.insert(index, block);
            state.bitfield.set(index, true);
            state.length = index + 1;
            index
        };
        let _ = self.events.send(CoreEvent::Append {
            start: index,
            length: 1,
        });
        Ok(index)
    }

    async fn get(&self, index: u64) -> anyhow::Result<Option<Bytes>> {
        let mut state = self.state.write().unwrap();
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            bail!("injected read failure at {index}");
        }
        Ok(state.blocks.get(&index).cloned())
    }

    fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }
}

/// Keeps every opened core for the lifetime of the storage, so reopening a
/// key returns the same core.
#[derive(Debug, Default)]
pub struct MemoryCoreStorage {
    cores: DashMap<CoreKey, Arc<MemoryCore>>,
}

impl MemoryCoreStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CoreKey) -> Option<Arc<MemoryCore>> {
        self.cores.get(key).map(|c| c.clone())
    }

    pub fn len(&self) -> usize {
        self.cores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cores.is_empty()
    }
}

impl CoreStorage for MemoryCoreStorage {
    fn open(&self, key: CoreKey, keypair: Option<Keypair>) -> anyhow::Result<Arc<dyn Core>> {
        if let Some(kp) = &keypair {
            if kp.core_key() != key {
                bail!("keypair does not match core {}", key.fmt_short());
            }
        }
        let core = self
            .cores
            .entry(key)
            .or_insert_with(|| Arc::new(MemoryCore::new(key, keypair)))
            .clone();
        Ok(core)
    }
}

#[derive(Debug, Default)]
struct SessionState {
    replicating: HashSet<DiscoveryKey>,
    wanted: HashSet<DiscoveryKey>,
    outbox: BytesMut,
    codec: ExtensionCodec,
}

/// A replication session whose far end is a test.
///
/// Replicating a core fires `PeerAdd` on it right away, as if the peer had
/// opened the same core on its side.
#[derive(Debug)]
pub struct MemorySession {
    peer: PeerId,
    storage: Arc<MemoryCoreStorage>,
    state: Mutex<SessionState>,
    closed: std::sync::atomic::AtomicBool,
}

impl MemorySession {
    pub fn new(peer: PeerId, storage: Arc<MemoryCoreStorage>) -> Self {
        Self {
            peer,
            storage,
            state: Mutex::new(SessionState::default()),
            closed: Default::default(),
        }
    }

    pub fn is_replicating(&self, discovery_key: &DiscoveryKey) -> bool {
        self.state.lock().unwrap().replicating.contains(discovery_key)
    }

    pub fn replicating(&self) -> HashSet<DiscoveryKey> {
        self.state.lock().unwrap().replicating.clone()
    }

    pub fn is_wanted(&self, discovery_key: &DiscoveryKey) -> bool {
        self.state.lock().unwrap().wanted.contains(discovery_key)
    }

    /// Drains and decodes everything sent so far.
    pub fn take_sent(&self) -> Vec<ExtensionMessage> {
        let mut state = self.state.lock().unwrap();
        let SessionState { outbox, codec, .. } = &mut *state;
        let mut out = Vec::new();
        while let Ok(Some(msg)) = codec.decode(outbox) {
            out.push(msg);
        }
        out
    }

    /// Makes every further send fail, like a dropped connection.
    pub fn close(&self) {
        self.closed
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_open(&self) -> anyhow::Result<()> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(anyhow!("session to {} is closed", self.peer.fmt_short()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ReplicationSession for MemorySession {
    fn peer_id(&self) -> PeerId {
        self.peer
    }

    async fn replicate(&self, core: Arc<dyn Core>) -> anyhow::Result<()> {
        self.check_open()?;
        let dk = core.discovery_key();
        let added = self.state.lock().unwrap().replicating.insert(dk);
        if added {
            if let Some(core) = self.storage.get(&core.key()) {
                core.peer_add(self.peer);
            }
        }
        Ok(())
    }

    async fn unreplicate(&self, discovery_key: &DiscoveryKey) -> anyhow::Result<()> {
        let removed = self.state.lock().unwrap().replicating.remove(discovery_key);
        if removed {
            let core = self
                .storage
                .cores
                .iter()
                .find(|c| c.key().discovery_key() == *discovery_key)
                .map(|c| c.value().clone());
            if let Some(core) = core {
                core.peer_remove(self.peer);
            }
        }
        Ok(())
    }

    async fn want_all(&self, discovery_key: &DiscoveryKey) -> anyhow::Result<()> {
        self.check_open()?;
        self.state.lock().unwrap().wanted.insert(*discovery_key);
        Ok(())
    }

    async fn send(&self, message: ExtensionMessage) -> anyhow::Result<()> {
        self.check_open()?;
        let mut state = self.state.lock().unwrap();
        let SessionState { outbox, codec, .. } = &mut *state;
        codec.encode(message, outbox)?;
        Ok(())
    }
}
