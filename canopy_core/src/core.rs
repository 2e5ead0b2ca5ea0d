//! The replicated append-only log ("core") primitive.
//!
//! Canopy does not implement cores itself. Storage engines plug in through
//! [`CoreStorage`], which opens [`Core`] handles by key.

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use crate::{
    bitfield::Bitfield,
    keys::{CoreKey, DiscoveryKey, Keypair, PeerId},
};

/// Something that happened to a core, local or remote.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoreEvent {
    /// Blocks `[start, start + length)` were appended locally.
    Append { start: u64, length: u64 },
    /// A block was downloaded from a peer.
    Download { index: u64 },
    /// A peer started replicating this core with us.
    PeerAdd(PeerId),
    /// A peer stopped replicating this core.
    PeerRemove(PeerId),
    /// A replicating peer revealed which of the blocks
    /// `[start, start + length)` it has. `bitfield` is relative to `start`.
    PeerBitfield {
        peer: PeerId,
        start: u64,
        length: u64,
        bitfield: Bitfield,
    },
}

#[async_trait]
pub trait Core: Debug + Send + Sync + 'static {
    fn key(&self) -> CoreKey;

    fn discovery_key(&self) -> DiscoveryKey {
        self.key().discovery_key()
    }

    /// Whether we hold the secret key of this core.
    fn writable(&self) -> bool;

    /// Number of blocks known to exist, downloaded or not.
    fn length(&self) -> u64;

    /// Blocks that are present locally.
    fn bitfield(&self) -> Bitfield;

    /// Waits until the core has loaded its metadata.
    async fn ready(&self) -> anyhow::Result<()>;

    /// Appends a block and returns its index. Fails on cores we cannot write.
    async fn append(&self, block: Bytes) -> anyhow::Result<u64>;

    /// Reads a block if it is present locally.
    async fn get(&self, index: u64) -> anyhow::Result<Option<Bytes>>;

    fn subscribe(&self) -> broadcast::Receiver<CoreEvent>;
}

pub trait CoreStorage: Debug + Send + Sync + 'static {
    /// Opens (creating if needed) the core with public key `key`. The
    /// keypair is given for cores we write to.
    fn open(&self, key: CoreKey, keypair: Option<Keypair>) -> anyhow::Result<Arc<dyn Core>>;
}
