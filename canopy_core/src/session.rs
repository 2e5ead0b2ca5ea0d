use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;

use crate::{
    core::Core,
    keys::{DiscoveryKey, PeerId},
    wire::ExtensionMessage,
};

/// One connection to a peer, multiplexing the replication of many cores and
/// carrying the project extension messages.
///
/// Cores can be added and removed while the session is live.
#[async_trait]
pub trait ReplicationSession: Debug + Send + Sync + 'static {
    fn peer_id(&self) -> PeerId;

    async fn replicate(&self, core: Arc<dyn Core>) -> anyhow::Result<()>;

    async fn unreplicate(&self, discovery_key: &DiscoveryKey) -> anyhow::Result<()>;

    /// Asks the peer for every block of the core, which also makes it
    /// reveal its bitfield.
    async fn want_all(&self, discovery_key: &DiscoveryKey) -> anyhow::Result<()>;

    async fn send(&self, message: ExtensionMessage) -> anyhow::Result<()>;
}
