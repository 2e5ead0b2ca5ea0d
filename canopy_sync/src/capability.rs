use async_trait::async_trait;
use canopy_auth::{Roles, RolesEvent, SyncCapability};
use canopy_core::{DeviceId, NamespaceMap};
use tokio::sync::broadcast;
use tracing::warn;

/// Source of the per-namespace sync capability of remote devices.
#[async_trait]
pub trait SyncCapabilities: std::fmt::Debug + Send + Sync + 'static {
    /// Never fails; a device that cannot be resolved is `Unknown`
    /// everywhere.
    async fn sync_capability(&self, device_id: &DeviceId) -> NamespaceMap<SyncCapability>;

    /// Fires whenever a capability may have changed.
    fn updates(&self) -> broadcast::Receiver<RolesEvent>;
}

#[async_trait]
impl SyncCapabilities for Roles {
    async fn sync_capability(&self, device_id: &DeviceId) -> NamespaceMap<SyncCapability> {
        match Roles::sync_capability(self, device_id).await {
            Ok(capability) => capability,
            Err(e) => {
                warn!(device = %device_id.fmt_short(), "failed to resolve sync capability: {e}");
                NamespaceMap::from_fn(|_| SyncCapability::Unknown)
            }
        }
    }

    fn updates(&self) -> broadcast::Receiver<RolesEvent> {
        self.subscribe()
    }
}
