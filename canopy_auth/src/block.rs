//! Blocks appended to auth cores.

use canopy_core::{DeviceId, VersionId};
use minicbor::{Decode, Encode};

use crate::{ownership::SignedCoreOwnership, role::RoleId};

#[derive(Encode, Decode, Clone, Debug, PartialEq, Eq)]
#[cbor(flat)]
pub enum AuthBlock {
    #[n(0)]
    CoreOwnership(#[n(0)] SignedCoreOwnership),
    #[n(1)]
    Role(#[n(0)] RoleBlock),
}

/// One version of a device's role document.
#[derive(Encode, Decode, Clone, Debug, PartialEq, Eq)]
#[cbor(map)]
pub struct RoleBlock {
    /// The device the role is assigned to.
    #[n(0)]
    pub doc_id: DeviceId,
    #[n(1)]
    #[cbor(default)]
    pub links: Vec<VersionId>,
    #[n(2)]
    pub role_id: RoleId,
    /// Length of the target device's auth core when the role was assigned.
    #[n(3)]
    pub from_index: u64,
}

/// The indexed value of a role record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoleValue {
    pub role_id: RoleId,
    pub from_index: u64,
}
