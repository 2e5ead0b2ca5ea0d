//! The fixed set of roles and what each one allows.

use std::fmt;

use canopy_core::{Namespace, NamespaceMap};
use minicbor::{Decode, Encode};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Encode, Decode)]
#[cbor(index_only)]
pub enum RoleId {
    #[n(0)]
    Creator,
    #[n(1)]
    Coordinator,
    #[n(2)]
    Member,
    #[n(3)]
    Blocked,
    #[n(4)]
    Left,
    /// Fallback for devices without a valid role record.
    #[n(5)]
    NoRole,
}

impl RoleId {
    pub fn role(self) -> &'static Role {
        match self {
            RoleId::Creator => &CREATOR_ROLE,
            RoleId::Coordinator => &COORDINATOR_ROLE,
            RoleId::Member => &MEMBER_ROLE,
            RoleId::Blocked => &BLOCKED_ROLE,
            RoleId::Left => &LEFT_ROLE,
            RoleId::NoRole => &NO_ROLE,
        }
    }

    /// Ordering key for "least permissive first": the number of roles it
    /// may assign, then a fixed rank.
    pub fn permissiveness(self) -> (usize, u8) {
        let rank = match self {
            RoleId::Blocked => 0,
            RoleId::Left => 1,
            RoleId::NoRole => 2,
            RoleId::Member => 3,
            RoleId::Coordinator => 4,
            RoleId::Creator => 5,
        };
        (self.role().role_assignment.len(), rank)
    }
}

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.role().name)
    }
}

/// Document schemas a role grants access to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Schema {
    Observation,
    Track,
    Preset,
    Field,
    ProjectSettings,
    DeviceInfo,
    Role,
    CoreOwnership,
    Icon,
    Translation,
    RemoteDetectionAlert,
}

impl Schema {
    pub const COUNT: usize = 11;

    pub const ALL: [Schema; Self::COUNT] = [
        Schema::Observation,
        Schema::Track,
        Schema::Preset,
        Schema::Field,
        Schema::ProjectSettings,
        Schema::DeviceInfo,
        Schema::Role,
        Schema::CoreOwnership,
        Schema::Icon,
        Schema::Translation,
        Schema::RemoteDetectionAlert,
    ];
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DocCapability {
    pub read_own: bool,
    pub write_own: bool,
    pub read_others: bool,
    pub write_others: bool,
}

impl DocCapability {
    const ALL: Self = Self::new(true, true, true, true);
    const NONE: Self = Self::new(false, false, false, false);
    const OWN_AND_READ: Self = Self::new(true, true, true, false);
    const OWN: Self = Self::new(true, true, false, false);

    const fn new(read_own: bool, write_own: bool, read_others: bool, write_others: bool) -> Self {
        Self {
            read_own,
            write_own,
            read_others,
            write_others,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncPolicy {
    Allowed,
    Blocked,
}

/// A role's sync policy as seen by the sync layer. `Unknown` until the
/// device's role has synced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncCapability {
    Allowed,
    Blocked,
    Unknown,
}

impl From<SyncPolicy> for SyncCapability {
    fn from(policy: SyncPolicy) -> Self {
        match policy {
            SyncPolicy::Allowed => SyncCapability::Allowed,
            SyncPolicy::Blocked => SyncCapability::Blocked,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Role {
    pub role_id: RoleId,
    pub name: &'static str,
    docs: [DocCapability; Schema::COUNT],
    /// Roles this role may assign to others.
    pub role_assignment: &'static [RoleId],
    pub sync: NamespaceMap<SyncPolicy>,
}

impl Role {
    pub fn doc(&self, schema: Schema) -> DocCapability {
        self.docs[schema as usize]
    }

    pub fn can_assign(&self, role_id: RoleId) -> bool {
        self.role_assignment.contains(&role_id)
    }
}

const ASSIGNABLE: &[RoleId] = &[RoleId::Coordinator, RoleId::Member, RoleId::Blocked];

const ALLOW_ALL: NamespaceMap<SyncPolicy> = NamespaceMap::from_array([SyncPolicy::Allowed; 5]);
const BLOCK_ALL: NamespaceMap<SyncPolicy> = NamespaceMap::from_array([SyncPolicy::Blocked; 5]);

pub static CREATOR_ROLE: Role = Role {
    role_id: RoleId::Creator,
    name: "Project Creator",
    docs: [DocCapability::ALL; Schema::COUNT],
    role_assignment: ASSIGNABLE,
    sync: ALLOW_ALL,
};

pub static COORDINATOR_ROLE: Role = Role {
    role_id: RoleId::Coordinator,
    name: "Coordinator",
    docs: [DocCapability::ALL; Schema::COUNT],
    role_assignment: ASSIGNABLE,
    sync: ALLOW_ALL,
};

pub static MEMBER_ROLE: Role = Role {
    role_id: RoleId::Member,
    name: "Member",
    docs: [DocCapability::OWN_AND_READ; Schema::COUNT],
    role_assignment: &[],
    sync: ALLOW_ALL,
};

pub static BLOCKED_ROLE: Role = Role {
    role_id: RoleId::Blocked,
    name: "Blocked",
    docs: [DocCapability::NONE; Schema::COUNT],
    role_assignment: &[],
    sync: BLOCK_ALL,
};

/// A device that left the project keeps syncing auth records so others
/// learn that it left.
pub static LEFT_ROLE: Role = Role {
    role_id: RoleId::Left,
    name: "Left",
    docs: [DocCapability::NONE; Schema::COUNT],
    role_assignment: &[],
    sync: NamespaceMap::from_array([
        SyncPolicy::Allowed,
        SyncPolicy::Blocked,
        SyncPolicy::Blocked,
        SyncPolicy::Blocked,
        SyncPolicy::Blocked,
    ]),
};

pub static NO_ROLE: Role = Role {
    role_id: RoleId::NoRole,
    name: "No Role",
    docs: [DocCapability::OWN; Schema::COUNT],
    role_assignment: &[],
    sync: NamespaceMap::from_array([
        SyncPolicy::Allowed,
        SyncPolicy::Allowed,
        SyncPolicy::Blocked,
        SyncPolicy::Allowed,
        SyncPolicy::Allowed,
    ]),
};
