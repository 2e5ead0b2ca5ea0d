//! Who owns which core, and what each device may do.
//!
//! Both questions are answered from blocks appended to auth cores:
//!
//! - [`CoreOwnership`] verifies and indexes the signed document each device
//!   writes once, binding its identity to its five writer cores.
//! - [`Roles`] resolves a device's [`Role`] from role records by validating
//!   the chain of assignments back to the project creator.
//!
//! [`AuthIndexerHandle`] feeds both from the cores of a
//! [`CoreManager`](canopy_cores::CoreManager).

pub mod block;
mod indexer;
pub mod ownership;
pub mod records;
pub mod role;
pub mod roles;

pub use block::{AuthBlock, RoleBlock, RoleValue};
pub use indexer::AuthIndexerHandle;
pub use ownership::{
    CoreOwnership, CoreOwnershipDoc, OwnershipError, SignedCoreOwnership, VerificationError,
};
pub use records::{MemoryRecordStore, Record, RecordStore};
pub use role::{Role, RoleId, Schema, SyncCapability, SyncPolicy};
pub use roles::{ROLE_CHAIN_ITERATION_LIMIT, RoleError, RoleRecord, Roles, RolesEvent};
