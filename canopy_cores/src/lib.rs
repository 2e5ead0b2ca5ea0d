//! The core manager of a canopy project.
//!
//! [`CoreManager`] keeps the index of every core in a project, grouped by
//! namespace:
//!
//! - the five local writer cores, derived from the project key and the
//!   device's root key on every start
//! - the project creator's auth core
//! - remote cores learned from peers or from core ownership records,
//!   persisted through a [`CoreKeyStore`]
//!
//! It also speaks the project extension: auth core keys are exchanged on
//! connect, and "have" messages announce which blocks of each core we hold
//! so peers can work out what they are missing without a download round
//! trip.

mod have;
mod index;
pub mod key_store;
mod manager;

pub use index::CoreRecord;
pub use key_store::{CoreKeyStore, MemoryCoreKeyStore};
pub use manager::{
    CoreManager, CoreManagerError, CoreManagerEvent, CoreManagerOptions, DEFAULT_HAVE_DEBOUNCE,
    PeerHave,
};
