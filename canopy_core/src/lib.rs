//! Core canopy protocol types and traits.
//!
//! This crate defines the types shared by all canopy crates.
//!
//! ## Protocol types (wire-stable)
//!
//! The following modules define on-the-wire formats:
//!
//! - Namespaces and per-namespace maps (`namespace::Namespace`,
//!   `namespace::NamespaceMap`)
//! - Keys, discovery keys and signatures (`keys::CoreKey`,
//!   `keys::DiscoveryKey`, `keys::Signature`, `keys::DeviceId`)
//! - Record versions (`version::VersionId`)
//! - The run-length bitfield encoding (`bitfield::rle`)
//! - Extension messages and their framing (`wire::ExtensionMessage`,
//!   `wire::ExtensionCodec`)
//!
//! Changes to them are protocol changes.
//!
//! ## Collaborator traits
//!
//! Cores and the transport are provided by the host:
//!
//! - `core::Core` and `core::CoreStorage` for the append-only log
//! - `session::ReplicationSession` for one replication connection to a peer
//!
//! An in-memory implementation of all three lives in `canopy_core_memory`.

pub mod bitfield;
pub mod core;
pub mod keys;
pub mod namespace;
pub mod session;
pub mod version;
pub mod wire;

pub use bitfield::Bitfield;
pub use core::{Core, CoreEvent, CoreStorage};
pub use keys::{CoreKey, DeviceId, DiscoveryKey, Keypair, PeerId, Signature};
pub use namespace::{DATA_NAMESPACES, Namespace, NamespaceMap, PRESYNC_NAMESPACES};
pub use session::ReplicationSession;
pub use version::VersionId;
pub use wire::ExtensionMessage;
