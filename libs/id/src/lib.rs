//! # fleet-id
//!
//! Typed identifiers used by the node manager.
//!
//! Identifiers are system-generated, prefixed ULIDs: `{prefix}_{ulid}`.
//!
//! - `node_01HV4Z4NYPLTRS0JTUA8XDME5F` names one node record (one intended or
//!   actual compute node). It is stamped on the cloud instance as a tag so a
//!   lost create acknowledgement can still be paired.
//! - `tick_01HV4Z2WQXKJNM8GPQY6VBKC3D` names one reconciliation pass, so every
//!   decision logged during that pass can be correlated.
//!
//! IDs order by creation time, so sorted record listings come out oldest
//! first.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Backing type of every ID, re-exported for the `define_id!` expansion.
pub use ulid::Ulid;
