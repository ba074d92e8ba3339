//! Fleet Node Manager Library
//!
//! Keeps a pool of cloud compute nodes sized to the resource demand of a job
//! queue: boots nodes when jobs wait, drains nodes that sit idle, and cleans
//! up nodes that fail to come up.
//!
//! ## Architecture
//!
//! ```text
//! Supervisor
//! ├── QueueMonitor       (wishlist + busy set, degraded on failure)
//! ├── InventoryMonitor   (owned instances, degraded on failure)
//! └── Reconciler         (plans per size, owns the node pool)
//!     └── NodeActor(id)  (per-node lifecycle, all cloud calls for the node)
//! ```
//!
//! Monitors publish snapshots into the `NodeRegistry`; the reconciler reads
//! them and the registry, and sends commands to node actors. Only a node's
//! own actor mutates its record.
//!
//! ## Modules
//!
//! - `actors`: Actor framework and the node lifecycle
//! - `cloud`: Provider drivers and the rate-limited, retrying adapter
//! - `queue`: Job queue clients
//! - `registry`: Node records and monitor snapshots

pub mod actors;
pub mod cloud;
pub mod config;
pub mod context;
pub mod events;
pub mod monitor;
pub mod queue;
pub mod reconciler;
pub mod registry;
pub mod size;
pub mod supervisor;

// Exposed for integration tests
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

// Re-export commonly used types
pub use config::Config;
pub use context::FleetContext;
pub use reconciler::{Action, Decision, Reconciler};
pub use supervisor::Supervisor;
