//! Typed ID definitions.

use crate::define_id;

// One intended or actual compute node. Never reused: destroy + recreate
// always yields a fresh NodeId.
define_id!(NodeId, "node");

// One reconciliation pass.
define_id!(TickId, "tick");
