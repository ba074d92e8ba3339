//! Node records and their lifecycle state machine.
//!
//! ## State Machine
//!
//! ```text
//! booting -> unpaired_wait -> paired_idle <-> paired_busy
//!    |            |               |               ^
//!    |            |               v               |
//!    |            |        shutdown_pending ------+
//!    |            |               |
//!    |            +------> shutdown_requested -> terminated
//!    +-------------------------------------------^
//!
//! any non-terminal state -> failed
//! ```
//!
//! `terminated` and `failed` are terminal. A terminal record is never written
//! again; a node that needs to come back is a new record with a new id.

use chrono::{DateTime, Utc};
use fleet_id::NodeId;
use serde::Serialize;
use tokio::time::Instant;

use crate::cloud::InstanceId;
use crate::size::NodeSize;

/// Lifecycle state of a node record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Create call issued or being retried.
    Booting,
    /// Instance id known, waiting for inventory to report it running.
    UnpairedWait,
    /// Confirmed running, no job assigned.
    PairedIdle,
    /// Confirmed running, a job is assigned.
    PairedBusy,
    /// Marked for shutdown, inside the grace window.
    ShutdownPending,
    /// Destroy issued, waiting for inventory to confirm absence.
    ShutdownRequested,
    Terminated,
    Failed,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Booting => "booting",
            Self::UnpairedWait => "unpaired_wait",
            Self::PairedIdle => "paired_idle",
            Self::PairedBusy => "paired_busy",
            Self::ShutdownPending => "shutdown_pending",
            Self::ShutdownRequested => "shutdown_requested",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    /// Counts toward `have[size]` when reconciling demand.
    pub fn counts_toward_demand(&self) -> bool {
        matches!(
            self,
            Self::Booting | Self::UnpairedWait | Self::PairedIdle | Self::PairedBusy
        )
    }

    /// On its way out but still holding (or about to release) an instance.
    pub fn is_leaving(&self) -> bool {
        matches!(self, Self::ShutdownPending | Self::ShutdownRequested)
    }

    /// Backed by an instance that inventory has confirmed running.
    pub fn is_paired(&self) -> bool {
        matches!(
            self,
            Self::PairedIdle | Self::PairedBusy | Self::ShutdownPending
        )
    }

    /// Whether the state machine allows `self -> to`.
    pub fn can_transition_to(&self, to: NodeState) -> bool {
        use NodeState::*;

        if self.is_terminal() {
            return false;
        }
        if to == Failed {
            return true;
        }

        matches!(
            (self, to),
            (Booting, UnpairedWait)
                | (Booting, ShutdownRequested)
                | (Booting, Terminated)
                | (UnpairedWait, PairedIdle)
                | (UnpairedWait, ShutdownRequested)
                | (PairedIdle, PairedBusy)
                | (PairedIdle, ShutdownPending)
                | (PairedBusy, PairedIdle)
                | (ShutdownPending, PairedBusy)
                | (ShutdownPending, PairedIdle)
                | (ShutdownPending, ShutdownRequested)
                | (ShutdownRequested, Terminated)
        )
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The manager's model of one intended or actual compute node.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub id: NodeId,

    /// Provider instance id. Absent until the create is acknowledged (or the
    /// instance is found by its node id tag); never changes once set.
    pub instance_id: Option<InstanceId>,

    pub size: NodeSize,
    pub state: NodeState,

    pub created_at: Instant,
    pub created_wall: DateTime<Utc>,

    /// Entry time of the current state.
    pub state_since: Instant,

    /// Last inventory snapshot that listed the instance.
    pub last_seen: Option<Instant>,

    /// Set on entry to `PairedIdle`, cleared when busy.
    pub idle_since: Option<Instant>,

    pub busy: bool,

    /// Create attempts that failed, or destroy escalations.
    pub failure_count: u32,

    /// Found in inventory rather than created by this process.
    pub adopted: bool,

    pub terminal_at: Option<Instant>,
    pub last_error: Option<String>,
}

impl NodeRecord {
    /// Fresh boot intent.
    pub fn booting(size: NodeSize, now: Instant) -> Self {
        Self {
            id: NodeId::new(),
            instance_id: None,
            size,
            state: NodeState::Booting,
            created_at: now,
            created_wall: Utc::now(),
            state_since: now,
            last_seen: None,
            idle_since: None,
            busy: false,
            failure_count: 0,
            adopted: false,
            terminal_at: None,
            last_error: None,
        }
    }

    /// Record for an owned instance that no record claims.
    pub fn adopted(instance_id: InstanceId, size: NodeSize, now: Instant) -> Self {
        Self {
            instance_id: Some(instance_id),
            state: NodeState::UnpairedWait,
            adopted: true,
            ..Self::booting(size, now)
        }
    }

    /// Time spent in the current state.
    pub fn in_state_for(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.state_since)
    }

    pub fn age(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Idle time, zero unless idle.
    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        self.idle_since
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or_default()
    }
}
