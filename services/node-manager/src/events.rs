//! Fleet events.
//!
//! Every state transition, cloud call, degraded-mode change and reconciliation
//! decision is emitted as a `FleetEvent`. Events go to an `EventSink`; the
//! daemon uses `TracingSink`, tests use `MemorySink` to assert on behavior.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use fleet_id::{NodeId, TickId};
use serde::Serialize;
use tracing::{info, warn};

use crate::cloud::InstanceId;
use crate::registry::NodeState;

/// All event type names as constants.
pub mod event_types {
    pub const NODE_STATE_CHANGED: &str = "node.state_changed";
    pub const NODE_DESTROY_ESCALATED: &str = "node.destroy_escalated";
    pub const CLOUD_CALL: &str = "cloud.call";
    pub const MONITOR_DEGRADED: &str = "monitor.degraded";
    pub const MONITOR_RECOVERED: &str = "monitor.recovered";
    pub const RECONCILE_DECISION: &str = "reconcile.decision";
    pub const QUEUE_UNSATISFIABLE: &str = "queue.unsatisfiable";
    pub const INVENTORY_FOREIGN: &str = "inventory.foreign";
}

/// Which poller an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorKind {
    Queue,
    Inventory,
}

/// Cloud operation named in a `CloudCall` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudOp {
    Create,
    Destroy,
}

/// Per-size rationale attached to a reconciliation decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SizeRationale {
    pub size: String,
    pub wanted: u32,
    pub target: u32,
    pub active: u32,
    pub leaving: u32,
    pub boot: u32,
    pub reclaim: Vec<NodeId>,

    /// Selected nodes with the reason each was picked (`stuck`, `idle`).
    pub drain: Vec<(NodeId, &'static str)>,

    /// Demand `max_nodes` keeps from being met.
    pub capped: u32,

    /// Boots withheld by the price budget.
    pub over_budget: u32,

    pub status: &'static str,
}

/// Domain events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FleetEvent {
    NodeStateChanged {
        node_id: NodeId,
        instance_id: Option<InstanceId>,
        size: String,
        from: NodeState,
        to: NodeState,
        reason: String,
    },

    /// Destroy kept failing or the instance kept reappearing.
    NodeDestroyEscalated {
        node_id: NodeId,
        instance_id: InstanceId,
        escalations: u32,
        gave_up: bool,
    },

    CloudCall {
        node_id: NodeId,
        op: CloudOp,
        instance_id: Option<InstanceId>,
        ok: bool,
        error: Option<String>,
    },

    MonitorDegraded {
        monitor: MonitorKind,
        error: String,
    },

    MonitorRecovered {
        monitor: MonitorKind,
        failed_polls: u32,
    },

    ReconcileDecision {
        tick_id: TickId,
        /// Set when scaling was suspended for the tick.
        frozen: Option<String>,
        adopted: Vec<InstanceId>,
        sizes: Vec<SizeRationale>,
    },

    QueueUnsatisfiable {
        job_id: String,
        cores: u32,
        ram_mb: u64,
        scratch_mb: u64,
    },

    InventoryForeign {
        instance_id: InstanceId,
        owner: Option<String>,
        reason: String,
    },
}

impl FleetEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::NodeStateChanged { .. } => event_types::NODE_STATE_CHANGED,
            Self::NodeDestroyEscalated { .. } => event_types::NODE_DESTROY_ESCALATED,
            Self::CloudCall { .. } => event_types::CLOUD_CALL,
            Self::MonitorDegraded { .. } => event_types::MONITOR_DEGRADED,
            Self::MonitorRecovered { .. } => event_types::MONITOR_RECOVERED,
            Self::ReconcileDecision { .. } => event_types::RECONCILE_DECISION,
            Self::QueueUnsatisfiable { .. } => event_types::QUEUE_UNSATISFIABLE,
            Self::InventoryForeign { .. } => event_types::INVENTORY_FOREIGN,
        }
    }

    /// Events an operator should look at.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            Self::NodeDestroyEscalated { .. }
                | Self::MonitorDegraded { .. }
                | Self::QueueUnsatisfiable { .. }
                | Self::InventoryForeign { .. }
        ) || matches!(self, Self::NodeStateChanged { to: NodeState::Failed, .. })
    }
}

/// Timestamped event as written out.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub event_type: &'static str,
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: FleetEvent,
}

impl EventEnvelope {
    pub fn new(event: FleetEvent) -> Self {
        Self {
            event_type: event.event_type(),
            occurred_at: Utc::now(),
            event,
        }
    }
}

/// Destination for fleet events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: FleetEvent);
}

/// Writes events as structured tracing records.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: FleetEvent) {
        let envelope = EventEnvelope::new(event);
        let payload = serde_json::to_string(&envelope).unwrap_or_default();

        if envelope.event.is_warning() {
            warn!(target: "fleet_events", event_type = envelope.event_type, %payload, "fleet event");
        } else {
            info!(target: "fleet_events", event_type = envelope.event_type, %payload, "fleet event");
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<FleetEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FleetEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events with the given `event_type`.
    pub fn of_type(&self, event_type: &str) -> Vec<FleetEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type() == event_type)
            .collect()
    }

    pub fn count(&self, event_type: &str) -> usize {
        self.of_type(event_type).len()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: FleetEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_serialization() {
        let event = FleetEvent::MonitorDegraded {
            monitor: MonitorKind::Inventory,
            error: "timeout".into(),
        };
        let json = serde_json::to_value(EventEnvelope::new(event)).unwrap();

        assert_eq!(json["event_type"], "monitor.degraded");
        assert_eq!(json["kind"], "monitor_degraded");
        assert_eq!(json["monitor"], "inventory");
        assert_eq!(json["error"], "timeout");
    }

    #[test]
    fn test_state_change_serializes_states() {
        let event = FleetEvent::NodeStateChanged {
            node_id: NodeId::new(),
            instance_id: None,
            size: "small".into(),
            from: NodeState::PairedIdle,
            to: NodeState::ShutdownPending,
            reason: "idle".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["from"], "paired_idle");
        assert_eq!(json["to"], "shutdown_pending");
        assert!(!event.is_warning());
    }

    #[test]
    fn test_memory_sink_filters() {
        let sink = MemorySink::new();
        sink.emit(FleetEvent::MonitorRecovered {
            monitor: MonitorKind::Queue,
            failed_polls: 2,
        });
        sink.emit(FleetEvent::QueueUnsatisfiable {
            job_id: "j".into(),
            cores: 99,
            ram_mb: 1,
            scratch_mb: 0,
        });

        assert_eq!(sink.count(event_types::MONITOR_RECOVERED), 1);
        assert_eq!(sink.count(event_types::QUEUE_UNSATISFIABLE), 1);
        assert_eq!(sink.events().len(), 2);

        sink.clear();
        assert!(sink.events().is_empty());
    }
}
