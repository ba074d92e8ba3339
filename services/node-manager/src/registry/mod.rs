//! Node registry.
//!
//! The authoritative table of node records plus the latest monitor snapshots.
//!
//! - Readers get point-in-time copies (`snapshot`, `get`).
//! - Each record sits behind its own lock. The only way to write it is the
//!   `RecordWriter` returned by `insert`, which is handed to the record's
//!   actor and cannot be cloned, so every record has exactly one writer.
//! - The table lock is only held to insert, evict or clone the set of
//!   record cells, never across a record write.
//! - Monitor snapshots are published through `watch` channels; consumers
//!   always see the latest one and never block the publisher.

mod record;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use fleet_id::NodeId;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

pub use record::{NodeRecord, NodeState};

use crate::cloud::{CloudInstance, InstanceId};
use crate::size::{JobRequirement, Wishlist};

/// Registry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("node {0} not found")]
    NotFound(NodeId),

    #[error("node {0} already registered")]
    Duplicate(NodeId),

    /// The record reached a terminal state and is frozen.
    #[error("node {id} is {state} and can no longer change")]
    Terminal { id: NodeId, state: NodeState },

    #[error("node {id}: {from} -> {to} is not a valid transition")]
    InvalidTransition {
        id: NodeId,
        from: NodeState,
        to: NodeState,
    },

    #[error("node {id} already has instance {existing}")]
    InstanceAlreadySet { id: NodeId, existing: InstanceId },
}

// =============================================================================
// Monitor snapshots
// =============================================================================

/// Latest view of the provider's instances.
#[derive(Debug, Clone)]
pub struct InventorySnapshot {
    /// Increments on every successful poll. A degraded republish keeps the
    /// sequence number of the data it carries.
    pub seq: u64,
    pub taken_at: Instant,
    pub instances: BTreeMap<InstanceId, CloudInstance>,

    /// The last poll failed; `instances` is stale.
    pub degraded: bool,

    /// At least one poll has succeeded.
    pub observed: bool,
}

impl InventorySnapshot {
    fn initial() -> Self {
        Self {
            seq: 0,
            taken_at: Instant::now(),
            instances: BTreeMap::new(),
            degraded: false,
            observed: false,
        }
    }

    /// Instance tagged as requested by `node_id`.
    pub fn find_by_node(&self, node_id: NodeId) -> Option<&CloudInstance> {
        self.instances
            .values()
            .find(|instance| instance.node_id() == Some(node_id))
    }

    /// Whether the snapshot can be trusted for scaling decisions.
    pub fn is_usable(&self) -> bool {
        self.observed && !self.degraded
    }
}

/// Latest view of the job queue.
#[derive(Debug, Clone)]
pub struct DemandSnapshot {
    pub seq: u64,
    pub taken_at: Instant,
    pub wishlist: Wishlist,

    /// Instances currently running a job.
    pub busy: BTreeSet<InstanceId>,

    pub unsatisfiable: Vec<JobRequirement>,
    pub degraded: bool,
    pub observed: bool,
}

impl DemandSnapshot {
    fn initial() -> Self {
        Self {
            seq: 0,
            taken_at: Instant::now(),
            wishlist: Wishlist::empty(),
            busy: BTreeSet::new(),
            unsatisfiable: Vec::new(),
            degraded: false,
            observed: false,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.observed && !self.degraded
    }
}

// =============================================================================
// Registry
// =============================================================================

type Cell = Arc<Mutex<NodeRecord>>;

fn lock(cell: &Cell) -> std::sync::MutexGuard<'_, NodeRecord> {
    cell.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Authoritative table of node records.
pub struct NodeRegistry {
    records: RwLock<HashMap<NodeId, Cell>>,
    inventory: watch::Sender<Arc<InventorySnapshot>>,
    demand: watch::Sender<Arc<DemandSnapshot>>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        let (inventory, _) = watch::channel(Arc::new(InventorySnapshot::initial()));
        let (demand, _) = watch::channel(Arc::new(DemandSnapshot::initial()));
        Self {
            records: RwLock::new(HashMap::new()),
            inventory,
            demand,
        }
    }

    /// Register a new record and hand out its only writer.
    pub fn insert(&self, record: NodeRecord) -> Result<RecordWriter, RegistryError> {
        let id = record.id;
        let cell = Arc::new(Mutex::new(record));

        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        if records.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        records.insert(id, cell.clone());

        Ok(RecordWriter { id, cell })
    }

    /// Point-in-time copy of one record.
    pub fn get(&self, id: NodeId) -> Option<NodeRecord> {
        let cell = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()?;
        let record = lock(&cell).clone();
        Some(record)
    }

    /// Point-in-time copy of every record. Each record is internally
    /// consistent; records are not captured atomically with each other.
    pub fn snapshot(&self) -> Vec<NodeRecord> {
        let cells: Vec<Cell> = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        cells.iter().map(|cell| lock(cell).clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove terminal records older than `retention`. Returns evicted ids.
    pub fn evict_expired(&self, now: Instant, retention: Duration) -> Vec<NodeId> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let expired: Vec<NodeId> = records
            .iter()
            .filter(|(_, cell)| {
                let record = lock(cell);
                record.state.is_terminal()
                    && record
                        .terminal_at
                        .is_some_and(|at| now.saturating_duration_since(at) >= retention)
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            records.remove(id);
        }
        expired
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    pub fn publish_inventory(&self, snapshot: InventorySnapshot) {
        self.inventory.send_replace(Arc::new(snapshot));
    }

    pub fn inventory(&self) -> Arc<InventorySnapshot> {
        self.inventory.borrow().clone()
    }

    pub fn subscribe_inventory(&self) -> watch::Receiver<Arc<InventorySnapshot>> {
        self.inventory.subscribe()
    }

    pub fn publish_demand(&self, snapshot: DemandSnapshot) {
        self.demand.send_replace(Arc::new(snapshot));
    }

    pub fn demand(&self) -> Arc<DemandSnapshot> {
        self.demand.borrow().clone()
    }

    pub fn subscribe_demand(&self) -> watch::Receiver<Arc<DemandSnapshot>> {
        self.demand.subscribe()
    }
}

// =============================================================================
// Record writer
// =============================================================================

/// Exclusive write access to one record.
#[derive(Debug)]
pub struct RecordWriter {
    id: NodeId,
    cell: Cell,
}

impl RecordWriter {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Copy of the current record.
    pub fn read(&self) -> NodeRecord {
        lock(&self.cell).clone()
    }

    pub fn state(&self) -> NodeState {
        lock(&self.cell).state
    }

    /// Mutate non-state fields. Refused once the record is terminal.
    pub fn update<R>(&self, f: impl FnOnce(&mut NodeRecord) -> R) -> Result<R, RegistryError> {
        let mut record = lock(&self.cell);
        if record.state.is_terminal() {
            return Err(RegistryError::Terminal {
                id: self.id,
                state: record.state,
            });
        }
        Ok(f(&mut record))
    }

    /// Record the provider instance id. Setting the same id again is a no-op;
    /// a different id is refused.
    pub fn set_instance_id(&self, instance_id: InstanceId) -> Result<(), RegistryError> {
        self.update(|record| match &record.instance_id {
            Some(existing) if *existing == instance_id => Ok(()),
            Some(existing) => Err(RegistryError::InstanceAlreadySet {
                id: record.id,
                existing: existing.clone(),
            }),
            None => {
                record.instance_id = Some(instance_id);
                Ok(())
            }
        })?
    }

    /// Move to `to`, maintaining the timestamps tied to each state. Returns
    /// the previous state.
    pub fn transition(&self, to: NodeState, now: Instant) -> Result<NodeState, RegistryError> {
        let mut record = lock(&self.cell);
        let from = record.state;

        if from.is_terminal() {
            return Err(RegistryError::Terminal {
                id: self.id,
                state: from,
            });
        }
        if !from.can_transition_to(to) {
            return Err(RegistryError::InvalidTransition {
                id: self.id,
                from,
                to,
            });
        }

        record.state = to;
        record.state_since = now;
        match to {
            NodeState::PairedIdle => {
                record.busy = false;
                record.idle_since = Some(now);
            }
            NodeState::PairedBusy => {
                record.busy = true;
                record.idle_since = None;
            }
            NodeState::Terminated | NodeState::Failed => {
                record.idle_since = None;
                record.terminal_at = Some(now);
            }
            _ => {}
        }

        Ok(from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size::tests::size;

    fn small() -> crate::size::NodeSize {
        size("small", 2, 4096, 0, 0.1)
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_and_snapshot() {
        let registry = NodeRegistry::new();
        let writer = registry
            .insert(NodeRecord::booting(small(), Instant::now()))
            .unwrap();

        assert_eq!(registry.len(), 1);
        let copy = registry.get(writer.id()).unwrap();
        assert_eq!(copy.state, NodeState::Booting);
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transition_sets_idle_since() {
        let registry = NodeRegistry::new();
        let writer = registry
            .insert(NodeRecord::booting(small(), Instant::now()))
            .unwrap();
        writer.set_instance_id(InstanceId::new("i-1")).unwrap();
        writer.transition(NodeState::UnpairedWait, Instant::now()).unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        let now = Instant::now();
        writer.transition(NodeState::PairedIdle, now).unwrap();
        assert_eq!(writer.read().idle_since, Some(now));

        writer.transition(NodeState::PairedBusy, now).unwrap();
        let record = writer.read();
        assert!(record.busy);
        assert_eq!(record.idle_since, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_transition_is_refused() {
        let registry = NodeRegistry::new();
        let writer = registry
            .insert(NodeRecord::booting(small(), Instant::now()))
            .unwrap();

        let err = writer
            .transition(NodeState::PairedBusy, Instant::now())
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));
        assert_eq!(writer.state(), NodeState::Booting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_record_is_frozen() {
        let registry = NodeRegistry::new();
        let writer = registry
            .insert(NodeRecord::booting(small(), Instant::now()))
            .unwrap();
        writer.transition(NodeState::Failed, Instant::now()).unwrap();

        assert!(matches!(
            writer.transition(NodeState::Booting, Instant::now()),
            Err(RegistryError::Terminal { .. })
        ));
        assert!(writer.update(|r| r.failure_count += 1).is_err());
        assert!(writer.set_instance_id(InstanceId::new("i-2")).is_err());
        assert_eq!(writer.read().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_instance_id_is_immutable() {
        let registry = NodeRegistry::new();
        let writer = registry
            .insert(NodeRecord::booting(small(), Instant::now()))
            .unwrap();

        writer.set_instance_id(InstanceId::new("i-1")).unwrap();
        writer.set_instance_id(InstanceId::new("i-1")).unwrap();
        assert!(matches!(
            writer.set_instance_id(InstanceId::new("i-2")),
            Err(RegistryError::InstanceAlreadySet { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_after_retention() {
        let registry = NodeRegistry::new();
        let done = registry
            .insert(NodeRecord::booting(small(), Instant::now()))
            .unwrap();
        let live = registry
            .insert(NodeRecord::booting(small(), Instant::now()))
            .unwrap();
        done.transition(NodeState::Terminated, Instant::now()).unwrap();

        let retention = Duration::from_secs(60);
        assert!(registry.evict_expired(Instant::now(), retention).is_empty());

        tokio::time::advance(retention).await;
        assert_eq!(registry.evict_expired(Instant::now(), retention), vec![done.id()]);
        assert!(registry.get(done.id()).is_none());
        assert!(registry.get(live.id()).is_some());
    }

    #[tokio::test]
    async fn test_snapshot_publication() {
        let registry = NodeRegistry::new();
        let mut rx = registry.subscribe_inventory();
        assert!(!registry.inventory().is_usable());

        registry.publish_inventory(InventorySnapshot {
            seq: 1,
            taken_at: Instant::now(),
            instances: BTreeMap::new(),
            degraded: false,
            observed: true,
        });

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().seq, 1);
        assert!(registry.inventory().is_usable());
    }
}
