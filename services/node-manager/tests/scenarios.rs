//! End-to-end scenarios for the node manager.
//!
//! Each test runs the full supervisor (both monitors, the reconciler and the
//! node actors) against `MockCloud` and `StaticQueue` on a paused clock, so
//! hours of fleet time pass in milliseconds.
//!
//! Intervals come from `TEST_CONFIG`: queue poll 10s, inventory poll 15s,
//! reconcile 20s, idle timeout 300s, shutdown grace 30s.

use std::collections::BTreeMap;
use std::time::Duration;

use fleet_node_manager::actors::DrainReport;
use fleet_node_manager::cloud::{CloudInstance, CreateFault, InstanceId, InstanceState, TAG_OWNER, TAG_SIZE};
use fleet_node_manager::events::{event_types, FleetEvent, MonitorKind};
use fleet_node_manager::registry::{NodeRecord, NodeState};
use fleet_node_manager::size::JobRequirement;
use fleet_node_manager::testutil::TestFleet;
use fleet_node_manager::Supervisor;
use tokio::sync::watch;
use tokio::task::JoinHandle;

// =============================================================================
// Harness
// =============================================================================

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<DrainReport>,
}

impl Running {
    fn start(fleet: &TestFleet) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let supervisor = Supervisor::new(fleet.ctx.clone(), fleet.queue.clone());
        let task = tokio::spawn(supervisor.run(shutdown_rx));
        Self { shutdown, task }
    }

    async fn stop(self) -> DrainReport {
        self.shutdown.send(true).unwrap();
        self.task.await.unwrap()
    }
}

async fn advance(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

/// Step the clock a second at a time until `pred` holds or `max_secs` pass.
async fn wait_for(fleet: &TestFleet, max_secs: u64, pred: impl Fn(&[NodeRecord]) -> bool) -> bool {
    for _ in 0..max_secs {
        if pred(&records(fleet)) {
            return true;
        }
        advance(1).await;
    }
    pred(&records(fleet))
}

fn all_in(state: NodeState) -> impl Fn(&[NodeRecord]) -> bool {
    move |records| !records.is_empty() && records.iter().all(|r| r.state == state)
}

fn transitions_to(fleet: &TestFleet, state: NodeState) -> usize {
    fleet
        .events
        .events()
        .iter()
        .filter(|e| matches!(e, FleetEvent::NodeStateChanged { to, .. } if *to == state))
        .count()
}

fn large_jobs(n: usize) -> Vec<JobRequirement> {
    (0..n)
        .map(|i| JobRequirement::new(format!("render-{i}"), 16, 32768, 0))
        .collect()
}

fn small_job() -> Vec<JobRequirement> {
    vec![JobRequirement::new("lint", 1, 1024, 0)]
}

fn records(fleet: &TestFleet) -> Vec<NodeRecord> {
    fleet.ctx.registry.snapshot()
}

fn states(fleet: &TestFleet) -> Vec<NodeState> {
    let mut states: Vec<_> = records(fleet).into_iter().map(|r| r.state).collect();
    states.sort_by_key(|s| s.as_str());
    states
}

fn owned_instance(id: &str, owner: &str, size: &str) -> CloudInstance {
    CloudInstance {
        id: InstanceId::new(id),
        state: InstanceState::Running,
        tags: BTreeMap::from([
            (TAG_OWNER.to_string(), owner.to_string()),
            (TAG_SIZE.to_string(), size.to_string()),
        ]),
    }
}

// =============================================================================
// Scaling
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_scale_up_hold_and_scale_down() {
    let fleet = TestFleet::new();
    fleet.queue.set_jobs(large_jobs(3));
    let running = Running::start(&fleet);

    advance(60).await;
    assert_eq!(states(&fleet), vec![NodeState::PairedIdle; 3]);
    assert!(records(&fleet).iter().all(|r| r.size.name == "large"));
    assert_eq!(fleet.cloud.create_calls(), 3);

    // Demand unchanged: nothing more happens.
    advance(100).await;
    assert_eq!(fleet.cloud.create_calls(), 3);
    assert_eq!(fleet.cloud.destroy_calls(), 0);

    // Queue drains; nodes go after idle timeout plus grace.
    fleet.queue.set_jobs(Vec::new());
    advance(400).await;

    assert_eq!(states(&fleet), vec![NodeState::Terminated; 3]);
    assert_eq!(fleet.cloud.destroy_calls(), 3);
    assert!(fleet.cloud.instances().await.is_empty());
    // Terminated records are not booted again.
    assert_eq!(fleet.cloud.create_calls(), 3);

    let report = running.stop().await;
    assert!(report.is_clean());
    assert!(report.unsettled.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_boots_capped_at_max_nodes() {
    let fleet = TestFleet::new();
    fleet.queue.set_jobs(large_jobs(8));
    let running = Running::start(&fleet);

    advance(120).await;
    assert_eq!(records(&fleet).len(), 5);
    assert_eq!(fleet.cloud.create_calls(), 5);

    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_busy_node_survives_empty_queue() {
    let fleet = TestFleet::new();
    fleet.queue.set_jobs(small_job());
    let running = Running::start(&fleet);

    advance(60).await;
    let node = records(&fleet).pop().unwrap();
    let instance_id = node.instance_id.clone().unwrap();

    fleet.queue.set_busy([instance_id]);
    fleet.queue.set_jobs(Vec::new());
    advance(600).await;

    assert_eq!(states(&fleet), vec![NodeState::PairedBusy]);
    assert_eq!(fleet.cloud.destroy_calls(), 0);

    // Job done: idle timeout starts from here.
    fleet.queue.set_busy([]);
    advance(200).await;
    assert_eq!(states(&fleet), vec![NodeState::PairedIdle]);

    advance(250).await;
    assert_eq!(states(&fleet), vec![NodeState::Terminated]);

    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_idle_node_shut_down_exactly_once() {
    let fleet = TestFleet::new();
    fleet.queue.set_jobs(small_job());
    let running = Running::start(&fleet);

    assert!(wait_for(&fleet, 60, all_in(NodeState::PairedIdle)).await);
    fleet.queue.set_jobs(Vec::new());
    assert!(wait_for(&fleet, 600, all_in(NodeState::Terminated)).await);

    // Further ticks while pending, requested and terminated add nothing.
    advance(200).await;

    let drained: usize = fleet
        .events
        .events()
        .iter()
        .map(|e| match e {
            FleetEvent::ReconcileDecision { sizes, .. } => sizes.iter().map(|s| s.drain.len()).sum(),
            _ => 0,
        })
        .sum();
    assert_eq!(drained, 1);
    assert_eq!(transitions_to(&fleet, NodeState::ShutdownPending), 1);
    assert_eq!(fleet.cloud.destroy_calls(), 1);

    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_busy_signal_during_grace_cancels_shutdown() {
    let fleet = TestFleet::new();
    fleet.queue.set_jobs(small_job());
    let running = Running::start(&fleet);

    assert!(wait_for(&fleet, 60, all_in(NodeState::PairedIdle)).await);
    fleet.queue.set_jobs(Vec::new());
    assert!(wait_for(&fleet, 600, all_in(NodeState::ShutdownPending)).await);

    let node = records(&fleet).pop().unwrap();
    fleet.queue.set_busy([node.instance_id.clone().unwrap()]);
    advance(120).await;

    assert_eq!(states(&fleet), vec![NodeState::PairedBusy]);
    assert_eq!(fleet.cloud.destroy_calls(), 0);
    assert!(fleet.cloud.instance(node.instance_id.as_ref().unwrap()).await.is_some());

    running.stop().await;
}

// =============================================================================
// Degraded monitors
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_queue_outage_freezes_scale_down() {
    let fleet = TestFleet::new();
    fleet.queue.set_jobs(small_job());
    let running = Running::start(&fleet);

    advance(60).await;
    assert_eq!(states(&fleet), vec![NodeState::PairedIdle]);

    // The empty queue is never observed while the queue is down.
    fleet.queue.set_unreachable(true);
    fleet.queue.set_jobs(Vec::new());
    advance(600).await;

    assert_eq!(states(&fleet), vec![NodeState::PairedIdle]);
    assert_eq!(fleet.cloud.destroy_calls(), 0);
    assert_eq!(
        fleet.events.events().iter().filter(|e| matches!(
            e,
            FleetEvent::MonitorDegraded {
                monitor: MonitorKind::Queue,
                ..
            }
        )).count(),
        1
    );

    fleet.queue.set_unreachable(false);
    advance(120).await;

    assert_eq!(states(&fleet), vec![NodeState::Terminated]);
    assert_eq!(fleet.events.count(event_types::MONITOR_RECOVERED), 1);

    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_inventory_outage_freezes_scale_down() {
    let fleet = TestFleet::new();
    fleet.queue.set_jobs(small_job());
    let running = Running::start(&fleet);

    assert!(wait_for(&fleet, 60, all_in(NodeState::PairedIdle)).await);
    fleet.queue.set_jobs(Vec::new());
    fleet.cloud.fail_lists(u32::MAX).await;

    // Well past idle timeout, but the inventory is stale the whole time.
    advance(600).await;
    assert_eq!(states(&fleet), vec![NodeState::PairedIdle]);
    assert_eq!(transitions_to(&fleet, NodeState::ShutdownPending), 0);
    assert_eq!(fleet.cloud.destroy_calls(), 0);
    assert_eq!(
        fleet.events.events().iter().filter(|e| matches!(
            e,
            FleetEvent::MonitorDegraded {
                monitor: MonitorKind::Inventory,
                ..
            }
        )).count(),
        1
    );

    fleet.cloud.fail_lists(0).await;
    assert!(wait_for(&fleet, 200, all_in(NodeState::Terminated)).await);

    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_inventory_outage_delays_boot() {
    let fleet = TestFleet::new();
    fleet.cloud.fail_lists(9).await;
    fleet.queue.set_jobs(small_job());
    let running = Running::start(&fleet);

    advance(40).await;
    assert_eq!(fleet.cloud.create_calls(), 0);
    assert!(records(&fleet).is_empty());

    advance(80).await;
    assert_eq!(fleet.cloud.create_calls(), 1);
    assert_eq!(states(&fleet), vec![NodeState::PairedIdle]);

    running.stop().await;
}

// =============================================================================
// Cloud faults
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_lost_create_ack_yields_one_instance() {
    let fleet = TestFleet::new();
    fleet.cloud.script_create(CreateFault::LoseAck).await;
    fleet.queue.set_jobs(small_job());
    let running = Running::start(&fleet);

    advance(60).await;

    let instances = fleet.cloud.instances().await;
    assert_eq!(instances.len(), 1);
    assert_eq!(fleet.cloud.create_calls(), 2);

    let node = records(&fleet).pop().unwrap();
    assert_eq!(node.state, NodeState::PairedIdle);
    assert_eq!(node.instance_id.as_ref(), Some(&instances[0].id));

    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_boot_timeout_fails_and_replaces() {
    let fleet = TestFleet::with(|c| c.daemon.boot_timeout_secs = 120);
    fleet.cloud.set_visibility_delay(1_000).await;
    fleet.queue.set_jobs(small_job());
    let running = Running::start(&fleet);

    advance(200).await;

    let all = records(&fleet);
    let failed: Vec<_> = all.iter().filter(|r| r.state == NodeState::Failed).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].size.name, "small");
    assert!(fleet.cloud.destroy_calls() >= 1);

    // The failed node's instance is gone and a replacement was requested.
    let failed_instance = failed[0].instance_id.clone().unwrap();
    assert!(fleet.cloud.instance(&failed_instance).await.is_none());
    assert_eq!(fleet.cloud.create_calls(), 2);
    assert_eq!(all.iter().filter(|r| r.state == NodeState::UnpairedWait).count(), 1);

    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_vanished_instance_fails_node() {
    let fleet = TestFleet::new();
    fleet.queue.set_jobs(small_job());
    let running = Running::start(&fleet);

    advance(60).await;
    let node = records(&fleet).pop().unwrap();
    fleet.cloud.remove_instance(node.instance_id.as_ref().unwrap()).await;

    // Two fresh snapshots without it, then the reconciler replaces it.
    advance(60).await;
    assert_eq!(fleet.ctx.registry.get(node.id).unwrap().state, NodeState::Failed);

    advance(60).await;
    assert_eq!(fleet.cloud.create_calls(), 2);
    assert_eq!(fleet.cloud.instances().await.len(), 1);

    running.stop().await;
}

// =============================================================================
// Adoption
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_adopts_owned_orphans_only() {
    let fleet = TestFleet::new();
    fleet.cloud.insert_instance(owned_instance("orphan-1", "test-fleet", "small")).await;
    fleet.cloud.insert_instance(owned_instance("other-1", "someone-else", "small")).await;
    let running = Running::start(&fleet);

    advance(60).await;

    let adopted = records(&fleet);
    assert_eq!(adopted.len(), 1);
    assert!(adopted[0].adopted);
    assert_eq!(adopted[0].instance_id, Some(InstanceId::new("orphan-1")));
    assert_eq!(adopted[0].state, NodeState::PairedIdle);
    assert_eq!(fleet.cloud.create_calls(), 0);
    assert_eq!(fleet.events.count(event_types::INVENTORY_FOREIGN), 1);

    // With no demand the orphan drains like any other idle node.
    advance(400).await;
    assert_eq!(states(&fleet), vec![NodeState::Terminated]);
    let remaining: Vec<_> = fleet.cloud.instances().await.into_iter().map(|i| i.id).collect();
    assert_eq!(remaining, vec![InstanceId::new("other-1")]);

    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_adopted_overshoot_trimmed_to_max() {
    let fleet = TestFleet::new();
    for i in 0..6 {
        fleet
            .cloud
            .insert_instance(owned_instance(&format!("orphan-{i}"), "test-fleet", "small"))
            .await;
    }
    // Enough queued work to want all six; max_nodes for small is 4.
    fleet.queue.set_jobs(
        (0..6)
            .map(|i| JobRequirement::new(format!("lint-{i}"), 1, 1024, 0))
            .collect(),
    );
    let running = Running::start(&fleet);

    // Well inside idle_timeout, the two extra nodes still go.
    let trimmed = wait_for(&fleet, 150, |records| {
        records.iter().filter(|r| r.state == NodeState::Terminated).count() == 2
    })
    .await;
    assert!(trimmed);
    assert_eq!(fleet.cloud.instances().await.len(), 4);
    assert_eq!(fleet.cloud.create_calls(), 0);

    let live: Vec<_> = records(&fleet).into_iter().filter(|r| !r.state.is_terminal()).collect();
    assert_eq!(live.len(), 4);
    assert!(live.iter().all(|r| r.adopted && r.state == NodeState::PairedIdle));

    // The excess demand shows up as capped instead of a quiet fleet.
    let capped = fleet
        .events
        .of_type(event_types::RECONCILE_DECISION)
        .into_iter()
        .any(|e| match e {
            FleetEvent::ReconcileDecision { sizes, .. } => sizes.iter().any(|s| s.size == "small" && s.capped == 2),
            _ => false,
        });
    assert!(capped);

    running.stop().await;
}

// =============================================================================
// Process shutdown
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_shutdown_leaves_instances_running() {
    let fleet = TestFleet::new();
    fleet.queue.set_jobs(large_jobs(2));
    let running = Running::start(&fleet);

    advance(60).await;
    let report = running.stop().await;

    assert!(report.is_clean());
    assert_eq!(report.stopped, 2);
    assert_eq!(fleet.cloud.instances().await.len(), 2);
    assert_eq!(fleet.cloud.destroy_calls(), 0);
}
