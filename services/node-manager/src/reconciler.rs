//! Reconciler: compares demand with the registry and dispatches actions.
//!
//! `plan` is a pure function of the registry view, the two monitor snapshots
//! and the commands still in flight; `Reconciler` runs it on a fixed interval
//! and turns its actions into actor spawns and actor commands. The
//! reconciler never talks to the cloud.
//!
//! Per size:
//!
//! 1. `active` = live records that count toward demand, `leaving` = records
//!    shutting down (they still occupy a slot under `max_nodes`).
//! 2. `target = clamp(wishlist[size], min_nodes, max_nodes)`.
//! 3. Below target: reclaim nodes still in their shutdown grace window, then
//!    boot new ones, never past `max_nodes - (active + leaving)` and never
//!    past the price budget.
//! 4. Above target: drain stuck nodes first, then idle nodes past
//!    `idle_timeout`, longest idle first, oldest first on ties. Nodes above
//!    `max_nodes` go without waiting out `idle_timeout`. Busy nodes are
//!    never candidates.
//!
//! Nothing scales while either monitor is degraded or has not reported yet.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use fleet_id::{NodeId, TickId};
use fleet_reconcile::{
    idle_key, select_for_drain, ConvergenceStatus, DrainKey, DrainPriority, ScaleDelta, SizeCounts,
};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::actors::{ActorError, NodePool};
use crate::cloud::InstanceId;
use crate::config::Config;
use crate::context::FleetContext;
use crate::events::{FleetEvent, SizeRationale};
use crate::registry::{DemandSnapshot, InventorySnapshot, NodeRecord, NodeState};
use crate::size::{NodeSize, SizeCatalog};

/// Small tolerance for summed float prices.
const PRICE_EPSILON: f64 = 1e-9;

// =============================================================================
// Decision
// =============================================================================

/// One corrective action.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Create a record and start its actor in `Booting`.
    Boot { size: NodeSize },

    /// Track an owned instance no record claims.
    Adopt { instance_id: InstanceId, size: NodeSize },

    Shutdown { node_id: NodeId, reason: DrainPriority },

    /// Take back a node inside its shutdown grace window.
    Reclaim { node_id: NodeId },
}

/// Output of one reconciliation pass.
#[derive(Debug, Clone)]
pub struct Decision {
    pub tick_id: TickId,

    /// Why scaling was suspended, if it was.
    pub frozen: Option<String>,

    pub actions: Vec<Action>,
    pub sizes: Vec<SizeRationale>,
}

impl Decision {
    pub fn boots(&self) -> impl Iterator<Item = &NodeSize> {
        self.actions.iter().filter_map(|a| match a {
            Action::Boot { size } => Some(size),
            _ => None,
        })
    }

    pub fn shutdowns(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.actions.iter().filter_map(|a| match a {
            Action::Shutdown { node_id, .. } => Some(*node_id),
            _ => None,
        })
    }

    /// Nothing to do and nothing withheld.
    pub fn is_quiet(&self) -> bool {
        self.frozen.is_none()
            && self.actions.is_empty()
            && self.sizes.iter().all(|s| s.capped == 0 && s.over_budget == 0)
    }
}

/// Commands sent but not yet reflected in the registry.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    pub shutdown: HashSet<NodeId>,
    pub reclaim: HashSet<NodeId>,
}

/// Everything `plan` looks at.
pub struct PlanInput<'a> {
    pub config: &'a Config,
    pub catalog: &'a SizeCatalog,
    pub records: &'a [NodeRecord],
    pub demand: &'a DemandSnapshot,
    pub inventory: &'a InventorySnapshot,
    pub in_flight: &'a InFlight,
    pub now: Instant,
}

// =============================================================================
// Planning
// =============================================================================

fn freeze_reason(demand: &DemandSnapshot, inventory: &InventorySnapshot) -> Option<String> {
    if !demand.observed {
        Some("job queue not yet observed".into())
    } else if demand.degraded {
        Some("job queue degraded".into())
    } else if !inventory.observed {
        Some("inventory not yet observed".into())
    } else if inventory.degraded {
        Some("inventory degraded".into())
    } else {
        None
    }
}

/// Owned, live instances that no record accounts for.
fn adoptions(input: &PlanInput<'_>) -> Vec<(InstanceId, NodeSize)> {
    if !input.inventory.is_usable() {
        return Vec::new();
    }

    let owner = input.config.cloud.owner_tag.as_str();
    let claimed_instances: HashSet<&InstanceId> = input
        .records
        .iter()
        .filter_map(|r| r.instance_id.as_ref())
        .collect();
    let live_records: HashSet<NodeId> = input
        .records
        .iter()
        .filter(|r| !r.state.is_terminal())
        .map(|r| r.id)
        .collect();

    input
        .inventory
        .instances
        .values()
        .filter(|i| i.owner() == Some(owner) && !i.state.is_gone())
        .filter(|i| !claimed_instances.contains(&i.id))
        .filter(|i| !i.node_id().is_some_and(|n| live_records.contains(&n)))
        .filter_map(|i| {
            let size = input.catalog.get(i.size_name()?)?;
            Some((i.id.clone(), size.clone()))
        })
        .collect()
}

/// `idle_timeout` is the minimum idle time for an idle node to qualify.
fn drain_rank(
    record: &NodeRecord,
    now: Instant,
    boot_timeout: Duration,
    idle_timeout: Duration,
) -> Option<(DrainPriority, DrainKey)> {
    let age = record.age(now);
    match record.state {
        NodeState::Booting | NodeState::UnpairedWait if age >= boot_timeout => {
            Some((DrainPriority::Stuck, idle_key(Duration::ZERO, age)))
        }
        NodeState::PairedIdle if !record.busy && record.idle_for(now) >= idle_timeout => {
            Some((DrainPriority::Idle, idle_key(record.idle_for(now), age)))
        }
        _ => None,
    }
}

/// Compute one reconciliation pass.
pub fn plan(input: &PlanInput<'_>) -> Decision {
    let tick_id = TickId::new();
    let mut actions = Vec::new();

    let adopted = adoptions(input);
    let mut adopted_per_size: HashMap<String, u32> = HashMap::new();
    let mut spend: f64 = input
        .records
        .iter()
        .filter(|r| !r.state.is_terminal())
        .map(|r| r.size.price)
        .sum();
    for (instance_id, size) in adopted {
        *adopted_per_size.entry(size.name.clone()).or_default() += 1;
        spend += size.price;
        actions.push(Action::Adopt { instance_id, size });
    }

    if let Some(reason) = freeze_reason(input.demand, input.inventory) {
        return Decision {
            tick_id,
            frozen: Some(reason),
            actions,
            sizes: Vec::new(),
        };
    }

    let config = input.config;
    let budget = config.daemon.max_total_price;
    let boot_timeout = config.boot_timeout();
    let idle_timeout = config.idle_timeout();
    let mut sizes = Vec::new();

    for size in input.catalog.iter() {
        let of_size: Vec<&NodeRecord> = input
            .records
            .iter()
            .filter(|r| r.size.name == size.name && !r.state.is_terminal())
            .collect();

        let shutting = |id: &NodeId| input.in_flight.shutdown.contains(id);
        let reclaiming = |id: &NodeId| input.in_flight.reclaim.contains(id);

        let adopted_here = adopted_per_size.get(&size.name).copied().unwrap_or(0);
        let active_records: Vec<&NodeRecord> = of_size
            .iter()
            .copied()
            .filter(|r| (r.state.counts_toward_demand() && !shutting(&r.id)) || reclaiming(&r.id))
            .collect();
        let leaving = of_size.len() as u32 - active_records.len() as u32;

        let mut reclaimable: Vec<&NodeRecord> = of_size
            .iter()
            .copied()
            .filter(|r| r.state == NodeState::ShutdownPending && !reclaiming(&r.id))
            .collect();
        // Most recently marked first: furthest from their destroy call.
        reclaimable.sort_by(|a, b| b.state_since.cmp(&a.state_since).then(a.id.cmp(&b.id)));

        let counts = SizeCounts {
            active: active_records.len() as u32 + adopted_here,
            leaving,
            reclaimable: reclaimable.len() as u32,
        };
        let wanted = input.demand.wishlist.count_for(&size.name);
        let bounds = config.bounds(&size.name);
        let delta = ScaleDelta::compute(bounds, wanted, counts);

        let reclaim: Vec<NodeId> = reclaimable
            .iter()
            .take(delta.reclaim as usize)
            .map(|r| r.id)
            .collect();
        for node_id in &reclaim {
            actions.push(Action::Reclaim { node_id: *node_id });
        }

        let mut boot = 0;
        let mut over_budget = 0;
        for _ in 0..delta.boot {
            let affordable = budget.is_none_or(|b| spend + size.price <= b + PRICE_EPSILON);
            if affordable {
                spend += size.price;
                boot += 1;
                actions.push(Action::Boot { size: size.clone() });
            } else {
                over_budget += 1;
            }
        }

        let candidates: Vec<&NodeRecord> = active_records
            .iter()
            .copied()
            .filter(|r| !reclaiming(&r.id))
            .collect();
        // The excess over `max_nodes` drains any idle node; the rest of the
        // surplus waits for `idle_timeout`.
        let over_max = counts.active.saturating_sub(bounds.max()).min(delta.drain);
        let mut drain = select_for_drain(candidates.clone(), over_max as usize, |r| {
            drain_rank(r, input.now, boot_timeout, Duration::ZERO)
        });
        let chosen: HashSet<NodeId> = drain.iter().map(|(r, _)| r.id).collect();
        let remaining: Vec<&NodeRecord> = candidates
            .into_iter()
            .filter(|r| !chosen.contains(&r.id))
            .collect();
        drain.extend(select_for_drain(
            remaining,
            (delta.drain as usize).saturating_sub(drain.len()),
            |r| drain_rank(r, input.now, boot_timeout, idle_timeout),
        ));
        for (record, reason) in &drain {
            actions.push(Action::Shutdown {
                node_id: record.id,
                reason: *reason,
            });
        }

        let unpaired = active_records
            .iter()
            .filter(|r| matches!(r.state, NodeState::Booting | NodeState::UnpairedWait))
            .count() as u32
            + adopted_here;
        let status = ConvergenceStatus::assess(&delta, counts.active, unpaired);

        let touched = wanted > 0 || !of_size.is_empty() || adopted_here > 0 || bounds.min() > 0;
        if touched {
            sizes.push(SizeRationale {
                size: size.name.clone(),
                wanted,
                target: delta.target,
                active: counts.active,
                leaving: counts.leaving,
                boot,
                reclaim,
                drain: drain
                    .iter()
                    .map(|(r, reason)| (r.id, reason.as_str()))
                    .collect(),
                capped: delta.capped,
                over_budget,
                status: status.as_str(),
            });
        }
    }

    Decision {
        tick_id,
        frozen: None,
        actions,
        sizes,
    }
}

// =============================================================================
// Reconciler loop
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Shutdown,
    Reclaim,
}

/// Periodic driver around `plan`. Owns the node pool.
pub struct Reconciler {
    ctx: FleetContext,
    pool: NodePool,

    /// Commands sent, with the record state they were sent against. Dropped
    /// once the state moves on.
    in_flight: HashMap<NodeId, (Command, NodeState)>,
}

impl Reconciler {
    pub fn new(ctx: FleetContext) -> Self {
        let pool = NodePool::new(ctx.clone());
        Self {
            ctx,
            pool,
            in_flight: HashMap::new(),
        }
    }

    pub fn pool(&self) -> &NodePool {
        &self.pool
    }

    pub fn into_pool(self) -> NodePool {
        self.pool
    }

    fn refresh_in_flight(&mut self, records: &[NodeRecord]) -> InFlight {
        let states: HashMap<NodeId, NodeState> = records.iter().map(|r| (r.id, r.state)).collect();
        self.in_flight
            .retain(|id, (_, sent_at)| states.get(id).is_some_and(|state| state == sent_at));

        let mut in_flight = InFlight::default();
        for (id, (command, _)) in &self.in_flight {
            match command {
                Command::Shutdown => in_flight.shutdown.insert(*id),
                Command::Reclaim => in_flight.reclaim.insert(*id),
            };
        }
        in_flight
    }

    /// Run one pass: evict, plan, dispatch, report.
    pub fn tick(&mut self) -> Decision {
        let now = Instant::now();
        let registry = self.ctx.registry.clone();

        self.pool.prune();
        let evicted = registry.evict_expired(now, self.ctx.config.retention());
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Evicted terminal records");
        }

        let records = registry.snapshot();
        let in_flight = self.refresh_in_flight(&records);
        let demand = registry.demand();
        let inventory = registry.inventory();

        let decision = plan(&PlanInput {
            config: &self.ctx.config,
            catalog: &self.ctx.catalog,
            records: &records,
            demand: &demand,
            inventory: &inventory,
            in_flight: &in_flight,
            now,
        });

        let states: HashMap<NodeId, NodeState> = records.iter().map(|r| (r.id, r.state)).collect();
        self.dispatch(&decision, &states, now);
        self.report(&decision);
        decision
    }

    fn dispatch(&mut self, decision: &Decision, states: &HashMap<NodeId, NodeState>, now: Instant) {
        for action in &decision.actions {
            let sent = match action {
                Action::Boot { size } => {
                    if let Err(e) = self.pool.spawn(NodeRecord::booting(size.clone(), now)) {
                        warn!(size = %size.name, error = %e, "Failed to register boot");
                    }
                    continue;
                }
                Action::Adopt { instance_id, size } => {
                    info!(instance_id = %instance_id, size = %size.name, "Adopting owned instance");
                    if let Err(e) = self
                        .pool
                        .spawn(NodeRecord::adopted(instance_id.clone(), size.clone(), now))
                    {
                        warn!(instance_id = %instance_id, error = %e, "Failed to register adoption");
                    }
                    continue;
                }
                Action::Shutdown { node_id, reason } => (
                    *node_id,
                    Command::Shutdown,
                    self.pool.shutdown(*node_id, *reason, decision.tick_id),
                ),
                Action::Reclaim { node_id } => (
                    *node_id,
                    Command::Reclaim,
                    self.pool.reclaim(*node_id, decision.tick_id),
                ),
            };

            let (node_id, command, result) = sent;
            match result {
                Ok(()) => {
                    if let Some(state) = states.get(&node_id) {
                        self.in_flight.insert(node_id, (command, *state));
                    }
                }
                // Retried next tick.
                Err(ActorError::MailboxFull) => {
                    warn!(node_id = %node_id, command = ?command, "Node mailbox full")
                }
                Err(e) => warn!(node_id = %node_id, command = ?command, error = %e, "Command not delivered"),
            }
        }
    }

    fn report(&self, decision: &Decision) {
        if decision.is_quiet() {
            debug!(tick = %decision.tick_id, "Fleet converged");
            return;
        }

        match &decision.frozen {
            Some(reason) => warn!(tick = %decision.tick_id, reason = %reason, "Scaling frozen"),
            None => info!(tick = %decision.tick_id, actions = decision.actions.len(), "Reconciliation decision"),
        }

        self.ctx.events.emit(FleetEvent::ReconcileDecision {
            tick_id: decision.tick_id,
            frozen: decision.frozen.clone(),
            adopted: decision
                .actions
                .iter()
                .filter_map(|a| match a {
                    Action::Adopt { instance_id, .. } => Some(instance_id.clone()),
                    _ => None,
                })
                .collect(),
            sizes: decision.sizes.clone(),
        });
    }

    /// Reconcile on `reconcile_interval_secs` until shutdown, then hand back
    /// the pool for draining.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> NodePool {
        let mut timer = tokio::time::interval(self.ctx.config.reconcile_interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.ctx.config.daemon.reconcile_interval_secs,
            "Starting reconciler"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
                _ = timer.tick() => {
                    self.tick();
                }
            }
        }

        self.pool
    }
}
