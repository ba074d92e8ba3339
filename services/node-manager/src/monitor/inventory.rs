//! Cloud inventory monitor: lists instances and publishes snapshots.

use std::collections::{BTreeMap, HashSet};

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::Health;
use crate::cloud::{CancelSignal, CloudError, CloudInstance, InstanceId};
use crate::context::FleetContext;
use crate::events::{FleetEvent, MonitorKind};
use crate::registry::InventorySnapshot;

/// Polls the provider through the shared adapter.
pub struct InventoryMonitor {
    ctx: FleetContext,
    health: Health,
    seq: u64,
    cancel: CancelSignal,

    /// Foreign instances already reported.
    reported: HashSet<InstanceId>,
}

impl InventoryMonitor {
    pub fn new(ctx: FleetContext) -> Self {
        Self {
            ctx,
            health: Health::new(MonitorKind::Inventory),
            seq: 0,
            cancel: CancelSignal::never(),
            reported: HashSet::new(),
        }
    }

    /// Stop retrying list calls once `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.cancel = CancelSignal::from_watch(shutdown);
        self
    }

    /// Poll once and publish. On failure the previous snapshot is
    /// republished as degraded with its sequence number unchanged.
    pub async fn poll(&mut self) -> std::sync::Arc<InventorySnapshot> {
        match self.ctx.cloud.list(&mut self.cancel).await {
            Ok(instances) => {
                self.health.succeeded(self.ctx.events.as_ref());
                self.seq += 1;
                self.report_foreign(&instances);

                let instances: BTreeMap<InstanceId, CloudInstance> = instances
                    .into_iter()
                    .map(|instance| (instance.id.clone(), instance))
                    .collect();
                debug!(seq = self.seq, count = instances.len(), "Inventory polled");

                self.ctx.registry.publish_inventory(InventorySnapshot {
                    seq: self.seq,
                    taken_at: Instant::now(),
                    instances,
                    degraded: false,
                    observed: true,
                });
            }
            Err(CloudError::Cancelled) => {}
            Err(e) => {
                self.health.failed(self.ctx.events.as_ref(), &e);
                let mut stale = InventorySnapshot::clone(&self.ctx.registry.inventory());
                stale.degraded = true;
                self.ctx.registry.publish_inventory(stale);
            }
        }
        self.ctx.registry.inventory()
    }

    /// Report instances that are not ours to manage: a different or missing
    /// owner tag, or our tag with a size the catalog does not know.
    fn report_foreign(&mut self, instances: &[CloudInstance]) {
        let owner_tag = self.ctx.config.cloud.owner_tag.as_str();
        let present: HashSet<&InstanceId> = instances.iter().map(|i| &i.id).collect();
        self.reported.retain(|id| present.contains(id));

        for instance in instances {
            let reason = match instance.owner() {
                Some(owner) if owner == owner_tag => match instance.size_name() {
                    Some(size) if self.ctx.catalog.get(size).is_some() => continue,
                    Some(size) => format!("owned instance with unknown size '{size}'"),
                    None => "owned instance without a size tag".to_string(),
                },
                Some(_) => "owned by another manager".to_string(),
                None => "no owner tag".to_string(),
            };

            if self.reported.insert(instance.id.clone()) {
                warn!(instance_id = %instance.id, reason = %reason, "Ignoring foreign instance");
                self.ctx.events.emit(FleetEvent::InventoryForeign {
                    instance_id: instance.id.clone(),
                    owner: instance.owner().map(str::to_string),
                    reason,
                });
            }
        }
    }

    /// Poll on `inventory_poll_secs` until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut timer = tokio::time::interval(self.ctx.config.inventory_poll_interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            driver = self.ctx.cloud.driver_name(),
            interval_secs = self.ctx.config.daemon.inventory_poll_secs,
            "Starting inventory monitor"
        );

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.poll().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Inventory monitor shutting down");
                        break;
                    }
                }
            }
        }
    }
}
