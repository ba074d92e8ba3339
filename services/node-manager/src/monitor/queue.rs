//! Queue monitor: reduces queued jobs to the wishlist and tracks busy nodes.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::Health;
use crate::context::FleetContext;
use crate::events::{FleetEvent, MonitorKind};
use crate::queue::{JobQueue, QueueError};
use crate::registry::DemandSnapshot;
use crate::size::{build_wishlist, Wishlist};

/// Polls the job queue and publishes demand snapshots.
pub struct QueueMonitor {
    ctx: FleetContext,
    queue: Arc<dyn JobQueue>,
    health: Health,
    seq: u64,

    /// Unsatisfiable job ids already reported.
    reported: HashSet<String>,
}

impl QueueMonitor {
    pub fn new(ctx: FleetContext, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            ctx,
            queue,
            health: Health::new(MonitorKind::Queue),
            seq: 0,
            reported: HashSet::new(),
        }
    }

    /// Poll once and publish. Returns the wishlist now in effect, which is the
    /// previous one when the queue could not be read.
    pub async fn poll(&mut self) -> Wishlist {
        match self.fetch().await {
            Ok(snapshot) => {
                self.health.succeeded(self.ctx.events.as_ref());
                self.report_unsatisfiable(&snapshot);
                let wishlist = snapshot.wishlist.clone();
                self.ctx.registry.publish_demand(snapshot);
                wishlist
            }
            Err(e) => {
                self.health.failed(self.ctx.events.as_ref(), &e);
                let last = self.ctx.registry.demand();
                let mut stale = DemandSnapshot::clone(&last);
                stale.degraded = true;
                let wishlist = stale.wishlist.clone();
                self.ctx.registry.publish_demand(stale);
                wishlist
            }
        }
    }

    async fn fetch(&mut self) -> Result<DemandSnapshot, QueueError> {
        let jobs = self.queue.list_queued_jobs().await?;
        let busy = self.queue.busy_nodes().await?;
        let report = build_wishlist(&self.ctx.catalog, &jobs);

        self.seq += 1;
        debug!(
            seq = self.seq,
            queued = jobs.len(),
            wanted = report.wishlist.total(),
            busy = busy.len(),
            "Queue polled"
        );

        Ok(DemandSnapshot {
            seq: self.seq,
            taken_at: Instant::now(),
            wishlist: report.wishlist,
            busy,
            unsatisfiable: report.unsatisfiable,
            degraded: false,
            observed: true,
        })
    }

    fn report_unsatisfiable(&mut self, snapshot: &DemandSnapshot) {
        let current: HashSet<&str> = snapshot
            .unsatisfiable
            .iter()
            .map(|job| job.job_id.as_str())
            .collect();
        self.reported.retain(|id| current.contains(id.as_str()));

        for job in &snapshot.unsatisfiable {
            if self.reported.insert(job.job_id.clone()) {
                self.ctx.events.emit(FleetEvent::QueueUnsatisfiable {
                    job_id: job.job_id.clone(),
                    cores: job.cores,
                    ram_mb: job.ram_mb,
                    scratch_mb: job.scratch_mb,
                });
            }
        }

        if !snapshot.unsatisfiable.is_empty() {
            warn!(
                count = snapshot.unsatisfiable.len(),
                "Queued jobs fit no configured size"
            );
        }
    }

    /// Poll on `queue_poll_secs` until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut timer = tokio::time::interval(self.ctx.config.queue_poll_interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            queue = self.queue.name(),
            interval_secs = self.ctx.config.daemon.queue_poll_secs,
            "Starting queue monitor"
        );

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.poll().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Queue monitor shutting down");
                        break;
                    }
                }
            }
        }
    }
}
