//! Top-level task wiring.
//!
//! Starts the two monitors and the reconciler on their own intervals, waits
//! for the shutdown signal, then drains the node actors.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::actors::{DrainReport, NodePool};
use crate::context::FleetContext;
use crate::monitor::{InventoryMonitor, QueueMonitor};
use crate::queue::JobQueue;
use crate::reconciler::Reconciler;

pub struct Supervisor {
    ctx: FleetContext,
    queue: Arc<dyn JobQueue>,
}

impl Supervisor {
    pub fn new(ctx: FleetContext, queue: Arc<dyn JobQueue>) -> Self {
        Self { ctx, queue }
    }

    /// Run until `shutdown` flips to true.
    ///
    /// No new create is issued once shutdown is signalled. Actors finish the
    /// call they are in and stop; any still running after
    /// `drain_deadline_secs` are aborted.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> DrainReport {
        info!(
            cloud = self.ctx.cloud.driver_name(),
            queue = self.queue.name(),
            sizes = self.ctx.catalog.len(),
            "Starting node manager"
        );

        let queue_monitor = QueueMonitor::new(self.ctx.clone(), self.queue.clone());
        let queue_task = tokio::spawn(queue_monitor.run(shutdown.clone()));

        let inventory_monitor = InventoryMonitor::new(self.ctx.clone()).with_shutdown(shutdown.clone());
        let inventory_task = tokio::spawn(inventory_monitor.run(shutdown.clone()));

        let reconciler = Reconciler::new(self.ctx.clone());
        let reconciler_task = tokio::spawn(reconciler.run(shutdown.clone()));

        let mut pool = match reconciler_task.await {
            Ok(pool) => pool,
            Err(e) => {
                error!(error = %e, "Reconciler task panicked");
                NodePool::new(self.ctx.clone())
            }
        };

        join("queue monitor", queue_task).await;
        join("inventory monitor", inventory_task).await;

        let report = pool.drain(self.ctx.config.drain_deadline()).await;
        if report.is_clean() {
            info!(stopped = report.stopped, "Node actors drained");
        } else {
            warn!(
                stopped = report.stopped,
                aborted = report.aborted,
                "Node actors force aborted at drain deadline"
            );
        }
        for node_id in &report.unsettled {
            warn!(node_id = %node_id, "Node left mid-call; next start will adopt or clean up");
        }

        report
    }
}

async fn join(name: &str, task: JoinHandle<()>) {
    if let Err(e) = task.await {
        error!(task = name, error = %e, "Task panicked");
    }
}
