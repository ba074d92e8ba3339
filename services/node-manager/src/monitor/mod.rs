//! Periodic pollers for the job queue and the cloud inventory.
//!
//! Both follow the same failure policy: a failed poll keeps the last good
//! snapshot, republishes it marked degraded, and emits one degraded event per
//! outage. Consumers never read a failed poll as an empty answer.

mod inventory;
mod queue;

pub use inventory::InventoryMonitor;
pub use queue::QueueMonitor;

use tracing::{error, info, warn};

use crate::events::{EventSink, FleetEvent, MonitorKind};

/// Consecutive failures logged as warnings before switching to errors.
const WARN_FAILURES: u32 = 3;

/// Degraded-mode bookkeeping shared by both monitors.
#[derive(Debug)]
struct Health {
    kind: MonitorKind,
    consecutive_failures: u32,
}

impl Health {
    fn new(kind: MonitorKind) -> Self {
        Self {
            kind,
            consecutive_failures: 0,
        }
    }

    fn is_degraded(&self) -> bool {
        self.consecutive_failures > 0
    }

    fn failed(&mut self, events: &dyn EventSink, error: &dyn std::fmt::Display) {
        self.consecutive_failures += 1;
        let consecutive_failures = self.consecutive_failures;

        if consecutive_failures == 1 {
            events.emit(FleetEvent::MonitorDegraded {
                monitor: self.kind,
                error: error.to_string(),
            });
        }

        if consecutive_failures <= WARN_FAILURES {
            warn!(monitor = ?self.kind, error = %error, consecutive_failures, "Poll failed, keeping last snapshot");
        } else {
            error!(monitor = ?self.kind, error = %error, consecutive_failures, "Poll failed repeatedly");
        }
    }

    fn succeeded(&mut self, events: &dyn EventSink) {
        if self.consecutive_failures > 0 {
            info!(monitor = ?self.kind, failed_polls = self.consecutive_failures, "Poll recovered");
            events.emit(FleetEvent::MonitorRecovered {
                monitor: self.kind,
                failed_polls: self.consecutive_failures,
            });
        }
        self.consecutive_failures = 0;
    }
}
