//! Job queue access.
//!
//! The manager consumes two things from the queue: the resource asks of jobs
//! waiting to be scheduled, and which nodes are currently running a job.

mod fixed;
mod http;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use fixed::StaticQueue;
pub use http::HttpQueue;

use crate::cloud::InstanceId;
use crate::config::{ConfigError, QueueConfig, QueueDriverKind};
use crate::size::JobRequirement;

/// Job queue errors. All of them put the queue monitor in degraded mode.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job queue unreachable: {0}")]
    Unreachable(String),

    #[error("job queue returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid job queue response: {0}")]
    Decode(String),
}

/// Job queue interface.
#[async_trait]
pub trait JobQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Jobs that are runnable but not yet scheduled.
    async fn list_queued_jobs(&self) -> Result<Vec<JobRequirement>, QueueError>;

    /// Instances currently running at least one job.
    async fn busy_nodes(&self) -> Result<BTreeSet<InstanceId>, QueueError>;
}

/// Build the configured queue client.
pub fn queue_from_config(config: &QueueConfig) -> Result<Arc<dyn JobQueue>, ConfigError> {
    match config.driver {
        QueueDriverKind::Http => {
            let endpoint = config
                .endpoint
                .clone()
                .ok_or_else(|| ConfigError::Invalid("queue.endpoint is required".into()))?;
            let queue = HttpQueue::new(
                endpoint,
                config.token.clone(),
                Duration::from_secs(config.request_timeout_secs),
            )
            .map_err(|e| ConfigError::Invalid(format!("queue http client: {e}")))?;
            Ok(Arc::new(queue))
        }
        QueueDriverKind::Static => Ok(Arc::new(StaticQueue::new())),
    }
}
