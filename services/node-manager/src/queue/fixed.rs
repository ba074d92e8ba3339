//! In-memory job queue.

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::{JobQueue, QueueError};
use crate::cloud::InstanceId;
use crate::size::JobRequirement;

#[derive(Debug, Default)]
struct Contents {
    jobs: Vec<JobRequirement>,
    busy: BTreeSet<InstanceId>,
    unreachable: bool,
}

/// Queue whose contents are set directly. Backs `driver = "static"` and tests.
#[derive(Debug, Default)]
pub struct StaticQueue {
    contents: Mutex<Contents>,
}

impl StaticQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_jobs(jobs: Vec<JobRequirement>) -> Self {
        let queue = Self::new();
        queue.set_jobs(jobs);
        queue
    }

    pub fn set_jobs(&self, jobs: Vec<JobRequirement>) {
        self.with(|c| c.jobs = jobs);
    }

    pub fn set_busy(&self, busy: impl IntoIterator<Item = InstanceId>) {
        self.with(|c| c.busy = busy.into_iter().collect());
    }

    /// Simulate an outage.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.with(|c| c.unreachable = unreachable);
    }

    fn with<R>(&self, f: impl FnOnce(&mut Contents) -> R) -> R {
        let mut contents = self.contents.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut contents)
    }
}

#[async_trait]
impl JobQueue for StaticQueue {
    fn name(&self) -> &str {
        "static"
    }

    async fn list_queued_jobs(&self) -> Result<Vec<JobRequirement>, QueueError> {
        self.with(|c| {
            if c.unreachable {
                Err(QueueError::Unreachable("static queue marked unreachable".into()))
            } else {
                Ok(c.jobs.clone())
            }
        })
    }

    async fn busy_nodes(&self) -> Result<BTreeSet<InstanceId>, QueueError> {
        self.with(|c| {
            if c.unreachable {
                Err(QueueError::Unreachable("static queue marked unreachable".into()))
            } else {
                Ok(c.busy.clone())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_queue_contents() {
        let queue = StaticQueue::with_jobs(vec![JobRequirement::new("a", 1, 1024, 0)]);
        queue.set_busy([InstanceId::new("i-1")]);

        assert_eq!(queue.list_queued_jobs().await.unwrap().len(), 1);
        assert!(queue.busy_nodes().await.unwrap().contains(&InstanceId::new("i-1")));

        queue.set_unreachable(true);
        assert!(matches!(
            queue.list_queued_jobs().await,
            Err(QueueError::Unreachable(_))
        ));
    }
}
