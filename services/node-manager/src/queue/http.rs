//! HTTP job queue client.
//!
//! ```text
//! GET /v1/jobs?state=queued   -> {"jobs": [{id, cores, ram_mb, scratch_mb, node_count}]}
//! GET /v1/jobs?state=running  -> {"jobs": [{id, node}]}
//! ```

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, error};

use super::{JobQueue, QueueError};
use crate::cloud::InstanceId;
use crate::size::JobRequirement;

/// HTTP job queue client.
pub struct HttpQueue {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobsResponse<T> {
    jobs: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct RunningJob {
    /// Instance the job is running on.
    node: Option<InstanceId>,
}

impl HttpQueue {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn fetch_jobs<T: DeserializeOwned>(&self, state: &str) -> Result<Vec<T>, QueueError> {
        let url = format!("{}/v1/jobs", self.base_url);
        let mut request = self.client.get(&url).query(&[("state", state)]);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| QueueError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, state, "Failed to list jobs");
            return Err(QueueError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: JobsResponse<T> = response
            .json()
            .await
            .map_err(|e| QueueError::Decode(e.to_string()))?;
        Ok(body.jobs)
    }
}

#[async_trait]
impl JobQueue for HttpQueue {
    fn name(&self) -> &str {
        "http"
    }

    async fn list_queued_jobs(&self) -> Result<Vec<JobRequirement>, QueueError> {
        let jobs: Vec<JobRequirement> = self.fetch_jobs("queued").await?;
        debug!(count = jobs.len(), "Fetched queued jobs");
        Ok(jobs)
    }

    async fn busy_nodes(&self) -> Result<BTreeSet<InstanceId>, QueueError> {
        let jobs: Vec<RunningJob> = self.fetch_jobs("running").await?;
        Ok(jobs.into_iter().filter_map(|job| job.node).collect())
    }
}
