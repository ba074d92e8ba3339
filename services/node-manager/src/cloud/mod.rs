//! Cloud provider access.
//!
//! - `CloudDriver`: the capability interface a provider implements
//!   (list / create / destroy). Chosen from configuration at startup.
//! - `CloudAdapter`: wraps a driver with retry, backoff, jitter and a global
//!   token-bucket rate limit. Every node actor and the inventory monitor go
//!   through one shared adapter.
//! - `HttpCloud`: REST provider driver.
//! - `MockCloud`: in-memory provider with fault injection.

mod adapter;
mod backoff;
mod http;
mod mock;
mod rate_limit;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_id::NodeId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use adapter::{CancelSignal, CloudAdapter};
pub use backoff::BackoffPolicy;
pub use http::HttpCloud;
pub use mock::{CreateFault, MockCloud};
pub use rate_limit::RateLimiter;

use crate::config::{CloudConfig, CloudDriverKind, ConfigError};
use crate::size::NodeSize;

/// Tag naming the process that owns an instance.
pub const TAG_OWNER: &str = "fleet-owner";

/// Tag carrying the node record that requested the instance.
pub const TAG_NODE_ID: &str = "fleet-node-id";

/// Tag carrying the catalog size name.
pub const TAG_SIZE: &str = "fleet-size";

/// Provider-assigned instance identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Instance state as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Terminated,
}

impl InstanceState {
    /// Whether the instance is on its way out or gone.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Stopping | Self::Terminated)
    }
}

/// One instance as listed by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudInstance {
    pub id: InstanceId,
    pub state: InstanceState,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl CloudInstance {
    pub fn owner(&self) -> Option<&str> {
        self.tags.get(TAG_OWNER).map(String::as_str)
    }

    pub fn size_name(&self) -> Option<&str> {
        self.tags.get(TAG_SIZE).map(String::as_str)
    }

    /// Node record that requested this instance, if the tag parses.
    pub fn node_id(&self) -> Option<NodeId> {
        self.tags.get(TAG_NODE_ID).and_then(|v| v.parse().ok())
    }
}

/// Tags stamped on every instance this process creates.
pub fn instance_tags(owner: &str, node_id: NodeId, size: &NodeSize) -> BTreeMap<String, String> {
    BTreeMap::from([
        (TAG_OWNER.to_string(), owner.to_string()),
        (TAG_NODE_ID.to_string(), node_id.to_string()),
        (TAG_SIZE.to_string(), size.name.clone()),
    ])
}

/// Cloud call errors.
#[derive(Debug, Clone, Error)]
pub enum CloudError {
    /// Timeout, 5xx, connection failure. Retried by the adapter.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Provider throttled the call. Retried by the adapter, and pauses the
    /// global bucket.
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    /// Quota exceeded, invalid size, bad credentials. Not retried.
    #[error("provider rejected the request: {0}")]
    Terminal(String),

    /// The instance does not exist. `destroy` treats this as success.
    #[error("instance not found: {0}")]
    NotFound(InstanceId),

    /// Transient failures outlasted the retry budget.
    #[error("{op} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        op: &'static str,
        attempts: u32,
        last: Box<CloudError>,
    },

    /// A shutdown cancelled the call before it was issued.
    #[error("cancelled before the call was issued")]
    Cancelled,
}

impl CloudError {
    /// Whether the adapter should retry this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited { .. })
    }
}

/// Provider capability interface.
#[async_trait]
pub trait CloudDriver: Send + Sync {
    /// Driver name for logging.
    fn name(&self) -> &str;

    /// All instances visible to our credentials, ours or not.
    async fn list(&self) -> Result<Vec<CloudInstance>, CloudError>;

    /// Request one instance. `tags` always include the requesting node id,
    /// which drivers pass on as an idempotency token.
    async fn create(
        &self,
        size: &NodeSize,
        tags: &BTreeMap<String, String>,
    ) -> Result<InstanceId, CloudError>;

    /// Destroy an instance. Drivers report a missing instance as `NotFound`.
    async fn destroy(&self, id: &InstanceId) -> Result<(), CloudError>;
}

/// Build the configured driver.
pub fn driver_from_config(config: &CloudConfig) -> Result<Arc<dyn CloudDriver>, ConfigError> {
    match config.driver {
        CloudDriverKind::Http => {
            let endpoint = config
                .endpoint
                .clone()
                .ok_or_else(|| ConfigError::Invalid("cloud.endpoint is required".into()))?;
            let driver = HttpCloud::new(
                endpoint,
                config.token.clone(),
                Duration::from_secs(config.request_timeout_secs),
            )
            .map_err(|e| ConfigError::Invalid(format!("cloud http client: {e}")))?;
            Ok(Arc::new(driver))
        }
        CloudDriverKind::Mock => Ok(Arc::new(MockCloud::new())),
    }
}
