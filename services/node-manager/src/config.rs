//! Configuration for the node manager.
//!
//! Loaded once at startup from a TOML file (`FLEET_CONFIG`), with a few
//! environment overrides for values that should not live in the file
//! (credentials, log level). The result is validated and then shared
//! read-only by every component; any validation error is fatal.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fleet_reconcile::{ReconcileError, ScaleBounds};
use serde::Deserialize;
use thiserror::Error;

use crate::size::{NodeSize, SizeCatalog};

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/fleet/node-manager.toml";

/// Configuration errors. All of them stop the process at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("limits reference unknown size '{0}'")]
    UnknownSize(String),

    #[error("size '{size}': {source}")]
    InvalidBounds {
        size: String,
        #[source]
        source: ReconcileError,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Node manager configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(default)]
    pub backoff: BackoffConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub cloud: CloudConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    /// Size catalog.
    pub sizes: Vec<NodeSize>,

    /// Per-size node count bounds. Sizes without an entry get
    /// `min_nodes = 0, max_nodes = daemon.default_max_nodes`.
    #[serde(default)]
    pub limits: Vec<SizeLimit>,

    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Timers and bounds for the control loop.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub reconcile_interval_secs: u64,
    pub queue_poll_secs: u64,
    pub inventory_poll_secs: u64,

    /// How often each node actor wakes up to check its timers and the latest
    /// snapshots.
    pub actor_tick_ms: u64,

    /// Created-to-paired deadline.
    pub boot_timeout_secs: u64,

    /// Idle time before a node becomes a shutdown candidate.
    pub idle_timeout_secs: u64,

    /// Window between a shutdown decision and the destroy call in which a
    /// job assignment cancels the shutdown.
    pub shutdown_grace_secs: u64,

    /// How long terminal records stay visible before eviction.
    pub retention_secs: u64,

    /// Process drain deadline.
    pub drain_deadline_secs: u64,

    pub max_create_attempts: u32,
    pub max_destroy_escalations: u32,
    pub default_max_nodes: u32,

    /// Optional cap on the summed price of all live nodes.
    pub max_total_price: Option<f64>,

    pub mailbox_size: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: fleet_reconcile::DEFAULT_RECONCILE_INTERVAL.as_secs(),
            queue_poll_secs: 10,
            inventory_poll_secs: 15,
            actor_tick_ms: 1000,
            boot_timeout_secs: 20 * 60,
            idle_timeout_secs: 5 * 60,
            shutdown_grace_secs: 30,
            retention_secs: 5 * 60,
            drain_deadline_secs: 60,
            max_create_attempts: fleet_reconcile::DEFAULT_MAX_CREATE_ATTEMPTS,
            max_destroy_escalations: 5,
            default_max_nodes: 8,
            max_total_price: None,
            mailbox_size: 32,
        }
    }
}

/// Retry policy for every cloud call.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,

    /// Retries after the first attempt.
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 500,
            max_ms: 30_000,
            jitter: 0.25,
            max_retries: 4,
        }
    }
}

/// Global provider call ceiling.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    pub calls_per_sec: f64,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            calls_per_sec: 5.0,
            burst: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudDriverKind {
    #[default]
    Http,
    /// In-memory provider, for development.
    Mock,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CloudConfig {
    pub driver: CloudDriverKind,
    pub endpoint: Option<String>,

    /// Bearer token. Prefer `FLEET_CLOUD_TOKEN`.
    pub token: Option<String>,

    /// Value of the owner tag stamped on every instance this process creates.
    pub owner_tag: String,

    pub request_timeout_secs: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            driver: CloudDriverKind::default(),
            endpoint: None,
            token: None,
            owner_tag: "fleet-node-manager".to_string(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueDriverKind {
    #[default]
    Http,
    /// In-memory queue, for development.
    Static,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    pub driver: QueueDriverKind,
    pub endpoint: Option<String>,

    /// Bearer token. Prefer `FLEET_QUEUE_TOKEN`.
    pub token: Option<String>,

    pub request_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            driver: QueueDriverKind::default(),
            endpoint: None,
            token: None,
            request_timeout_secs: 15,
        }
    }
}

/// Node count bounds for one size.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SizeLimit {
    pub size: String,
    #[serde(default)]
    pub min_nodes: u32,
    pub max_nodes: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load from `FLEET_CONFIG` (or the default path) and apply env overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var("FLEET_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::parse_file(Path::new(&path))?;

        if let Ok(level) = std::env::var("FLEET_LOG_LEVEL") {
            config.log_level = level;
        }
        if let Ok(token) = std::env::var("FLEET_CLOUD_TOKEN") {
            config.cloud.token = Some(token);
        }
        if let Ok(token) = std::env::var("FLEET_QUEUE_TOKEN") {
            config.queue.token = Some(token);
        }

        config.validate()?;
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&contents)?)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent policy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sizes.is_empty() {
            return Err(ConfigError::Invalid("size catalog is empty".into()));
        }

        let mut names = HashSet::new();
        for size in &self.sizes {
            if !names.insert(size.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate size '{}'", size.name)));
            }
            if size.cores == 0 || size.ram_mb == 0 {
                return Err(ConfigError::Invalid(format!(
                    "size '{}' must have non-zero cores and RAM",
                    size.name
                )));
            }
            if !size.price.is_finite() || size.price <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "size '{}' must have a positive price",
                    size.name
                )));
            }
        }

        let mut limited = HashSet::new();
        for limit in &self.limits {
            if !names.contains(limit.size.as_str()) {
                return Err(ConfigError::UnknownSize(limit.size.clone()));
            }
            if !limited.insert(limit.size.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate limits for size '{}'",
                    limit.size
                )));
            }
            ScaleBounds::new(limit.min_nodes, limit.max_nodes).map_err(|source| {
                ConfigError::InvalidBounds {
                    size: limit.size.clone(),
                    source,
                }
            })?;
        }

        let d = &self.daemon;
        for (name, value) in [
            ("reconcile_interval_secs", d.reconcile_interval_secs),
            ("queue_poll_secs", d.queue_poll_secs),
            ("inventory_poll_secs", d.inventory_poll_secs),
            ("actor_tick_ms", d.actor_tick_ms),
            ("boot_timeout_secs", d.boot_timeout_secs),
            ("shutdown_grace_secs", d.shutdown_grace_secs),
            ("drain_deadline_secs", d.drain_deadline_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("daemon.{name} must be non-zero")));
            }
        }
        if d.max_create_attempts == 0 || d.max_destroy_escalations == 0 || d.mailbox_size == 0 {
            return Err(ConfigError::Invalid(
                "daemon attempt bounds and mailbox_size must be non-zero".into(),
            ));
        }
        if let Some(budget) = d.max_total_price {
            if !budget.is_finite() || budget <= 0.0 {
                return Err(ConfigError::Invalid("daemon.max_total_price must be positive".into()));
            }
        }

        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(ConfigError::Invalid("backoff.jitter must be within [0, 1]".into()));
        }
        if self.backoff.base_ms == 0 || self.backoff.max_ms < self.backoff.base_ms {
            return Err(ConfigError::Invalid(
                "backoff.base_ms must be non-zero and not above backoff.max_ms".into(),
            ));
        }

        if !self.rate_limit.calls_per_sec.is_finite() || self.rate_limit.calls_per_sec <= 0.0 {
            return Err(ConfigError::Invalid("rate_limit.calls_per_sec must be positive".into()));
        }
        if self.rate_limit.burst == 0 {
            return Err(ConfigError::Invalid("rate_limit.burst must be non-zero".into()));
        }

        if self.cloud.driver == CloudDriverKind::Http && self.cloud.endpoint.is_none() {
            return Err(ConfigError::Invalid("cloud.endpoint is required for the http driver".into()));
        }
        if self.cloud.owner_tag.is_empty() {
            return Err(ConfigError::Invalid("cloud.owner_tag must not be empty".into()));
        }
        if self.queue.driver == QueueDriverKind::Http && self.queue.endpoint.is_none() {
            return Err(ConfigError::Invalid("queue.endpoint is required for the http driver".into()));
        }

        Ok(())
    }

    /// The size catalog, cheapest first.
    pub fn catalog(&self) -> SizeCatalog {
        SizeCatalog::new(self.sizes.clone())
    }

    /// Count bounds for a size.
    pub fn bounds(&self, size: &str) -> ScaleBounds {
        let (min, max) = self
            .limits
            .iter()
            .find(|l| l.size == size)
            .map_or((0, self.daemon.default_max_nodes), |l| (l.min_nodes, l.max_nodes));
        ScaleBounds::clamped(min, max)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.daemon.reconcile_interval_secs)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_secs(self.daemon.queue_poll_secs)
    }

    pub fn inventory_poll_interval(&self) -> Duration {
        Duration::from_secs(self.daemon.inventory_poll_secs)
    }

    pub fn actor_tick(&self) -> Duration {
        Duration::from_millis(self.daemon.actor_tick_ms)
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.daemon.boot_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.daemon.idle_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.daemon.shutdown_grace_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.daemon.retention_secs)
    }

    pub fn drain_deadline(&self) -> Duration {
        Duration::from_secs(self.daemon.drain_deadline_secs)
    }
}
