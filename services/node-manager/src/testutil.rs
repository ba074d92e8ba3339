//! In-process fleet wiring for tests and local experiments.
//!
//! Builds a `FleetContext` over `MockCloud`, `StaticQueue` and `MemorySink`
//! with a small catalog and deterministic backoff.

use std::sync::Arc;

use crate::cloud::{CloudAdapter, MockCloud};
use crate::config::Config;
use crate::context::FleetContext;
use crate::events::MemorySink;
use crate::queue::StaticQueue;

/// Config used by `TestFleet::new`.
pub const TEST_CONFIG: &str = r#"
[daemon]
reconcile_interval_secs = 20
queue_poll_secs = 10
inventory_poll_secs = 15
actor_tick_ms = 1000
boot_timeout_secs = 1200
idle_timeout_secs = 300
shutdown_grace_secs = 30
retention_secs = 300
drain_deadline_secs = 60
max_create_attempts = 3
max_destroy_escalations = 3

[backoff]
base_ms = 500
max_ms = 8000
jitter = 0.0
max_retries = 2

[rate_limit]
calls_per_sec = 1000.0
burst = 100

[cloud]
driver = "mock"
owner_tag = "test-fleet"

[queue]
driver = "static"

[[sizes]]
name = "small"
cores = 2
ram_mb = 4096
scratch_mb = 50000
price = 0.10

[[sizes]]
name = "medium"
cores = 8
ram_mb = 16384
scratch_mb = 200000
price = 0.40

[[sizes]]
name = "large"
cores = 16
ram_mb = 65536
scratch_mb = 400000
price = 0.80

[[limits]]
size = "small"
min_nodes = 0
max_nodes = 4

[[limits]]
size = "medium"
min_nodes = 0
max_nodes = 4

[[limits]]
size = "large"
min_nodes = 0
max_nodes = 5
"#;

/// A fleet context with handles on its fakes.
pub struct TestFleet {
    pub ctx: FleetContext,
    pub cloud: Arc<MockCloud>,
    pub queue: Arc<StaticQueue>,
    pub events: Arc<MemorySink>,
}

impl Default for TestFleet {
    fn default() -> Self {
        Self::new()
    }
}

impl TestFleet {
    pub fn new() -> Self {
        match Config::from_toml_str(TEST_CONFIG) {
            Ok(config) => Self::with_config(config),
            Err(e) => panic!("test config is invalid: {e}"),
        }
    }

    /// `TEST_CONFIG` with `edit` applied before validation.
    pub fn with(edit: impl FnOnce(&mut Config)) -> Self {
        let mut config: Config = match toml::from_str(TEST_CONFIG) {
            Ok(config) => config,
            Err(e) => panic!("test config is invalid: {e}"),
        };
        edit(&mut config);
        if let Err(e) = config.validate() {
            panic!("edited test config is invalid: {e}");
        }
        Self::with_config(config)
    }

    pub fn with_config(config: Config) -> Self {
        let cloud = Arc::new(MockCloud::new());
        let queue = Arc::new(StaticQueue::new());
        let events = Arc::new(MemorySink::new());
        let adapter = CloudAdapter::from_config(cloud.clone(), &config);
        let ctx = FleetContext::new(config, adapter, events.clone());

        Self {
            ctx,
            cloud,
            queue,
            events,
        }
    }
}
