//! Process-wide context.

use std::sync::Arc;

use crate::cloud::CloudAdapter;
use crate::config::Config;
use crate::events::EventSink;
use crate::registry::NodeRegistry;
use crate::size::SizeCatalog;

/// Everything a component needs, built once at startup and passed down.
#[derive(Clone)]
pub struct FleetContext {
    pub config: Arc<Config>,
    pub catalog: Arc<SizeCatalog>,
    pub cloud: Arc<CloudAdapter>,
    pub registry: Arc<NodeRegistry>,
    pub events: Arc<dyn EventSink>,
}

impl FleetContext {
    pub fn new(config: Config, cloud: CloudAdapter, events: Arc<dyn EventSink>) -> Self {
        let catalog = config.catalog();
        Self {
            config: Arc::new(config),
            catalog: Arc::new(catalog),
            cloud: Arc::new(cloud),
            registry: Arc::new(NodeRegistry::new()),
            events,
        }
    }
}
