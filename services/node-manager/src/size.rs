//! Node sizes, job requirements and the wishlist.
//!
//! The wishlist is the demand side of reconciliation: every queued job is
//! mapped to the cheapest configured size whose capacity dominates its
//! requirement in every dimension, and the results are counted per size.
//! It is rebuilt from scratch on every queue poll, so a job that leaves the
//! queue simply stops contributing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A purchasable node shape. Defined by configuration, immutable at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSize {
    /// Catalog name, also stamped on instances as a tag.
    pub name: String,

    pub cores: u32,

    pub ram_mb: u64,

    pub scratch_mb: u64,

    /// Relative price (any unit, only compared against other sizes and the
    /// optional budget cap).
    pub price: f64,

    /// Provider-side type to request. Defaults to `name`.
    #[serde(default)]
    pub instance_type: Option<String>,
}

impl NodeSize {
    /// Whether a node of this size can run the given job.
    pub fn satisfies(&self, job: &JobRequirement) -> bool {
        self.cores >= job.cores && self.ram_mb >= job.ram_mb && self.scratch_mb >= job.scratch_mb
    }

    /// The type name sent to the cloud provider.
    pub fn provider_type(&self) -> &str {
        self.instance_type.as_deref().unwrap_or(&self.name)
    }
}

/// A queued job's resource ask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequirement {
    /// Queue-side job identifier.
    #[serde(rename = "id")]
    pub job_id: String,

    pub cores: u32,

    pub ram_mb: u64,

    #[serde(default)]
    pub scratch_mb: u64,

    /// Nodes the job needs at once.
    #[serde(default = "default_node_count")]
    pub node_count: u32,
}

fn default_node_count() -> u32 {
    1
}

impl JobRequirement {
    /// Single-node requirement.
    pub fn new(job_id: impl Into<String>, cores: u32, ram_mb: u64, scratch_mb: u64) -> Self {
        Self {
            job_id: job_id.into(),
            cores,
            ram_mb,
            scratch_mb,
            node_count: 1,
        }
    }
}

/// The configured sizes, cheapest first.
#[derive(Debug, Clone, Default)]
pub struct SizeCatalog {
    sizes: Vec<NodeSize>,
}

impl SizeCatalog {
    /// Build a catalog. Sizes are ordered by price, then name, so that the
    /// first satisfying size is always the cheapest one.
    pub fn new(mut sizes: Vec<NodeSize>) -> Self {
        sizes.sort_by(|a, b| a.price.total_cmp(&b.price).then_with(|| a.name.cmp(&b.name)));
        Self { sizes }
    }

    pub fn get(&self, name: &str) -> Option<&NodeSize> {
        self.sizes.iter().find(|s| s.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeSize> {
        self.sizes.iter()
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    /// Cheapest size whose capacity dominates the job in every dimension.
    pub fn cheapest_fit(&self, job: &JobRequirement) -> Option<&NodeSize> {
        self.sizes.iter().find(|s| s.satisfies(job))
    }
}

/// Required node counts per size, in catalog order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Wishlist {
    entries: Vec<(NodeSize, u32)>,
}

impl Wishlist {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Count wanted for a size, zero when absent.
    pub fn count_for(&self, size_name: &str) -> u32 {
        self.entries
            .iter()
            .find(|(size, _)| size.name == size_name)
            .map_or(0, |(_, count)| *count)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeSize, u32)> {
        self.entries.iter().map(|(size, count)| (size, *count))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total nodes wanted across all sizes.
    pub fn total(&self) -> u32 {
        self.entries
            .iter()
            .fold(0u32, |total, (_, count)| total.saturating_add(*count))
    }
}

/// Result of reducing the queue.
#[derive(Debug, Clone, Default)]
pub struct WishlistReport {
    pub wishlist: Wishlist,

    /// Jobs no configured size can run. Reported, never silently dropped.
    pub unsatisfiable: Vec<JobRequirement>,
}

/// Reduce queued jobs to a wishlist.
pub fn build_wishlist(catalog: &SizeCatalog, jobs: &[JobRequirement]) -> WishlistReport {
    let mut counts: BTreeMap<&str, u32> = BTreeMap::new();
    let mut unsatisfiable = Vec::new();

    for job in jobs {
        match catalog.cheapest_fit(job) {
            Some(size) => {
                let count = counts.entry(size.name.as_str()).or_default();
                *count = count.saturating_add(job.node_count.max(1));
            }
            None => unsatisfiable.push(job.clone()),
        }
    }

    let entries = catalog
        .iter()
        .filter_map(|size| {
            counts
                .get(size.name.as_str())
                .map(|count| (size.clone(), *count))
        })
        .collect();

    WishlistReport {
        wishlist: Wishlist { entries },
        unsatisfiable,
    }
}
