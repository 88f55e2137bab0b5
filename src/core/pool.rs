use std::sync::Arc;
use tracing::{debug, info};

use crate::core::cluster::Cluster;
use crate::monitoring::ClusterSnapshot;

/// An ordered collection of clusters.
///
/// Order is insertion order and it is the only tie-breaker: matching is
/// first-fit, so callers that care about packing sort their clusters before
/// adding them.
pub struct ResourcePool {
    name: String,
    clusters: Vec<Arc<Cluster>>,
}

impl ResourcePool {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        debug!(pool = %name, "New resource pool created");
        Self {
            name,
            clusters: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends a cluster. The same cluster can be added twice.
    pub fn add(&mut self, cluster: Arc<Cluster>) {
        info!(pool = %self.name, cluster = %cluster.name(), "Cluster added to pool");
        self.clusters.push(cluster);
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn clusters(&self) -> impl Iterator<Item = &Arc<Cluster>> {
        self.clusters.iter()
    }

    pub fn find_cluster(&self, name: &str) -> Option<Arc<Cluster>> {
        self.clusters.iter().find(|c| c.name() == name).cloned()
    }

    /// First cluster in the pool, for requests with no requirements.
    pub fn get_resource(&self) -> Option<Arc<Cluster>> {
        if self.clusters.is_empty() {
            debug!(pool = %self.name, "Pool is empty, cannot return resource");
        }
        self.clusters.first().cloned()
    }

    /// First cluster, in pool order, with a free slot, a memory block of at
    /// least `memory_mb`, the requested architecture and the requested
    /// network. The answer is advisory: nothing is reserved until
    /// `Cluster::vm_create` checks the ledger again under its lock.
    pub async fn get_resource_first_fit(
        &self,
        network: &str,
        cpu_arch: &str,
        memory_mb: u64,
    ) -> Option<Arc<Cluster>> {
        for cluster in &self.clusters {
            if cluster.can_host(network, cpu_arch, memory_mb).await {
                debug!(
                    pool = %self.name,
                    cluster = %cluster.name(),
                    network,
                    cpu_arch,
                    memory_mb,
                    "First-fit match"
                );
                return Some(Arc::clone(cluster));
            }
        }
        debug!(pool = %self.name, network, cpu_arch, memory_mb, "No cluster fits the request");
        None
    }

    pub async fn snapshot(&self) -> Vec<ClusterSnapshot> {
        let mut snapshots = Vec::with_capacity(self.clusters.len());
        for cluster in &self.clusters {
            snapshots.push(cluster.snapshot().await);
        }
        snapshots
    }

    /// One line per cluster: name, cloud type and address.
    pub fn describe(&self) -> String {
        if self.clusters.is_empty() {
            return format!("Resource pool {}: empty", self.name);
        }
        let mut out = format!("Resource pool {}:", self.name);
        for cluster in &self.clusters {
            out.push_str(&format!(
                "\n\t{}\t{}\t{}",
                cluster.name(),
                cluster.cloud_type(),
                cluster.network_address()
            ));
        }
        out
    }
}
