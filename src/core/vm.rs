use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a caller asks for. The pool matches on network, arch and memory;
/// the image location is handed straight to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VMRequest {
    pub name: String,
    pub network: String,
    pub cpu_arch: String,
    pub image_location: String,
    pub memory_mb: u64,
}

impl VMRequest {
    pub fn new(
        name: impl Into<String>,
        network: impl Into<String>,
        cpu_arch: impl Into<String>,
        image_location: impl Into<String>,
        memory_mb: u64,
    ) -> Self {
        Self {
            name: name.into(),
            network: network.into(),
            cpu_arch: cpu_arch.into(),
            image_location: image_location.into(),
            memory_mb,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VMStatus {
    Starting,   // asked for, not confirmed yet 🏗️
    Running,    // Vrooooom! 🏎️
    Error,      // Houston, we have a problem! 🚨
    Shutdown,   // gone for good 👋
}

impl VMStatus {
    pub fn is_terminal(self) -> bool {
        self == VMStatus::Shutdown
    }
}

impl fmt::Display for VMStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VMStatus::Starting => write!(f, "Starting"),
            VMStatus::Running => write!(f, "Running"),
            VMStatus::Error => write!(f, "Error"),
            VMStatus::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// One provisioned VM as its host cluster sees it.
///
/// Records are created by `Cluster::vm_create` and only ever handed out as
/// clones; the authoritative copy lives in the cluster's VM table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VM {
    pub name: String,
    pub backend_id: String,
    /// Cluster-local sequence number. Backends may hand an id out again, the
    /// record number never repeats within a cluster.
    pub record: u64,
    pub host_cluster: String,
    pub cluster_address: String,
    pub cloud_type: String,
    pub network: String,
    pub cpu_arch: String,
    pub image_location: String,
    pub memory_mb: u64,
    /// Index of the memory block the reservation came out of. Destroy gives
    /// the memory back to this exact block.
    pub memory_entry: usize,
    pub status: VMStatus,
    pub override_status: Option<VMStatus>,
    pub created_at: DateTime<Utc>,
    pub last_poll: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
}

impl VM {
    pub(crate) fn new(
        request: &VMRequest,
        record: u64,
        backend_id: String,
        host_cluster: &str,
        cluster_address: &str,
        cloud_type: &str,
        memory_entry: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: request.name.clone(),
            backend_id,
            record,
            host_cluster: host_cluster.to_string(),
            cluster_address: cluster_address.to_string(),
            cloud_type: cloud_type.to_string(),
            network: request.network.clone(),
            cpu_arch: request.cpu_arch.clone(),
            image_location: request.image_location.clone(),
            memory_mb: request.memory_mb,
            memory_entry,
            status: VMStatus::Starting,
            override_status: None,
            created_at: now,
            last_poll: None,
            last_state_change: now,
        }
    }

    /// The status an operator sees: a forced status wins over polled state.
    pub fn effective_status(&self) -> VMStatus {
        self.override_status.unwrap_or(self.status)
    }

    /// Folds one poll result into the record. Returns true if `status`
    /// actually changed.
    pub(crate) fn apply_poll(&mut self, polled: VMStatus, at: DateTime<Utc>) -> bool {
        self.last_poll = Some(at);
        if self.override_status.take().is_some() {
            tracing::debug!(vm = %self.backend_id, "Poll returned a status, override cleared");
        }
        if self.status == polled || self.status.is_terminal() {
            return false;
        }
        self.status = polled;
        self.last_state_change = at;
        true
    }

    pub fn describe(&self) -> String {
        format!(
            "VM Name: {}, ID: {}, host: {}, Status: {}",
            self.name,
            self.backend_id,
            self.cluster_address,
            self.effective_status()
        )
    }
}
