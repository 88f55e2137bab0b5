pub mod handlers;

use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub use handlers::RetryPolicy;

/// Top-level error handed back to whoever drives the scheduler.
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("No cluster can host the VM (network: {network}, arch: {cpu_arch}, memory: {memory_mb}MB)")]
    NoResource {
        network: String,
        cpu_arch: String,
        memory_mb: u64,
    },

    #[error("Cluster Error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Backend Error: {0}")]
    Backend(#[from] BackendError),

    #[error("Configuration Error: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Cluster {cluster} lacks {resource} for the request ({requested})")]
    InsufficientCapacity {
        cluster: String,
        resource: ResourceType,
        requested: String,
    },

    #[error("Failed to create VM {vm_name} on {cluster}: {source}")]
    CreateFailed {
        cluster: String,
        vm_name: String,
        #[source]
        source: BackendError,
    },

    #[error("Backend returned id {backend_id} which {cluster} already hosts")]
    DuplicateBackendId {
        cluster: String,
        backend_id: String,
    },

    #[error("Could not confirm destruction of {backend_id} after {attempts} attempts, cleaned up locally: {source}")]
    DestroyIncomplete {
        backend_id: String,
        attempts: u32,
        #[source]
        source: BackendError,
    },
}

impl ClusterError {
    /// The pool routed a request to a cluster that could not take it. Only the
    /// request is aborted, but callers may want to log it louder.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, ClusterError::InsufficientCapacity { .. })
    }
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Backend has no record of {0}")]
    NotFound(String),

    #[error("Transient backend failure: {0}")]
    Transient(String),

    #[error("Backend rejected the request: {0}")]
    Rejected(String),

    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Backend I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BackendError::Transient(_) | BackendError::Timeout(_) | BackendError::Io(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cluster {cluster}: unparsable memory list {value:?}")]
    InvalidMemoryList {
        cluster: String,
        value: String,
    },

    #[error("Cluster {cluster}: {field} must not be empty")]
    MissingField {
        cluster: String,
        field: &'static str,
    },

    #[error("Cluster {cluster}: unsupported cloud type {cloud_type:?}")]
    UnsupportedCloudType {
        cluster: String,
        cloud_type: String,
    },

    #[error("Failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Failed to write settings: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Slots,
    Memory,
    CpuArchitecture,
    Network,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Slots => write!(f, "VM slots"),
            ResourceType::Memory => write!(f, "Memory"),
            ResourceType::CpuArchitecture => write!(f, "CPU architecture"),
            ResourceType::Network => write!(f, "Network pool"),
        }
    }
}

pub type CloudResult<T> = Result<T, CloudError>;
