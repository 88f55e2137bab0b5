pub mod metrics;

pub use metrics::{ClusterSnapshot, MetricsSnapshot, SchedulerMetrics};
