//! Retry coordination, policy and metrics

mod coordinator;
mod metrics;
mod policy;

pub use coordinator::{ExecuteOutcome, RetryCoordinator};
pub use metrics::{
    AttemptOutcome, MetricsConfig, MetricsSnapshot, ProxyAttemptStats, RequestRecord,
    RetryAttempt, RetryMetrics,
};
pub use policy::{BackoffStrategy, RetryPolicy};
