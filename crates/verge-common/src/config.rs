use std::time::Duration;

/// Scheduler-wide configuration, built once at startup and handed to every
/// long-lived component. Pure algorithm functions take what they need as
/// parameters instead of reading this.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Scheduler name; connectors use it to recognise their node labels.
    pub name: String,
    pub namespace: String,
    /// Dimension of every resource vector in the cluster.
    pub resource_count: usize,
    /// Migration budget `K` for the in-edge planner.
    pub maximum_migrations: usize,
    /// Cap on cloud-to-edge promotions per suggestion.
    pub maximum_cloud_offload: usize,
    /// Largest new-replica batch handed to one decision pass.
    pub batch_size: usize,
    /// Period of the new-pod buffer drain.
    pub flush_period: Duration,
    /// Period of the cloud-to-edge suggestion pass.
    pub cloud_suggest_period: Duration,
    /// Period of the stuck-queue health check.
    pub health_check_period: Duration,
    /// Backoff between failed resync attempts.
    pub recover_retry_period: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "verge".to_string(),
            namespace: "default".to_string(),
            resource_count: 2,
            maximum_migrations: 2,
            maximum_cloud_offload: 4,
            batch_size: 8,
            flush_period: Duration::from_millis(500),
            cloud_suggest_period: Duration::from_secs(30),
            health_check_period: Duration::from_secs(10),
            recover_retry_period: Duration::from_secs(5),
        }
    }
}
