use std::time::Duration;

use clap::Parser;

use verge_common::SchedulerConfig;

#[derive(Debug, Parser)]
pub struct Args {
    /// Scheduler name; connectors match node labels against it.
    #[arg(long, env = "VERGE_NAME", default_value = "verge")]
    pub name: String,

    #[arg(long, env = "VERGE_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Connector kind. `sim` is the in-tree cluster double.
    #[arg(long, env = "VERGE_CONNECTOR", default_value = "sim")]
    pub connector: String,

    /// Dimension of the resource vectors.
    #[arg(long, default_value_t = 2)]
    pub resource_count: usize,

    /// Migration budget per decision.
    #[arg(long, default_value_t = 2)]
    pub maximum_migrations: usize,

    /// Cap on cloud-to-edge promotions per suggestion.
    #[arg(long, default_value_t = 4)]
    pub maximum_cloud_offload: usize,

    /// Largest new-replica batch per decision pass.
    #[arg(long, default_value_t = 8)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 500)]
    pub flush_period_duration_ms: u64,

    #[arg(long, default_value_t = 30_000)]
    pub cloud_suggest_duration_ms: u64,

    #[arg(long, default_value_t = 10_000)]
    pub health_check_duration_ms: u64,

    #[arg(long, default_value_t = 5_000)]
    pub recover_retry_duration_ms: u64,

    /// Address for the status HTTP server.
    #[arg(long, default_value = "0.0.0.0:18080")]
    pub listen_addr: String,

    /// Log output format: "text" (human-readable, default) or "json".
    #[arg(long, env = "VERGE_LOG_FORMAT", default_value = "text")]
    pub log_format: String,
}

impl Args {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            resource_count: self.resource_count,
            maximum_migrations: self.maximum_migrations,
            maximum_cloud_offload: self.maximum_cloud_offload,
            batch_size: self.batch_size,
            flush_period: Duration::from_millis(self.flush_period_duration_ms),
            cloud_suggest_period: Duration::from_millis(self.cloud_suggest_duration_ms),
            health_check_period: Duration::from_millis(self.health_check_duration_ms),
            recover_retry_period: Duration::from_millis(self.recover_retry_duration_ms),
        }
    }
}
