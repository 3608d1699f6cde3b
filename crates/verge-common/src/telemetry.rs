use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing for a binary.
///
/// - `service_name`: identifies the component in log lines.
/// - `log_format`: `"text"` (human-readable, default) or `"json"`.
///
/// Honors `RUST_LOG`; defaults to `info`.
pub fn init_tracing(service_name: &str, log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    tracing::info!(service_name, "tracing initialized");
}
