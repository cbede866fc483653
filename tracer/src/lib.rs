use tracing::subscriber::set_global_default;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

/// Initializes the process-wide tracing subscriber. Exporting spans to an external
/// collector (otel, Jaeger, ...) is left to the embedding application; this only wires
/// up stdout + structured JSON layers, which is all the apply pipeline itself needs.
pub fn init_tracing(log_level: Option<&str>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.unwrap_or("info")));

    let stdout_layer = tracing_subscriber::fmt::layer().pretty();
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_level(true)
        .with_current_span(true)
        .with_thread_names(true);

    let subscriber = Registry::default()
        .with(env_filter)
        .with(json_layer)
        .with(stdout_layer);

    set_global_default(subscriber).expect("failed to set default tracing subscriber");
}

#[cfg(test)]
mod tests {}
