use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn env_filter() -> EnvFilter {
    // The opcua stack logs a lot at info while populating its address
    // space; keep it at warn unless RUST_LOG overrides.
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,opcua=warn"))
}

/// Initialize structured logging for the gateway process.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer())
        .init();
}
