use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

// Default verbosity when RUST_LOG is not set
fn default_level() -> &'static str {
    if cfg!(debug_assertions) { "trace" } else { "info" }
}

pub fn init_logging() {
    let level = default_level();

    let (filter, from_env) = match EnvFilter::try_from_default_env() {
        Ok(f) => (f, true),
        Err(_) => (EnvFilter::new(level), false),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    // Logged after init so the message is not lost
    if !from_env {
        info!("\"RUST_LOG\" variable not set, defaulting to {level}");
    }
}
