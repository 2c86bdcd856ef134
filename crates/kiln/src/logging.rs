//! Tracing setup for the kiln binary.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Build the filter from `RUST_LOG`, falling back to `KILN_LOG`.
fn env_filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }

    let level = level_for(std::env::var("KILN_LOG").ok().as_deref());
    EnvFilter::new(format!("kiln={level},kiln_exec={level}"))
}

fn level_for(kiln_log: Option<&str>) -> &'static str {
    match kiln_log {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

/// Initialize tracing on stderr. `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = env_filter();
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(use_json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!use_json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .try_init();
}
