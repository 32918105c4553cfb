//! Tracing setup shared by the orchestrator and worker binaries.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable selecting the log level when `RUST_LOG` is unset.
pub const LOG_LEVEL_ENV: &str = "LOCALRUNNER_LOG";

fn filter_directives(level: Option<&str>) -> String {
    let level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("localrunner={level},localrunner::bridge::codec=off")
}

/// Initialize tracing with RUST_LOG / LOCALRUNNER_LOG and LOG_FORMAT support.
///
/// Logs always go to stderr: a worker's stdout is test output. Calling this
/// twice is harmless.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(filter_directives(
            std::env::var(LOG_LEVEL_ENV).ok().as_deref(),
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
