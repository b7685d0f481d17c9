use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "WARDEN_LOG";

/// Structured logs on stderr, filtered by `WARDEN_LOG` (default `info`).
/// Stdout stays reserved for command output and the serve protocol.
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
