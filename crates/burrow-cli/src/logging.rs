use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;

/// Install the global subscriber
///
/// `RUST_LOG` takes precedence over `level`. Logs go to stderr so command
/// output on stdout stays machine-readable.
pub fn init(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .flatten_event(true)
            .init(),
    }
}
