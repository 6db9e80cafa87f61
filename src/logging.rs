// ABOUTME: tracing subscriber setup shared by the CLI and the worker binaries
// ABOUTME: Logs go to stderr; RUST_LOG overrides the default filter

use clap::ValueEnum;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Filter used when RUST_LOG is unset
pub const DEFAULT_FILTER: &str = "mediaworkers=info";

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// JSON Lines
    Json,
}

/// Install the global subscriber. Later calls are ignored.
///
/// Worker processes inherit stderr from the pool's owner, so `process` is
/// attached to every line to tell their output apart.
pub fn setup_logging(format: LogFormat, process: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());

    let result = match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .with(filter)
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .with(filter)
            .try_init(),
    };

    if result.is_ok() {
        tracing::debug!(process = %process, pid = std::process::id(), "Logging initialised");
    }
}

/// Log panics through tracing before the default hook prints them
pub fn setup_panic_handler() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        tracing::error!("Process panicked: {}", panic_info);
        default_hook(panic_info);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_is_idempotent() {
        setup_logging(LogFormat::Text, "test");
        setup_logging(LogFormat::Json, "test");
    }
}
