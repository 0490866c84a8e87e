//! Tracing setup for the `srs-daq` binary.
//!
//! `RUST_LOG` wins when set; otherwise the configured `log_level` applies to
//! every crate. Output is human-readable by default, JSON on request.

use daq_core::error::{AppResult, DaqError};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Output format for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Compact single-line output with colours on a terminal
    #[default]
    Compact,
    /// JSON lines for log aggregation
    Json,
}

/// Build the filter: `RUST_LOG` if it parses, else `level`.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber.
///
/// Idempotent: a second call, or a call after a test harness installed its
/// own subscriber, returns `Ok(())`.
pub fn init(level: &str, format: OutputFormat) -> AppResult<()> {
    let filter = env_filter(level);

    let result = match format {
        OutputFormat::Compact => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .compact()
                    .with_target(true)
                    .with_thread_names(false)
                    .with_filter(filter),
            )
            .try_init(),
        OutputFormat::Json => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_filter(filter),
            )
            .try_init(),
    };

    result.or_else(|e| {
        // Expected in tests and when a library already installed one
        if e.to_string()
            .contains("a global default trace dispatcher has already been set")
        {
            Ok(())
        } else {
            Err(DaqError::Configuration(format!(
                "Failed to initialize tracing: {e}"
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_is_ok() {
        assert!(init("info", OutputFormat::Compact).is_ok());
        assert!(init("debug", OutputFormat::Json).is_ok());
    }
}
