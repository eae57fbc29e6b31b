//! Subscriber setup for the `tracing` events emitted by the store crates.
//!
//! The store crates never install a subscriber themselves. A batch engine
//! embedding them calls [`init_tracing`] once at startup, choosing between
//! readable console lines for interactive runs and one JSON object per event
//! for workers whose output is collected by a log shipper.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Filter used when neither the config nor `RUST_LOG` yields a valid one.
/// The AWS SDK logs every request at `info`.
const FALLBACK_FILTER: &str = "info,aws_config=warn,aws_smithy_runtime=warn";

/// How store events are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingFormat {
    /// One line per event, with the target module.
    Console,
    /// One JSON object per event, including thread, file and line.
    Json,
}

impl TracingFormat {
    /// `json` in any case selects [`TracingFormat::Json`]; anything else is
    /// console output.
    fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("json") {
            TracingFormat::Json
        } else {
            TracingFormat::Console
        }
    }
}

/// Which store events are logged, and how.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// `EnvFilter` directives, e.g. `"jobvault_object=debug,info"` to follow
    /// object-store retries.
    pub log_level: String,
    pub format: TracingFormat,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_level: FALLBACK_FILTER.to_string(),
            format: TracingFormat::Console,
        }
    }
}

impl TracingConfig {
    pub fn new(log_level: impl Into<String>, format: TracingFormat) -> Self {
        Self {
            log_level: log_level.into(),
            format,
        }
    }

    /// Read `RUST_LOG` for the filter and `JOBVAULT_LOG_FORMAT`
    /// (`console` or `json`) for the format.
    pub fn from_env() -> Self {
        let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| FALLBACK_FILTER.to_string());
        let format = std::env::var("JOBVAULT_LOG_FORMAT")
            .map_or(TracingFormat::Console, |f| TracingFormat::parse(&f));
        Self { log_level, format }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.log_level)
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new(FALLBACK_FILTER))
    }
}

/// Install the process-wide subscriber for store events.
///
/// Fails if another subscriber is already installed, e.g. by the embedding
/// program.
pub fn init_tracing(config: TracingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let output = match config.format {
        TracingFormat::Console => fmt::layer().with_target(true).boxed(),
        TracingFormat::Json => fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .json()
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(config.filter())
        .with(output)
        .try_init()?;

    tracing::debug!(format = ?config.format, filter = %config.log_level, "Job store logging enabled");
    Ok(())
}

/// [`init_tracing`] with [`TracingConfig::from_env`].
pub fn init_default_tracing() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing(TracingConfig::from_env())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_quiets_sdk_logs() {
        let config = TracingConfig::default();
        assert!(config.log_level.starts_with("info"));
        assert!(config.log_level.contains("aws_smithy_runtime=warn"));
        assert_eq!(config.format, TracingFormat::Console);
    }

    #[test]
    fn test_object_store_debugging() {
        let config = TracingConfig::new("jobvault_object=debug", TracingFormat::Json);
        assert_eq!(config.log_level, "jobvault_object=debug");
        assert_eq!(config.format, TracingFormat::Json);
        assert_eq!(config.filter().to_string(), "jobvault_object=debug");
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!(TracingFormat::parse("json"), TracingFormat::Json);
        assert_eq!(TracingFormat::parse("JSON"), TracingFormat::Json);
        assert_eq!(TracingFormat::parse("pretty"), TracingFormat::Console);
    }

    #[test]
    fn test_second_init_fails() {
        // Whichever call comes first in this process wins; the other must
        // report an error instead of panicking.
        let first = init_tracing(TracingConfig::default());
        let second = init_tracing(TracingConfig::default());
        assert!(first.is_err() || second.is_err());
    }
}
