use crate::config::LogFormat;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Builds the event filter: an explicit `--log-level` first, then `RUST_LOG`,
/// then the configured level.
pub fn env_filter(explicit: Option<&str>, configured: &str) -> Result<EnvFilter, LoggingError> {
    if let Some(directive) = explicit {
        return parse_filter(directive);
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    parse_filter(configured)
}

fn parse_filter(directive: &str) -> Result<EnvFilter, LoggingError> {
    EnvFilter::try_new(directive).map_err(|err| LoggingError::Filter {
        directive: directive.to_string(),
        reason: err.to_string(),
    })
}

/// Installs the global subscriber. Call once, from the binary.
pub fn init_tracing(
    explicit: Option<&str>,
    configured: &str,
    format: LogFormat,
) -> Result<(), LoggingError> {
    let filter = env_filter(explicit, configured)?;
    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
            .try_init(),
    };
    result.map_err(|err| LoggingError::Init(err.to_string()))
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter {directive:?}: {reason}")]
    Filter { directive: String, reason: String },
    #[error("failed to install log subscriber: {0}")]
    Init(String),
}
