//! Tracing subscriber setup
//!
//! Library code only emits `tracing` events; binaries and tests call one of
//! these initializers once. `RUST_LOG` takes precedence over the default
//! directive.

use thiserror::Error;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Errors from installing the global subscriber
#[derive(Debug, Error)]
pub enum TracingInitError {
    #[error("Invalid log filter directive: {0}")]
    Filter(#[from] ParseError),

    #[error("A global tracing subscriber is already installed: {0}")]
    AlreadyInstalled(#[from] TryInitError),
}

fn env_filter(default_directive: &str) -> Result<EnvFilter, TracingInitError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(default_directive)?),
    }
}

/// Install a human-readable subscriber, e.g. `init_tracing("info,conduit_infra=debug")`
///
/// # Errors
///
/// Returns an error if the directive does not parse or a global subscriber
/// is already installed
pub fn init_tracing(default_directive: &str) -> Result<(), TracingInitError> {
    let filter = env_filter(default_directive)?;
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()?;

    tracing::info!(filter = %default_directive, "Logging initialized");
    Ok(())
}

/// Install a JSON subscriber for log aggregation
///
/// # Errors
///
/// Returns an error if the directive does not parse or a global subscriber
/// is already installed
pub fn init_tracing_json(default_directive: &str) -> Result<(), TracingInitError> {
    let filter = env_filter(default_directive)?;
    let fmt_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .flatten_event(true);

    tracing_subscriber::registry().with(fmt_layer).with(filter).try_init()?;

    tracing::info!(filter = %default_directive, "Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_install_is_an_error() {
        // Whichever call installs first, the other must report an error
        // instead of panicking.
        let first = init_tracing("debug");
        let second = init_tracing_json("debug");
        assert!(first.is_err() || second.is_err());
        assert!(matches!(second, Err(TracingInitError::AlreadyInstalled(_))) || first.is_err());
    }

    #[test]
    fn test_invalid_directive() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let result = env_filter("conduit=notalevel");
        assert!(matches!(result, Err(TracingInitError::Filter(_))));
    }
}
