//! Tracing subscriber setup
//!
//! Library code only emits `tracing` events. Applications that want them
//! printed call [`init_logging`] once at startup.

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Install a global subscriber for `config`.
///
/// `RUST_LOG`, when set, takes precedence over `config.level`.
///
/// # Errors
///
/// Fails if the level is not a valid filter directive or a global
/// subscriber is already installed.
///
/// # Examples
///
/// ```no_run
/// use capwire::config::LoggingConfig;
/// use capwire::logging::init_logging;
///
/// let config = LoggingConfig {
///     level: "capwire=debug".to_string(),
///     json_format: false,
/// };
/// init_logging(&config).unwrap();
/// ```
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?;

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.json_format {
        let layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true);
        registry.with(layer).try_init()?;
    } else {
        let layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true);
        registry.with(layer).try_init()?;
    }

    Ok(())
}
