//! Structured logging bootstrap for embedders that do not install their
//! own subscriber.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Logging configuration: an env-filter directive plus the output shape.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `orcheo=debug,sqlx=warn`. The
    /// `ORCHEO_LOG` environment variable overrides it when set.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            filter: "info".to_string(),
            json: false,
        }
    }
}

/// Install the global subscriber. Safe to call more than once; later
/// calls are no-ops when a subscriber is already set.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_env("ORCHEO_LOG")
        .unwrap_or_else(|_| EnvFilter::new(config.filter.clone()));
    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    if installed.is_err() {
        tracing::debug!("global subscriber already installed");
    }
}
