//! Observability utilities.
//!
//! The engine itself only emits `tracing` events at `debug` and `trace`.
//! Binaries, benches and tests that want to see them can install a
//! subscriber with [`init_tracing`].

use crate::errors::FlowError;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Subscriber settings for [`init_tracing`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Include the event target.
    pub with_target: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            filter: "stepflow=info".to_string(),
            json: false,
            with_target: false,
        }
    }
}

impl TracingConfig {
    /// Creates the default config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the fallback filter directive.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    /// Switches to JSON output.
    #[must_use]
    pub fn json(mut self) -> Self {
        self.json = true;
        self
    }

    /// Resolves the filter, preferring `RUST_LOG`.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Configuration`] if the fallback directive does
    /// not parse.
    pub fn env_filter(&self) -> Result<EnvFilter, FlowError> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.filter).map_err(|e| {
                FlowError::Configuration(format!("invalid filter '{}': {e}", self.filter))
            }),
        }
    }
}

/// Installs a global `tracing` subscriber.
///
/// # Errors
///
/// Returns [`FlowError::Configuration`] if the filter is invalid or a global
/// subscriber is already installed.
pub fn init_tracing(config: &TracingConfig) -> Result<(), FlowError> {
    let filter = config.env_filter()?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| FlowError::Configuration(format!("tracing init failed: {e}")))
}
