//! Step logging middleware.

use super::{overlay_options, Middleware, MiddlewareOptions};
use crate::core::FlowResult;
use crate::steps::{SharedHandler, StepHandler};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Level the [`Logging`] middleware emits at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// `TRACE`
    Trace,
    /// `DEBUG`
    Debug,
    /// `INFO`
    #[default]
    Info,
    /// `WARN`
    Warn,
    /// `ERROR`
    Error,
}

/// Configuration for [`Logging`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level for the start and completion events.
    pub level: LogLevel,
}

impl LoggingConfig {
    /// Creates a default config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the level.
    #[must_use]
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }
}

/// Logs `Starting step: <name>` before and `Completed step: <name>` after
/// every step. Halted outputs are logged as `Step halted: <name>`.
///
/// Registration options may override the level: `{"level": "debug"}`.
#[derive(Debug, Clone, Default)]
pub struct Logging {
    config: LoggingConfig,
}

impl Logging {
    /// Creates the middleware with the default `info` level.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the middleware from a config.
    #[must_use]
    pub fn with_config(config: LoggingConfig) -> Self {
        Self { config }
    }
}

impl Middleware for Logging {
    fn wrap(&self, next: SharedHandler, options: &MiddlewareOptions) -> SharedHandler {
        let config = overlay_options(&self.config, options, self.name());
        Arc::new(LoggedStep {
            level: config.level,
            next,
        })
    }

    fn name(&self) -> &str {
        "logging"
    }
}

struct LoggedStep {
    level: LogLevel,
    next: SharedHandler,
}

impl StepHandler for LoggedStep {
    fn call(&self, result: FlowResult) -> FlowResult {
        let step = self.next.name().unwrap_or("unknown");
        emit(self.level, step, "Starting step");

        let output = self.next.call(result);

        if output.should_continue() {
            emit(self.level, step, "Completed step");
        } else {
            emit(self.level, step, "Step halted");
        }
        output
    }

    fn name(&self) -> Option<&str> {
        self.next.name()
    }
}

fn emit(level: LogLevel, step: &str, message: &str) {
    match level {
        LogLevel::Trace => tracing::trace!(step = %step, "{message}: {step}"),
        LogLevel::Debug => tracing::debug!(step = %step, "{message}: {step}"),
        LogLevel::Info => tracing::info!(step = %step, "{message}: {step}"),
        LogLevel::Warn => tracing::warn!(step = %step, "{message}: {step}"),
        LogLevel::Error => tracing::error!(step = %step, "{message}: {step}"),
    }
}
