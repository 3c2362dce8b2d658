//! Retry middleware with backoff strategies.

use super::{overlay_options, Middleware, MiddlewareOptions};
use crate::core::{ExecutionError, FlowResult, Severity, CURRENT_STEP_KEY};
use crate::steps::{SharedHandler, StepHandler, STEP_ERROR_CATEGORY};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Error category recorded once every attempt has failed.
pub const RETRY_EXHAUSTED_CATEGORY: &str = "retry_exhausted";

/// Callback invoked before each retry with the input, the failed attempt
/// number and the error that failed it.
pub type OnRetry = Arc<dyn Fn(&FlowResult, u32, &ExecutionError) + Send + Sync>;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Constant delay between retries.
    Constant,
    /// Linear increase: delay * attempt.
    Linear,
    /// Exponential: delay * 2^(attempt - 1).
    #[default]
    Exponential,
}

impl BackoffStrategy {
    /// Calculates the delay after a given failed attempt.
    #[must_use]
    pub fn delay(&self, base: Duration, attempt: u32) -> Duration {
        match self {
            Self::Constant => base,
            Self::Linear => base.saturating_mul(attempt),
            Self::Exponential => {
                base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            }
        }
    }
}

/// Jitter strategy for adding randomness to delays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterStrategy {
    /// No jitter.
    #[default]
    None,
    /// Full jitter: [0, delay].
    Full,
    /// Equal jitter: [delay/2, delay].
    Equal,
    /// Decorrelated jitter: [delay, 3 * delay].
    Decorrelated,
}

impl JitterStrategy {
    /// Applies jitter to a delay.
    #[must_use]
    pub fn apply(&self, delay: Duration) -> Duration {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        if millis == 0 {
            return delay;
        }
        let mut rng = rand::thread_rng();

        match self {
            Self::None => delay,
            Self::Full => Duration::from_millis(rng.gen_range(0..=millis)),
            Self::Equal => {
                let half = millis / 2;
                Duration::from_millis(half + rng.gen_range(0..=millis - half))
            }
            Self::Decorrelated => {
                Duration::from_millis(rng.gen_range(millis..=millis.saturating_mul(3)))
            }
        }
    }
}

/// Configuration for [`Retry`].
///
/// Registration options use the same field names, e.g.
/// `{"max_attempts": 5, "base_delay_ms": 100}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// How the delay grows between attempts.
    pub backoff: BackoffStrategy,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Randomization applied to each delay.
    pub jitter: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential,
            base_delay_ms: 2000,
            jitter: JitterStrategy::None,
        }
    }
}

impl RetryConfig {
    /// Creates the default config: 3 attempts, exponential from 2s.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the attempt limit.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the backoff strategy and base delay.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffStrategy, base_delay: Duration) -> Self {
        self.backoff = backoff;
        self.base_delay_ms = u64::try_from(base_delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculates the delay after a failed attempt.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self
            .backoff
            .delay(Duration::from_millis(self.base_delay_ms), attempt);
        self.jitter.apply(base)
    }
}

/// Re-runs a step whose body failed.
///
/// A failure is an output that halted with a new `step_error` entry, which is
/// what a [`Step`](crate::steps::Step) produces when its body returns `Err`
/// or panics. Deliberate halts are not retried. After `max_attempts` failures
/// the input is returned halted with a critical `retry_exhausted` error and
/// the context keys `retry_attempts` and `retry_failed`.
#[derive(Clone, Default)]
pub struct Retry {
    config: RetryConfig,
    on_retry: Option<OnRetry>,
}

impl Retry {
    /// Creates the middleware with the default config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the middleware from a config.
    #[must_use]
    pub fn with_config(config: RetryConfig) -> Self {
        Self {
            config,
            on_retry: None,
        }
    }

    /// Sets a callback invoked before each retry.
    #[must_use]
    pub fn on_retry<F>(mut self, callback: F) -> Self
    where
        F: Fn(&FlowResult, u32, &ExecutionError) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(callback));
        self
    }

    /// Returns the config.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

impl fmt::Debug for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retry")
            .field("config", &self.config)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl Middleware for Retry {
    fn wrap(&self, next: SharedHandler, options: &MiddlewareOptions) -> SharedHandler {
        let mut config = overlay_options(&self.config, options, self.name());
        if config.max_attempts == 0 {
            warn!("Retry max_attempts of 0 treated as 1");
            config.max_attempts = 1;
        }
        Arc::new(RetryingStep {
            config,
            on_retry: self.on_retry.clone(),
            next,
        })
    }

    fn name(&self) -> &str {
        "retry"
    }
}

struct RetryingStep {
    config: RetryConfig,
    on_retry: Option<OnRetry>,
    next: SharedHandler,
}

impl RetryingStep {
    /// Returns the fault recorded by this attempt, if it failed.
    fn new_fault(input: &FlowResult, output: &FlowResult) -> Option<ExecutionError> {
        if output.should_continue() {
            return None;
        }
        let before = input.errors_for(STEP_ERROR_CATEGORY).len();
        output.errors_for(STEP_ERROR_CATEGORY).get(before..)?.last().cloned()
    }
}

impl StepHandler for RetryingStep {
    fn call(&self, result: FlowResult) -> FlowResult {
        let max_attempts = self.config.max_attempts;
        let mut attempt = 1;

        loop {
            let output = self.next.call(result.clone());
            let Some(fault) = Self::new_fault(&result, &output) else {
                return output;
            };

            if attempt >= max_attempts {
                debug!(
                    step = self.next.name().unwrap_or_default(),
                    attempts = attempt,
                    "Retries exhausted"
                );
                let base = match self.next.name() {
                    Some(name) => result.with_context(CURRENT_STEP_KEY, name),
                    None => result,
                };
                let message = format!("Failed after {max_attempts} attempts: {}", fault.message());
                let exhausted = match fault.shared_fault() {
                    Some(cause) => base.halt().with_fault(
                        RETRY_EXHAUSTED_CATEGORY,
                        message,
                        Severity::Critical,
                        cause,
                    ),
                    None => base
                        .halt()
                        .with_severity(RETRY_EXHAUSTED_CATEGORY, message, Severity::Critical),
                };
                return exhausted
                    .with_context("retry_attempts", attempt)
                    .with_context("retry_failed", true);
            }

            if let Some(callback) = &self.on_retry {
                callback(&result, attempt, &fault);
            }

            let delay = self.config.delay_for(attempt);
            debug!(
                step = self.next.name().unwrap_or_default(),
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Retrying step"
            );
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            attempt += 1;
        }
    }

    fn name(&self) -> Option<&str> {
        self.next.name()
    }
}
