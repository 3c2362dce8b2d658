//! Middleware for step execution.
//!
//! A middleware decorates a step handler at registration time: it receives
//! the next handler in the chain and returns a new handler wrapping it. The
//! wrapper may run code before or after `next`, call it several times, or not
//! call it at all.

mod instrumentation;
mod logging;
mod retry;

pub use instrumentation::{
    InMemoryCollector, Instrumentation, InstrumentationConfig, MetricsCollector, StepMetrics,
};
pub use logging::{LogLevel, Logging, LoggingConfig};
pub use retry::{
    BackoffStrategy, JitterStrategy, OnRetry, Retry, RetryConfig, RETRY_EXHAUSTED_CATEGORY,
};

use crate::core::FlowResult;
use crate::steps::{SharedHandler, StepHandler};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Options supplied alongside a middleware registration.
pub type MiddlewareOptions = HashMap<String, Value>;

/// Trait for step middleware.
pub trait Middleware: Send + Sync {
    /// Wraps `next`, returning the handler that will run in its place.
    fn wrap(&self, next: SharedHandler, options: &MiddlewareOptions) -> SharedHandler;

    /// A short name used in logs.
    fn name(&self) -> &str {
        "middleware"
    }
}

/// A middleware built from a closure.
///
/// ```
/// use std::sync::Arc;
/// use stepflow::middleware::FnMiddleware;
/// use stepflow::prelude::*;
///
/// let tagging = FnMiddleware::new(|next: SharedHandler, _options: &MiddlewareOptions| {
///     let wrapped: SharedHandler =
///         Arc::new(move |r: FlowResult| next.call(r).with_context("tagged", true));
///     wrapped
/// });
///
/// let pipeline = Pipeline::new()
///     .use_middleware(tagging)
///     .step("noop", |r: FlowResult| Ok(r));
///
/// let output = pipeline.call(FlowResult::new(0));
/// assert_eq!(output.get_context("tagged"), Some(&serde_json::json!(true)));
/// ```
pub struct FnMiddleware<F> {
    f: F,
}

impl<F> FnMiddleware<F>
where
    F: Fn(SharedHandler, &MiddlewareOptions) -> SharedHandler + Send + Sync,
{
    /// Creates a middleware from a closure.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(SharedHandler, &MiddlewareOptions) -> SharedHandler + Send + Sync,
{
    fn wrap(&self, next: SharedHandler, options: &MiddlewareOptions) -> SharedHandler {
        (self.f)(next, options)
    }

    fn name(&self) -> &str {
        "fn"
    }
}

impl<F> fmt::Debug for FnMiddleware<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnMiddleware").finish_non_exhaustive()
    }
}

/// A middleware together with the options it was registered with.
#[derive(Clone)]
pub(crate) struct Registration {
    middleware: Arc<dyn Middleware>,
    options: MiddlewareOptions,
}

impl Registration {
    pub(crate) fn new(middleware: Arc<dyn Middleware>, options: MiddlewareOptions) -> Self {
        Self { middleware, options }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("middleware", &self.middleware.name())
            .field("options", &self.options)
            .finish()
    }
}

/// A handler that remembers the step name across middleware layers.
struct Named {
    name: String,
    inner: SharedHandler,
}

impl StepHandler for Named {
    fn call(&self, result: FlowResult) -> FlowResult {
        self.inner.call(result)
    }

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

fn named(name: &str, handler: SharedHandler) -> SharedHandler {
    if handler.name() == Some(name) {
        return handler;
    }
    Arc::new(Named {
        name: name.to_string(),
        inner: handler,
    })
}

/// Wraps `handler` in every registration. The first registration ends up
/// outermost. Every layer, the innermost handler included, reports `name`.
pub(crate) fn apply_middleware(
    name: &str,
    handler: SharedHandler,
    registrations: &[Registration],
) -> SharedHandler {
    registrations
        .iter()
        .rev()
        .fold(named(name, handler), |next, registration| {
            named(name, registration.middleware.wrap(next, &registration.options))
        })
}

/// Overlays registration options onto a middleware's own config.
///
/// Unknown keys are ignored. Options that do not fit the config are logged
/// and the base config is returned unchanged.
pub(crate) fn overlay_options<T>(base: &T, options: &MiddlewareOptions, middleware: &str) -> T
where
    T: Serialize + DeserializeOwned + Clone,
{
    if options.is_empty() {
        return base.clone();
    }

    let merged = match serde_json::to_value(base) {
        Ok(Value::Object(mut fields)) => {
            for (key, value) in options {
                if fields.contains_key(key) {
                    fields.insert(key.clone(), value.clone());
                }
            }
            Value::Object(fields)
        }
        _ => return base.clone(),
    };

    match serde_json::from_value(merged) {
        Ok(config) => config,
        Err(e) => {
            warn!(middleware = %middleware, error = %e, "Ignoring invalid middleware options");
            base.clone()
        }
    }
}
