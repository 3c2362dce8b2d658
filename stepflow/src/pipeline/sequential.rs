//! Sequential pipeline.

use crate::core::FlowResult;
use crate::errors::FlowError;
use crate::middleware::{apply_middleware, Middleware, MiddlewareOptions, Registration};
use crate::steps::{invoke_guarded, ConditionalStep, SharedHandler, Step, StepHandler, StepOptions};
use std::collections::HashMap;
use std::fmt;
use std::ops::Shr;
use std::sync::Arc;
use tracing::{debug, trace};

/// A registered, middleware-wrapped step.
#[derive(Clone)]
pub(crate) struct Entry {
    pub(crate) name: String,
    pub(crate) handler: SharedHandler,
}

/// An ordered list of steps run one after another.
///
/// Each call threads a [`FlowResult`] through the steps and stops as soon as
/// a step returns a halted result.
///
/// ```
/// use stepflow::prelude::*;
///
/// let pipeline = Pipeline::new()
///     .step("trim", |r: FlowResult| {
///         let text = r.value().as_str().unwrap_or_default().trim().to_string();
///         Ok(r.continue_with(text))
///     })
///     .step("shout", |r: FlowResult| {
///         let text = r.value().as_str().unwrap_or_default().to_uppercase();
///         Ok(r.continue_with(text))
///     });
///
/// let output = pipeline.call(FlowResult::new("  hi  "));
/// assert_eq!(output.value(), "HI");
/// ```
#[derive(Clone, Default)]
pub struct Pipeline {
    name: Option<String>,
    steps: Vec<Entry>,
    index: HashMap<String, usize>,
    middleware: Vec<Registration>,
}

impl Pipeline {
    /// Creates an empty, unnamed pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty pipeline with a name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Registers middleware with no options.
    ///
    /// Middleware only wraps steps registered after it.
    #[must_use]
    pub fn use_middleware(self, middleware: impl Middleware + 'static) -> Self {
        self.use_middleware_with(middleware, MiddlewareOptions::new())
    }

    /// Registers middleware with options.
    #[must_use]
    pub fn use_middleware_with(
        mut self,
        middleware: impl Middleware + 'static,
        options: MiddlewareOptions,
    ) -> Self {
        self.middleware
            .push(Registration::new(Arc::new(middleware), options));
        self
    }

    /// Adds a step.
    #[must_use]
    pub fn step<F>(self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(FlowResult) -> anyhow::Result<FlowResult> + Send + Sync + 'static,
    {
        self.step_with(name, body, StepOptions::default())
    }

    /// Adds a step with options.
    #[must_use]
    pub fn step_with<F>(mut self, name: impl Into<String>, body: F, options: StepOptions) -> Self
    where
        F: Fn(FlowResult) -> anyhow::Result<FlowResult> + Send + Sync + 'static,
    {
        let step = Step::new(name, body).with_options(options);
        let name = step.name().to_string();
        self.register(name, Arc::new(step));
        self
    }

    /// Adds a step that only runs when `condition` holds.
    #[must_use]
    pub fn step_if<C, F>(self, name: impl Into<String>, condition: C, body: F) -> Self
    where
        C: Fn(&FlowResult) -> bool + Send + Sync + 'static,
        F: Fn(FlowResult) -> anyhow::Result<FlowResult> + Send + Sync + 'static,
    {
        self.step_if_with(name, condition, body, StepOptions::default())
    }

    /// Adds a conditional step with options.
    #[must_use]
    pub fn step_if_with<C, F>(
        mut self,
        name: impl Into<String>,
        condition: C,
        body: F,
        options: StepOptions,
    ) -> Self
    where
        C: Fn(&FlowResult) -> bool + Send + Sync + 'static,
        F: Fn(FlowResult) -> anyhow::Result<FlowResult> + Send + Sync + 'static,
    {
        let step = ConditionalStep::new(name, condition, body).with_options(options);
        let name = step.name().to_string();
        self.register(name, Arc::new(step));
        self
    }

    /// Adds any [`StepHandler`] under `name`, wrapped in the registered
    /// middleware. The handler is responsible for its own context tagging.
    #[must_use]
    pub fn step_handler(
        mut self,
        name: impl Into<String>,
        handler: impl StepHandler + 'static,
    ) -> Self {
        self.register(name.into(), Arc::new(handler));
        self
    }

    /// Runs every step in order, stopping at the first halted result.
    pub fn call(&self, result: FlowResult) -> FlowResult {
        let mut current = result;
        for entry in &self.steps {
            if !current.should_continue() {
                debug!(pipeline = self.label(), step = %entry.name, "Pipeline halted before step");
                break;
            }
            trace!(pipeline = self.label(), step = %entry.name, "Running step");
            current = invoke_guarded(&entry.name, entry.handler.as_ref(), current);
        }
        current
    }

    /// Returns a pipeline running this pipeline's steps followed by
    /// `other`'s. A step of `other` whose name is already present replaces
    /// that step in place.
    #[must_use]
    pub fn compose(&self, other: &Self) -> Self {
        let mut composed = self.clone();
        composed.name = self.name.as_ref().map(|name| format!("{name}_composed"));
        composed.middleware.extend(other.middleware.iter().cloned());
        for entry in &other.steps {
            composed.insert_wrapped(entry.name.clone(), Arc::clone(&entry.handler));
        }
        composed
    }

    /// Returns a pipeline holding only the named steps, in the order given.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::StepNotFound`] if any name is not registered.
    pub fn subpipeline(&self, names: &[&str]) -> Result<Self, FlowError> {
        let mut sub = Self {
            name: self.name.as_ref().map(|name| format!("{name}_sub")),
            steps: Vec::with_capacity(names.len()),
            index: HashMap::with_capacity(names.len()),
            middleware: self.middleware.clone(),
        };

        for name in names {
            let handler = self
                .find_step(name)
                .ok_or_else(|| FlowError::step_not_found(*name))?;
            sub.insert_wrapped((*name).to_string(), Arc::clone(handler));
        }

        Ok(sub)
    }

    /// Looks up a registered (wrapped) step.
    #[must_use]
    pub fn find_step(&self, name: &str) -> Option<&SharedHandler> {
        self.index.get(name).map(|&i| &self.steps[i].handler)
    }

    /// The pipeline name.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if no steps are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step names in execution order.
    #[must_use]
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|e| e.name.as_str()).collect()
    }

    /// Number of middleware registrations.
    #[must_use]
    pub fn middleware_count(&self) -> usize {
        self.middleware.len()
    }

    /// Wraps `handler` in the registered middleware and stores it.
    pub(crate) fn register(&mut self, name: String, handler: SharedHandler) {
        let wrapped = apply_middleware(&name, handler, &self.middleware);
        self.insert_wrapped(name, wrapped);
    }

    /// Stores an already wrapped handler, replacing a same-named one in place.
    pub(crate) fn insert_wrapped(&mut self, name: String, handler: SharedHandler) {
        if let Some(&i) = self.index.get(&name) {
            self.steps[i].handler = handler;
        } else {
            self.index.insert(name.clone(), self.steps.len());
            self.steps.push(Entry { name, handler });
        }
    }

    pub(crate) fn entries(&self) -> &[Entry] {
        &self.steps
    }

    pub(crate) fn set_name(&mut self, name: Option<String>) {
        self.name = name;
    }

    /// An empty pipeline carrying this one's middleware.
    pub(crate) fn empty_like(&self, name: Option<String>) -> Self {
        Self {
            name,
            middleware: self.middleware.clone(),
            ..Self::default()
        }
    }

    fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("anonymous")
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("steps", &self.step_names())
            .field("middleware", &self.middleware)
            .finish()
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "Pipeline<{name} {} steps>", self.steps.len()),
            None => write!(f, "Pipeline<{} steps>", self.steps.len()),
        }
    }
}

impl StepHandler for Pipeline {
    fn call(&self, result: FlowResult) -> FlowResult {
        Self::call(self, result)
    }

    fn name(&self) -> Option<&str> {
        Self::name(self)
    }
}

impl Shr for Pipeline {
    type Output = Self;

    fn shr(self, rhs: Self) -> Self {
        self.compose(&rhs)
    }
}

impl Shr<&Pipeline> for &Pipeline {
    type Output = Pipeline;

    fn shr(self, rhs: &Pipeline) -> Pipeline {
        self.compose(rhs)
    }
}
