//! Dependency-ordered pipeline with parallel wave execution.

use super::graph::DependencyGraph;
use super::parallel::{merge_wave, run_branches, with_dependency_context, Branch, ParallelConfig};
use super::Pipeline;
use crate::core::FlowResult;
use crate::errors::FlowError;
use crate::middleware::{Middleware, MiddlewareOptions};
use crate::steps::{invoke_guarded, SharedHandler, StepHandler, StepOptions};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// A pipeline whose steps declare dependencies on each other.
///
/// Steps may depend on steps registered later; names are resolved when the
/// graph is traversed. Every traversal ([`sorted_steps`](Self::sorted_steps),
/// [`parallel_groups`](Self::parallel_groups), [`call`](Self::call),
/// [`call_parallel`](Self::call_parallel)) fails on cycles and undeclared
/// dependencies.
///
/// Before a step runs, the output context of each of its direct dependencies
/// is copied into its input under `"<dependency>_<key>"`.
#[derive(Clone, Default)]
pub struct DagPipeline {
    inner: Pipeline,
    graph: DependencyGraph,
}

impl DagPipeline {
    /// Creates an empty, unnamed pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty pipeline with a name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            inner: Pipeline::named(name),
            graph: DependencyGraph::new(),
        }
    }

    /// Registers middleware with no options.
    #[must_use]
    pub fn use_middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.inner = self.inner.use_middleware(middleware);
        self
    }

    /// Registers middleware with options.
    #[must_use]
    pub fn use_middleware_with(
        mut self,
        middleware: impl Middleware + 'static,
        options: MiddlewareOptions,
    ) -> Self {
        self.inner = self.inner.use_middleware_with(middleware, options);
        self
    }

    /// Adds a step depending on `depends_on`.
    #[must_use]
    pub fn step<F>(self, name: impl Into<String>, body: F, depends_on: &[&str]) -> Self
    where
        F: Fn(FlowResult) -> anyhow::Result<FlowResult> + Send + Sync + 'static,
    {
        self.step_with(name, body, depends_on, StepOptions::default())
    }

    /// Adds a step with options.
    #[must_use]
    pub fn step_with<F>(
        mut self,
        name: impl Into<String>,
        body: F,
        depends_on: &[&str],
        options: StepOptions,
    ) -> Self
    where
        F: Fn(FlowResult) -> anyhow::Result<FlowResult> + Send + Sync + 'static,
    {
        let name = self.declare(name, depends_on);
        self.inner = self.inner.step_with(name, body, options);
        self
    }

    /// Adds a conditional step.
    #[must_use]
    pub fn step_if<C, F>(
        self,
        name: impl Into<String>,
        condition: C,
        body: F,
        depends_on: &[&str],
    ) -> Self
    where
        C: Fn(&FlowResult) -> bool + Send + Sync + 'static,
        F: Fn(FlowResult) -> anyhow::Result<FlowResult> + Send + Sync + 'static,
    {
        self.step_if_with(name, condition, body, depends_on, StepOptions::default())
    }

    /// Adds a conditional step with options.
    #[must_use]
    pub fn step_if_with<C, F>(
        mut self,
        name: impl Into<String>,
        condition: C,
        body: F,
        depends_on: &[&str],
        options: StepOptions,
    ) -> Self
    where
        C: Fn(&FlowResult) -> bool + Send + Sync + 'static,
        F: Fn(FlowResult) -> anyhow::Result<FlowResult> + Send + Sync + 'static,
    {
        let name = self.declare(name, depends_on);
        self.inner = self.inner.step_if_with(name, condition, body, options);
        self
    }

    /// Adds any [`StepHandler`] under `name`.
    #[must_use]
    pub fn step_handler(
        mut self,
        name: impl Into<String>,
        handler: impl StepHandler + 'static,
        depends_on: &[&str],
    ) -> Self {
        let name = self.declare(name, depends_on);
        self.inner = self.inner.step_handler(name, handler);
        self
    }

    /// Returns every step name with dependencies ahead of dependents.
    ///
    /// # Errors
    ///
    /// Fails on a cycle or an undeclared dependency.
    pub fn sorted_steps(&self) -> Result<Vec<String>, FlowError> {
        self.graph.sorted()
    }

    /// Returns the execution waves: each step appears in the first wave
    /// after all of its dependencies, and each wave is sorted by name.
    ///
    /// # Errors
    ///
    /// Fails on a cycle or an undeclared dependency.
    pub fn parallel_groups(&self) -> Result<Vec<Vec<String>>, FlowError> {
        self.graph.waves()
    }

    /// Runs the steps one at a time in dependency order.
    ///
    /// # Errors
    ///
    /// Fails on a cycle or an undeclared dependency. Step faults do not
    /// produce errors here; they halt the returned result.
    pub fn call(&self, result: FlowResult) -> Result<FlowResult, FlowError> {
        let order = self.sorted_steps()?;
        let mut outputs: HashMap<String, FlowResult> = HashMap::with_capacity(order.len());
        let mut current = result;

        for name in &order {
            if !current.should_continue() {
                debug!(pipeline = self.label(), step = %name, "Pipeline halted before step");
                break;
            }
            let handler = self.handler(name)?;
            let input = with_dependency_context(current, self.deps(name), &outputs);

            trace!(pipeline = self.label(), step = %name, "Running step");
            current = invoke_guarded(name, handler.as_ref(), input);
            outputs.insert(name.clone(), current.clone());
        }

        Ok(current)
    }

    /// Runs the pipeline wave by wave, with up to `max_threads` steps of a
    /// wave in flight at once.
    ///
    /// Every step of a multi-step wave starts from an independent copy of
    /// the wave input. After the wave, branch contexts are merged under
    /// `"<step>_<key>"`, errors are concatenated, and the run stops if any
    /// branch halted. Must be awaited inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails on a cycle or an undeclared dependency.
    pub async fn call_parallel(
        &self,
        result: FlowResult,
        max_threads: usize,
    ) -> Result<FlowResult, FlowError> {
        let waves = self.parallel_groups()?;
        let max_threads = max_threads.max(1);
        let mut outputs: HashMap<String, FlowResult> = HashMap::with_capacity(self.graph.len());
        let mut current = result;

        for wave in &waves {
            if !current.should_continue() {
                debug!(pipeline = self.label(), "Pipeline halted; skipping remaining waves");
                break;
            }

            if let [name] = wave.as_slice() {
                let handler = self.handler(name)?;
                let input = with_dependency_context(current, self.deps(name), &outputs);
                current = invoke_guarded(name, handler.as_ref(), input);
                outputs.insert(name.clone(), current.clone());
                continue;
            }

            debug!(
                pipeline = self.label(),
                steps = ?wave,
                max_threads,
                "Running wave"
            );
            let branches = wave
                .iter()
                .map(|name| -> Result<Branch, FlowError> {
                    Ok(Branch {
                        name: name.clone(),
                        handler: Arc::clone(self.handler(name)?),
                        input: with_dependency_context(
                            current.deep_clone(),
                            self.deps(name),
                            &outputs,
                        ),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            let branch_outputs = run_branches(branches, max_threads).await?;
            current = merge_wave(&current, wave, &branch_outputs);
            outputs.extend(branch_outputs);
        }

        Ok(current)
    }

    /// [`call_parallel`](Self::call_parallel) with the bound taken from a
    /// config.
    ///
    /// # Errors
    ///
    /// Fails on a cycle or an undeclared dependency.
    pub async fn call_parallel_with(
        &self,
        result: FlowResult,
        config: &ParallelConfig,
    ) -> Result<FlowResult, FlowError> {
        self.call_parallel(result, config.effective_threads()).await
    }

    /// Returns a pipeline holding `name` and everything it transitively
    /// depends on.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::StepNotFound`] if `name` was never declared.
    pub fn subgraph(&self, name: &str) -> Result<Self, FlowError> {
        let keep = self.graph.closure(name)?;

        let sub_name = self.inner.name().map(|base| format!("{base}_subgraph_{name}"));
        let mut inner = self.inner.empty_like(sub_name);
        for entry in self.inner.entries() {
            if keep.contains(&entry.name) {
                inner.insert_wrapped(entry.name.clone(), Arc::clone(&entry.handler));
            }
        }

        Ok(Self {
            inner,
            graph: self.graph.restricted_to(&keep),
        })
    }

    /// Returns the union of two pipelines.
    ///
    /// Shared step names keep the receiver's position, take `other`'s
    /// handler and the union of both dependency lists.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let mut inner = self.inner.compose(&other.inner);
        inner.set_name(self.inner.name().map(|base| format!("{base}_merged")));
        Self {
            inner,
            graph: self.graph.union(&other.graph),
        }
    }

    /// The declared dependencies of a step.
    #[must_use]
    pub fn dependencies_of(&self, name: &str) -> Option<&[String]> {
        self.graph.dependencies_of(name)
    }

    /// Declared step names in registration order.
    #[must_use]
    pub fn declared_steps(&self) -> &[String] {
        self.graph.declared()
    }

    /// Looks up a registered (wrapped) step.
    #[must_use]
    pub fn find_step(&self, name: &str) -> Option<&SharedHandler> {
        self.inner.find_step(name)
    }

    /// The pipeline name.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.inner.name()
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if no steps are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// The step list as a plain sequential pipeline, in registration order.
    #[must_use]
    pub fn as_pipeline(&self) -> &Pipeline {
        &self.inner
    }

    fn declare(&mut self, name: impl Into<String>, depends_on: &[&str]) -> String {
        let name = name.into();
        let deps = depends_on.iter().map(|d| (*d).to_string()).collect();
        self.graph.declare(name.clone(), deps);
        name
    }

    fn deps(&self, name: &str) -> &[String] {
        self.graph.dependencies_of(name).unwrap_or_default()
    }

    fn handler(&self, name: &str) -> Result<&SharedHandler, FlowError> {
        self.inner
            .find_step(name)
            .ok_or_else(|| FlowError::step_not_found(name))
    }

    fn label(&self) -> &str {
        self.inner.name().unwrap_or("anonymous")
    }
}

impl fmt::Debug for DagPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DagPipeline")
            .field("name", &self.inner.name())
            .field("graph", &self.graph)
            .field("middleware", &self.inner.middleware_count())
            .finish()
    }
}

impl fmt::Display for DagPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.name() {
            Some(name) => write!(f, "DagPipeline<{name} {} steps>", self.inner.len()),
            None => write!(f, "DagPipeline<{} steps>", self.inner.len()),
        }
    }
}
