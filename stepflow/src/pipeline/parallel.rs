//! Wave execution and result merging for parallel DAG runs.

use crate::core::{Context, ErrorLog, FlowResult};
use crate::errors::FlowError;
use crate::steps::{halt_on_fault, invoke_guarded, SharedHandler};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, trace};

/// Configuration for [`DagPipeline::call_parallel_with`](super::DagPipeline::call_parallel_with).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Upper bound on steps running at once within a wave. Zero is treated
    /// as one.
    pub max_threads: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self { max_threads: 4 }
    }
}

impl ParallelConfig {
    /// Creates the default config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the concurrency bound.
    #[must_use]
    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    /// The bound actually applied.
    #[must_use]
    pub fn effective_threads(&self) -> usize {
        self.max_threads.max(1)
    }
}

/// One step of a wave, ready to run.
pub(crate) struct Branch {
    pub(crate) name: String,
    pub(crate) handler: SharedHandler,
    pub(crate) input: FlowResult,
}

/// Copies each dependency's output context into `result` under
/// `"<dependency>_<key>"`.
pub(crate) fn with_dependency_context(
    result: FlowResult,
    dependencies: &[String],
    outputs: &HashMap<String, FlowResult>,
) -> FlowResult {
    let entries: Vec<_> = dependencies
        .iter()
        .filter_map(|dep| outputs.get(dep).map(|output| (dep, output)))
        .flat_map(|(dep, output)| {
            output
                .context()
                .iter_shared()
                .map(move |(key, value)| (format!("{dep}_{key}"), value))
        })
        .collect();

    if entries.is_empty() {
        result
    } else {
        result.with_shared_entries(entries)
    }
}

/// Runs every branch on the blocking pool with at most `max_threads` in
/// flight, returning each branch's output by name.
pub(crate) async fn run_branches(
    branches: Vec<Branch>,
    max_threads: usize,
) -> Result<HashMap<String, FlowResult>, FlowError> {
    let semaphore = Arc::new(Semaphore::new(max_threads.max(1)));
    let mut in_flight = FuturesUnordered::new();
    let count = branches.len();

    for Branch { name, handler, input } in branches {
        let permit = Arc::clone(&semaphore)
            .acquire_owned()
            .await
            .map_err(|e| FlowError::Internal(format!("Worker slots unavailable: {e}")))?;

        trace!(step = %name, "Launching branch");
        let fallback = input.clone();
        let worker_name = name.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            invoke_guarded(&worker_name, handler.as_ref(), input)
        });

        in_flight.push(async move { (name, fallback, handle.await) });
    }

    let mut outputs = HashMap::with_capacity(count);
    while let Some((name, fallback, joined)) = in_flight.next().await {
        let output = match joined {
            Ok(output) => output,
            Err(e) => halt_on_fault(&fallback, &name, anyhow::anyhow!("worker failed: {e}")),
        };
        outputs.insert(name, output);
    }

    Ok(outputs)
}

/// Folds a wave's branch outputs back into one result.
///
/// Branch contexts land under `"<step>_<key>"`. Errors a branch added are
/// appended to the wave input's lists; an error counts as inherited only if
/// the wave input holds the same record, so branches that rebuild their
/// result from scratch keep all of their errors. The value is the first halted
/// branch's value in wave order, otherwise the wave input's value.
pub(crate) fn merge_wave(
    base: &FlowResult,
    wave: &[String],
    outputs: &HashMap<String, FlowResult>,
) -> FlowResult {
    let mut context = Context::clone(base.context());
    let mut errors = ErrorLog::clone(base.errors());
    let mut halted: Option<&FlowResult> = None;
    let mut proceed = true;

    for (name, output) in wave.iter().filter_map(|n| outputs.get(n).map(|o| (n, o))) {
        for (key, value) in output.context().iter_shared() {
            context.insert(format!("{name}_{key}"), Arc::clone(value));
        }

        for (category, list) in output.errors() {
            let inherited = base.errors_for(category);
            let added: Vec<_> = list
                .iter()
                .filter(|e| !inherited.iter().any(|known| known.same_record(e)))
                .cloned()
                .collect();
            if !added.is_empty() {
                errors.entry(category.clone()).or_default().extend(added);
            }
        }

        if !output.should_continue() {
            proceed = false;
            halted.get_or_insert(output);
        }
    }

    let value = halted.map_or_else(|| base.value().clone(), |output| output.value().clone());
    if let Some(output) = halted {
        debug!(step = ?output.current_step(), "Wave halted");
    }

    FlowResult::from_parts(value, context, errors, proceed)
}
