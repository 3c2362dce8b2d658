//! Step handler trait and implementations.
//!
//! Steps are the fundamental units of work in a stepflow pipeline. Anything
//! that maps a [`FlowResult`] to a new one can act as a handler; [`Step`]
//! and [`ConditionalStep`] add naming, context tagging, duration tracking and
//! fault conversion around a caller-supplied body.

mod options;
mod step;

pub use options::StepOptions;
pub use step::{ConditionalStep, Step, StepBody, StepCondition};

use crate::core::{FlowResult, Severity, CURRENT_STEP_KEY, FAILED_STEP_KEY};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Error category used when a step body fails or panics.
pub const STEP_ERROR_CATEGORY: &str = "step_error";

/// Trait for anything that can run as a pipeline step.
///
/// Implemented by [`Step`], [`ConditionalStep`], middleware wrappers,
/// [`Pipeline`](crate::pipeline::Pipeline) and any
/// `Fn(FlowResult) -> FlowResult` closure.
pub trait StepHandler: Send + Sync {
    /// Runs the handler.
    fn call(&self, result: FlowResult) -> FlowResult;

    /// The step name, when the handler knows it.
    fn name(&self) -> Option<&str> {
        None
    }
}

impl<F> StepHandler for F
where
    F: Fn(FlowResult) -> FlowResult + Send + Sync,
{
    fn call(&self, result: FlowResult) -> FlowResult {
        self(result)
    }
}

/// A shared, type-erased step handler.
pub type SharedHandler = Arc<dyn StepHandler>;

/// Converts a fault into a halted result carrying a critical `step_error`.
pub(crate) fn halt_on_fault(result: &FlowResult, step: &str, fault: anyhow::Error) -> FlowResult {
    tracing::debug!(step = %step, error = %fault, "Step fault converted to halted result");

    result
        .halt()
        .with_fault(
            STEP_ERROR_CATEGORY,
            format!("{step}: {fault}"),
            Severity::Critical,
            fault,
        )
        .with_context(FAILED_STEP_KEY, step)
}

/// Turns a panic payload into an error carrying the panic message.
pub(crate) fn panic_fault(payload: &(dyn Any + Send)) -> anyhow::Error {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "step panicked".to_string());
    anyhow::anyhow!(message)
}

/// Runs a handler, converting any panic that escapes it (for example from a
/// middleware wrapper) into a halted result.
pub(crate) fn invoke_guarded(
    name: &str,
    handler: &dyn StepHandler,
    input: FlowResult,
) -> FlowResult {
    let fallback = input.with_context(CURRENT_STEP_KEY, name);
    match panic::catch_unwind(AssertUnwindSafe(|| handler.call(input))) {
        Ok(output) => output,
        Err(payload) => halt_on_fault(&fallback, name, panic_fault(payload.as_ref())),
    }
}
