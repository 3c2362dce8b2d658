//! Core domain model types for stepflow.
//!
//! This module contains the values threaded through every pipeline:
//! - The immutable [`FlowResult`] and its [`Context`]
//! - Severity-tagged [`ExecutionError`] records

mod context;
mod execution_error;
mod result;

pub use context::Context;
pub use execution_error::{ExecutionError, Severity};
pub use result::{ErrorLog, FlowResult, CURRENT_STEP_KEY, FAILED_STEP_KEY, UNKNOWN_STEP};
