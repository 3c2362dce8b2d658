//! Testing utilities for stepflow pipelines.
//!
//! This module provides:
//! - Step doubles that record, count, slow down or fail
//! - Assertions for [`FlowResult`](crate::core::FlowResult)s

mod assertions;
mod mocks;

pub use assertions::{
    assert_context_value, assert_error_count, assert_halted, assert_success,
};
pub use mocks::{ConcurrencyProbe, CountingStep, ExecutionLog, FailingStep, RecordingStep, SlowStep};
