//! # Stepflow
//!
//! An embeddable pipeline engine for named, side-effecting steps.
//!
//! Stepflow threads an immutable [`FlowResult`](crate::core::FlowResult) through a
//! series of steps, with support for:
//!
//! - **Sequential pipelines**: run steps in order, stopping at the first halt
//! - **Dependency graphs**: declare what each step needs and run in
//!   topological order, or wave by wave with a bound on parallelism
//! - **Categorized errors**: severity-tagged records that accumulate without
//!   stopping execution
//! - **Middleware**: wrap every step with logging, timing or retries
//!
//! ## Quick Start
//!
//! ```rust
//! use stepflow::prelude::*;
//!
//! let pipeline = DagPipeline::named("report")
//!     .step("load", |r: FlowResult| Ok(r.continue_with(vec![3, 1, 2])), &[])
//!     .step(
//!         "count",
//!         |r: FlowResult| {
//!             let n = r.value().as_array().map_or(0, Vec::len);
//!             Ok(r.with_context("count", n))
//!         },
//!         &["load"],
//!     );
//!
//! let output = pipeline.call(FlowResult::new(serde_json::Value::Null))?;
//! assert!(output.should_continue());
//! assert_eq!(output.get_context("count"), Some(&serde_json::json!(3)));
//! # Ok::<(), stepflow::errors::FlowError>(())
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod core;
pub mod errors;
pub mod middleware;
pub mod observability;
pub mod pipeline;
pub mod steps;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::core::{Context, ExecutionError, FlowResult, Severity};
    pub use crate::errors::{
        CircularDependencyError, FlowError, MissingDependencyError, StepNotFoundError,
    };
    pub use crate::middleware::{
        FnMiddleware, Instrumentation, Logging, Middleware, MiddlewareOptions, Retry, RetryConfig,
    };
    pub use crate::observability::{init_tracing, TracingConfig};
    pub use crate::pipeline::{DagPipeline, ParallelConfig, Pipeline};
    pub use crate::steps::{ConditionalStep, SharedHandler, Step, StepHandler, StepOptions};
}
