//! Pipeline building and execution.
//!
//! This module provides:
//! - [`Pipeline`], an ordered list of steps run one after another
//! - [`DagPipeline`], steps with declared dependencies, run in dependency
//!   order or wave by wave with bounded parallelism
//! - [`DependencyGraph`], the ordering, cycle detection and wave partitioning
//!   behind it

mod dag;
mod graph;
#[cfg(test)]
mod integration_tests;
mod parallel;
mod sequential;

pub use dag::DagPipeline;
pub use graph::DependencyGraph;
pub use parallel::ParallelConfig;
pub use sequential::Pipeline;
