//! Error types for pipeline construction and graph traversal.
//!
//! Faults raised inside step bodies never surface here: they are converted
//! into halted [`FlowResult`](crate::core::FlowResult)s. These types cover the
//! engine's own failures (bad graphs, unknown step names, invalid options).

use thiserror::Error;

/// The main error type for stepflow operations.
#[derive(Debug, Clone, Error)]
pub enum FlowError {
    /// The dependency graph contains a cycle.
    #[error("{0}")]
    CircularDependency(#[from] CircularDependencyError),

    /// A step depends on a name that was never declared.
    #[error("{0}")]
    MissingDependency(#[from] MissingDependencyError),

    /// A requested step does not exist.
    #[error("{0}")]
    StepNotFound(#[from] StepNotFoundError),

    /// Invalid configuration was supplied.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An internal invariant was violated.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error raised when the dependency graph is not acyclic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Circular dependency detected: {}", cycle_path.join(" -> "))]
pub struct CircularDependencyError {
    /// The steps forming the cycle; the first name is repeated at the end.
    pub cycle_path: Vec<String>,
}

impl CircularDependencyError {
    /// Creates a new circular dependency error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        Self { cycle_path }
    }

    /// Returns true if the named step participates in the cycle.
    #[must_use]
    pub fn involves(&self, step: &str) -> bool {
        self.cycle_path.iter().any(|name| name == step)
    }
}

/// Error raised when a declared dependency never resolves to a step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Step '{step}' depends on unknown step '{dependency}'")]
pub struct MissingDependencyError {
    /// The step declaring the dependency.
    pub step: String,
    /// The dependency that was never declared.
    pub dependency: String,
}

impl MissingDependencyError {
    /// Creates a new missing dependency error.
    #[must_use]
    pub fn new(step: impl Into<String>, dependency: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            dependency: dependency.into(),
        }
    }
}

/// Error raised when a step name is not registered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Step '{name}' not found")]
pub struct StepNotFoundError {
    /// The missing step name.
    pub name: String,
}

impl StepNotFoundError {
    /// Creates a new step-not-found error.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl FlowError {
    /// Shorthand for a [`FlowError::StepNotFound`].
    #[must_use]
    pub fn step_not_found(name: impl Into<String>) -> Self {
        Self::StepNotFound(StepNotFoundError::new(name))
    }

    /// Returns true if this is a cycle error.
    #[must_use]
    pub fn is_cycle(&self) -> bool {
        matches!(self, Self::CircularDependency(_))
    }
}
