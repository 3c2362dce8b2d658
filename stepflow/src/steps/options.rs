//! Per-step options.

use serde::{Deserialize, Serialize};

/// Options recognized by [`Step`](super::Step).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepOptions {
    /// Record the elapsed seconds under `"<name>_duration"`.
    pub track_duration: bool,
    /// Marks the step as required. Carried for callers and middleware;
    /// execution does not consult it.
    pub required: bool,
}

impl StepOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables duration tracking.
    #[must_use]
    pub fn track_duration(mut self) -> Self {
        self.track_duration = true;
        self
    }

    /// Marks the step as required.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}
