//! Step doubles for testing.
//!
//! Each double keeps its state behind an `Arc`, so a clone can be registered
//! in a pipeline while the original is kept for inspection.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::{FlowResult, CURRENT_STEP_KEY};
use crate::steps::{halt_on_fault, StepHandler};

/// A shared, ordered log of step names.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl ExecutionLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a name.
    pub fn record(&self, name: impl Into<String>) {
        self.entries.lock().push(name.into());
    }

    /// Returns the recorded names in order.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// Number of recorded names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Position of the first occurrence of `name`.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.entries.lock().iter().position(|n| n == name)
    }
}

/// A step that appends its name to an [`ExecutionLog`] and passes the
/// result through.
#[derive(Debug, Clone)]
pub struct RecordingStep {
    name: String,
    log: ExecutionLog,
}

impl RecordingStep {
    /// Creates a recording step writing to `log`.
    #[must_use]
    pub fn new(name: impl Into<String>, log: &ExecutionLog) -> Self {
        Self {
            name: name.into(),
            log: log.clone(),
        }
    }
}

impl StepHandler for RecordingStep {
    fn call(&self, result: FlowResult) -> FlowResult {
        self.log.record(self.name.as_str());
        result.with_context(CURRENT_STEP_KEY, self.name.as_str())
    }

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

/// A step that counts its invocations.
#[derive(Debug, Clone)]
pub struct CountingStep {
    name: String,
    count: Arc<AtomicUsize>,
}

impl CountingStep {
    /// Creates a counting step.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of invocations so far, across all clones.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Resets the counter.
    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
    }
}

impl StepHandler for CountingStep {
    fn call(&self, result: FlowResult) -> FlowResult {
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        result
            .with_context(CURRENT_STEP_KEY, self.name.as_str())
            .with_context(format!("{}_calls", self.name), n)
    }

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

/// Tracks how many instrumented steps run at the same time.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyProbe {
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ConcurrencyProbe {
    /// Creates a probe.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest number of steps observed running at once.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A step that blocks its thread for a fixed delay.
#[derive(Debug, Clone)]
pub struct SlowStep {
    name: String,
    delay: Duration,
    probe: Option<ConcurrencyProbe>,
}

impl SlowStep {
    /// Creates a slow step.
    #[must_use]
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
            probe: None,
        }
    }

    /// Creates a slow step with the delay in milliseconds.
    #[must_use]
    pub fn with_delay_ms(name: impl Into<String>, ms: u64) -> Self {
        Self::new(name, Duration::from_millis(ms))
    }

    /// Reports to `probe` while running.
    #[must_use]
    pub fn with_probe(mut self, probe: &ConcurrencyProbe) -> Self {
        self.probe = Some(probe.clone());
        self
    }
}

impl StepHandler for SlowStep {
    fn call(&self, result: FlowResult) -> FlowResult {
        if let Some(probe) = &self.probe {
            probe.enter();
        }
        std::thread::sleep(self.delay);
        if let Some(probe) = &self.probe {
            probe.exit();
        }
        result.with_context(CURRENT_STEP_KEY, self.name.as_str())
    }

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

/// A step whose body always fails.
#[derive(Debug, Clone)]
pub struct FailingStep {
    name: String,
    message: String,
}

impl FailingStep {
    /// Creates a failing step.
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl StepHandler for FailingStep {
    fn call(&self, result: FlowResult) -> FlowResult {
        let tagged = result.with_context(CURRENT_STEP_KEY, self.name.as_str());
        halt_on_fault(&tagged, &self.name, anyhow::anyhow!(self.message.clone()))
    }

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }
}
