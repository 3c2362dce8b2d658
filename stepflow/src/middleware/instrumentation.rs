//! Timing middleware and metrics collection.

use super::{overlay_options, Middleware, MiddlewareOptions};
use crate::core::{FlowResult, UNKNOWN_STEP};
use crate::steps::{SharedHandler, StepHandler};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Timing for one step invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepMetrics {
    /// Step name.
    pub step: String,
    /// Wall time spent in the wrapped handler.
    pub duration: Duration,
    /// Whether the output still continues.
    pub success: bool,
    /// When the invocation started.
    pub timestamp: DateTime<Utc>,
}

/// Receives [`StepMetrics`] from [`Instrumentation`].
#[cfg_attr(test, mockall::automock)]
pub trait MetricsCollector: Send + Sync {
    /// Records one invocation.
    fn record(&self, metrics: &StepMetrics);
}

/// A collector that keeps every record in memory.
#[derive(Debug, Default)]
pub struct InMemoryCollector {
    records: Mutex<Vec<StepMetrics>>,
}

impl InMemoryCollector {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the recorded metrics.
    #[must_use]
    pub fn records(&self) -> Vec<StepMetrics> {
        self.records.lock().clone()
    }

    /// Returns the records for one step.
    #[must_use]
    pub fn records_for(&self, step: &str) -> Vec<StepMetrics> {
        self.records
            .lock()
            .iter()
            .filter(|m| m.step == step)
            .cloned()
            .collect()
    }

    /// Total time recorded across all steps.
    #[must_use]
    pub fn total_duration(&self) -> Duration {
        self.records.lock().iter().map(|m| m.duration).sum()
    }

    /// Clears the records.
    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl MetricsCollector for InMemoryCollector {
    fn record(&self, metrics: &StepMetrics) {
        self.records.lock().push(metrics.clone());
    }
}

/// Configuration for [`Instrumentation`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentationConfig {
    /// Label included in log lines when no collector is attached.
    pub label: Option<String>,
}

/// Measures every step and adds `"<step>_duration"` (seconds) to the context.
///
/// With a collector attached each measurement is handed to it; otherwise it
/// is logged at `info`.
#[derive(Clone, Default)]
pub struct Instrumentation {
    config: InstrumentationConfig,
    collector: Option<Arc<dyn MetricsCollector>>,
}

impl Instrumentation {
    /// Creates the middleware without a collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends measurements to `collector`.
    #[must_use]
    pub fn with_collector(mut self, collector: Arc<dyn MetricsCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    /// Sets the log label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.config.label = Some(label.into());
        self
    }
}

impl std::fmt::Debug for Instrumentation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrumentation")
            .field("config", &self.config)
            .field("collector", &self.collector.is_some())
            .finish()
    }
}

impl Middleware for Instrumentation {
    fn wrap(&self, next: SharedHandler, options: &MiddlewareOptions) -> SharedHandler {
        let config = overlay_options(&self.config, options, self.name());
        Arc::new(InstrumentedStep {
            label: config.label,
            collector: self.collector.clone(),
            next,
        })
    }

    fn name(&self) -> &str {
        "instrumentation"
    }
}

struct InstrumentedStep {
    label: Option<String>,
    collector: Option<Arc<dyn MetricsCollector>>,
    next: SharedHandler,
}

impl StepHandler for InstrumentedStep {
    fn call(&self, result: FlowResult) -> FlowResult {
        let timestamp = Utc::now();
        let started = Instant::now();

        let output = self.next.call(result);

        let duration = started.elapsed();
        let step = self
            .next
            .name()
            .or_else(|| output.current_step())
            .unwrap_or(UNKNOWN_STEP)
            .to_string();

        let metrics = StepMetrics {
            step,
            duration,
            success: output.should_continue(),
            timestamp,
        };

        match &self.collector {
            Some(collector) => collector.record(&metrics),
            None => info!(
                label = self.label.as_deref().unwrap_or_default(),
                step = %metrics.step,
                duration_secs = duration.as_secs_f64(),
                success = metrics.success,
                "Step timing recorded"
            ),
        }

        output.with_context(format!("{}_duration", metrics.step), duration.as_secs_f64())
    }

    fn name(&self) -> Option<&str> {
        self.next.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::Step;
    use mockall::predicate::function;
    use serde_json::Value;

    fn sleepy_step(name: &str, millis: u64) -> SharedHandler {
        Arc::new(Step::new(name, move |r: FlowResult| {
            std::thread::sleep(Duration::from_millis(millis));
            Ok(r)
        }))
    }

    #[test]
    fn test_records_to_collector() {
        let collector = Arc::new(InMemoryCollector::new());
        let middleware = Instrumentation::new().with_collector(collector.clone());

        let wrapped = middleware.wrap(sleepy_step("fetch", 10), &MiddlewareOptions::new());
        let output = wrapped.call(FlowResult::new(0));

        let records = collector.records_for("fetch");
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        assert!(records[0].duration >= Duration::from_millis(10));

        let secs = output
            .get_context("fetch_duration")
            .and_then(Value::as_f64)
            .unwrap();
        assert!(secs >= 0.01);
    }

    #[test]
    fn test_mock_collector_receives_failure() {
        let mut collector = MockMetricsCollector::new();
        collector
            .expect_record()
            .with(function(|m: &StepMetrics| m.step == "broken" && !m.success))
            .times(1)
            .return_const(());

        let step: SharedHandler = Arc::new(Step::new("broken", |_r: FlowResult| {
            Err(anyhow::anyhow!("boom"))
        }));
        let wrapped = Instrumentation::new()
            .with_collector(Arc::new(collector))
            .wrap(step, &MiddlewareOptions::new());

        let output = wrapped.call(FlowResult::new(0));
        assert!(!output.should_continue());
        assert!(output.get_context("broken_duration").is_some());
    }

    #[test]
    fn test_logs_without_collector() {
        let wrapped = Instrumentation::new()
            .with_label("svc")
            .wrap(sleepy_step("quiet", 0), &MiddlewareOptions::new());

        let output = wrapped.call(FlowResult::new(0));
        assert!(output.get_context("quiet_duration").is_some());
    }

    #[test]
    fn test_collector_totals() {
        let collector = InMemoryCollector::new();
        for millis in [5, 7] {
            collector.record(&StepMetrics {
                step: "a".to_string(),
                duration: Duration::from_millis(millis),
                success: true,
                timestamp: Utc::now(),
            });
        }

        assert_eq!(collector.total_duration(), Duration::from_millis(12));
        collector.clear();
        assert!(collector.records().is_empty());
    }
}
