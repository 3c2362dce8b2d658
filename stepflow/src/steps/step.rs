//! Named steps wrapping caller-supplied bodies.

use super::{halt_on_fault, panic_fault, StepHandler, StepOptions};
use crate::core::{FlowResult, CURRENT_STEP_KEY};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

/// A step body. Returning `Err` or panicking halts the run with a critical error.
pub type StepBody = Arc<dyn Fn(FlowResult) -> anyhow::Result<FlowResult> + Send + Sync>;

/// A guard deciding whether a [`ConditionalStep`] runs its body.
pub type StepCondition = Arc<dyn Fn(&FlowResult) -> bool + Send + Sync>;

/// A named step.
#[derive(Clone)]
pub struct Step {
    name: String,
    body: StepBody,
    options: StepOptions,
}

impl Step {
    /// Creates a new step with default options.
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(FlowResult) -> anyhow::Result<FlowResult> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            body: Arc::new(body),
            options: StepOptions::default(),
        }
    }

    /// Sets the step options.
    #[must_use]
    pub fn with_options(mut self, options: StepOptions) -> Self {
        self.options = options;
        self
    }

    /// Returns the step name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the step options.
    #[must_use]
    pub fn options(&self) -> &StepOptions {
        &self.options
    }

    /// Runs the body against an already tagged result.
    fn run(&self, tagged: FlowResult) -> FlowResult {
        trace!(step = %self.name, "Executing step");

        let started = self.options.track_duration.then(Instant::now);
        let input = tagged.clone();

        match panic::catch_unwind(AssertUnwindSafe(|| (self.body)(input))) {
            Ok(Ok(output)) => match started {
                Some(started) => output.with_context(
                    format!("{}_duration", self.name),
                    started.elapsed().as_secs_f64(),
                ),
                None => output,
            },
            Ok(Err(fault)) => halt_on_fault(&tagged, &self.name, fault),
            Err(payload) => halt_on_fault(&tagged, &self.name, panic_fault(payload.as_ref())),
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Step<{}>", self.name)
    }
}

impl StepHandler for Step {
    fn call(&self, result: FlowResult) -> FlowResult {
        self.run(result.with_context(CURRENT_STEP_KEY, self.name.as_str()))
    }

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

/// A step that only runs its body when a condition holds.
///
/// When the condition is false the result is returned tagged with
/// `"<name>_skipped" = true` and otherwise untouched.
#[derive(Clone)]
pub struct ConditionalStep {
    step: Step,
    condition: StepCondition,
}

impl ConditionalStep {
    /// Creates a new conditional step.
    pub fn new<C, F>(name: impl Into<String>, condition: C, body: F) -> Self
    where
        C: Fn(&FlowResult) -> bool + Send + Sync + 'static,
        F: Fn(FlowResult) -> anyhow::Result<FlowResult> + Send + Sync + 'static,
    {
        Self {
            step: Step::new(name, body),
            condition: Arc::new(condition),
        }
    }

    /// Sets the step options.
    #[must_use]
    pub fn with_options(mut self, options: StepOptions) -> Self {
        self.step = self.step.with_options(options);
        self
    }

    /// Returns the step name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.step.name()
    }
}

impl fmt::Debug for ConditionalStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionalStep")
            .field("name", &self.step.name)
            .field("options", &self.step.options)
            .finish()
    }
}

impl StepHandler for ConditionalStep {
    fn call(&self, result: FlowResult) -> FlowResult {
        let tagged = result.with_context(CURRENT_STEP_KEY, self.step.name.as_str());

        if (self.condition)(&tagged) {
            self.step.run(tagged)
        } else {
            trace!(step = %self.step.name, "Condition not met, skipping step");
            tagged.with_context(format!("{}_skipped", self.step.name), true)
        }
    }

    fn name(&self) -> Option<&str> {
        Some(self.step.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FAILED_STEP_KEY;
    use crate::steps::STEP_ERROR_CATEGORY;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_step_tags_current_step() {
        let step = Step::new("double", |r: FlowResult| {
            let n = r.value().as_i64().unwrap_or(0);
            Ok(r.continue_with(n * 2))
        });

        let output = step.call(FlowResult::new(21));

        assert_eq!(output.value(), &json!(42));
        assert_eq!(output.current_step(), Some("double"));
        assert_eq!(StepHandler::name(&step), Some("double"));
    }

    #[test]
    fn test_step_error_becomes_critical_halt() {
        let step = Step::new("load", |_r: FlowResult| Err(anyhow::anyhow!("connection refused")));

        let output = step.call(FlowResult::new("input"));

        assert!(!output.should_continue());
        assert!(output.has_critical_errors());
        assert_eq!(output.value(), &json!("input"));
        assert_eq!(output.get_context(FAILED_STEP_KEY), Some(&json!("load")));
        assert_eq!(
            output.errors_for(STEP_ERROR_CATEGORY)[0].message(),
            "load: connection refused"
        );
    }

    #[test]
    fn test_step_panic_becomes_critical_halt() {
        let step = Step::new("explode", |_r: FlowResult| -> anyhow::Result<FlowResult> {
            panic!("kaboom")
        });

        let output = step.call(FlowResult::new(0));

        assert!(!output.should_continue());
        let error = &output.errors_for(STEP_ERROR_CATEGORY)[0];
        assert_eq!(error.message(), "explode: kaboom");
        assert_eq!(error.step(), "explode");
    }

    #[test]
    fn test_track_duration() {
        let fast = Step::new("fast", |r: FlowResult| Ok(r))
            .with_options(StepOptions::new().track_duration());
        let slow = Step::new("slow", |r: FlowResult| {
            std::thread::sleep(Duration::from_millis(30));
            Ok(r)
        })
        .with_options(StepOptions::new().track_duration());

        let fast_secs = fast
            .call(FlowResult::new(0))
            .get_context("fast_duration")
            .and_then(serde_json::Value::as_f64)
            .unwrap();
        let slow_secs = slow
            .call(FlowResult::new(0))
            .get_context("slow_duration")
            .and_then(serde_json::Value::as_f64)
            .unwrap();

        assert!(fast_secs >= 0.0);
        assert!(slow_secs >= 0.03);
        assert!(slow_secs > fast_secs);
    }

    #[test]
    fn test_duration_not_tracked_by_default() {
        let step = Step::new("plain", |r: FlowResult| Ok(r));
        let output = step.call(FlowResult::new(0));
        assert!(output.get_context("plain_duration").is_none());
    }

    #[test]
    fn test_conditional_step_runs_when_true() {
        let step = ConditionalStep::new(
            "premium",
            |r: &FlowResult| r.get_context("tier") == Some(&json!("premium")),
            |r: FlowResult| Ok(r.continue_with("discounted")),
        );

        let output = step.call(FlowResult::new("full").with_context("tier", "premium"));

        assert_eq!(output.value(), &json!("discounted"));
        assert!(output.get_context("premium_skipped").is_none());
    }

    #[test]
    fn test_conditional_step_skips_when_false() {
        let step = ConditionalStep::new(
            "premium",
            |_r: &FlowResult| false,
            |r: FlowResult| Ok(r.continue_with("discounted")),
        );

        let output = step.call(FlowResult::new("full"));

        assert_eq!(output.value(), &json!("full"));
        assert_eq!(output.get_context("premium_skipped"), Some(&json!(true)));
        assert_eq!(output.current_step(), Some("premium"));
        assert!(output.should_continue());
        assert!(!output.has_errors());
    }

    #[test]
    fn test_condition_sees_tagged_result() {
        let step = ConditionalStep::new(
            "self_aware",
            |r: &FlowResult| r.current_step() == Some("self_aware"),
            |r: FlowResult| Ok(r.continue_with(true)),
        );

        assert_eq!(step.call(FlowResult::new(false)).value(), &json!(true));
    }

    #[test]
    fn test_conditional_step_fault_handling() {
        let step = ConditionalStep::new(
            "guarded",
            |_r: &FlowResult| true,
            |_r: FlowResult| Err(anyhow::anyhow!("nope")),
        );

        let output = step.call(FlowResult::new(0));
        assert!(!output.should_continue());
        assert_eq!(output.errors_for(STEP_ERROR_CATEGORY)[0].message(), "guarded: nope");
    }

    #[test]
    fn test_display() {
        let step = Step::new("parse", |r: FlowResult| Ok(r));
        assert_eq!(step.to_string(), "Step<parse>");
        assert!(format!("{step:?}").contains("parse"));
    }
}
