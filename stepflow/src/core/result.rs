//! The immutable result threaded through every step.

use super::{Context, ExecutionError, Severity};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Context key holding the name of the step currently executing.
pub const CURRENT_STEP_KEY: &str = "current_step";

/// Context key holding the name of the step whose fault halted the run.
pub const FAILED_STEP_KEY: &str = "failed_step";

/// Step name recorded on errors raised outside of any step.
pub const UNKNOWN_STEP: &str = "unknown";

/// Errors grouped by category, each category an append-only list.
pub type ErrorLog = BTreeMap<String, Vec<ExecutionError>>;

/// The outcome of a pipeline step.
///
/// A `FlowResult` carries a value, a context map, categorized errors and a
/// continuation flag. It is never mutated: every `with_*`, `halt*` and
/// `continue_with` call returns a new result that shares the untouched parts
/// of the receiver. Cloning is cheap; use [`FlowResult::deep_clone`] when a
/// fully independent copy is needed.
#[derive(Debug, Clone)]
pub struct FlowResult {
    value: Arc<Value>,
    context: Arc<Context>,
    errors: Arc<ErrorLog>,
    proceed: bool,
}

impl FlowResult {
    /// Creates a result with an empty context, no errors, and `continue` set.
    #[must_use]
    pub fn new(value: impl Into<Value>) -> Self {
        Self::from_parts(value, Context::new(), ErrorLog::new(), true)
    }

    /// Assembles a result from its parts.
    #[must_use]
    pub fn from_parts(
        value: impl Into<Value>,
        context: Context,
        errors: ErrorLog,
        proceed: bool,
    ) -> Self {
        Self {
            value: Arc::new(value.into()),
            context: Arc::new(context),
            errors: Arc::new(errors),
            proceed,
        }
    }

    /// The payload.
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Consumes the result, returning the payload.
    #[must_use]
    pub fn into_value(self) -> Value {
        Arc::try_unwrap(self.value).unwrap_or_else(|shared| Value::clone(&shared))
    }

    /// The accumulated context.
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Gets a single context value.
    #[must_use]
    pub fn get_context(&self, key: &str) -> Option<&Value> {
        self.context.get(key)
    }

    /// The name of the step currently tagged in the context, if any.
    #[must_use]
    pub fn current_step(&self) -> Option<&str> {
        self.context.get(CURRENT_STEP_KEY).and_then(Value::as_str)
    }

    /// All errors, grouped by category.
    #[must_use]
    pub fn errors(&self) -> &ErrorLog {
        &self.errors
    }

    /// Errors recorded under one category.
    #[must_use]
    pub fn errors_for(&self, category: &str) -> &[ExecutionError] {
        self.errors.get(category).map_or(&[], Vec::as_slice)
    }

    /// Returns a result whose context has `key` set to `value`.
    #[must_use]
    pub fn with_context(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut context = Context::clone(&self.context);
        context.insert(key.into(), Arc::new(value.into()));
        self.replace_context(context)
    }

    /// Returns a result with every entry of `entries` set in the context.
    #[must_use]
    pub fn merge_context<I, K, V>(&self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let mut context = Context::clone(&self.context);
        for (key, value) in entries {
            context.insert(key.into(), Arc::new(value.into()));
        }
        self.replace_context(context)
    }

    /// Records an error-severity entry under `category`.
    #[must_use]
    pub fn with_error(&self, category: impl Into<String>, message: impl Into<String>) -> Self {
        self.with_severity(category, message, Severity::Error)
    }

    /// Records a warning under `category`.
    #[must_use]
    pub fn with_warning(&self, category: impl Into<String>, message: impl Into<String>) -> Self {
        self.with_severity(category, message, Severity::Warning)
    }

    /// Records an entry with an explicit severity under `category`.
    #[must_use]
    pub fn with_severity(
        &self,
        category: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
    ) -> Self {
        let error = ExecutionError::new(self.owning_step(), message, severity);
        self.with_execution_error(category, error)
    }

    /// Records an entry carrying the fault that caused it.
    #[must_use]
    pub fn with_fault(
        &self,
        category: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
        fault: impl Into<Arc<anyhow::Error>>,
    ) -> Self {
        let error = ExecutionError::new(self.owning_step(), message, severity).with_fault(fault);
        self.with_execution_error(category, error)
    }

    /// Appends a prebuilt error record under `category`.
    #[must_use]
    pub fn with_execution_error(&self, category: impl Into<String>, error: ExecutionError) -> Self {
        let mut errors = ErrorLog::clone(&self.errors);
        errors.entry(category.into()).or_default().push(error);
        Self {
            value: Arc::clone(&self.value),
            context: Arc::clone(&self.context),
            errors: Arc::new(errors),
            proceed: self.proceed,
        }
    }

    /// Returns a halted result with the value unchanged.
    #[must_use]
    pub fn halt(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            context: Arc::clone(&self.context),
            errors: Arc::clone(&self.errors),
            proceed: false,
        }
    }

    /// Returns a halted result carrying `value`.
    #[must_use]
    pub fn halt_with(&self, value: impl Into<Value>) -> Self {
        Self {
            value: Arc::new(value.into()),
            ..self.halt()
        }
    }

    /// Returns a result carrying `value`.
    ///
    /// The continuation flag is kept as-is, so calling this on a halted
    /// result does not resume it.
    #[must_use]
    pub fn continue_with(&self, value: impl Into<Value>) -> Self {
        Self {
            value: Arc::new(value.into()),
            context: Arc::clone(&self.context),
            errors: Arc::clone(&self.errors),
            proceed: self.proceed,
        }
    }

    /// Returns true if execution should proceed.
    #[must_use]
    pub fn should_continue(&self) -> bool {
        self.proceed
    }

    /// Returns true if any category holds at least one error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.errors.values().any(|list| !list.is_empty())
    }

    /// Returns true if any critical error was recorded.
    #[must_use]
    pub fn has_critical_errors(&self) -> bool {
        self.all_errors().any(ExecutionError::is_critical)
    }

    /// Iterates over every error, category by category.
    pub fn all_errors(&self) -> impl Iterator<Item = &ExecutionError> {
        self.errors.values().flatten()
    }

    /// Returns only the warnings.
    #[must_use]
    pub fn warnings(&self) -> Vec<&ExecutionError> {
        self.all_errors().filter(|e| e.is_warning()).collect()
    }

    /// Continues and carries no errors at all. Warnings defeat success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.proceed && !self.has_errors()
    }

    /// Halted, or carrying an error of error or critical severity.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        !self.proceed || self.all_errors().any(ExecutionError::is_error)
    }

    /// Returns a copy that shares no storage with this result.
    ///
    /// Parallel branches each start from one of these so that no branch can
    /// observe another's state.
    #[must_use]
    pub fn deep_clone(&self) -> Self {
        Self {
            value: Arc::new(Value::clone(&self.value)),
            context: Arc::new(self.context.deep_clone()),
            errors: Arc::new(ErrorLog::clone(&self.errors)),
            proceed: self.proceed,
        }
    }

    /// Converts to a JSON summary.
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "value": Value::clone(&self.value),
            "context": self.context.to_json(),
            "errors": serde_json::to_value(&*self.errors).unwrap_or(Value::Null),
            "continue": self.proceed,
            "success": self.is_success(),
        })
    }

    /// Sets shared context entries without copying their payloads.
    pub(crate) fn with_shared_entries<'a, I>(&self, entries: I) -> Self
    where
        I: IntoIterator<Item = (String, &'a Arc<Value>)>,
    {
        let mut context = Context::clone(&self.context);
        for (key, value) in entries {
            context.insert(key, Arc::clone(value));
        }
        self.replace_context(context)
    }

    #[cfg(test)]
    pub(crate) fn shares_storage_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
            || Arc::ptr_eq(&self.context, &other.context)
            || Arc::ptr_eq(&self.errors, &other.errors)
    }

    fn owning_step(&self) -> String {
        self.current_step().unwrap_or(UNKNOWN_STEP).to_string()
    }

    fn replace_context(&self, context: Context) -> Self {
        Self {
            value: Arc::clone(&self.value),
            context: Arc::new(context),
            errors: Arc::clone(&self.errors),
            proceed: self.proceed,
        }
    }
}

impl fmt::Display for FlowResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.is_success() { "SUCCESS" } else { "FAILURE" };
        let categories: Vec<&str> = self.errors.keys().map(String::as_str).collect();
        write!(
            f,
            "[{}] value={}, errors={:?}, continue={}",
            status, self.value, categories, self.proceed
        )
    }
}
