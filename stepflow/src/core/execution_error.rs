//! Severity-tagged error records carried by a [`FlowResult`](super::FlowResult).

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;

/// How serious a recorded error is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Does not imply failure, but defeats success.
    Warning,
    /// Implies failure.
    Error,
    /// Implies failure. Used by the automatic fault conversion in steps.
    Critical,
}

impl Default for Severity {
    fn default() -> Self {
        Self::Error
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// A structured error recorded during pipeline execution.
///
/// Immutable once constructed. The optional fault is shared so that results
/// holding the record stay cheap to clone.
#[derive(Debug, Clone)]
pub struct ExecutionError {
    step: String,
    message: String,
    severity: Severity,
    timestamp: DateTime<Utc>,
    fault: Option<Arc<anyhow::Error>>,
}

impl ExecutionError {
    /// Creates a new error record stamped with the current time.
    #[must_use]
    pub fn new(step: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            step: step.into(),
            message: message.into(),
            severity,
            timestamp: Utc::now(),
            fault: None,
        }
    }

    /// Attaches the fault that caused this error.
    #[must_use]
    pub fn with_fault(mut self, fault: impl Into<Arc<anyhow::Error>>) -> Self {
        self.fault = Some(fault.into());
        self
    }

    /// The step that was running when the error was recorded.
    #[must_use]
    pub fn step(&self) -> &str {
        &self.step
    }

    /// The human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The severity.
    #[must_use]
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// When the error was recorded.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// The underlying fault, if any.
    #[must_use]
    pub fn fault(&self) -> Option<&anyhow::Error> {
        self.fault.as_deref()
    }

    pub(crate) fn shared_fault(&self) -> Option<Arc<anyhow::Error>> {
        self.fault.clone()
    }

    /// Returns true if both describe the same recorded error: same step,
    /// message, severity and timestamp.
    pub(crate) fn same_record(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp
            && self.severity == other.severity
            && self.step == other.step
            && self.message == other.message
    }

    /// Returns true if severity is critical.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }

    /// Returns true if severity is error or critical.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self.severity, Severity::Error | Severity::Critical)
    }

    /// Returns true if severity is warning.
    #[must_use]
    pub fn is_warning(&self) -> bool {
        self.severity == Severity::Warning
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.severity.to_string().to_uppercase(),
            self.step,
            self.message
        )
    }
}

impl Serialize for ExecutionError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ExecutionError", 5)?;
        state.serialize_field("step", &self.step)?;
        state.serialize_field("message", &self.message)?;
        state.serialize_field("severity", &self.severity)?;
        state.serialize_field("timestamp", &self.timestamp)?;
        state.serialize_field("fault", &self.fault.as_ref().map(ToString::to_string))?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_predicates() {
        let warning = ExecutionError::new("s", "w", Severity::Warning);
        let error = ExecutionError::new("s", "e", Severity::Error);
        let critical = ExecutionError::new("s", "c", Severity::Critical);

        assert!(warning.is_warning());
        assert!(!warning.is_error());
        assert!(!warning.is_critical());

        assert!(error.is_error());
        assert!(!error.is_critical());

        assert!(critical.is_error());
        assert!(critical.is_critical());
        assert!(!critical.is_warning());
    }

    #[test]
    fn test_display() {
        let err = ExecutionError::new("validate", "Input cannot be empty", Severity::Error);
        assert_eq!(err.to_string(), "[ERROR] validate: Input cannot be empty");
    }

    #[test]
    fn test_severity_serialize() {
        let json = serde_json::to_string(&Severity::Critical).unwrap();
        assert_eq!(json, r#""critical""#);

        let parsed: Severity = serde_json::from_str(r#""warning""#).unwrap();
        assert_eq!(parsed, Severity::Warning);
    }

    #[test]
    fn test_serialize_with_fault() {
        let err = ExecutionError::new("load", "load: boom", Severity::Critical)
            .with_fault(anyhow::anyhow!("boom"));

        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["step"], "load");
        assert_eq!(json["severity"], "critical");
        assert_eq!(json["fault"], "boom");
        assert_eq!(err.fault().map(ToString::to_string), Some("boom".to_string()));
    }

    #[test]
    fn test_default_severity_is_error() {
        assert_eq!(Severity::default(), Severity::Error);
    }
}
