//! Test assertions for flow results.

use crate::core::FlowResult;
use serde_json::Value;

/// Asserts that the result continues and carries no errors.
pub fn assert_success(result: &FlowResult) {
    assert!(result.is_success(), "Expected success, got {result}");
}

/// Asserts that the result was halted.
pub fn assert_halted(result: &FlowResult) {
    assert!(
        !result.should_continue(),
        "Expected a halted result, got {result}"
    );
}

/// Asserts that `category` holds exactly `expected` errors.
pub fn assert_error_count(result: &FlowResult, category: &str, expected: usize) {
    let actual = result.errors_for(category).len();
    assert_eq!(
        actual, expected,
        "Expected {expected} '{category}' errors, got {actual}: {:?}",
        result.errors_for(category)
    );
}

/// Asserts that the context holds `expected` under `key`.
pub fn assert_context_value(result: &FlowResult, key: &str, expected: &Value) {
    let actual = result.get_context(key);
    assert_eq!(
        actual,
        Some(expected),
        "Expected {expected} for context key '{key}', got {actual:?}. Keys: {:?}",
        result.context().keys().collect::<Vec<_>>()
    );
}
