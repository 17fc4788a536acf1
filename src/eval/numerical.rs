//! Numeric answer checking.
//!
//! The parsing rule is deterministic: when the whole trimmed output is one
//! number, that is the answer; otherwise the answer is the last numeric
//! token anywhere in the output. Scripts that print progress lines before
//! their final `Result: 42` therefore evaluate on the 42.

use regex::Regex;

use super::{truncate, Verdict};
use crate::exec::ExecutionResult;

const NUMBER_TOKEN: &str = r"-?\d+(\.\d+)?";

pub(super) fn check(
    execution: &ExecutionResult,
    expected: f64,
    tolerance: Option<f64>,
    epsilon: f64,
) -> Verdict {
    let Some(actual) = parse_numeric_output(&execution.stdout) else {
        return Verdict::fail("no numeric value found in output")
            .with_values(expected.to_string(), truncate(execution.stdout.trim(), 200));
    };

    let difference = (actual - expected).abs();
    let (passed, rule) = match tolerance {
        Some(t) => (difference <= t, format!("tolerance {}", t)),
        // Integral expectations with no stated tolerance mean exactly that
        // integer, not something near it.
        None if expected.fract() == 0.0 => (actual == expected, "exact match".to_string()),
        None => (difference <= epsilon, format!("epsilon {}", epsilon)),
    };

    let verdict = if passed {
        Verdict::pass(format!("matched expected value ({})", rule))
    } else {
        Verdict::fail(format!("value differs by {} ({})", difference, rule))
    };
    verdict.with_values(expected.to_string(), actual.to_string())
}

/// Extracts the numeric answer from a script's stdout, if there is one.
fn parse_numeric_output(stdout: &str) -> Option<f64> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return None;
    }

    let whole = Regex::new(&format!("^{}$", NUMBER_TOKEN)).ok()?;
    if whole.is_match(trimmed) {
        return trimmed.parse().ok();
    }

    let token = Regex::new(NUMBER_TOKEN).ok()?;
    token
        .find_iter(trimmed)
        .last()
        .and_then(|m| m.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn output(stdout: &str) -> ExecutionResult {
        ExecutionResult {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: Some(0),
            duration: Duration::ZERO,
            timed_out: false,
            stdout_truncated: false,
            stderr_truncated: false,
        }
    }

    #[test]
    fn test_bare_number_matches() {
        let verdict = check(&output("42\n"), 42.0, None, 1e-9);
        assert!(verdict.passed);
        assert_eq!(verdict.actual, "42");
    }

    #[test]
    fn test_labelled_number_matches() {
        let verdict = check(&output("Result: 42\n"), 42.0, None, 1e-9);
        assert!(verdict.passed);
    }

    #[test]
    fn test_last_token_wins() {
        let verdict = check(
            &output("Processed 100 items in 3 batches\nResult: 42"),
            42.0,
            None,
            1e-9,
        );
        assert!(verdict.passed);
        assert_eq!(verdict.actual, "42");
    }

    #[test]
    fn test_tolerance_accepts_close_value() {
        let verdict = check(&output("Result: 42.0001"), 42.0, Some(0.001), 1e-9);
        assert!(verdict.passed);
    }

    #[test]
    fn test_tolerance_rejects_distant_value() {
        let verdict = check(&output("Result: 42.0001"), 42.0, Some(0.00001), 1e-9);
        assert!(!verdict.passed);
        assert_eq!(verdict.expected, "42");
        assert_eq!(verdict.actual, "42.0001");
    }

    #[test]
    fn test_integral_expectation_is_exact_without_tolerance() {
        let verdict = check(&output("42.0001"), 42.0, None, 1e-9);
        assert!(!verdict.passed);

        let verdict = check(&output("42.0"), 42.0, None, 1e-9);
        assert!(verdict.passed);
    }

    #[test]
    fn test_fractional_expectation_uses_epsilon() {
        let verdict = check(&output("0.30000000000000004"), 0.3, None, 1e-9);
        assert!(verdict.passed);
    }

    #[test]
    fn test_negative_value() {
        let verdict = check(&output("balance: -7"), -7.0, None, 1e-9);
        assert!(verdict.passed);
    }

    #[test]
    fn test_no_number_fails() {
        let verdict = check(&output("nothing to see here"), 42.0, None, 1e-9);
        assert!(!verdict.passed);
        assert!(verdict.detail.contains("no numeric value"));

        let verdict = check(&output(""), 42.0, None, 1e-9);
        assert!(!verdict.passed);
    }
}
