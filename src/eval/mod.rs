//! Output evaluation.
//!
//! One checker per expected-result kind, selected by a closed match on the
//! task's [`ExpectedResult`]. Checkers never abort the pipeline: whatever
//! goes wrong while judging an output (a missing file, unparseable CSV, a
//! crashed checker script) comes back as a failed [`Verdict`] with the
//! reason in its detail.

mod classification;
mod numerical;
mod script_run;
mod string_answer;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PipelineConfig;
use crate::env::ExecutionEnvironment;
use crate::exec::ExecutionResult;
use crate::task::{ExpectedResult, TaskSpec};

/// The outcome of judging one execution against its expected result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    /// Whether the output satisfied the expectation.
    pub passed: bool,
    /// Human-readable explanation of the decision.
    pub detail: String,
    /// What the task expected, rendered for the report.
    pub expected: String,
    /// What the output actually contained.
    pub actual: String,
}

impl Verdict {
    /// Creates a passing verdict.
    pub fn pass(detail: impl Into<String>) -> Self {
        Self {
            passed: true,
            detail: detail.into(),
            expected: String::new(),
            actual: String::new(),
        }
    }

    /// Creates a failing verdict.
    pub fn fail(detail: impl Into<String>) -> Self {
        Self {
            passed: false,
            detail: detail.into(),
            expected: String::new(),
            actual: String::new(),
        }
    }

    /// Sets the expected and actual values.
    pub fn with_values(mut self, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        self.expected = expected.into();
        self.actual = actual.into();
        self
    }
}

/// Judges executions against their tasks' expected results.
pub struct Evaluator {
    config: PipelineConfig,
}

impl Evaluator {
    /// Creates a new evaluator using the given configuration.
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Evaluates one finished execution. Always returns a verdict; an
    /// evaluation problem is a failed verdict, not an error.
    pub async fn evaluate(
        &self,
        task: &TaskSpec,
        env: &ExecutionEnvironment,
        execution: &ExecutionResult,
    ) -> Verdict {
        debug!(
            "Evaluating task '{}' with {} checker",
            task.id,
            task.result.kind()
        );

        match &task.result {
            ExpectedResult::Numerical { amount, tolerance } => {
                numerical::check(execution, *amount, *tolerance, self.config.numeric_epsilon)
            }
            ExpectedResult::StringAnswer {
                expected_string,
                case_sensitive,
            } => string_answer::check(execution, expected_string, *case_sensitive),
            ExpectedResult::ClassificationMatch {
                ground_truth_file,
                predictions_file,
                threshold,
            } => classification::check(
                task,
                env,
                ground_truth_file,
                predictions_file.as_deref(),
                *threshold,
            ),
            ExpectedResult::ScriptRun { script_file } => {
                script_run::check(task, env, script_file, &self.config).await
            }
        }
    }
}

/// Truncates a string for display.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len).collect();
        format!("{}...", cut)
    }
}
