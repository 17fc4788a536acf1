//! Outcome records, run summaries, and result persistence.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::eval::Verdict;
use crate::exec::ExecutionResult;
use crate::install::InstallReport;
use crate::task::TaskSpec;

/// Byte cap for stdout/stderr summaries stored in outcome records.
const OUTPUT_SUMMARY_LIMIT: usize = 10_000;

/// Errors while persisting results.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize result: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Terminal state of one task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Ran to completion and the output satisfied the expectation.
    Success,
    /// Ran to completion but the output did not match.
    Mismatch,
    /// The response did not contain exactly one script block.
    ExtractionError,
    /// The environment could not be built.
    ProvisioningError,
    /// The script failed in a way traced back to failed dependencies.
    InstallError,
    /// The script failed to run or crashed.
    ExecutionError,
    /// The script exceeded its wall-clock deadline.
    Timeout,
}

impl TaskStatus {
    /// True only for a passing attempt.
    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Success)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Success => write!(f, "success"),
            TaskStatus::Mismatch => write!(f, "mismatch"),
            TaskStatus::ExtractionError => write!(f, "extraction_error"),
            TaskStatus::ProvisioningError => write!(f, "provisioning_error"),
            TaskStatus::InstallError => write!(f, "install_error"),
            TaskStatus::ExecutionError => write!(f, "execution_error"),
            TaskStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// Everything recorded about one task attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRecord {
    /// Task identifier.
    pub task_id: String,
    /// Task difficulty label.
    pub difficulty: String,
    /// Expected-result kind ("numerical", "classification_match", ...).
    pub result_kind: String,
    /// Terminal status of the attempt.
    pub status: TaskStatus,
    /// Status-specific explanation.
    pub detail: String,
    /// Expected value, rendered.
    pub expected: String,
    /// Actual value found, rendered.
    pub actual: String,
    /// Timestamp when the attempt started.
    pub started_at: DateTime<Utc>,
    /// Timestamp when the attempt completed.
    pub completed_at: DateTime<Utc>,
    /// Wall-clock time for the whole attempt.
    pub duration: Duration,
    /// Script exit code, when it ran.
    pub exit_code: Option<i32>,
    /// Whether the script hit its deadline.
    pub timed_out: bool,
    /// Captured stdout (truncated if too long).
    pub stdout: String,
    /// Captured stderr (truncated if too long).
    pub stderr: String,
    /// True when stdout was cut, at capture time or here.
    pub stdout_truncated: bool,
    /// True when stderr was cut, at capture time or here.
    pub stderr_truncated: bool,
    /// Per-package install outcomes, when dependencies were requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install: Option<InstallReport>,
    /// Where the extracted script was archived, relative to the run dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_file: Option<String>,
}

impl OutcomeRecord {
    /// Creates a record for a finished attempt.
    pub fn new(
        task: &TaskSpec,
        status: TaskStatus,
        detail: impl Into<String>,
        duration: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: task.id.clone(),
            difficulty: task.difficulty.clone(),
            result_kind: task.result.kind().to_string(),
            status,
            detail: detail.into(),
            expected: String::new(),
            actual: String::new(),
            started_at: now - chrono::Duration::from_std(duration).unwrap_or_default(),
            completed_at: now,
            duration,
            exit_code: None,
            timed_out: false,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            install: None,
            script_file: None,
        }
    }

    /// Copies the verdict's expected/actual values into the record.
    pub fn with_verdict(mut self, verdict: &Verdict) -> Self {
        self.expected = verdict.expected.clone();
        self.actual = verdict.actual.clone();
        self
    }

    /// Copies execution observables into the record.
    pub fn with_execution(mut self, execution: &ExecutionResult) -> Self {
        self.exit_code = execution.exit_code;
        self.timed_out = execution.timed_out;
        self.stdout_truncated =
            execution.stdout_truncated || execution.stdout.len() > OUTPUT_SUMMARY_LIMIT;
        self.stderr_truncated =
            execution.stderr_truncated || execution.stderr.len() > OUTPUT_SUMMARY_LIMIT;
        self.stdout = truncate_string(execution.stdout.clone(), OUTPUT_SUMMARY_LIMIT);
        self.stderr = truncate_string(execution.stderr.clone(), OUTPUT_SUMMARY_LIMIT);
        self
    }

    /// Attaches the dependency install report.
    pub fn with_install(mut self, install: InstallReport) -> Self {
        self.install = Some(install);
        self
    }

    /// Records where the extracted script was archived.
    pub fn with_script_file(mut self, path: impl Into<String>) -> Self {
        self.script_file = Some(path.into());
        self
    }

    /// Returns true if the attempt passed.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Pass/total counts for one slice of the run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Breakdown {
    pub total: usize,
    pub passed: usize,
}

/// Aggregated view over a whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub pass_rate: f64,
    pub by_status: BTreeMap<String, usize>,
    pub by_difficulty: BTreeMap<String, Breakdown>,
    pub by_kind: BTreeMap<String, Breakdown>,
    pub total_duration: Duration,
    pub generated_at: DateTime<Utc>,
}

impl RunSummary {
    /// Builds the summary from a run's outcome records.
    pub fn from_outcomes(outcomes: &[OutcomeRecord]) -> Self {
        let total = outcomes.len();
        let passed = outcomes.iter().filter(|o| o.is_success()).count();

        let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_difficulty: BTreeMap<String, Breakdown> = BTreeMap::new();
        let mut by_kind: BTreeMap<String, Breakdown> = BTreeMap::new();

        for outcome in outcomes {
            *by_status.entry(outcome.status.to_string()).or_default() += 1;

            let difficulty = by_difficulty.entry(outcome.difficulty.clone()).or_default();
            difficulty.total += 1;
            if outcome.is_success() {
                difficulty.passed += 1;
            }

            let kind = by_kind.entry(outcome.result_kind.clone()).or_default();
            kind.total += 1;
            if outcome.is_success() {
                kind.passed += 1;
            }
        }

        Self {
            total,
            passed,
            failed: total - passed,
            pass_rate: if total > 0 {
                passed as f64 / total as f64
            } else {
                0.0
            },
            by_status,
            by_difficulty,
            by_kind,
            total_duration: outcomes.iter().map(|o| o.duration).sum(),
            generated_at: Utc::now(),
        }
    }

    /// Renders the summary for the console.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Results: {}/{} passed ({:.1}%)\n",
            self.passed,
            self.total,
            self.pass_rate * 100.0
        ));

        if !self.by_status.is_empty() {
            out.push_str("By status:\n");
            for (status, count) in &self.by_status {
                out.push_str(&format!("  {:<20} {}\n", status, count));
            }
        }
        if !self.by_difficulty.is_empty() {
            out.push_str("By difficulty:\n");
            for (difficulty, b) in &self.by_difficulty {
                out.push_str(&format!("  {:<20} {}/{}\n", difficulty, b.passed, b.total));
            }
        }
        if !self.by_kind.is_empty() {
            out.push_str("By result kind:\n");
            for (kind, b) in &self.by_kind {
                out.push_str(&format!("  {:<20} {}/{}\n", kind, b.passed, b.total));
            }
        }
        out
    }
}

/// Writes a run's artifacts under a timestamped directory: one JSON record
/// per task, the extracted scripts, and a summary.
pub struct ReportWriter {
    run_dir: PathBuf,
    scripts_dir: PathBuf,
}

impl ReportWriter {
    /// Creates the run directory and its scripts subdirectory.
    ///
    /// # Errors
    ///
    /// Returns `ReportError::Io` when the directories cannot be created.
    pub fn create(base: &Path) -> Result<Self, ReportError> {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let run_dir = base.join(format!("run_{}", stamp));
        let scripts_dir = run_dir.join("scripts");
        fs::create_dir_all(&scripts_dir)?;

        info!("Writing results to {}", run_dir.display());
        Ok(Self {
            run_dir,
            scripts_dir,
        })
    }

    /// The run's output directory.
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Archives an extracted script; returns its path relative to the run
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns `ReportError::Io` when the file cannot be written.
    pub fn write_script(&self, task_id: &str, script: &str) -> Result<String, ReportError> {
        let name = format!("{}.py", task_id);
        fs::write(self.scripts_dir.join(&name), script)?;
        Ok(format!("scripts/{}", name))
    }

    /// Writes one task's outcome record as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns `ReportError` when serialization or the write fails.
    pub fn write_outcome(&self, record: &OutcomeRecord) -> Result<PathBuf, ReportError> {
        let path = self.run_dir.join(format!("{}.json", record.task_id));
        let json = serde_json::to_string_pretty(record)?;
        fs::write(&path, json)?;
        debug!("Saved result to {}", path.display());
        Ok(path)
    }

    /// Writes the aggregated run summary.
    ///
    /// # Errors
    ///
    /// Returns `ReportError` when serialization or the write fails.
    pub fn write_summary(&self, summary: &RunSummary) -> Result<PathBuf, ReportError> {
        let path = self.run_dir.join("summary.json");
        let json = serde_json::to_string_pretty(summary)?;
        fs::write(&path, json)?;
        Ok(path)
    }
}

/// Truncates a string to a maximum length without splitting a character.
fn truncate_string(s: String, max_len: usize) -> String {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated]", &s[..end])
}
