//! Task definitions for the benchmark harness.
//!
//! Tasks are loaded from YAML or JSON files. Each file describes one task:
//! its difficulty, optional staged input files, an optional companion script,
//! the task text shown to the model, and the expected result the evaluator
//! checks against. The task id is derived from the definition file name.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::PipelineConfig;

/// Errors that can occur while loading task definitions.
#[derive(Debug, Error)]
pub enum TaskError {
    /// IO error while reading a task file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The task file could not be parsed.
    #[error("Failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    /// The task file path has no usable stem for an id.
    #[error("Invalid task file path: {path}")]
    InvalidPath { path: String },

    /// A task specifies both a task_file and a task_folder.
    #[error("Task '{id}' specifies both task_file and task_folder")]
    ConflictingInputs { id: String },

    /// A classification threshold outside [0, 1].
    #[error("Task '{id}' has invalid threshold {value}")]
    InvalidThreshold { id: String, value: f64 },

    /// No task with the requested id exists.
    #[error("Task '{0}' not found")]
    NotFound(String),
}

/// The expected result of a task, selecting the evaluation strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExpectedResult {
    /// A numeric value parsed from the solution's stdout.
    Numerical {
        amount: f64,
        /// Comparison tolerance. When absent, integral amounts compare
        /// exactly and fractional amounts use the configured epsilon.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tolerance: Option<f64>,
    },

    /// A string answer announced via an `ANSWER=` marker in stdout.
    StringAnswer {
        expected_string: String,
        #[serde(default = "default_case_sensitive")]
        case_sensitive: bool,
    },

    /// A predictions file compared row-by-row against a ground truth file.
    ClassificationMatch {
        ground_truth_file: String,
        /// Name of the file the solution must produce. Defaults to the
        /// staged task_file name.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        predictions_file: Option<String>,
        /// Minimum agreement score. When absent, full agreement is required.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        threshold: Option<f64>,
    },

    /// A checker script run against the environment; exit code 0 passes.
    ScriptRun { script_file: String },
}

fn default_case_sensitive() -> bool {
    true
}

impl ExpectedResult {
    /// Short kind name used in logs and report breakdowns.
    pub fn kind(&self) -> &'static str {
        match self {
            ExpectedResult::Numerical { .. } => "numerical",
            ExpectedResult::StringAnswer { .. } => "string_answer",
            ExpectedResult::ClassificationMatch { .. } => "classification_match",
            ExpectedResult::ScriptRun { .. } => "script_run",
        }
    }
}

/// The task text shown to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescription {
    pub description: String,
}

/// Specification for one benchmark task, immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Unique identifier, derived from the definition file stem.
    #[serde(default)]
    pub id: String,
    /// Difficulty rating (e.g. "easy", "medium", "hard").
    pub difficulty: String,
    /// Single input file staged into the environment root, relative to the
    /// configured files directory. Mutually exclusive with `task_folder`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_file: Option<String>,
    /// Input folder staged into the environment under its own name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_folder: Option<String>,
    /// Companion script started in the background before the solution runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_script: Option<String>,
    /// Minimum seconds between companion start and solution execution.
    #[serde(default)]
    pub script_wait_time: u64,
    /// Per-task override of the configured execution timeout, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_timeout: Option<u64>,
    /// The task text shown to the model.
    pub task_specification: TaskDescription,
    /// Expected result and evaluation strategy.
    pub result: ExpectedResult,
}

impl TaskSpec {
    /// Creates a new task specification.
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        result: ExpectedResult,
    ) -> Self {
        Self {
            id: id.into(),
            difficulty: "medium".to_string(),
            task_file: None,
            task_folder: None,
            task_script: None,
            script_wait_time: 0,
            script_timeout: None,
            task_specification: TaskDescription {
                description: description.into(),
            },
            result,
        }
    }

    /// Sets the difficulty.
    pub fn with_difficulty(mut self, difficulty: impl Into<String>) -> Self {
        self.difficulty = difficulty.into();
        self
    }

    /// Sets the staged input file.
    pub fn with_task_file(mut self, file: impl Into<String>) -> Self {
        self.task_file = Some(file.into());
        self
    }

    /// Sets the staged input folder.
    pub fn with_task_folder(mut self, folder: impl Into<String>) -> Self {
        self.task_folder = Some(folder.into());
        self
    }

    /// Sets the companion script.
    pub fn with_task_script(mut self, script: impl Into<String>) -> Self {
        self.task_script = Some(script.into());
        self
    }

    /// Sets the companion wait time in seconds.
    pub fn with_script_wait_time(mut self, seconds: u64) -> Self {
        self.script_wait_time = seconds;
        self
    }

    /// Sets the per-task execution timeout in seconds.
    pub fn with_script_timeout(mut self, seconds: u64) -> Self {
        self.script_timeout = Some(seconds);
        self
    }

    /// The task text shown to the model.
    pub fn description(&self) -> &str {
        &self.task_specification.description
    }

    /// The execution timeout for this task, falling back to the configured one.
    pub fn execution_timeout(&self, config: &PipelineConfig) -> Duration {
        self.script_timeout
            .map(Duration::from_secs)
            .unwrap_or(config.script_timeout)
    }

    /// The companion wait time as a duration.
    pub fn wait_duration(&self) -> Duration {
        Duration::from_secs(self.script_wait_time)
    }

    /// Validates the loaded specification.
    pub fn validate(&self) -> Result<(), TaskError> {
        if self.task_file.is_some() && self.task_folder.is_some() {
            return Err(TaskError::ConflictingInputs {
                id: self.id.clone(),
            });
        }

        if let ExpectedResult::ClassificationMatch {
            threshold: Some(threshold),
            ..
        } = &self.result
        {
            if !(0.0..=1.0).contains(threshold) {
                return Err(TaskError::InvalidThreshold {
                    id: self.id.clone(),
                    value: *threshold,
                });
            }
        }

        Ok(())
    }

    /// Loads a task from a YAML or JSON definition file.
    ///
    /// The task id is the file stem; an `id` field in the file is ignored.
    ///
    /// # Errors
    ///
    /// Returns `TaskError` on IO failure, parse failure, or invalid spec.
    pub fn load_from_file(path: &Path) -> Result<Self, TaskError> {
        let contents = std::fs::read_to_string(path)?;
        let display = path.display().to_string();

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml")
        );

        let mut task: TaskSpec = if is_yaml {
            serde_yaml::from_str(&contents).map_err(|e| TaskError::Parse {
                path: display.clone(),
                message: e.to_string(),
            })?
        } else {
            serde_json::from_str(&contents).map_err(|e| TaskError::Parse {
                path: display.clone(),
                message: e.to_string(),
            })?
        };

        task.id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .ok_or(TaskError::InvalidPath { path: display })?;

        task.validate()?;
        Ok(task)
    }
}

/// Loads every `*.yaml`, `*.yml`, and `*.json` task definition in a
/// directory (non-recursive), sorted by task id.
///
/// # Errors
///
/// Returns `TaskError` if the directory cannot be read or any file fails
/// to load.
pub fn load_tasks(dir: &Path) -> Result<Vec<TaskSpec>, TaskError> {
    let mut paths: Vec<PathBuf> = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let matches = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some(ext) if ["yaml", "yml", "json"]
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        );
        if matches {
            paths.push(path);
        }
    }

    let mut tasks = paths
        .iter()
        .map(|path| TaskSpec::load_from_file(path))
        .collect::<Result<Vec<_>, _>>()?;

    tasks.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(tasks)
}
