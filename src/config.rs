//! Pipeline configuration for the benchmark harness.
//!
//! This module provides configuration options for the task execution
//! pipeline, including timeouts, interpreter selection, staging directories,
//! evaluation tolerance, and concurrency limits. The config is an explicit
//! object handed to the pipeline at construction; there is no global state.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for the task execution pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Staging settings
    /// Base directory holding task input files referenced by task specs.
    pub files_dir: PathBuf,
    /// Directory under which execution environments are created.
    /// Defaults to the system temp directory when `None`.
    pub work_root: Option<PathBuf>,
    /// Preserve environment directories after the run, for debugging.
    pub keep_environments: bool,

    // Interpreter settings
    /// Python interpreter used to create virtualenvs and run companion scripts.
    pub python_bin: String,

    // Timeout settings
    /// Wall-clock timeout for solution script execution. Tasks may override it.
    pub script_timeout: Duration,
    /// Timeout for each external package-manager call.
    pub install_timeout: Duration,

    // Installation policy
    /// Treat any single package installation failure as fatal for the task.
    pub fail_fast_install: bool,
    /// Prefix apt invocations with sudo.
    pub use_sudo: bool,

    // Evaluation settings
    /// Tolerance for float comparisons when the task does not specify one.
    pub numeric_epsilon: f64,

    // Capture settings
    /// Per-stream cap on captured subprocess output, in bytes.
    pub max_output_bytes: usize,

    // Concurrency settings
    /// Maximum number of tasks to run concurrently.
    pub max_concurrent_tasks: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            // Staging defaults
            files_dir: PathBuf::from("files"),
            work_root: None,
            keep_environments: false,

            // Interpreter defaults
            python_bin: "python3".to_string(),

            // Timeout defaults
            script_timeout: Duration::from_secs(60),
            install_timeout: Duration::from_secs(300),

            // Installation defaults
            fail_fast_install: false,
            use_sudo: true,

            // Evaluation defaults
            numeric_epsilon: 1e-9,

            // Capture defaults
            max_output_bytes: 1024 * 1024,

            // Concurrency defaults
            max_concurrent_tasks: 1,
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SOLVEBENCH_FILES_DIR`: Base directory for task input files (default: files)
    /// - `SOLVEBENCH_WORK_ROOT`: Directory for execution environments (default: system temp)
    /// - `SOLVEBENCH_KEEP_ENVIRONMENTS`: Preserve environments after runs (default: false)
    /// - `SOLVEBENCH_PYTHON_BIN`: Python interpreter (default: python3)
    /// - `SOLVEBENCH_SCRIPT_TIMEOUT_SECS`: Script execution timeout in seconds (default: 60)
    /// - `SOLVEBENCH_INSTALL_TIMEOUT_SECS`: Per-package install timeout in seconds (default: 300)
    /// - `SOLVEBENCH_FAIL_FAST_INSTALL`: Escalate install failures immediately (default: false)
    /// - `SOLVEBENCH_USE_SUDO`: Run apt under sudo (default: true)
    /// - `SOLVEBENCH_NUMERIC_EPSILON`: Default float tolerance (default: 1e-9)
    /// - `SOLVEBENCH_MAX_OUTPUT_BYTES`: Per-stream capture cap (default: 1048576)
    /// - `SOLVEBENCH_MAX_CONCURRENT_TASKS`: Concurrent task limit (default: 1)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Staging settings
        if let Ok(val) = std::env::var("SOLVEBENCH_FILES_DIR") {
            config.files_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("SOLVEBENCH_WORK_ROOT") {
            config.work_root = Some(PathBuf::from(val));
        }

        if let Ok(val) = std::env::var("SOLVEBENCH_KEEP_ENVIRONMENTS") {
            config.keep_environments = parse_env_bool(&val, "SOLVEBENCH_KEEP_ENVIRONMENTS")?;
        }

        // Interpreter settings
        if let Ok(val) = std::env::var("SOLVEBENCH_PYTHON_BIN") {
            config.python_bin = val;
        }

        // Timeout settings
        if let Ok(val) = std::env::var("SOLVEBENCH_SCRIPT_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "SOLVEBENCH_SCRIPT_TIMEOUT_SECS")?;
            config.script_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("SOLVEBENCH_INSTALL_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "SOLVEBENCH_INSTALL_TIMEOUT_SECS")?;
            config.install_timeout = Duration::from_secs(secs);
        }

        // Installation settings
        if let Ok(val) = std::env::var("SOLVEBENCH_FAIL_FAST_INSTALL") {
            config.fail_fast_install = parse_env_bool(&val, "SOLVEBENCH_FAIL_FAST_INSTALL")?;
        }

        if let Ok(val) = std::env::var("SOLVEBENCH_USE_SUDO") {
            config.use_sudo = parse_env_bool(&val, "SOLVEBENCH_USE_SUDO")?;
        }

        // Evaluation settings
        if let Ok(val) = std::env::var("SOLVEBENCH_NUMERIC_EPSILON") {
            config.numeric_epsilon = parse_env_value(&val, "SOLVEBENCH_NUMERIC_EPSILON")?;
        }

        // Capture settings
        if let Ok(val) = std::env::var("SOLVEBENCH_MAX_OUTPUT_BYTES") {
            config.max_output_bytes = parse_env_value(&val, "SOLVEBENCH_MAX_OUTPUT_BYTES")?;
        }

        // Concurrency settings
        if let Ok(val) = std::env::var("SOLVEBENCH_MAX_CONCURRENT_TASKS") {
            config.max_concurrent_tasks = parse_env_value(&val, "SOLVEBENCH_MAX_CONCURRENT_TASKS")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.python_bin.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "python_bin cannot be empty".to_string(),
            ));
        }

        if self.script_timeout.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "script_timeout must be greater than 0".to_string(),
            ));
        }

        if self.install_timeout.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "install_timeout must be greater than 0".to_string(),
            ));
        }

        if self.numeric_epsilon < 0.0 {
            return Err(ConfigError::ValidationFailed(
                "numeric_epsilon cannot be negative".to_string(),
            ));
        }

        if self.max_output_bytes == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_output_bytes must be greater than 0".to_string(),
            ));
        }

        if self.max_concurrent_tasks == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_tasks must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Resolves the directory under which environments are created.
    pub fn resolved_work_root(&self) -> PathBuf {
        self.work_root
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Builder method to set the task files directory.
    pub fn with_files_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.files_dir = dir.into();
        self
    }

    /// Builder method to set the environment work root.
    pub fn with_work_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_root = Some(dir.into());
        self
    }

    /// Builder method to preserve environments after runs.
    pub fn with_keep_environments(mut self, keep: bool) -> Self {
        self.keep_environments = keep;
        self
    }

    /// Builder method to set the Python interpreter.
    pub fn with_python_bin(mut self, bin: impl Into<String>) -> Self {
        self.python_bin = bin.into();
        self
    }

    /// Builder method to set the script execution timeout.
    pub fn with_script_timeout(mut self, timeout: Duration) -> Self {
        self.script_timeout = timeout;
        self
    }

    /// Builder method to set the per-package install timeout.
    pub fn with_install_timeout(mut self, timeout: Duration) -> Self {
        self.install_timeout = timeout;
        self
    }

    /// Builder method to escalate install failures immediately.
    pub fn with_fail_fast_install(mut self, fail_fast: bool) -> Self {
        self.fail_fast_install = fail_fast;
        self
    }

    /// Builder method to toggle sudo for apt invocations.
    pub fn with_use_sudo(mut self, use_sudo: bool) -> Self {
        self.use_sudo = use_sudo;
        self
    }

    /// Builder method to set the default numeric tolerance.
    pub fn with_numeric_epsilon(mut self, epsilon: f64) -> Self {
        self.numeric_epsilon = epsilon;
        self
    }

    /// Builder method to set the per-stream output capture cap.
    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    /// Builder method to set max concurrent tasks.
    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.files_dir, PathBuf::from("files"));
        assert!(config.work_root.is_none());
        assert!(!config.keep_environments);
        assert_eq!(config.python_bin, "python3");
        assert_eq!(config.script_timeout, Duration::from_secs(60));
        assert_eq!(config.install_timeout, Duration::from_secs(300));
        assert!(!config.fail_fast_install);
        assert!(config.use_sudo);
        assert!((config.numeric_epsilon - 1e-9).abs() < f64::EPSILON);
        assert_eq!(config.max_output_bytes, 1024 * 1024);
        assert_eq!(config.max_concurrent_tasks, 1);
    }

    #[test]
    fn test_config_builder() {
        let config = PipelineConfig::new()
            .with_files_dir("/data/files")
            .with_work_root("/tmp/bench")
            .with_keep_environments(true)
            .with_python_bin("python3.12")
            .with_script_timeout(Duration::from_secs(120))
            .with_install_timeout(Duration::from_secs(60))
            .with_fail_fast_install(true)
            .with_use_sudo(false)
            .with_numeric_epsilon(0.001)
            .with_max_output_bytes(4096)
            .with_max_concurrent_tasks(8);

        assert_eq!(config.files_dir, PathBuf::from("/data/files"));
        assert_eq!(config.work_root, Some(PathBuf::from("/tmp/bench")));
        assert!(config.keep_environments);
        assert_eq!(config.python_bin, "python3.12");
        assert_eq!(config.script_timeout, Duration::from_secs(120));
        assert_eq!(config.install_timeout, Duration::from_secs(60));
        assert!(config.fail_fast_install);
        assert!(!config.use_sudo);
        assert!((config.numeric_epsilon - 0.001).abs() < f64::EPSILON);
        assert_eq!(config.max_output_bytes, 4096);
        assert_eq!(config.max_concurrent_tasks, 8);
    }

    #[test]
    fn test_validation_valid_config() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_empty_python_bin() {
        let config = PipelineConfig::default().with_python_bin("");
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("python_bin"));
    }

    #[test]
    fn test_validation_zero_script_timeout() {
        let config = PipelineConfig::default().with_script_timeout(Duration::from_secs(0));
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("script_timeout"));
    }

    #[test]
    fn test_validation_zero_install_timeout() {
        let config = PipelineConfig::default().with_install_timeout(Duration::from_secs(0));
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("install_timeout"));
    }

    #[test]
    fn test_validation_negative_epsilon() {
        let config = PipelineConfig::default().with_numeric_epsilon(-1.0);
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("numeric_epsilon"));
    }

    #[test]
    fn test_validation_zero_output_cap() {
        let config = PipelineConfig::default().with_max_output_bytes(0);
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("max_output_bytes"));
    }

    #[test]
    fn test_validation_zero_concurrency() {
        let config = PipelineConfig::default().with_max_concurrent_tasks(0);
        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("max_concurrent_tasks"));
    }

    #[test]
    fn test_resolved_work_root_defaults_to_temp() {
        let config = PipelineConfig::default();
        assert_eq!(config.resolved_work_root(), std::env::temp_dir());

        let config = config.with_work_root("/var/bench");
        assert_eq!(config.resolved_work_root(), PathBuf::from("/var/bench"));
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("true", "test").unwrap());
        assert!(parse_env_bool("1", "test").unwrap());
        assert!(parse_env_bool("yes", "test").unwrap());
        assert!(parse_env_bool("on", "test").unwrap());
        assert!(parse_env_bool("TRUE", "test").unwrap());

        assert!(!parse_env_bool("false", "test").unwrap());
        assert!(!parse_env_bool("0", "test").unwrap());
        assert!(!parse_env_bool("no", "test").unwrap());
        assert!(!parse_env_bool("off", "test").unwrap());

        assert!(parse_env_bool("invalid", "test").is_err());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            key: "KEY".to_string(),
            message: "bad value".to_string(),
        };
        assert!(err.to_string().contains("KEY"));
        assert!(err.to_string().contains("bad value"));

        let err = ConfigError::ValidationFailed("test failure".to_string());
        assert!(err.to_string().contains("test failure"));
    }
}
