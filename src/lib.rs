//! solvebench: Task execution pipeline for scoring model-written solutions.
//!
//! This library runs benchmark tasks end to end: extracting a Python script
//! and its dependencies from a model response, provisioning an isolated
//! environment, installing packages, executing under a deadline, and
//! evaluating the output against the task's expected result.

// Core modules
pub mod cli;
pub mod config;
pub mod env;
pub mod eval;
pub mod exec;
pub mod extract;
pub mod install;
pub mod pipeline;
pub mod report;
pub mod task;

// Re-export commonly used error types
pub use config::ConfigError;
pub use env::EnvError;
pub use exec::ExecError;
pub use extract::ExtractionError;
pub use install::InstallError;
pub use report::ReportError;
pub use task::TaskError;

// Re-export the primary pipeline surface
pub use config::PipelineConfig;
pub use pipeline::{Pipeline, PipelineState};
pub use report::{OutcomeRecord, RunSummary, TaskStatus};
pub use task::{ExpectedResult, TaskSpec};
