//! The task execution pipeline.
//!
//! Runs one attempt end to end: extract the script from the model response,
//! provision an isolated environment, install declared dependencies,
//! execute under a deadline, evaluate the output, and tear the environment
//! down. Teardown runs on every path that got far enough to own an
//! environment; an attempt can fail, but it cannot leak.
//!
//! `run_task` is infallible on purpose: every failure mode is a terminal
//! [`TaskStatus`] inside the returned [`OutcomeRecord`], so one broken task
//! never takes down a batch.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::env::{EnvironmentManager, ExecutionEnvironment};
use crate::eval::Evaluator;
use crate::exec::{execute_script, ExecutionResult};
use crate::extract::{extract_solution, ExtractedSolution, SolutionSource};
use crate::install::{failure_excerpt, InstallReport, Installer};
use crate::report::{OutcomeRecord, TaskStatus};
use crate::task::TaskSpec;

/// Progress of one attempt through the pipeline. Logged on every
/// transition; the terminal outcome lives in [`TaskStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Pending,
    Extracting,
    Provisioning,
    Installing,
    Executing,
    Evaluating,
    CleaningUp,
    Done,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineState::Pending => write!(f, "pending"),
            PipelineState::Extracting => write!(f, "extracting"),
            PipelineState::Provisioning => write!(f, "provisioning"),
            PipelineState::Installing => write!(f, "installing"),
            PipelineState::Executing => write!(f, "executing"),
            PipelineState::Evaluating => write!(f, "evaluating"),
            PipelineState::CleaningUp => write!(f, "cleaning_up"),
            PipelineState::Done => write!(f, "done"),
        }
    }
}

/// Coordinates the full extract/provision/install/execute/evaluate cycle.
pub struct Pipeline {
    config: PipelineConfig,
    environments: EnvironmentManager,
    installer: Installer,
    evaluator: Evaluator,
    concurrency_limiter: Arc<Semaphore>,
}

impl Pipeline {
    /// Creates a pipeline from a validated configuration.
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            environments: EnvironmentManager::new(&config),
            installer: Installer::new(&config),
            evaluator: Evaluator::new(&config),
            concurrency_limiter: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
            config,
        }
    }

    /// The pipeline's configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs one task attempt against one model response.
    ///
    /// Always produces a record; failures surface as terminal statuses, not
    /// errors. The environment, if one was provisioned, is gone by the time
    /// this returns (unless `keep_environments` is set).
    pub async fn run_task(&self, task: &TaskSpec, source: &SolutionSource) -> OutcomeRecord {
        let start = Instant::now();
        debug!("Task '{}' -> {}", task.id, PipelineState::Pending);

        let _permit = match self.concurrency_limiter.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                error!("Failed to acquire concurrency permit: {}", e);
                return OutcomeRecord::new(
                    task,
                    TaskStatus::ExecutionError,
                    format!("Failed to acquire concurrency permit: {}", e),
                    start.elapsed(),
                );
            }
        };

        info!("Running task '{}' ({})", task.id, task.result.kind());

        // Extraction is pure; when it fails, no environment has been
        // touched and none must be cleaned up.
        debug!("Task '{}' -> {}", task.id, PipelineState::Extracting);
        let solution = match extract_solution(source) {
            Ok(solution) => solution,
            Err(e) => {
                warn!("Task '{}': {}", task.id, e);
                return OutcomeRecord::new(
                    task,
                    TaskStatus::ExtractionError,
                    e.to_string(),
                    start.elapsed(),
                );
            }
        };

        debug!("Task '{}' -> {}", task.id, PipelineState::Provisioning);
        let mut env = match self.environments.provision(task).await {
            Ok(env) => env,
            Err(e) => {
                error!("Task '{}': {}", task.id, e);
                return OutcomeRecord::new(
                    task,
                    TaskStatus::ProvisioningError,
                    e.to_string(),
                    start.elapsed(),
                );
            }
        };

        // Past this point the attempt owns an environment. The stage logic
        // is factored out so this is the single exit where teardown runs.
        let record = self.run_provisioned(task, &solution, &mut env, start).await;

        debug!("Task '{}' -> {}", task.id, PipelineState::CleaningUp);
        env.teardown().await;
        debug!("Task '{}' -> {}", task.id, PipelineState::Done);

        info!(
            "Task '{}' finished with status {} in {:?}",
            task.id, record.status, record.duration
        );
        record
    }

    /// The stages that run inside a provisioned environment. Returns the
    /// outcome record; the caller owns teardown.
    async fn run_provisioned(
        &self,
        task: &TaskSpec,
        solution: &ExtractedSolution,
        env: &mut ExecutionEnvironment,
        start: Instant,
    ) -> OutcomeRecord {
        if let Err(e) = self.environments.create_venv(env).await {
            error!("Task '{}': {}", task.id, e);
            return OutcomeRecord::new(
                task,
                TaskStatus::ProvisioningError,
                e.to_string(),
                start.elapsed(),
            );
        }

        if let Err(e) = self.environments.start_companion(env, task).await {
            error!("Task '{}': {}", task.id, e);
            return OutcomeRecord::new(
                task,
                TaskStatus::ProvisioningError,
                e.to_string(),
                start.elapsed(),
            );
        }

        debug!("Task '{}' -> {}", task.id, PipelineState::Installing);
        let install = match self.installer.install(env, solution).await {
            Ok(report) => report,
            Err(e) => {
                warn!("Task '{}': {}", task.id, e);
                return OutcomeRecord::new(
                    task,
                    TaskStatus::InstallError,
                    e.to_string(),
                    start.elapsed(),
                );
            }
        };

        self.wait_for_companion(task, env).await;

        debug!("Task '{}' -> {}", task.id, PipelineState::Executing);
        let timeout = task.execution_timeout(&self.config);
        let execution = match execute_script(
            env,
            &solution.script,
            timeout,
            self.config.max_output_bytes,
        )
        .await
        {
            Ok(execution) => execution,
            Err(e) => {
                error!("Task '{}': {}", task.id, e);
                let record = OutcomeRecord::new(
                    task,
                    TaskStatus::ExecutionError,
                    e.to_string(),
                    start.elapsed(),
                );
                return attach_install(record, install);
            }
        };

        if execution.timed_out {
            warn!(
                "Task '{}' timed out after {:?}",
                task.id, execution.duration
            );
            let record = OutcomeRecord::new(
                task,
                TaskStatus::Timeout,
                format!("script exceeded {}s deadline", timeout.as_secs()),
                start.elapsed(),
            )
            .with_execution(&execution);
            return attach_install(record, install);
        }

        if !execution.is_success() {
            let (status, detail) = classify_script_failure(&install, &execution);
            warn!("Task '{}': {}", task.id, detail);
            let record = OutcomeRecord::new(task, status, detail, start.elapsed())
                .with_execution(&execution);
            return attach_install(record, install);
        }

        debug!("Task '{}' -> {}", task.id, PipelineState::Evaluating);
        let verdict = self.evaluator.evaluate(task, env, &execution).await;
        let status = if verdict.passed {
            TaskStatus::Success
        } else {
            TaskStatus::Mismatch
        };

        let record = OutcomeRecord::new(task, status, verdict.detail.clone(), start.elapsed())
            .with_verdict(&verdict)
            .with_execution(&execution);
        attach_install(record, install)
    }

    /// Runs a batch of attempts, bounded by `max_concurrent_tasks`.
    pub async fn run_batch(&self, work: &[(TaskSpec, SolutionSource)]) -> Vec<OutcomeRecord> {
        let total = work.len();
        info!("Running {} tasks", total);

        let futures: Vec<_> = work
            .iter()
            .enumerate()
            .map(|(index, (task, source))| async move {
                info!("[{}/{}] Task '{}'", index + 1, total, task.id);
                self.run_task(task, source).await
            })
            .collect();

        futures::future::join_all(futures).await
    }

    /// Sleeps out whatever remains of the task's companion wait, so the
    /// companion (e.g. a local server) is ready before the solution runs.
    /// Time spent installing packages counts toward the wait.
    async fn wait_for_companion(&self, task: &TaskSpec, env: &ExecutionEnvironment) {
        let wait = task.wait_duration();
        if wait.is_zero() {
            return;
        }

        let remaining = env.remaining_companion_wait(wait);
        if remaining.is_zero() {
            debug!("Companion wait for task '{}' already elapsed", task.id);
            return;
        }

        info!(
            "Waiting {:?} for companion of task '{}'",
            remaining, task.id
        );
        tokio::time::sleep(remaining).await;
    }
}

/// Decides whether a failed script traces back to failed installs. A script
/// that dies on a missing import after some requested package could not be
/// installed is the installer's fault, not the script's.
fn classify_script_failure(
    install: &InstallReport,
    execution: &ExecutionResult,
) -> (TaskStatus, String) {
    let import_failure = execution.stderr.contains("ModuleNotFoundError")
        || execution.stderr.contains("ImportError");

    if import_failure && !install.all_ok() {
        let names: Vec<&str> = install
            .failed()
            .iter()
            .map(|outcome| outcome.name.as_str())
            .collect();
        return (
            TaskStatus::InstallError,
            format!("missing dependency after failed install: {}", names.join(", ")),
        );
    }

    let detail = match execution.exit_code {
        Some(code) => format!(
            "script exited with code {}: {}",
            code,
            failure_excerpt(execution)
        ),
        None => "script killed by signal".to_string(),
    };
    (TaskStatus::ExecutionError, detail)
}

/// Attaches the install report only when packages were actually requested.
fn attach_install(record: OutcomeRecord, install: InstallReport) -> OutcomeRecord {
    if install.is_empty() {
        record
    } else {
        record.with_install(install)
    }
}
