//! Execution environments for running extracted solutions.
//!
//! Each task attempt gets a disposable environment: a uniquely-named
//! directory under the work root, a private virtualenv inside it, staged
//! copies of the task's input files, and any companion background process
//! the task declares. The environment owns everything written during its
//! lifetime and is torn down on every exit path; dropping an active
//! environment removes it as a last resort.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::task::{ExpectedResult, TaskSpec};

/// Errors that can occur while provisioning an environment.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The environment directory could not be created.
    #[error("Failed to create environment: {0}")]
    Create(String),

    /// An input file could not be staged.
    #[error("Failed to stage '{path}': {message}")]
    Staging { path: String, message: String },

    /// Virtualenv creation failed or timed out.
    #[error("Virtualenv creation failed: {0}")]
    Venv(String),

    /// A companion script could not be spawned.
    #[error("Companion script failed to start: {0}")]
    Companion(String),

    /// IO error during provisioning.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A companion background process owned by an environment.
struct Companion {
    name: String,
    child: Child,
}

/// An isolated, disposable execution environment for one task attempt.
pub struct ExecutionEnvironment {
    /// Unique identifier, also the directory name under the work root.
    pub id: String,
    root: PathBuf,
    venv_dir: PathBuf,
    companions: Vec<Companion>,
    companion_started: Option<Instant>,
    created_at: Instant,
    keep: bool,
    active: bool,
}

impl ExecutionEnvironment {
    /// The environment's working directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The virtualenv directory inside the environment.
    pub fn venv_dir(&self) -> &Path {
        &self.venv_dir
    }

    /// The Python interpreter inside the virtualenv.
    pub fn venv_python(&self) -> PathBuf {
        self.venv_dir.join("bin").join("python")
    }

    /// The pip executable inside the virtualenv.
    pub fn venv_pip(&self) -> PathBuf {
        self.venv_dir.join("bin").join("pip")
    }

    /// Returns true until teardown has run.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// How much of the task's companion wait is still outstanding.
    ///
    /// Counted from companion start (or environment creation when no
    /// companion was launched), so time spent installing packages is
    /// credited against the wait.
    pub fn remaining_companion_wait(&self, wait: Duration) -> Duration {
        let reference = self.companion_started.unwrap_or(self.created_at);
        wait.saturating_sub(reference.elapsed())
    }

    /// Tears the environment down: stops companion processes and removes
    /// the directory tree. Idempotent; removal failure is logged, never
    /// escalated. With `keep_environments` set, the directory survives for
    /// debugging and only the processes are stopped.
    pub async fn teardown(&mut self) {
        if !self.active {
            return;
        }

        for companion in &mut self.companions {
            stop_companion(&companion.name, &mut companion.child).await;
        }
        self.companions.clear();

        if self.keep {
            info!("Preserving environment {} at {}", self.id, self.root.display());
        } else if let Err(e) = std::fs::remove_dir_all(&self.root) {
            if self.root.exists() {
                warn!("Failed to remove environment {}: {}", self.root.display(), e);
            }
        }

        self.active = false;
    }
}

impl Drop for ExecutionEnvironment {
    fn drop(&mut self) {
        if self.active {
            warn!("Environment {} dropped without teardown", self.id);
            // Companion children carry kill_on_drop; the directory is the
            // only resource left to release here.
            if !self.keep {
                let _ = std::fs::remove_dir_all(&self.root);
            }
        }
    }
}

/// Stop one companion process, TERM first and KILL if it lingers.
async fn stop_companion(name: &str, child: &mut Child) {
    if let Some(pid) = child.id() {
        info!("Stopping companion script '{}' (pid {})", name, pid);
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!("Companion '{}' ignored SIGTERM, killing", name);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill companion '{}': {}", name, e);
                }
            }
        }
    }
}

/// Creates and populates execution environments.
pub struct EnvironmentManager {
    config: PipelineConfig,
}

impl EnvironmentManager {
    /// Creates a new manager using the given configuration.
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Provisions a fresh environment for a task: unique directory plus
    /// staged input files. The virtualenv is created separately by
    /// [`create_venv`](Self::create_venv).
    ///
    /// # Errors
    ///
    /// Returns `EnvError` when the directory cannot be created or a staging
    /// copy fails partway. A missing source file is logged, not fatal; the
    /// evaluator reports the missing artifact later.
    pub async fn provision(&self, task: &TaskSpec) -> Result<ExecutionEnvironment, EnvError> {
        let id = format!("solvebench-{}-{}", task.id, Uuid::new_v4());
        let root = self.config.resolved_work_root().join(&id);

        std::fs::create_dir_all(&root)
            .map_err(|e| EnvError::Create(format!("{}: {}", root.display(), e)))?;

        info!("Provisioned environment {} at {}", id, root.display());

        let env = ExecutionEnvironment {
            id,
            venv_dir: root.join("venv"),
            root,
            companions: Vec::new(),
            companion_started: None,
            created_at: Instant::now(),
            keep: self.config.keep_environments,
            active: true,
        };

        self.stage_task_inputs(task, &env)?;
        Ok(env)
    }

    /// Creates the environment's private virtualenv.
    ///
    /// # Errors
    ///
    /// Returns `EnvError::Venv` when the interpreter is missing, exits
    /// nonzero, or exceeds the install timeout.
    pub async fn create_venv(&self, env: &ExecutionEnvironment) -> Result<(), EnvError> {
        debug!(
            "Creating virtualenv: {} -m venv {}",
            self.config.python_bin,
            env.venv_dir().display()
        );

        let mut command = Command::new(&self.config.python_bin);
        command
            .arg("-m")
            .arg("venv")
            .arg(env.venv_dir())
            .stdin(Stdio::null());

        let output = tokio::time::timeout(self.config.install_timeout, command.output())
            .await
            .map_err(|_| {
                EnvError::Venv(format!(
                    "timed out after {}s",
                    self.config.install_timeout.as_secs()
                ))
            })?
            .map_err(|e| EnvError::Venv(format!("{}: {}", self.config.python_bin, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EnvError::Venv(stderr.trim().to_string()));
        }

        debug!("Virtualenv ready at {}", env.venv_dir().display());
        Ok(())
    }

    /// Starts the task's companion script in the background, if it has one.
    ///
    /// The companion runs under the system interpreter from its own source
    /// directory, with its output streamed into the log. A missing script
    /// file is logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns `EnvError::Companion` when the spawn itself fails.
    pub async fn start_companion(
        &self,
        env: &mut ExecutionEnvironment,
        task: &TaskSpec,
    ) -> Result<(), EnvError> {
        let Some(script) = &task.task_script else {
            return Ok(());
        };

        let source = self.resolve_input(script);
        if !source.exists() {
            warn!("Companion script does not exist: {}", source.display());
            return Ok(());
        }

        let script_dir = source
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.files_dir.clone());

        let mut command = Command::new(&self.config.python_bin);
        command
            .arg(&source)
            .current_dir(&script_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| EnvError::Companion(format!("{}: {}", source.display(), e)))?;

        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| script.clone());

        info!(
            "Started companion script '{}' (pid {:?})",
            name,
            child.id()
        );

        if let Some(stdout) = child.stdout.take() {
            stream_companion_output(name.clone(), stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            stream_companion_output(name.clone(), stderr);
        }

        env.companion_started.get_or_insert_with(Instant::now);
        env.companions.push(Companion { name, child });
        Ok(())
    }

    /// Copies the task's declared inputs into the environment.
    fn stage_task_inputs(
        &self,
        task: &TaskSpec,
        env: &ExecutionEnvironment,
    ) -> Result<(), EnvError> {
        if let Some(folder) = &task.task_folder {
            let source = self.resolve_input(folder);
            if source.exists() {
                let destination = env.root().join(folder.trim_matches('/'));
                debug!(
                    "Staging folder {} -> {}",
                    source.display(),
                    destination.display()
                );
                copy_dir_atomic(&source, &destination).map_err(|e| EnvError::Staging {
                    path: folder.clone(),
                    message: e.to_string(),
                })?;
            } else {
                warn!("Task folder does not exist: {}", source.display());
            }
        }

        if let Some(file) = &task.task_file {
            self.stage_flat_file(file, env)?;
        }

        match &task.result {
            ExpectedResult::ClassificationMatch {
                ground_truth_file, ..
            } => self.stage_flat_file(ground_truth_file, env)?,
            ExpectedResult::ScriptRun { script_file } => self.stage_flat_file(script_file, env)?,
            _ => {}
        }

        Ok(())
    }

    /// Stages one file into the environment root under its bare file name.
    fn stage_flat_file(&self, relative: &str, env: &ExecutionEnvironment) -> Result<(), EnvError> {
        let source = self.resolve_input(relative);
        if !source.exists() {
            warn!("Task input does not exist: {}", source.display());
            return Ok(());
        }

        let Some(file_name) = Path::new(relative).file_name() else {
            warn!("Task input has no file name: {}", relative);
            return Ok(());
        };

        let destination = env.root().join(file_name);
        debug!(
            "Staging file {} -> {}",
            source.display(),
            destination.display()
        );
        copy_file_atomic(&source, &destination).map_err(|e| EnvError::Staging {
            path: relative.to_string(),
            message: e.to_string(),
        })
    }

    fn resolve_input(&self, relative: &str) -> PathBuf {
        self.config.files_dir.join(relative.trim_matches('/'))
    }
}

/// Stream a companion process pipe into the log, line by line.
fn stream_companion_output<R>(name: String, pipe: R)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!("task_script[{}]: {}", name, line);
        }
    });
}

/// Copies a file so that a partially written copy never appears under its
/// final name: write to a staging name in the destination directory, then
/// rename into place.
fn copy_file_atomic(src: &Path, dst: &Path) -> std::io::Result<()> {
    let dir = dst.parent().unwrap_or_else(|| Path::new("."));
    let file_name = dst
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "staged".to_string());
    let staging = dir.join(format!(
        ".{}.staging-{}",
        file_name,
        Uuid::new_v4().as_simple()
    ));

    if let Err(e) = std::fs::copy(src, &staging) {
        let _ = std::fs::remove_file(&staging);
        return Err(e);
    }
    if let Err(e) = std::fs::rename(&staging, dst) {
        let _ = std::fs::remove_file(&staging);
        return Err(e);
    }
    Ok(())
}

/// Recursively copies a directory, staging each file atomically.
fn copy_dir_atomic(src: &Path, dst: &Path) -> std::io::Result<()> {
    if !dst.exists() {
        std::fs::create_dir_all(dst)?;
    }

    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let path = entry.path();
        let dest_path = dst.join(entry.file_name());

        if path.is_dir() {
            copy_dir_atomic(&path, &dest_path)?;
        } else {
            copy_file_atomic(&path, &dest_path)?;
        }
    }

    Ok(())
}
