//! Checker-script evaluation.
//!
//! The task ships its own verification script; it runs inside the
//! environment under the virtualenv interpreter so it sees everything the
//! solution produced plus any packages the solution installed. Exit code
//! zero means the solution passed.

use std::path::Path;

use tokio::process::Command;
use tracing::debug;

use super::{truncate, Verdict};
use crate::config::PipelineConfig;
use crate::env::ExecutionEnvironment;
use crate::exec::run_with_timeout;
use crate::task::TaskSpec;

pub(super) async fn check(
    task: &TaskSpec,
    env: &ExecutionEnvironment,
    script_file: &str,
    config: &PipelineConfig,
) -> Verdict {
    let Some(name) = Path::new(script_file).file_name() else {
        return Verdict::fail(format!("checker script has no file name: {}", script_file));
    };
    let script_path = env.root().join(name);
    if !script_path.exists() {
        return Verdict::fail(format!(
            "checker script not found: {}",
            script_path.display()
        ));
    }

    let timeout = task.execution_timeout(config);
    debug!(
        "Running checker script {} (timeout {}s)",
        script_path.display(),
        timeout.as_secs()
    );

    let mut command = Command::new(env.venv_python());
    command.arg(&script_path).current_dir(env.root());

    let result = match run_with_timeout(command, timeout, config.max_output_bytes).await {
        Ok(result) => result,
        Err(e) => return Verdict::fail(format!("checker script failed to start: {}", e)),
    };

    if result.timed_out {
        return Verdict::fail(format!(
            "checker script timed out after {}s",
            timeout.as_secs()
        ))
        .with_values("exit 0", "timeout");
    }

    let stdout = truncate(result.stdout.trim(), 200);
    match result.exit_code {
        Some(0) => {
            let detail = if stdout.is_empty() {
                "checker passed".to_string()
            } else {
                format!("checker passed: {}", stdout)
            };
            Verdict::pass(detail).with_values("exit 0", "exit 0")
        }
        Some(code) => {
            let stderr = truncate(result.stderr.trim(), 200);
            let detail = if stderr.is_empty() {
                format!("checker exited with code {}", code)
            } else {
                format!("checker exited with code {}: {}", code, stderr)
            };
            Verdict::fail(detail).with_values("exit 0", format!("exit {}", code))
        }
        None => Verdict::fail("checker script killed by signal").with_values("exit 0", "signal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvironmentManager;
    use crate::task::ExpectedResult;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tempfile::TempDir;

    fn script_task() -> TaskSpec {
        TaskSpec::new(
            "checked",
            "x",
            ExpectedResult::ScriptRun {
                script_file: "verify.py".to_string(),
            },
        )
    }

    /// Environment whose venv interpreter is a shell stub, so checker runs
    /// need no Python on the test host.
    async fn env_with_fake_python(
        config: &PipelineConfig,
        body: &str,
    ) -> ExecutionEnvironment {
        let manager = EnvironmentManager::new(config);
        let env = manager.provision(&script_task()).await.unwrap();

        let bin = env.venv_dir().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let python = bin.join("python");
        std::fs::write(&python, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = std::fs::metadata(&python).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&python, perms).unwrap();

        std::fs::write(env.root().join("verify.py"), "print('ok')\n").unwrap();
        env
    }

    #[tokio::test]
    async fn test_zero_exit_passes() {
        let files = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let config = PipelineConfig::default()
            .with_files_dir(files.path())
            .with_work_root(work.path());

        let mut env = env_with_fake_python(&config, "echo all checks green; exit 0").await;
        let verdict = check(&script_task(), &env, "verify.py", &config).await;

        assert!(verdict.passed, "{}", verdict.detail);
        assert!(verdict.detail.contains("all checks green"));
        env.teardown().await;
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_with_stderr() {
        let files = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let config = PipelineConfig::default()
            .with_files_dir(files.path())
            .with_work_root(work.path());

        let mut env =
            env_with_fake_python(&config, "echo 'expected 5 rows, found 3' >&2; exit 2").await;
        let verdict = check(&script_task(), &env, "verify.py", &config).await;

        assert!(!verdict.passed);
        assert!(verdict.detail.contains("code 2"));
        assert!(verdict.detail.contains("expected 5 rows"));
        assert_eq!(verdict.actual, "exit 2");
        env.teardown().await;
    }

    #[tokio::test]
    async fn test_checker_timeout_fails() {
        let files = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let config = PipelineConfig::default()
            .with_files_dir(files.path())
            .with_work_root(work.path())
            .with_script_timeout(Duration::from_millis(200));

        let mut env = env_with_fake_python(&config, "sleep 30").await;
        let verdict = check(&script_task(), &env, "verify.py", &config).await;

        assert!(!verdict.passed);
        assert!(verdict.detail.contains("timed out"));
        assert_eq!(verdict.actual, "timeout");
        env.teardown().await;
    }

    #[tokio::test]
    async fn test_missing_checker_fails_gracefully() {
        let files = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let config = PipelineConfig::default()
            .with_files_dir(files.path())
            .with_work_root(work.path());

        let manager = EnvironmentManager::new(&config);
        let mut env = manager.provision(&script_task()).await.unwrap();

        let verdict = check(&script_task(), &env, "verify.py", &config).await;
        assert!(!verdict.passed);
        assert!(verdict.detail.contains("not found"));
        env.teardown().await;
    }
}
