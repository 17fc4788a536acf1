//! Dependency installation for extracted solutions.
//!
//! Solutions declare apt and pip packages; both are installed one package at
//! a time so a single bad name cannot sink the rest. Installs are advisory
//! by default: failures are recorded in the [`InstallReport`] and the task
//! proceeds, since models routinely over-declare dependencies. Package names
//! are passed as argv entries, never through a shell.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::env::ExecutionEnvironment;
use crate::exec::{run_with_timeout, ExecutionResult};
use crate::extract::ExtractedSolution;

/// Output cap for install commands. Package manager logs past this point
/// add nothing to a failure excerpt.
const INSTALL_OUTPUT_CAP: usize = 64 * 1024;

/// Raised only in fail-fast mode, on the first package that does not end up
/// usable.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("Failed to install {kind} package '{package}': {message}")]
    FailFast {
        package: String,
        kind: PackageKind,
        message: String,
    },
}

/// Which package manager a package belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageKind {
    Apt,
    Pip,
}

impl std::fmt::Display for PackageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackageKind::Apt => write!(f, "apt"),
            PackageKind::Pip => write!(f, "pip"),
        }
    }
}

/// Terminal state of one package install attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    /// Installed by this attempt.
    Installed,
    /// Was already on the system, nothing to do.
    AlreadyPresent,
    /// Install command failed; the excerpt says why.
    Failed(String),
    /// Install command exceeded the install timeout and was killed.
    TimedOut,
}

/// One package's install outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageOutcome {
    pub name: String,
    pub kind: PackageKind,
    pub status: InstallStatus,
}

impl PackageOutcome {
    /// True when the package is usable after the attempt.
    pub fn ok(&self) -> bool {
        matches!(
            self.status,
            InstallStatus::Installed | InstallStatus::AlreadyPresent
        )
    }
}

/// Everything that happened during dependency installation, in request
/// order: apt packages first, then pip.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallReport {
    pub outcomes: Vec<PackageOutcome>,
}

impl InstallReport {
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// True when every requested package ended up usable.
    pub fn all_ok(&self) -> bool {
        self.outcomes.iter().all(PackageOutcome::ok)
    }

    /// The packages that did not end up usable.
    pub fn failed(&self) -> Vec<&PackageOutcome> {
        self.outcomes.iter().filter(|o| !o.ok()).collect()
    }

    /// One-line digest for logs and result details.
    pub fn summary(&self) -> String {
        if self.outcomes.is_empty() {
            return "no packages requested".to_string();
        }
        let ok = self.outcomes.iter().filter(|o| o.ok()).count();
        format!("{}/{} packages ok", ok, self.outcomes.len())
    }
}

/// Installs a solution's declared dependencies into its environment.
pub struct Installer {
    config: PipelineConfig,
}

impl Installer {
    /// Creates a new installer using the given configuration.
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Installs the solution's apt packages on the host and its pip packages
    /// into the environment's virtualenv.
    ///
    /// # Errors
    ///
    /// With `fail_fast_install` set, returns on the first package that fails
    /// or times out. Otherwise never errors; consult the report.
    pub async fn install(
        &self,
        env: &ExecutionEnvironment,
        solution: &ExtractedSolution,
    ) -> Result<InstallReport, InstallError> {
        let mut report = InstallReport::default();

        if solution.apt_packages.is_empty() && solution.pip_packages.is_empty() {
            debug!("No packages requested");
            return Ok(report);
        }

        if !solution.apt_packages.is_empty() {
            self.refresh_apt_index().await;
            for name in &solution.apt_packages {
                let outcome = self.install_apt_package(name).await;
                self.record(&mut report, outcome)?;
            }
        }

        for name in &solution.pip_packages {
            let outcome = self.install_pip_package(env, name).await;
            self.record(&mut report, outcome)?;
        }

        info!("Dependency install finished: {}", report.summary());
        Ok(report)
    }

    /// Appends an outcome, warning on failure; in fail-fast mode a failure
    /// aborts the whole install instead.
    fn record(
        &self,
        report: &mut InstallReport,
        outcome: PackageOutcome,
    ) -> Result<(), InstallError> {
        match &outcome.status {
            InstallStatus::Failed(message) => {
                warn!(
                    "Failed to install {} package '{}': {}",
                    outcome.kind, outcome.name, message
                );
            }
            InstallStatus::TimedOut => {
                warn!(
                    "Install of {} package '{}' timed out after {}s",
                    outcome.kind,
                    outcome.name,
                    self.config.install_timeout.as_secs()
                );
            }
            _ => {}
        }

        if !outcome.ok() && self.config.fail_fast_install {
            let message = match outcome.status {
                InstallStatus::Failed(message) => message,
                InstallStatus::TimedOut => format!(
                    "timed out after {}s",
                    self.config.install_timeout.as_secs()
                ),
                _ => String::new(),
            };
            return Err(InstallError::FailFast {
                package: outcome.name,
                kind: outcome.kind,
                message,
            });
        }

        report.outcomes.push(outcome);
        Ok(())
    }

    async fn install_apt_package(&self, name: &str) -> PackageOutcome {
        if self.apt_package_present(name).await {
            debug!("apt package '{}' already present", name);
            return PackageOutcome {
                name: name.to_string(),
                kind: PackageKind::Apt,
                status: InstallStatus::AlreadyPresent,
            };
        }

        info!("Installing apt package '{}'", name);
        let mut command = self.apt_command();
        command.args(["install", "-y"]).arg(name);

        PackageOutcome {
            name: name.to_string(),
            kind: PackageKind::Apt,
            status: self.run_install(command).await,
        }
    }

    async fn install_pip_package(
        &self,
        env: &ExecutionEnvironment,
        name: &str,
    ) -> PackageOutcome {
        info!("Installing pip package '{}'", name);
        let mut command = Command::new(env.venv_pip());
        command.arg("install").arg(name).current_dir(env.root());

        PackageOutcome {
            name: name.to_string(),
            kind: PackageKind::Pip,
            status: self.run_install(command).await,
        }
    }

    /// Runs one install command and folds its result into a status.
    async fn run_install(&self, command: Command) -> InstallStatus {
        match run_with_timeout(command, self.config.install_timeout, INSTALL_OUTPUT_CAP).await {
            Ok(result) if result.timed_out => InstallStatus::TimedOut,
            Ok(result) if result.is_success() => InstallStatus::Installed,
            Ok(result) => InstallStatus::Failed(failure_excerpt(&result)),
            Err(e) => InstallStatus::Failed(e.to_string()),
        }
    }

    /// Refreshes the apt package index once before the first apt install.
    /// A stale index is survivable, so failure is logged and ignored.
    async fn refresh_apt_index(&self) {
        debug!("Refreshing apt package index");
        let mut command = self.apt_command();
        command.arg("update");

        match run_with_timeout(command, self.config.install_timeout, INSTALL_OUTPUT_CAP).await {
            Ok(result) if result.is_success() => {}
            Ok(result) => warn!("apt-get update failed: {}", failure_excerpt(&result)),
            Err(e) => warn!("apt-get update failed: {}", e),
        }
    }

    /// Checks the dpkg database for an already-installed package. A query
    /// that cannot run, fails, or hits the install timeout counts as not
    /// present and the install attempt decides.
    async fn apt_package_present(&self, name: &str) -> bool {
        let mut command = Command::new("dpkg-query");
        command.args(["-W", "-f", "${Status}"]).arg(name);

        match run_with_timeout(command, self.config.install_timeout, INSTALL_OUTPUT_CAP).await {
            Ok(result) => status_shows_installed(&result),
            Err(_) => false,
        }
    }

    /// Builds an apt-get command, through sudo when configured. The
    /// frontend variable rides along as a sudo argument so it survives
    /// sudo's environment reset.
    fn apt_command(&self) -> Command {
        if self.config.use_sudo {
            let mut command = Command::new("sudo");
            command
                .arg("DEBIAN_FRONTEND=noninteractive")
                .arg("apt-get");
            command
        } else {
            let mut command = Command::new("apt-get");
            command.env("DEBIAN_FRONTEND", "noninteractive");
            command
        }
    }
}

/// True when a dpkg-query status reply reports the package installed.
fn status_shows_installed(result: &ExecutionResult) -> bool {
    result.is_success() && result.stdout.contains("install ok installed")
}

/// Picks the most informative line out of a failed command's output.
pub(crate) fn failure_excerpt(result: &ExecutionResult) -> String {
    let line = result
        .stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .or_else(|| result.stdout.lines().rev().find(|l| !l.trim().is_empty()))
        .map(str::trim);

    match line {
        Some(line) => line.chars().take(300).collect(),
        None => format!("exit code {:?}", result.exit_code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvironmentManager;
    use crate::task::{ExpectedResult, TaskSpec};
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tempfile::TempDir;

    fn outcome(name: &str, kind: PackageKind, status: InstallStatus) -> PackageOutcome {
        PackageOutcome {
            name: name.to_string(),
            kind,
            status,
        }
    }

    fn test_task() -> TaskSpec {
        TaskSpec::new(
            "install-test",
            "x",
            ExpectedResult::Numerical {
                amount: 1.0,
                tolerance: None,
            },
        )
    }

    /// Provision an environment whose venv contains a scripted fake pip.
    async fn env_with_fake_pip(
        manager: &EnvironmentManager,
        body: &str,
    ) -> crate::env::ExecutionEnvironment {
        let env = manager.provision(&test_task()).await.unwrap();
        let bin = env.venv_dir().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let pip = bin.join("pip");
        std::fs::write(&pip, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = std::fs::metadata(&pip).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&pip, perms).unwrap();
        env
    }

    #[test]
    fn test_report_all_ok_and_failed() {
        let report = InstallReport {
            outcomes: vec![
                outcome("numpy", PackageKind::Pip, InstallStatus::Installed),
                outcome("curl", PackageKind::Apt, InstallStatus::AlreadyPresent),
            ],
        };
        assert!(report.all_ok());
        assert!(report.failed().is_empty());
        assert_eq!(report.summary(), "2/2 packages ok");

        let report = InstallReport {
            outcomes: vec![
                outcome("numpy", PackageKind::Pip, InstallStatus::Installed),
                outcome(
                    "nope",
                    PackageKind::Pip,
                    InstallStatus::Failed("no matching distribution".to_string()),
                ),
                outcome("slow", PackageKind::Pip, InstallStatus::TimedOut),
            ],
        };
        assert!(!report.all_ok());
        let failed = report.failed();
        assert_eq!(failed.len(), 2);
        assert_eq!(failed[0].name, "nope");
        assert_eq!(report.summary(), "1/3 packages ok");
    }

    #[test]
    fn test_empty_report_summary() {
        let report = InstallReport::default();
        assert!(report.all_ok());
        assert_eq!(report.summary(), "no packages requested");
    }

    #[tokio::test]
    async fn test_no_packages_is_a_noop() {
        let files = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let config = PipelineConfig::default()
            .with_files_dir(files.path())
            .with_work_root(work.path());
        let manager = EnvironmentManager::new(&config);
        let installer = Installer::new(&config);

        let mut env = manager.provision(&test_task()).await.unwrap();
        let report = installer
            .install(&env, &ExtractedSolution::new("print(1)"))
            .await
            .unwrap();
        assert!(report.is_empty());
        env.teardown().await;
    }

    #[tokio::test]
    async fn test_missing_pip_records_failure_and_continues() {
        let files = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let config = PipelineConfig::default()
            .with_files_dir(files.path())
            .with_work_root(work.path());
        let manager = EnvironmentManager::new(&config);
        let installer = Installer::new(&config);

        // No venv was created, so the pip binary does not exist.
        let mut env = manager.provision(&test_task()).await.unwrap();
        let solution = ExtractedSolution::new("print(1)")
            .with_pip_packages(vec!["numpy".to_string(), "pandas".to_string()]);

        let report = installer.install(&env, &solution).await.unwrap();
        assert_eq!(report.len(), 2);
        assert!(!report.all_ok());
        assert_eq!(report.failed().len(), 2);
        assert!(matches!(
            report.outcomes[0].status,
            InstallStatus::Failed(_)
        ));
        env.teardown().await;
    }

    #[tokio::test]
    async fn test_fake_pip_success_in_request_order() {
        let files = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let config = PipelineConfig::default()
            .with_files_dir(files.path())
            .with_work_root(work.path());
        let manager = EnvironmentManager::new(&config);
        let installer = Installer::new(&config);

        let mut env = env_with_fake_pip(&manager, "exit 0").await;
        let solution = ExtractedSolution::new("print(1)")
            .with_pip_packages(vec!["first".to_string(), "second".to_string()]);

        let report = installer.install(&env, &solution).await.unwrap();
        assert!(report.all_ok());
        assert_eq!(report.outcomes[0].name, "first");
        assert_eq!(report.outcomes[0].status, InstallStatus::Installed);
        assert_eq!(report.outcomes[1].name, "second");
        env.teardown().await;
    }

    #[tokio::test]
    async fn test_fake_pip_failure_keeps_stderr_excerpt() {
        let files = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let config = PipelineConfig::default()
            .with_files_dir(files.path())
            .with_work_root(work.path());
        let manager = EnvironmentManager::new(&config);
        let installer = Installer::new(&config);

        let mut env =
            env_with_fake_pip(&manager, "echo 'ERROR: no matching distribution' >&2; exit 1")
                .await;
        let solution =
            ExtractedSolution::new("print(1)").with_pip_packages(vec!["ghost-pkg".to_string()]);

        let report = installer.install(&env, &solution).await.unwrap();
        match &report.outcomes[0].status {
            InstallStatus::Failed(message) => {
                assert!(message.contains("no matching distribution"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        env.teardown().await;
    }

    #[tokio::test]
    async fn test_slow_pip_times_out() {
        let files = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let config = PipelineConfig::default()
            .with_files_dir(files.path())
            .with_work_root(work.path())
            .with_install_timeout(Duration::from_millis(200));
        let manager = EnvironmentManager::new(&config);
        let installer = Installer::new(&config);

        let mut env = env_with_fake_pip(&manager, "sleep 30").await;
        let solution =
            ExtractedSolution::new("print(1)").with_pip_packages(vec!["slowpkg".to_string()]);

        let report = installer.install(&env, &solution).await.unwrap();
        assert_eq!(report.outcomes[0].status, InstallStatus::TimedOut);
        env.teardown().await;
    }

    #[tokio::test]
    async fn test_fail_fast_aborts_on_first_failure() {
        let files = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let config = PipelineConfig::default()
            .with_files_dir(files.path())
            .with_work_root(work.path())
            .with_fail_fast_install(true);
        let manager = EnvironmentManager::new(&config);
        let installer = Installer::new(&config);

        let mut env = manager.provision(&test_task()).await.unwrap();
        let solution =
            ExtractedSolution::new("print(1)").with_pip_packages(vec!["broken".to_string()]);

        let err = installer.install(&env, &solution).await.unwrap_err();
        match err {
            InstallError::FailFast { package, kind, .. } => {
                assert_eq!(package, "broken");
                assert_eq!(kind, PackageKind::Pip);
            }
        }
        env.teardown().await;
    }

    fn query_reply(stdout: &str, exit_code: Option<i32>, timed_out: bool) -> ExecutionResult {
        ExecutionResult {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code,
            duration: Duration::ZERO,
            timed_out,
            stdout_truncated: false,
            stderr_truncated: false,
        }
    }

    #[test]
    fn test_status_reply_interpretation() {
        assert!(status_shows_installed(&query_reply(
            "install ok installed",
            Some(0),
            false
        )));
        // dpkg knows the name but the package was removed.
        assert!(!status_shows_installed(&query_reply(
            "deinstall ok config-files",
            Some(0),
            false
        )));
        assert!(!status_shows_installed(&query_reply("", Some(1), false)));
        // Timed out with the status line already on stdout.
        assert!(!status_shows_installed(&query_reply(
            "install ok installed",
            None,
            true
        )));
    }

    #[tokio::test]
    async fn test_unknown_package_is_not_present() {
        let installer = Installer::new(&PipelineConfig::default());
        assert!(
            !installer
                .apt_package_present("solvebench-no-such-package")
                .await
        );
    }
}
