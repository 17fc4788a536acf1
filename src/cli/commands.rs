//! CLI command definitions for solvebench.
//!
//! This module provides the command-line interface for running benchmark
//! tasks against stored model responses and inspecting task definitions.

use crate::config::PipelineConfig;
use crate::extract::{extract_solution, SolutionSource};
use crate::pipeline::Pipeline;
use crate::report::{ReportWriter, RunSummary};
use crate::task::{load_tasks, TaskError, TaskSpec};
use clap::Parser;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Default directory of task definitions.
const DEFAULT_TASKS_DIR: &str = "tasks";

/// Default base directory for task input files.
const DEFAULT_FILES_DIR: &str = "files";

/// Default directory of stored model responses.
const DEFAULT_RESPONSES_DIR: &str = "responses";
const DEFAULT_OUTPUT_DIR: &str = "results";

/// Response file extensions tried per task, in order.
const RESPONSE_EXTENSIONS: [&str; 2] = ["md", "txt"];

/// Benchmark pipeline for scoring model-written Python solutions.
#[derive(Parser)]
#[command(name = "solvebench")]
#[command(about = "Run benchmark tasks against stored model responses")]
#[command(version)]
#[command(
    long_about = "solvebench runs benchmark tasks end to end: it extracts a Python script and its\ndependencies from a stored model response, provisions an isolated environment with\na dedicated virtualenv, installs apt/pip packages, executes the script under a\ndeadline, and scores the output against the task's expected result.\n\nExample usage:\n  solvebench run --tasks-dir ./tasks --responses-dir ./responses --output-dir ./results"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run benchmark tasks against stored model responses.
    ///
    /// Each task needs a response file named `<task-id>.md` or `<task-id>.txt`
    /// in the responses directory. Tasks without one are skipped with a
    /// warning. Exits nonzero when any executed task fails.
    #[command(alias = "r")]
    Run(RunArgs),

    /// List the tasks defined in the tasks directory.
    #[command(name = "list-tasks", alias = "ls")]
    ListTasks(ListTasksArgs),

    /// Show one task definition as pretty-printed JSON.
    #[command(name = "show-task", alias = "show")]
    ShowTask(ShowTaskArgs),
}

/// Arguments for the `run` command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Directory of task definitions (*.yaml, *.yml, *.json).
    #[arg(short, long, default_value = DEFAULT_TASKS_DIR, env = "SOLVEBENCH_TASKS_DIR")]
    pub tasks_dir: String,

    /// Base directory for task input files staged into each environment.
    #[arg(short, long, default_value = DEFAULT_FILES_DIR, env = "SOLVEBENCH_FILES_DIR")]
    pub files_dir: String,

    /// Directory of model responses, one <task-id>.md or <task-id>.txt per task.
    #[arg(short, long, default_value = DEFAULT_RESPONSES_DIR, env = "SOLVEBENCH_RESPONSES_DIR")]
    pub responses_dir: String,

    /// Run only the task with this id.
    #[arg(long)]
    pub task: Option<String>,

    /// Directory where run reports are written.
    #[arg(short, long, default_value = DEFAULT_OUTPUT_DIR)]
    pub output_dir: String,

    /// Number of tasks to run concurrently.
    #[arg(short, long)]
    pub concurrency: Option<usize>,

    /// Script execution deadline in seconds (per-task overrides still win).
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Keep environment directories after each run, for debugging.
    #[arg(long)]
    pub keep_env: bool,
}

/// Arguments for the `list-tasks` command.
#[derive(Parser, Debug)]
pub struct ListTasksArgs {
    /// Directory of task definitions.
    #[arg(short, long, default_value = DEFAULT_TASKS_DIR, env = "SOLVEBENCH_TASKS_DIR")]
    pub tasks_dir: String,

    /// Output the inventory as JSON instead of a table.
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for the `show-task` command.
#[derive(Parser, Debug)]
pub struct ShowTaskArgs {
    /// Id of the task to show.
    pub task_id: String,

    /// Directory of task definitions.
    #[arg(short, long, default_value = DEFAULT_TASKS_DIR, env = "SOLVEBENCH_TASKS_DIR")]
    pub tasks_dir: String,
}

/// Parse CLI arguments without executing.
///
/// Useful when the caller needs the parsed arguments before running,
/// for example to initialize logging based on the log level.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// This is a convenience function that parses CLI args and runs the command.
/// For more control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// This is the main entry point for the solvebench CLI.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => {
            run_benchmark_command(args).await?;
        }
        Commands::ListTasks(args) => {
            run_list_tasks_command(args)?;
        }
        Commands::ShowTask(args) => {
            run_show_task_command(args)?;
        }
    }
    Ok(())
}

// ============================================================================
// Run Command Implementation
// ============================================================================

async fn run_benchmark_command(args: RunArgs) -> anyhow::Result<()> {
    let tasks_path = Path::new(&args.tasks_dir);
    if !tasks_path.is_dir() {
        return Err(anyhow::anyhow!(
            "Tasks directory does not exist: {}",
            args.tasks_dir
        ));
    }

    let config = build_config(&args)?;

    let mut tasks = load_tasks(tasks_path)?;
    if let Some(id) = &args.task {
        tasks.retain(|task| &task.id == id);
        if tasks.is_empty() {
            return Err(anyhow::anyhow!(
                "No task with id '{}' in {}",
                id,
                args.tasks_dir
            ));
        }
    }
    if tasks.is_empty() {
        return Err(anyhow::anyhow!(
            "No task definitions found in {}",
            args.tasks_dir
        ));
    }
    info!(count = tasks.len(), "Loaded task definitions");

    let responses_dir = Path::new(&args.responses_dir);
    let mut work = Vec::new();
    for task in tasks {
        match load_response(responses_dir, &task.id)? {
            Some(text) => work.push((task, SolutionSource::RawResponse(text))),
            None => warn!(task_id = %task.id, "No response file found, skipping task"),
        }
    }
    if work.is_empty() {
        return Err(anyhow::anyhow!(
            "No response files found in {} for any loaded task",
            args.responses_dir
        ));
    }

    let pipeline = Pipeline::new(config);
    let started = std::time::Instant::now();
    let mut records = pipeline.run_batch(&work).await;

    let writer = ReportWriter::create(Path::new(&args.output_dir))?;
    for (record, (_, source)) in records.iter_mut().zip(&work) {
        // The extractor is pure, so re-running it is the cheapest way to
        // archive the script without threading it through the pipeline.
        if let Ok(solution) = extract_solution(source) {
            match writer.write_script(&record.task_id, &solution.script) {
                Ok(rel) => record.script_file = Some(rel),
                Err(e) => {
                    warn!(task_id = %record.task_id, error = %e, "Failed to archive script")
                }
            }
        }
        writer.write_outcome(record)?;
    }

    let summary = RunSummary::from_outcomes(&records);
    writer.write_summary(&summary)?;

    println!("\n=== Solvebench Results ===");
    for record in &records {
        let marker = if record.is_success() { "✓" } else { "✗" };
        println!("  {} {:<24} {}", marker, record.task_id, record.status);
        if !record.is_success() {
            println!("      {}", record.detail);
        }
    }
    println!();
    println!("{}", summary.render());
    println!("Elapsed: {:.1}s", started.elapsed().as_secs_f64());
    println!("Report: {}", writer.run_dir().display());

    if summary.failed > 0 {
        return Err(anyhow::anyhow!(
            "{} of {} tasks failed",
            summary.failed,
            summary.total
        ));
    }
    Ok(())
}

/// Layer CLI overrides on top of the environment-derived configuration.
fn build_config(args: &RunArgs) -> anyhow::Result<PipelineConfig> {
    let mut config = PipelineConfig::from_env()
        .map_err(|e| anyhow::anyhow!("Invalid SOLVEBENCH_* environment: {e}"))?
        .with_files_dir(&args.files_dir);
    if let Some(limit) = args.concurrency {
        config = config.with_max_concurrent_tasks(limit);
    }
    if let Some(secs) = args.timeout {
        config = config.with_script_timeout(Duration::from_secs(secs));
    }
    if args.keep_env {
        config = config.with_keep_environments(true);
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;
    Ok(config)
}

/// Read the stored response for a task, probing `<id>.md` then `<id>.txt`.
///
/// Returns `Ok(None)` when no response file exists; the caller skips the
/// task. An unreadable file is an error rather than a skip.
fn load_response(dir: &Path, task_id: &str) -> anyhow::Result<Option<String>> {
    for ext in RESPONSE_EXTENSIONS {
        let path = dir.join(format!("{task_id}.{ext}"));
        if path.is_file() {
            let text = fs::read_to_string(&path).map_err(|e| {
                anyhow::anyhow!("Failed to read response file {}: {e}", path.display())
            })?;
            return Ok(Some(text));
        }
    }
    Ok(None)
}

// ============================================================================
// Inspection Commands
// ============================================================================

fn run_list_tasks_command(args: ListTasksArgs) -> anyhow::Result<()> {
    let tasks = load_tasks(Path::new(&args.tasks_dir))?;

    if args.json {
        let entries: Vec<serde_json::Value> = tasks
            .iter()
            .map(|task| {
                serde_json::json!({
                    "id": task.id,
                    "difficulty": task.difficulty,
                    "result_kind": task.result.kind(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if tasks.is_empty() {
        println!("No tasks found in {}", args.tasks_dir);
        return Ok(());
    }

    println!("{:<28} {:<12} {}", "ID", "DIFFICULTY", "RESULT KIND");
    for task in &tasks {
        println!(
            "{:<28} {:<12} {}",
            task.id,
            task.difficulty,
            task.result.kind()
        );
    }
    println!("\n{} tasks", tasks.len());
    Ok(())
}

fn run_show_task_command(args: ShowTaskArgs) -> anyhow::Result<()> {
    let task = find_task(Path::new(&args.tasks_dir), &args.task_id)?;
    println!("{}", serde_json::to_string_pretty(&task)?);
    Ok(())
}

fn find_task(tasks_dir: &Path, task_id: &str) -> Result<TaskSpec, TaskError> {
    let tasks = load_tasks(tasks_dir)?;
    tasks
        .into_iter()
        .find(|task| task.id == task_id)
        .ok_or_else(|| TaskError::NotFound(task_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command_defaults() {
        let args = vec!["solvebench", "run"];
        let cli = Cli::try_parse_from(args).expect("should parse");

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.tasks_dir, DEFAULT_TASKS_DIR);
                assert_eq!(args.files_dir, DEFAULT_FILES_DIR);
                assert_eq!(args.responses_dir, DEFAULT_RESPONSES_DIR);
                assert_eq!(args.output_dir, DEFAULT_OUTPUT_DIR);
                assert!(args.task.is_none());
                assert!(args.concurrency.is_none());
                assert!(args.timeout.is_none());
                assert!(!args.keep_env);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_command_with_all_options() {
        let args = vec![
            "solvebench",
            "run",
            "-t",
            "./my-tasks",
            "-f",
            "./my-files",
            "-r",
            "./my-responses",
            "--task",
            "csv-stats",
            "-o",
            "./my-results",
            "-c",
            "4",
            "--timeout",
            "120",
            "--keep-env",
        ];
        let cli = Cli::try_parse_from(args).expect("should parse");

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.tasks_dir, "./my-tasks");
                assert_eq!(args.files_dir, "./my-files");
                assert_eq!(args.responses_dir, "./my-responses");
                assert_eq!(args.task, Some("csv-stats".to_string()));
                assert_eq!(args.output_dir, "./my-results");
                assert_eq!(args.concurrency, Some(4));
                assert_eq!(args.timeout, Some(120));
                assert!(args.keep_env);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_alias() {
        let args = vec!["solvebench", "r", "--task", "csv-stats"];
        let cli = Cli::try_parse_from(args).expect("should parse with alias");

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.task, Some("csv-stats".to_string()));
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_list_tasks_parses() {
        let args = vec!["solvebench", "list-tasks", "-t", "./tasks", "-j"];
        let cli = Cli::try_parse_from(args).expect("should parse");

        match cli.command {
            Commands::ListTasks(args) => {
                assert_eq!(args.tasks_dir, "./tasks");
                assert!(args.json);
            }
            _ => panic!("Expected ListTasks command"),
        }
    }

    #[test]
    fn test_show_task_parses() {
        let args = vec!["solvebench", "show-task", "csv-stats"];
        let cli = Cli::try_parse_from(args).expect("should parse");

        match cli.command {
            Commands::ShowTask(args) => {
                assert_eq!(args.task_id, "csv-stats");
                assert_eq!(args.tasks_dir, DEFAULT_TASKS_DIR);
            }
            _ => panic!("Expected ShowTask command"),
        }
    }

    #[test]
    fn test_global_log_level() {
        let args = vec!["solvebench", "run", "-l", "debug"];
        let cli = Cli::try_parse_from(args).expect("should parse");
        assert_eq!(cli.log_level, "debug");
    }

    #[test]
    fn test_load_response_prefers_md() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("t1.md"), "markdown response").unwrap();
        fs::write(dir.path().join("t1.txt"), "text response").unwrap();

        let loaded = load_response(dir.path(), "t1").unwrap();
        assert_eq!(loaded.as_deref(), Some("markdown response"));
    }

    #[test]
    fn test_load_response_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_response(dir.path(), "absent").unwrap();
        assert!(loaded.is_none());
    }
}
