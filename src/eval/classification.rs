//! Classification accuracy checking.
//!
//! Compares the target column of a predictions CSV written by the solution
//! against a staged ground truth CSV. Files from spreadsheet exports show
//! up in UTF-16 often enough that decoding sniffs the byte-order mark
//! before falling back to UTF-8.

use std::path::Path;

use super::Verdict;
use crate::env::ExecutionEnvironment;
use crate::task::TaskSpec;

/// Header names that mark the label column, in lookup order. When none is
/// present the last column is assumed to hold the labels.
const TARGET_COLUMNS: [&str; 6] = [
    "target",
    "result",
    "durum",
    "label",
    "class",
    "classification",
];

pub(super) fn check(
    task: &TaskSpec,
    env: &ExecutionEnvironment,
    ground_truth_file: &str,
    predictions_file: Option<&str>,
    threshold: Option<f64>,
) -> Verdict {
    let truth_path = match staged_path(env, ground_truth_file) {
        Some(path) => path,
        None => {
            return Verdict::fail(format!(
                "ground truth file has no file name: {}",
                ground_truth_file
            ))
        }
    };
    if !truth_path.exists() {
        return Verdict::fail(format!(
            "ground truth file not found: {}",
            truth_path.display()
        ));
    }

    // The solution writes its predictions over the staged task file unless
    // the task names a separate predictions file.
    let Some(predictions_name) = predictions_file.or(task.task_file.as_deref()) else {
        return Verdict::fail("no predictions file configured for classification task");
    };
    let predictions_path = match staged_path(env, predictions_name) {
        Some(path) => path,
        None => {
            return Verdict::fail(format!(
                "predictions file has no file name: {}",
                predictions_name
            ))
        }
    };
    if !predictions_path.exists() {
        return Verdict::fail(format!(
            "predictions file not found: {}",
            predictions_path.display()
        ));
    }

    let truth = match read_target_column(&truth_path) {
        Ok(values) => values,
        Err(message) => {
            return Verdict::fail(format!("could not read ground truth: {}", message))
        }
    };
    let predictions = match read_target_column(&predictions_path) {
        Ok(values) => values,
        Err(message) => {
            return Verdict::fail(format!("could not read predictions: {}", message))
        }
    };

    if truth.is_empty() {
        return Verdict::fail("ground truth file has no data rows");
    }
    if truth.len() != predictions.len() {
        return Verdict::fail(format!(
            "row count mismatch: {} ground truth rows vs {} predictions",
            truth.len(),
            predictions.len()
        ));
    }

    let matches = truth.iter().zip(&predictions).filter(|(t, p)| t == p).count();
    let score = matches as f64 / truth.len() as f64;

    let (passed, required) = match threshold {
        Some(t) => (score >= t, format!(">= {}", t)),
        None => (matches == truth.len(), "1".to_string()),
    };

    let detail = format!("accuracy {:.4} ({}/{} rows)", score, matches, truth.len());
    let verdict = if passed {
        Verdict::pass(detail)
    } else {
        Verdict::fail(detail)
    };
    verdict.with_values(required, format!("{:.4}", score))
}

/// Where a task input landed inside the environment: flat, under its bare
/// file name.
fn staged_path(env: &ExecutionEnvironment, relative: &str) -> Option<std::path::PathBuf> {
    Path::new(relative)
        .file_name()
        .map(|name| env.root().join(name))
}

/// Reads the label column of a CSV file, one value per data row.
fn read_target_column(path: &Path) -> Result<Vec<String>, String> {
    let bytes = std::fs::read(path).map_err(|e| e.to_string())?;
    let content = decode_text(&bytes);

    let mut lines = content.lines().filter(|line| !line.trim().is_empty());
    let Some(header_line) = lines.next() else {
        return Ok(Vec::new());
    };

    let headers = split_csv_line(header_line);
    let target = target_column_index(&headers);

    let mut values = Vec::new();
    for line in lines {
        let fields = split_csv_line(line);
        let value = fields.get(target).cloned().unwrap_or_default();
        values.push(value.trim().to_string());
    }
    Ok(values)
}

/// Decodes CSV bytes, honoring a UTF-16 byte-order mark when present.
fn decode_text(bytes: &[u8]) -> String {
    if bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] == 0xFE {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }

    let text = String::from_utf8_lossy(bytes).to_string();
    match text.strip_prefix('\u{feff}') {
        Some(stripped) => stripped.to_string(),
        None => text,
    }
}

fn target_column_index(headers: &[String]) -> usize {
    for candidate in TARGET_COLUMNS {
        if let Some(idx) = headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(candidate))
        {
            return idx;
        }
    }
    headers.len().saturating_sub(1)
}

/// Splits one CSV line, honoring double-quoted fields with embedded commas
/// and doubled quotes.
fn split_csv_line(line: &str) -> Vec<String> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' if current.is_empty() => in_quotes = true,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::env::EnvironmentManager;
    use crate::task::ExpectedResult;
    use tempfile::TempDir;

    #[test]
    fn test_split_csv_line() {
        assert_eq!(split_csv_line("a,b,c"), vec!["a", "b", "c"]);
        assert_eq!(
            split_csv_line("\"x, y\",z\r"),
            vec!["x, y".to_string(), "z".to_string()]
        );
        assert_eq!(
            split_csv_line("\"he said \"\"hi\"\"\",ok"),
            vec!["he said \"hi\"".to_string(), "ok".to_string()]
        );
        assert_eq!(split_csv_line("a,,c"), vec!["a", "", "c"]);
    }

    #[test]
    fn test_target_column_lookup() {
        let headers = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        assert_eq!(target_column_index(&headers(&["id", "target", "note"])), 1);
        assert_eq!(target_column_index(&headers(&["id", "Durum"])), 1);
        assert_eq!(target_column_index(&headers(&["Label", "id"])), 0);
        // No recognized header: fall back to the last column.
        assert_eq!(target_column_index(&headers(&["id", "text", "value"])), 2);
    }

    #[test]
    fn test_read_target_column_utf16() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("labels.csv");

        let text = "id,target\n1,yes\n2,no\n";
        let mut bytes = vec![0xFF, 0xFE];
        for unit in text.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        std::fs::write(&path, bytes).unwrap();

        let values = read_target_column(&path).unwrap();
        assert_eq!(values, vec!["yes", "no"]);
    }

    #[test]
    fn test_read_target_column_skips_blank_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("labels.csv");
        std::fs::write(&path, "id,label\n\n1,cat\n2,dog\n\n").unwrap();

        let values = read_target_column(&path).unwrap();
        assert_eq!(values, vec!["cat", "dog"]);
    }

    async fn env_with_files(
        files: &[(&str, &str)],
    ) -> (TempDir, TempDir, ExecutionEnvironment, TaskSpec) {
        let files_dir = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let config = PipelineConfig::default()
            .with_files_dir(files_dir.path())
            .with_work_root(work.path());
        let manager = EnvironmentManager::new(&config);

        let task = TaskSpec::new(
            "classify",
            "x",
            ExpectedResult::ClassificationMatch {
                ground_truth_file: "truth.csv".to_string(),
                predictions_file: None,
                threshold: None,
            },
        )
        .with_task_file("predictions.csv");

        let env = manager.provision(&task).await.unwrap();
        for (name, content) in files {
            std::fs::write(env.root().join(name), content).unwrap();
        }
        (files_dir, work, env, task)
    }

    fn truth_and_predictions(correct: usize, total: usize) -> (String, String) {
        let mut truth = String::from("id,target\n");
        let mut predictions = String::from("id,label\n");
        for i in 0..total {
            truth.push_str(&format!("{},yes\n", i));
            let label = if i < correct { "yes" } else { "no" };
            predictions.push_str(&format!("{},{}\n", i, label));
        }
        (truth, predictions)
    }

    #[tokio::test]
    async fn test_threshold_pass_and_fail() {
        let (truth, predictions) = truth_and_predictions(9, 10);
        let (_files, _work, mut env, task) =
            env_with_files(&[("truth.csv", &truth), ("predictions.csv", &predictions)]).await;

        let verdict = check(&task, &env, "truth.csv", None, Some(0.8));
        assert!(verdict.passed, "{}", verdict.detail);
        assert!(verdict.detail.contains("9/10"));

        let verdict = check(&task, &env, "truth.csv", None, Some(0.95));
        assert!(!verdict.passed);
        assert_eq!(verdict.actual, "0.9000");

        env.teardown().await;
    }

    #[tokio::test]
    async fn test_no_threshold_requires_perfect_match() {
        let (truth, predictions) = truth_and_predictions(10, 10);
        let (_files, _work, mut env, task) =
            env_with_files(&[("truth.csv", &truth), ("predictions.csv", &predictions)]).await;

        let verdict = check(&task, &env, "truth.csv", None, None);
        assert!(verdict.passed);
        env.teardown().await;

        let (truth, predictions) = truth_and_predictions(9, 10);
        let (_files, _work, mut env, task) =
            env_with_files(&[("truth.csv", &truth), ("predictions.csv", &predictions)]).await;

        let verdict = check(&task, &env, "truth.csv", None, None);
        assert!(!verdict.passed);
        env.teardown().await;
    }

    #[tokio::test]
    async fn test_row_count_mismatch_fails() {
        let (truth, _) = truth_and_predictions(5, 5);
        let (predictions, _) = truth_and_predictions(3, 3);
        let (_files, _work, mut env, task) =
            env_with_files(&[("truth.csv", &truth), ("predictions.csv", &predictions)]).await;

        let verdict = check(&task, &env, "truth.csv", None, Some(0.5));
        assert!(!verdict.passed);
        assert!(verdict.detail.contains("row count mismatch"));
        env.teardown().await;
    }

    #[tokio::test]
    async fn test_missing_files_fail_gracefully() {
        let (_files, _work, mut env, task) = env_with_files(&[]).await;

        let verdict = check(&task, &env, "truth.csv", None, Some(0.5));
        assert!(!verdict.passed);
        assert!(verdict.detail.contains("ground truth file not found"));

        std::fs::write(env.root().join("truth.csv"), "id,target\n1,yes\n").unwrap();
        let verdict = check(&task, &env, "truth.csv", None, Some(0.5));
        assert!(!verdict.passed);
        assert!(verdict.detail.contains("predictions file not found"));

        env.teardown().await;
    }

    #[tokio::test]
    async fn test_explicit_predictions_file() {
        let (truth, predictions) = truth_and_predictions(4, 4);
        let (_files, _work, mut env, task) =
            env_with_files(&[("truth.csv", &truth), ("model_out.csv", &predictions)]).await;

        let verdict = check(&task, &env, "truth.csv", Some("out/model_out.csv"), None);
        assert!(verdict.passed, "{}", verdict.detail);
        env.teardown().await;
    }
}
