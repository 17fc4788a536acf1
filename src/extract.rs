//! Code and dependency extraction from model responses.
//!
//! A response carries fenced code blocks whose info string selects the kind:
//! ` ```python ` for the solution script, ` ```pip ` and ` ```apt ` for
//! dependency lists. Exactly one script block must be present. Dependency
//! blocks are optional and may repeat; each non-empty line that is not a
//! comment is one package token. Extraction is a pure parse with no side
//! effects.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during solution extraction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractionError {
    /// The response contains no script block.
    #[error("No script block found in response")]
    NoScriptBlock,

    /// The response contains more than one script block.
    #[error("Found {count} script blocks, expected exactly one")]
    MultipleScriptBlocks { count: usize },

    /// A code fence was opened but never closed.
    #[error("Unterminated code fence (tag '{tag}')")]
    UnterminatedFence { tag: String },

    /// The script block is present but empty.
    #[error("Script block is empty")]
    EmptyScript,
}

/// A solution extracted from a model response: the program plus its
/// declared dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedSolution {
    /// Solution script source, verbatim from the script block.
    pub script: String,
    /// OS-level package names, in declaration order.
    pub apt_packages: Vec<String>,
    /// Python package names, in declaration order.
    pub pip_packages: Vec<String>,
}

impl ExtractedSolution {
    /// Creates a solution with the given script and no dependencies.
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            apt_packages: Vec::new(),
            pip_packages: Vec::new(),
        }
    }

    /// Sets the apt package list.
    pub fn with_apt_packages(mut self, packages: Vec<String>) -> Self {
        self.apt_packages = packages;
        self
    }

    /// Sets the pip package list.
    pub fn with_pip_packages(mut self, packages: Vec<String>) -> Self {
        self.pip_packages = packages;
        self
    }
}

/// What the model layer hands to the pipeline: either a raw response blob
/// to parse, or an already-assembled solution bundle.
#[derive(Debug, Clone)]
pub enum SolutionSource {
    /// Raw response text containing fenced code blocks.
    RawResponse(String),
    /// A pre-parsed solution that skips fence parsing.
    Bundle(ExtractedSolution),
}

/// Extracts a solution from a source.
///
/// Raw responses are parsed for fenced blocks; bundles pass through after
/// the same non-empty-script validation.
///
/// # Errors
///
/// Returns `ExtractionError` when no script block is found, more than one
/// is found, a fence is unterminated, or the script is empty.
pub fn extract_solution(source: &SolutionSource) -> Result<ExtractedSolution, ExtractionError> {
    match source {
        SolutionSource::RawResponse(text) => parse_response(text),
        SolutionSource::Bundle(solution) => {
            if solution.script.trim().is_empty() {
                return Err(ExtractionError::EmptyScript);
            }
            Ok(solution.clone())
        }
    }
}

/// Block kinds recognized by the fence scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Script,
    Pip,
    Apt,
    Other,
}

impl BlockKind {
    fn from_tag(tag: &str) -> Self {
        match tag {
            "python" => BlockKind::Script,
            "pip" => BlockKind::Pip,
            "apt" => BlockKind::Apt,
            _ => BlockKind::Other,
        }
    }
}

/// Parses a raw response line by line.
///
/// A line whose trimmed form starts with three backticks opens a block
/// (the first word after the backticks, lowercased, is the tag) or closes
/// the one currently open. Block content is kept verbatim.
fn parse_response(text: &str) -> Result<ExtractedSolution, ExtractionError> {
    let mut scripts: Vec<String> = Vec::new();
    let mut pip_packages: Vec<String> = Vec::new();
    let mut apt_packages: Vec<String> = Vec::new();

    let mut open: Option<(BlockKind, String, Vec<&str>)> = None;

    for line in text.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("```") {
            match open.take() {
                Some((kind, _tag, lines)) => match kind {
                    BlockKind::Script => scripts.push(lines.join("\n")),
                    BlockKind::Pip => pip_packages.extend(parse_dependency_lines(&lines)),
                    BlockKind::Apt => apt_packages.extend(parse_dependency_lines(&lines)),
                    BlockKind::Other => {}
                },
                None => {
                    let tag = rest
                        .split_whitespace()
                        .next()
                        .unwrap_or("")
                        .to_lowercase();
                    open = Some((BlockKind::from_tag(&tag), tag, Vec::new()));
                }
            }
        } else if let Some((_, _, lines)) = open.as_mut() {
            lines.push(line);
        }
    }

    if let Some((_, tag, _)) = open {
        return Err(ExtractionError::UnterminatedFence { tag });
    }

    match scripts.len() {
        0 => Err(ExtractionError::NoScriptBlock),
        1 => {
            let script = scripts.remove(0);
            if script.trim().is_empty() {
                return Err(ExtractionError::EmptyScript);
            }
            Ok(ExtractedSolution {
                script,
                apt_packages,
                pip_packages,
            })
        }
        count => Err(ExtractionError::MultipleScriptBlocks { count }),
    }
}

/// One package token per non-empty, non-comment line.
fn parse_dependency_lines(lines: &[&str]) -> Vec<String> {
    lines
        .iter()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}
