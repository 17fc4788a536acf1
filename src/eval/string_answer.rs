//! Exact-string answer checking.
//!
//! Scripts declare their answer on an `ANSWER=` line. The last marker in
//! the output wins, so a script may print intermediate candidates and
//! settle on a final one. Values may be bare or wrapped in single or
//! double quotes: a bare value ends at the first whitespace, a quoted value
//! keeps everything between the quotes.

use regex::Regex;

use super::{truncate, Verdict};
use crate::exec::ExecutionResult;

pub(super) fn check(execution: &ExecutionResult, expected: &str, case_sensitive: bool) -> Verdict {
    let Some(raw) = last_answer_marker(&execution.stdout) else {
        return Verdict::fail("no ANSWER marker in output")
            .with_values(expected, truncate(execution.stdout.trim(), 200));
    };

    let actual = unquote(&raw);
    let matched = if case_sensitive {
        actual == expected
    } else {
        actual.eq_ignore_ascii_case(expected)
    };

    let verdict = if matched {
        Verdict::pass("answer matched")
    } else if case_sensitive {
        Verdict::fail("answer differs")
    } else {
        Verdict::fail("answer differs (case-insensitive)")
    };
    verdict.with_values(expected, actual)
}

/// The value of the last `ANSWER=` marker in the output: a quoted span
/// kept whole, or the bare run of non-whitespace after the `=`.
fn last_answer_marker(stdout: &str) -> Option<String> {
    let re = Regex::new(r#"ANSWER\s*=\s*("[^"\n]*"|'[^'\n]*'|\S+)"#).ok()?;
    re.captures_iter(stdout)
        .last()
        .and_then(|caps| caps.get(1).map(|m| m.as_str().to_string()))
}

/// Strips one layer of matching single or double quotes.
fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}
