//! Result parsing for captured runner output.
//!
//! Output is matched against every [`ReportFormat`] in [`FORMATS`]. Aggregate
//! counts come from the first format reporting a non-empty summary; per-test
//! detail is collected line by line, each line tried against every format.

mod playwright;
mod tap;

pub use playwright::PlaywrightList;
pub use tap::NodeTap;

use crate::types::{RunResults, TestResult};

/// A test recognised at some line of output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineMatch {
    pub result: TestResult,
    /// Lines used by the match, including the first (always >= 1).
    pub consumed: usize,
}

/// One runner output format.
pub trait ReportFormat: Sync {
    fn name(&self) -> &'static str;

    /// Aggregate counts printed by the runner, zero if none are found.
    fn summary(&self, output: &str) -> RunResults;

    /// Try to recognise a test result starting at `lines[idx]`.
    fn parse_line(&self, lines: &[&str], idx: usize) -> Option<LineMatch>;
}

/// Known formats, in priority order.
pub static FORMATS: &[&dyn ReportFormat] = &[&PlaywrightList, &NodeTap];

/// Aggregate pass/fail counts from raw output.
pub fn parse_summary(output: &str) -> RunResults {
    FORMATS
        .iter()
        .map(|format| format.summary(output))
        .find(|results| !results.is_empty())
        .unwrap_or_default()
}

/// Individual tests in output order. Duplicates are kept.
pub fn parse_tests(output: &str) -> Vec<TestResult> {
    let lines: Vec<&str> = output.lines().collect();
    let mut tests = Vec::new();
    let mut idx = 0;

    while idx < lines.len() {
        let matched = FORMATS
            .iter()
            .find_map(|format| format.parse_line(&lines, idx));
        match matched {
            Some(m) => {
                tests.push(m.result);
                idx += m.consumed.max(1);
            }
            None => idx += 1,
        }
    }

    tests
}

/// First capture of `re` parsed as a count, or 0.
fn capture_count(re: &regex::Regex, text: &str) -> u32 {
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}
