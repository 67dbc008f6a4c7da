//! Browser runner `--reporter=list` output.

use std::sync::LazyLock;

use regex::Regex;

use super::{LineMatch, ReportFormat, capture_count};
use crate::types::{RunResults, TestResult, TestStatus};

static PASSED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) passed").expect("valid regex"));
static FAILED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) failed").expect("valid regex"));
static SKIPPED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) skipped").expect("valid regex"));

/// `<indent><glyph> [<index>] <title> [(<duration>)]`, indented less than
/// [`ERROR_INDENT`] so call-log bullets and assertion diffs never match.
static LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^ {0,3}(✓|✘|×|-)\s+(?:\d+\s+)?(.+?)(?:\s+\((\d+(?:\.\d+)?(?:ms|s|m))\))?\s*$")
        .expect("valid regex")
});

/// Project tags such as `[chromium]`.
static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*\]\s*").expect("valid regex"));

/// Error detail lines under a failed test are indented at least this far.
const ERROR_INDENT: &str = "    ";

#[derive(Debug, Clone, Copy)]
pub struct PlaywrightList;

impl PlaywrightList {
    fn status(glyph: &str) -> TestStatus {
        match glyph {
            "✓" => TestStatus::Passed,
            "-" => TestStatus::Skipped,
            _ => TestStatus::Failed,
        }
    }

    /// Drop project tags and the `file › describe ›` breadcrumb.
    fn clean_title(raw: &str) -> String {
        let untagged = TAG_RE.replace_all(raw, "");
        let leaf = untagged
            .rsplit_once(" › ")
            .map_or(untagged.as_ref(), |(_, leaf)| leaf);
        leaf.trim_start_matches('›').trim().to_string()
    }

    /// Collect the indented block following a failed test line.
    fn error_block(lines: &[&str], start: usize) -> (Option<String>, usize) {
        let block: Vec<&str> = lines[start..]
            .iter()
            .take_while(|line| line.trim().is_empty() || line.starts_with(ERROR_INDENT))
            .copied()
            .collect();
        let text = block
            .iter()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        let error = (!text.is_empty()).then_some(text);
        (error, block.len())
    }
}

impl ReportFormat for PlaywrightList {
    fn name(&self) -> &'static str {
        "playwright-list"
    }

    fn summary(&self, output: &str) -> RunResults {
        RunResults::new(
            capture_count(&PASSED_RE, output),
            capture_count(&FAILED_RE, output),
            capture_count(&SKIPPED_RE, output),
        )
    }

    fn parse_line(&self, lines: &[&str], idx: usize) -> Option<LineMatch> {
        let caps = LINE_RE.captures(lines.get(idx)?)?;
        let status = Self::status(caps.get(1)?.as_str());
        let name = Self::clean_title(caps.get(2)?.as_str());
        if name.is_empty() {
            return None;
        }

        let mut result = TestResult::new(name, status);
        result.duration = caps.get(3).map(|m| m.as_str().to_string());

        let mut consumed = 1;
        if status == TestStatus::Failed {
            let (error, extra) = Self::error_block(lines, idx + 1);
            result.error = error;
            consumed += extra;
        }

        Some(LineMatch { result, consumed })
    }
}
