//! TAP output from the unit-test runner.

use std::sync::LazyLock;

use regex::Regex;

use super::{LineMatch, ReportFormat, capture_count};
use crate::types::{RunResults, TestResult, TestStatus};

static PASS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"# pass (\d+)").expect("valid regex"));
static FAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"# fail (\d+)").expect("valid regex"));

/// `<indent>ok|not ok <index> [-] <name> [# comment]`
static LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(ok|not ok)\s+\d+(?:\s+-)?\s+(.+?)\s*(?:#.*)?$").expect("valid regex")
});

#[derive(Debug, Clone, Copy)]
pub struct NodeTap;

impl ReportFormat for NodeTap {
    fn name(&self) -> &'static str {
        "node-tap"
    }

    /// TAP has no skipped counter, so `skipped` is always 0.
    fn summary(&self, output: &str) -> RunResults {
        RunResults::new(
            capture_count(&PASS_RE, output),
            capture_count(&FAIL_RE, output),
            0,
        )
    }

    fn parse_line(&self, lines: &[&str], idx: usize) -> Option<LineMatch> {
        let caps = LINE_RE.captures(lines.get(idx)?)?;
        let status = match caps.get(1)?.as_str() {
            "ok" => TestStatus::Passed,
            _ => TestStatus::Failed,
        };
        let name = caps.get(2)?.as_str().trim();
        if name.is_empty() {
            return None;
        }

        Some(LineMatch {
            result: TestResult::new(name, status),
            consumed: 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Option<TestResult> {
        NodeTap.parse_line(&[line], 0).map(|m| m.result)
    }

    #[test]
    fn not_ok_with_comment() {
        let result = parse("not ok 3 - rejects invalid input # time=12ms").unwrap();
        assert_eq!(result.name, "rejects invalid input");
        assert_eq!(result.status, TestStatus::Failed);
        assert!(result.duration.is_none());
        assert!(result.error.is_none());
    }

    #[test]
    fn indented_ok_without_dash() {
        let result = parse("    ok 12 parses headers").unwrap();
        assert_eq!(result.name, "parses headers");
        assert_eq!(result.status, TestStatus::Passed);
    }

    #[test]
    fn non_result_lines_are_ignored() {
        assert!(parse("TAP version 13").is_none());
        assert!(parse("1..4").is_none());
        assert!(parse("# pass 4").is_none());
        assert!(parse("okay 1 - nope").is_none());
    }

    #[test]
    fn summary_from_trailer() {
        let output = "# tests 3\n# suites 1\n# pass 2\n# fail 1\n# cancelled 0\n";
        assert_eq!(NodeTap.summary(output), RunResults::new(2, 1, 0));
    }
}
