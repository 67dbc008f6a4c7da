//! Output rendering for the qactl CLI.

use qa_core::types::{RunResults, RunStatus, TestResult, TestRun, TestRunListing, TestStatus};

use crate::client::Stats;

/// Print confirmation after starting a run.
pub fn print_run_created(run: &TestRunListing) {
    println!("Started run: {}", run.id);
    println!("  Category: {}", run.category.as_str());
    println!("  Command:  {}", run.command);
    println!("  Status:   {}", format_status(run.status));
}

/// Print a list of runs in tabular format.
pub fn print_run_list(runs: &[TestRunListing]) {
    if runs.is_empty() {
        println!("No runs found.");
        return;
    }

    println!(
        "{:<36}  {:<8}  {:<8}  {:<18}  {:<19}  {:>8}",
        "ID", "CATEGORY", "STATUS", "RESULTS", "STARTED", "DURATION"
    );
    println!("{}", "-".repeat(106));

    for run in runs {
        println!(
            "{:<36}  {:<8}  {:<8}  {:<18}  {:<19}  {:>8}",
            run.id.0,
            run.category.as_str(),
            format_status(run.status),
            format_results(&run.results),
            format_time(&run.started_at),
            format_duration(run.duration),
        );
    }

    println!();
    println!("{} run(s)", runs.len());
}

/// Print a run, optionally with its parsed tests and raw output.
pub fn print_run_details(run: &TestRun, tests: Option<&[TestResult]>, show_output: bool) {
    println!("Run: {}", run.id);
    println!();
    println!("  Status:    {}", format_status(run.status));
    println!("  Category:  {}", run.category.as_str());
    if let Some(project_id) = &run.project_id {
        println!("  Project:   {project_id}");
    }
    if let Some(file_id) = &run.file_id {
        println!("  File:      {file_id}");
    }
    println!("  Command:   {}", run.command);
    println!("  Results:   {}", format_results(&run.results));
    println!("  Started:   {}", format_time(&run.started_at));
    if let Some(completed) = &run.completed_at {
        println!("  Completed: {}", format_time(completed));
    }
    println!("  Duration:  {}", format_duration(run.duration));

    if let Some(tests) = tests {
        println!();
        if tests.is_empty() {
            println!("  No individual tests recognized in output.");
        }
        for test in tests {
            let duration = test
                .duration
                .as_deref()
                .map(|d| format!(" ({d})"))
                .unwrap_or_default();
            println!("  {} {}{}", test_glyph(test.status), test.name, duration);
            if let Some(error) = &test.error {
                for line in error.lines() {
                    println!("      {line}");
                }
            }
        }
    }

    if show_output {
        println!();
        println!("--- output ---");
        print!("{}", run.output);
        if !run.output.ends_with('\n') {
            println!();
        }
    }
}

pub fn print_stats(stats: &Stats) {
    println!("Projects:    {}", stats.projects);
    println!(
        "Test cases:  {}  {}",
        stats.test_cases.total,
        format_counts(&stats.test_cases.by_type)
    );
    println!("  status:    {}", format_counts(&stats.test_cases.by_status));
    println!("  priority:  {}", format_counts(&stats.test_cases.by_priority));
    println!(
        "Test files:  {}  {}",
        stats.test_files.total,
        format_counts(&stats.test_files.by_type)
    );
    println!(
        "Test runs:   {}  passed={} failed={} error={}",
        stats.test_runs.total,
        stats.test_runs.passed,
        stats.test_runs.failed,
        stats.test_runs.error
    );
    match &stats.last_run {
        Some(last) => println!(
            "Last run:    {} {} {} {}",
            last.id,
            format_status(last.status),
            format_results(&last.results),
            last.completed_at.as_ref().map_or_else(|| "-".to_string(), format_time)
        ),
        None => println!("Last run:    -"),
    }
}

pub fn format_status(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "RUNNING",
        RunStatus::Passed => "PASSED",
        RunStatus::Failed => "FAILED",
        RunStatus::Error => "ERROR",
    }
}

fn test_glyph(status: TestStatus) -> &'static str {
    match status {
        TestStatus::Passed => "✓",
        TestStatus::Failed => "✘",
        TestStatus::Skipped => "-",
    }
}

fn format_results(results: &RunResults) -> String {
    format!(
        "{}/{} ({} failed, {} skipped)",
        results.passed, results.total, results.failed, results.skipped
    )
}

fn format_counts(counts: &std::collections::BTreeMap<String, usize>) -> String {
    counts
        .iter()
        .map(|(key, count)| format!("{key}={count}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn format_duration(ms: Option<u64>) -> String {
    match ms {
        None => "-".to_string(),
        Some(ms) if ms < 1000 => format!("{ms}ms"),
        Some(ms) => format!("{:.1}s", ms as f64 / 1000.0),
    }
}
