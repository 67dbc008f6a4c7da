//! qactl - CLI client for qad
//!
//! Starts test runs on the QA dashboard daemon and inspects their results.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod client;
mod render;

use std::time::Duration;

use clap::{Parser, Subcommand};
use client::{Client, ClientError};
use qa_core::command::RunRequest;
use qa_core::types::{Id, RunStatus, TestRun};

/// CLI client for the qad QA dashboard daemon.
#[derive(Parser)]
#[command(name = "qactl")]
#[command(about = "Run and inspect tests on a qad daemon")]
#[command(version)]
struct Cli {
    /// Daemon address
    #[arg(
        long,
        global = true,
        env = "QAD_ADDR",
        default_value = "http://127.0.0.1:3000"
    )]
    addr: String,

    /// Auth token for daemon API
    #[arg(long, global = true, env = "QAD_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a test run (defaults to the api category)
    Run {
        /// Run one test file
        #[arg(long, conflicts_with_all = ["project", "category"])]
        file: Option<String>,

        /// Run every test file of a project
        #[arg(long, conflicts_with = "category")]
        project: Option<String>,

        /// Run a category: api, ui, unit or all
        #[arg(long)]
        category: Option<String>,

        /// Poll until the run finishes; exit non-zero unless it passed
        #[arg(long)]
        wait: bool,

        /// Poll interval for --wait
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
    },

    /// List runs, newest first
    List {
        /// Only runs of this project
        #[arg(long)]
        project: Option<String>,
    },

    /// Show one run
    Show {
        run_id: String,

        /// Include per-test results parsed from the output
        #[arg(long)]
        tests: bool,

        /// Include the full captured output
        #[arg(long)]
        output: bool,
    },

    /// Wait for a run to finish; exit non-zero unless it passed
    Wait {
        run_id: String,

        #[arg(long, default_value = "1000")]
        interval_ms: u64,
    },

    /// Aggregate counts
    Stats {
        /// Only this project
        #[arg(long)]
        project: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let client = Client::new(&cli.addr, cli.token.as_deref());

    if let Err(e) = client.wait_for_ready().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }

    let result = match cli.command {
        Command::Run {
            file,
            project,
            category,
            wait,
            interval_ms,
        } => {
            let req = RunRequest {
                command: None,
                file_id: file.map(Id::from_string),
                project_id: project.map(Id::from_string),
                category,
            };
            let interval = wait.then(|| Duration::from_millis(interval_ms));
            run_create(&client, &req, interval).await
        }
        Command::List { project } => run_list(&client, project.as_deref()).await,
        Command::Show {
            run_id,
            tests,
            output,
        } => run_show(&client, &run_id, tests, output).await,
        Command::Wait {
            run_id,
            interval_ms,
        } => run_wait(&client, &run_id, Duration::from_millis(interval_ms)).await,
        Command::Stats { project } => run_stats(&client, project.as_deref()).await,
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}

/// Commands return whether the process should exit successfully.
type Outcome = Result<bool, ClientError>;

async fn run_create(client: &Client, req: &RunRequest, wait: Option<Duration>) -> Outcome {
    let run = client.create_run(req).await?;
    render::print_run_created(&run);

    match wait {
        Some(interval) => run_wait(client, &run.id.0, interval).await,
        None => Ok(true),
    }
}

async fn run_list(client: &Client, project_id: Option<&str>) -> Outcome {
    let runs = client.list_runs(project_id).await?;
    render::print_run_list(&runs);
    Ok(true)
}

async fn run_show(client: &Client, run_id: &str, tests: bool, output: bool) -> Outcome {
    let run = client.get_run(run_id).await?;
    let detail = if tests {
        Some(client.get_results(run_id).await?)
    } else {
        None
    };
    render::print_run_details(&run, detail.as_ref().map(|d| d.tests.as_slice()), output);
    Ok(true)
}

async fn run_wait(client: &Client, run_id: &str, interval: Duration) -> Outcome {
    let run = client.wait_for_run(run_id, interval).await?;
    report_final(&run);
    Ok(run.status == RunStatus::Passed)
}

async fn run_stats(client: &Client, project_id: Option<&str>) -> Outcome {
    let stats = client.stats(project_id).await?;
    render::print_stats(&stats);
    Ok(true)
}

fn report_final(run: &TestRun) {
    println!(
        "Run {} finished: {} ({} passed, {} failed, {} skipped)",
        run.id,
        render::format_status(run.status),
        run.results.passed,
        run.results.failed,
        run.results.skipped
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_targets_are_exclusive() {
        let err = Cli::try_parse_from(["qactl", "run", "--file", "f1", "--project", "p1"]);
        assert!(err.is_err());
    }

    #[test]
    fn run_wait_flag_and_interval() {
        let args = ["qactl", "run", "--category", "unit", "--wait", "--interval-ms", "50"];
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Command::Run {
                category,
                wait,
                interval_ms,
                ..
            } => {
                assert_eq!(category.as_deref(), Some("unit"));
                assert!(wait);
                assert_eq!(interval_ms, 50);
            }
            _ => panic!("expected run command"),
        }
    }
}
