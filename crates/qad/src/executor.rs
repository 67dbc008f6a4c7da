//! Process executor for test runner commands.
//!
//! Runs one command line under `sh -c` with a wall-clock timeout. stdout and
//! stderr are forwarded chunk by chunk over a channel and appended in arrival
//! order to a single bounded buffer, so partial output survives timeouts and
//! cancellation.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use qa_core::{Config, Id};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between heartbeat log messages while a test process runs.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long to keep draining output after the process has exited or been
/// killed. Grandchildren that inherited the pipes can hold them open.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pending chunks between the pipe readers and the collector.
const CHUNK_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to start test process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed waiting for test process: {0}")]
    Wait(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// How the process wait loop terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The process exited on its own. Signal deaths report -1.
    Exited(i32),
    /// The timeout elapsed and the process was killed.
    TimedOut,
    /// Cancellation was requested and the process was killed.
    Cancelled,
}

/// Result of running one command.
#[derive(Debug, Clone)]
pub struct Execution {
    pub outcome: ExecutionOutcome,
    /// Combined stdout and stderr in arrival order.
    pub output: String,
    pub duration_ms: u64,
}

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Working directory of the child process.
    pub working_dir: PathBuf,
    /// Wall-clock limit; `None` disables it.
    pub timeout: Option<Duration>,
    pub max_output_bytes: usize,
}

impl ExecutorConfig {
    pub fn from_config(config: &Config) -> Self {
        let timeout = (config.run_timeout_sec > 0)
            .then(|| Duration::from_secs(u64::from(config.run_timeout_sec)));
        Self {
            working_dir: config.workspace_root.clone(),
            timeout,
            max_output_bytes: config.max_output_bytes,
        }
    }
}

/// Output collected from both pipes, capped at `max_bytes`.
struct OutputBuffer {
    buf: Vec<u8>,
    max_bytes: usize,
    truncated: bool,
}

impl OutputBuffer {
    fn new(max_bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(max_bytes.min(8192)),
            max_bytes,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let remaining = self.max_bytes.saturating_sub(self.buf.len());
        if chunk.len() > remaining && !self.truncated {
            warn!(max_bytes = self.max_bytes, "output exceeded limit, truncating");
            self.truncated = true;
        }
        self.buf.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
    }

    fn into_string(self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

/// Forward everything read from `reader` to `tx` until EOF.
async fn forward_chunks<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    tx: mpsc::Sender<Vec<u8>>,
) -> std::io::Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        if tx.send(chunk[..n].to_vec()).await.is_err() {
            // Collector is gone; nothing left to do with the data.
            return Ok(());
        }
    }
}

/// Kill the child's whole process group, then reap the child.
///
/// Runners fork workers and browsers that would otherwise outlive the shell
/// and keep the output pipes open.
async fn terminate(child: &mut Child, run_id: &Id) {
    if let Some(pid) = child.id() {
        if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            warn!(run_id = %run_id, error = %err, "failed to kill process group");
        }
    }
    if let Err(err) = child.kill().await {
        warn!(run_id = %run_id, error = %err, "failed to kill test process");
    }
}

/// Sleep until `deadline`, or forever when there is none.
async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Runs test commands as child processes.
#[derive(Debug, Clone)]
pub struct Executor {
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    /// Run `command_line` to completion, timeout, or cancellation.
    ///
    /// A non-zero exit is a normal [`ExecutionOutcome::Exited`]; only a
    /// failure to start or wait for the process is an error.
    pub async fn execute(
        &self,
        run_id: &Id,
        command_line: &str,
        cancel_token: CancellationToken,
    ) -> Result<Execution> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command_line)
            .current_dir(&self.config.working_dir)
            .env("FORCE_COLOR", "0")
            .env("NO_COLOR", "1")
            .env("CI", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        debug!(
            run_id = %run_id,
            command = %command_line,
            working_dir = %self.config.working_dir.display(),
            "spawning test process"
        );

        let mut child = cmd.spawn().map_err(ExecutorError::Spawn)?;

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(CHUNK_CHANNEL_CAPACITY);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            let run_id = run_id.clone();
            readers.push(tokio::spawn(async move {
                if let Err(err) = forward_chunks(stdout, tx).await {
                    warn!(run_id = %run_id, error = %err, "stdout capture failed");
                }
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = tx.clone();
            let run_id = run_id.clone();
            readers.push(tokio::spawn(async move {
                if let Err(err) = forward_chunks(stderr, tx).await {
                    warn!(run_id = %run_id, error = %err, "stderr capture failed");
                }
            }));
        }
        // Readers hold the only senders, so the channel closes at EOF.
        drop(tx);

        let started = Instant::now();
        let deadline = self.config.timeout.map(|t| started + t);
        let mut heartbeat =
            tokio::time::interval_at(started + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
        let mut output = OutputBuffer::new(self.config.max_output_bytes);
        let mut pipes_open = true;

        let outcome = loop {
            tokio::select! {
                result = child.wait() => {
                    let status = result.map_err(ExecutorError::Wait)?;
                    break ExecutionOutcome::Exited(status.code().unwrap_or(-1));
                }
                chunk = rx.recv(), if pipes_open => match chunk {
                    Some(chunk) => output.push(&chunk),
                    None => pipes_open = false,
                },
                () = cancel_token.cancelled() => {
                    info!(run_id = %run_id, "cancellation requested; killing test process");
                    terminate(&mut child, run_id).await;
                    break ExecutionOutcome::Cancelled;
                }
                () = sleep_until_deadline(deadline) => {
                    warn!(
                        run_id = %run_id,
                        timeout_ms = self.config.timeout.map_or(0, |t| t.as_millis()),
                        "test process timed out; killing"
                    );
                    terminate(&mut child, run_id).await;
                    break ExecutionOutcome::TimedOut;
                }
                _ = heartbeat.tick() => {
                    info!(
                        run_id = %run_id,
                        elapsed_sec = started.elapsed().as_secs(),
                        output_bytes = output.buf.len(),
                        "test process still running"
                    );
                }
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;

        // Drain what the pipes still hold after exit or kill.
        let drain_deadline = Instant::now() + IO_CAPTURE_TIMEOUT;
        while pipes_open {
            match tokio::time::timeout_at(drain_deadline, rx.recv()).await {
                Ok(Some(chunk)) => output.push(&chunk),
                Ok(None) => pipes_open = false,
                Err(_) => {
                    warn!(run_id = %run_id, "output capture timed out; pipes held open");
                    break;
                }
            }
        }
        for reader in readers {
            reader.abort();
        }

        let mut output = output.into_string();

        if outcome == ExecutionOutcome::TimedOut {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            let secs = self.config.timeout.map_or(0, |t| t.as_secs());
            output.push_str(&format!(
                "Test run timed out after {secs}s; the process was killed.\n"
            ));
        }

        info!(
            run_id = %run_id,
            outcome = ?outcome,
            duration_ms,
            output_bytes = output.len(),
            "test process finished"
        );

        Ok(Execution {
            outcome,
            output,
            duration_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn executor(dir: &TempDir, timeout: Option<Duration>, max_output_bytes: usize) -> Executor {
        Executor::new(ExecutorConfig {
            working_dir: dir.path().to_path_buf(),
            timeout,
            max_output_bytes,
        })
    }

    async fn run(executor: &Executor, command: &str) -> Execution {
        executor
            .execute(&Id::new(), command, CancellationToken::new())
            .await
            .unwrap()
    }

    #[test]
    fn config_from_daemon_config() {
        let config = Config {
            run_timeout_sec: 120,
            max_output_bytes: 4096,
            workspace_root: PathBuf::from("/srv/qa"),
            ..Default::default()
        };
        let exec = ExecutorConfig::from_config(&config);
        assert_eq!(exec.timeout, Some(Duration::from_secs(120)));
        assert_eq!(exec.max_output_bytes, 4096);
        assert_eq!(exec.working_dir, PathBuf::from("/srv/qa"));

        let unlimited = Config {
            run_timeout_sec: 0,
            ..Default::default()
        };
        assert!(ExecutorConfig::from_config(&unlimited).timeout.is_none());
    }

    #[tokio::test]
    async fn zero_exit_captures_stdout() {
        let dir = TempDir::new().unwrap();
        let result = run(&executor(&dir, None, 1024), "echo hello").await;
        assert_eq!(result.outcome, ExecutionOutcome::Exited(0));
        assert_eq!(result.output, "hello\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let result = run(&executor(&dir, None, 1024), "echo failing; exit 3").await;
        assert_eq!(result.outcome, ExecutionOutcome::Exited(3));
        assert!(result.output.contains("failing"));
    }

    #[tokio::test]
    async fn stdout_and_stderr_are_combined() {
        let dir = TempDir::new().unwrap();
        let result = run(
            &executor(&dir, None, 1024),
            "echo out; sleep 0.1; echo err >&2",
        )
        .await;
        assert_eq!(result.output, "out\nerr\n");
    }

    #[tokio::test]
    async fn runs_in_working_dir_with_ci_environment() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let result = run(
            &executor(&dir, None, 1024),
            "ls; echo \"$CI $FORCE_COLOR $NO_COLOR\"",
        )
        .await;
        assert!(result.output.contains("marker.txt"));
        assert!(result.output.contains("1 0 1"));
    }

    #[tokio::test]
    async fn timeout_kills_process_and_keeps_output() {
        let dir = TempDir::new().unwrap();
        let exec = executor(&dir, Some(Duration::from_millis(200)), 1024);
        let result = run(&exec, "echo started; sleep 10; echo never").await;

        assert_eq!(result.outcome, ExecutionOutcome::TimedOut);
        assert!(result.output.starts_with("started\n"));
        assert!(result.output.contains("timed out"));
        assert!(!result.output.contains("never"));
        assert!(result.duration_ms < 2_000);
    }

    #[tokio::test]
    async fn cancellation_kills_process() {
        let dir = TempDir::new().unwrap();
        let exec = executor(&dir, None, 1024);
        let cancel_token = CancellationToken::new();
        let trigger = cancel_token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = exec
            .execute(&Id::new(), "sleep 10; echo never", cancel_token)
            .await
            .unwrap();
        assert_eq!(result.outcome, ExecutionOutcome::Cancelled);
        assert!(result.output.is_empty());
    }

    #[tokio::test]
    async fn output_is_bounded() {
        let dir = TempDir::new().unwrap();
        let exec = executor(&dir, None, 1000);
        let result = run(&exec, "head -c 100000 /dev/zero | tr '\\0' a").await;
        assert_eq!(result.outcome, ExecutionOutcome::Exited(0));
        assert_eq!(result.output.len(), 1000);
    }

    #[tokio::test]
    async fn signal_death_reports_minus_one() {
        let dir = TempDir::new().unwrap();
        let result = run(&executor(&dir, None, 1024), "kill -9 $$").await;
        assert_eq!(result.outcome, ExecutionOutcome::Exited(-1));
    }

    #[tokio::test]
    async fn missing_working_dir_is_a_spawn_error() {
        let dir = TempDir::new().unwrap();
        let exec = Executor::new(ExecutorConfig {
            working_dir: dir.path().join("does-not-exist"),
            timeout: None,
            max_output_bytes: 1024,
        });
        let result = exec
            .execute(&Id::new(), "true", CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ExecutorError::Spawn(_))));
    }
}
