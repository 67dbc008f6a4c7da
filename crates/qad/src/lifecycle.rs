//! Run lifecycle management.
//!
//! Resolves run requests to commands, persists the `running` record, and
//! drives each execution on its own task until a single conditional update
//! moves the run to `passed`, `failed` or `error`.

use std::sync::Arc;

use chrono::Utc;
use qa_core::command::{CommandBuilder, CommandError, RunRequest, RunScope};
use qa_core::parser::parse_summary;
use qa_core::{Config, Id, Project, RunResults, RunStatus, TestFile, TestRun};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::executor::{Execution, ExecutionOutcome, Executor, ExecutorConfig};
use crate::storage::{RunCompletion, Storage, StorageError};

/// Output of runs found `running` when the daemon starts.
pub const RESTART_NOTE: &str = "interrupted: daemon restarted before the run completed";

/// Appended to the output of runs cancelled by daemon shutdown.
pub const SHUTDOWN_NOTE: &str = "interrupted: daemon shut down before the run completed";

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    InvalidRequest(#[from] CommandError),
    #[error("Test file not found")]
    FileNotFound(Id),
    #[error("Project not found")]
    ProjectNotFound(Id),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("daemon is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

/// A request resolved to the command that will run.
#[derive(Debug, Clone)]
struct ResolvedRun {
    project_id: Option<Id>,
    file_id: Option<Id>,
    run: TestRun,
}

/// Everything an execution task needs, cloned out of the manager.
struct RunContext {
    storage: Arc<Storage>,
    executor: Executor,
    concurrency: Arc<Semaphore>,
    cancel: CancellationToken,
}

/// Owns run creation and asynchronous completion.
#[derive(Debug)]
pub struct RunManager {
    storage: Arc<Storage>,
    commands: CommandBuilder,
    executor: Executor,
    /// Bounds simultaneously executing child processes.
    concurrency: Arc<Semaphore>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl RunManager {
    pub fn new(storage: Arc<Storage>, config: &Config) -> Self {
        let permits = match config.max_concurrent_runs {
            0 => Semaphore::MAX_PERMITS,
            n => n,
        };
        Self {
            storage,
            commands: CommandBuilder::from_config(config),
            executor: Executor::new(ExecutorConfig::from_config(config)),
            concurrency: Arc::new(Semaphore::new(permits)),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Command builder, also used to place test files on disk.
    pub fn commands(&self) -> &CommandBuilder {
        &self.commands
    }

    /// Number of executions that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Accept a run request.
    ///
    /// Validation and lookups happen before anything is stored: a rejected
    /// request leaves no record. On success the returned run is `running`
    /// and its execution has been scheduled.
    pub async fn start_run(&self, request: &RunRequest) -> Result<TestRun> {
        if self.shutdown.is_cancelled() {
            return Err(LifecycleError::ShuttingDown);
        }

        let resolved = self.resolve(request).await?;
        self.storage.insert_run(&resolved.run).await?;

        info!(
            run_id = %resolved.run.id,
            category = resolved.run.category.as_str(),
            project_id = ?resolved.project_id,
            file_id = ?resolved.file_id,
            command = %resolved.run.command,
            "test run started"
        );

        let ctx = RunContext {
            storage: Arc::clone(&self.storage),
            executor: self.executor.clone(),
            concurrency: Arc::clone(&self.concurrency),
            cancel: self.shutdown.child_token(),
        };
        let run_id = resolved.run.id.clone();
        let command = resolved.run.command.clone();
        self.tasks.spawn(drive_run(ctx, run_id, command));

        Ok(resolved.run)
    }

    async fn resolve(&self, request: &RunRequest) -> Result<ResolvedRun> {
        let (command, project_id, file_id) = match request.scope()? {
            RunScope::File(file_id) => {
                let file: TestFile = match self.storage.get_document(&file_id).await {
                    Ok(file) => file,
                    Err(StorageError::DocumentNotFound { .. }) => {
                        return Err(LifecycleError::FileNotFound(file_id));
                    }
                    Err(err) => return Err(err.into()),
                };
                let project_id = request
                    .project_id()
                    .cloned()
                    .or_else(|| file.project_id.clone());
                (self.commands.for_file(&file), project_id, Some(file_id))
            }
            RunScope::Project(project_id) => {
                match self.storage.get_document::<Project>(&project_id).await {
                    Ok(_) => {}
                    Err(StorageError::DocumentNotFound { .. }) => {
                        return Err(LifecycleError::ProjectNotFound(project_id));
                    }
                    Err(err) => return Err(err.into()),
                }
                (self.commands.for_project(&project_id), Some(project_id), None)
            }
            RunScope::Category(category) => (self.commands.for_category(category), None, None),
        };

        let run = TestRun::started(
            project_id.clone(),
            file_id.clone(),
            command.category,
            command.command_line,
        );
        Ok(ResolvedRun {
            project_id,
            file_id,
            run,
        })
    }

    /// Mark runs left `running` by a previous daemon process as `error`.
    pub async fn recover_interrupted(&self) -> Result<u64> {
        let count = self.storage.fail_interrupted_runs(RESTART_NOTE).await?;
        if count > 0 {
            warn!(count, "marked interrupted test runs as error");
        }
        Ok(count)
    }

    /// Cancel in-flight executions and wait for their final updates.
    pub async fn shutdown(&self) {
        info!(in_flight = self.tasks.len(), "stopping test runs");
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

/// Execute one run and record its terminal state.
async fn drive_run(ctx: RunContext, run_id: Id, command: String) {
    let permit = tokio::select! {
        permit = Arc::clone(&ctx.concurrency).acquire_owned() => permit.ok(),
        () = ctx.cancel.cancelled() => None,
    };

    let completion = match permit {
        None => RunCompletion {
            status: RunStatus::Error,
            output: SHUTDOWN_NOTE.to_string(),
            results: RunResults::default(),
            completed_at: Utc::now(),
        },
        Some(_permit) => match ctx.executor.execute(&run_id, &command, ctx.cancel.clone()).await {
            Ok(execution) => completion_for(execution),
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "test process could not be run");
                RunCompletion {
                    status: RunStatus::Error,
                    output: err.to_string(),
                    results: RunResults::default(),
                    completed_at: Utc::now(),
                }
            }
        },
    };

    match ctx.storage.complete_run(&run_id, &completion).await {
        Ok(true) => info!(
            run_id = %run_id,
            status = completion.status.as_str(),
            total = completion.results.total,
            passed = completion.results.passed,
            failed = completion.results.failed,
            skipped = completion.results.skipped,
            "test run finished"
        ),
        Ok(false) => warn!(
            run_id = %run_id,
            status = completion.status.as_str(),
            "run already terminal or evicted; result dropped"
        ),
        Err(err) => error!(run_id = %run_id, error = %err, "failed to record run result"),
    }
}

/// Map a finished execution to the run's terminal state.
fn completion_for(execution: Execution) -> RunCompletion {
    let mut output = execution.output;
    let status = match execution.outcome {
        ExecutionOutcome::Exited(code) => RunStatus::from_exit_code(code),
        ExecutionOutcome::TimedOut => RunStatus::Failed,
        ExecutionOutcome::Cancelled => {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(SHUTDOWN_NOTE);
            RunStatus::Error
        }
    };

    RunCompletion {
        status,
        results: parse_summary(&output),
        output,
        completed_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use qa_core::{Category, ProjectType, TestType};
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        manager: RunManager,
        storage: Arc<Storage>,
        dir: TempDir,
    }

    async fn harness(configure: impl FnOnce(&mut Config)) -> Harness {
        let dir = TempDir::new().unwrap();
        let mut config = Config {
            data_dir: dir.path().join("data"),
            workspace_root: dir.path().to_path_buf(),
            tests_dir: dir.path().join("tests"),
            browser_runner: "echo '4 passed, 1 skipped' #".to_string(),
            unit_runner: "echo '# pass 2'; echo '# fail 1'; false".to_string(),
            run_timeout_sec: 30,
            ..Default::default()
        };
        configure(&mut config);
        for sub in ["api", "ui", "unit", "projects"] {
            std::fs::create_dir_all(config.tests_dir.join(sub)).unwrap();
        }

        let storage = Storage::new(&config.db_path(), config.run_retention)
            .await
            .unwrap();
        storage.migrate_embedded().await.unwrap();
        let storage = Arc::new(storage);
        let manager = RunManager::new(Arc::clone(&storage), &config);
        Harness {
            manager,
            storage,
            dir,
        }
    }

    async fn wait_for_terminal(storage: &Storage, id: &Id) -> TestRun {
        for _ in 0..500 {
            let run = storage.get_run(id).await.unwrap();
            if run.status.is_terminal() {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("run {id} did not finish");
    }

    async fn insert_file(storage: &Storage, tests_dir: &Path, project_id: Option<Id>) -> TestFile {
        let now = Utc::now();
        let id = Id::new();
        let file = TestFile {
            file_path: tests_dir
                .join("api")
                .join("login.spec.js")
                .display()
                .to_string(),
            id,
            project_id,
            filename: "login.spec.js".to_string(),
            test_type: TestType::Api,
            language: "javascript".to_string(),
            description: String::new(),
            content: String::new(),
            created_at: now,
            updated_at: now,
        };
        storage.insert_document(&file).await.unwrap();
        file
    }

    fn request(json: serde_json::Value) -> RunRequest {
        serde_json::from_value(json).unwrap()
    }

    #[tokio::test]
    async fn unknown_file_is_not_found_and_creates_nothing() {
        let h = harness(|_| {}).await;
        let err = h
            .manager
            .start_run(&request(serde_json::json!({ "fileId": "missing" })))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::FileNotFound(_)));
        assert!(h.storage.list_runs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_project_is_not_found() {
        let h = harness(|_| {}).await;
        let err = h
            .manager
            .start_run(&request(serde_json::json!({ "projectId": "nope" })))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::ProjectNotFound(_)));
    }

    #[tokio::test]
    async fn explicit_command_is_rejected_before_storing() {
        let h = harness(|_| {}).await;
        let err = h
            .manager
            .start_run(&request(serde_json::json!({ "command": "echo hi" })))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidRequest(CommandError::CustomCommandUnsupported)
        ));
        assert!(h.storage.list_runs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn passing_category_run() {
        let h = harness(|_| {}).await;
        let run = h
            .manager
            .start_run(&request(serde_json::json!({ "category": "ui" })))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.category, Category::Ui);
        assert_eq!(run.results, RunResults::default());

        let done = wait_for_terminal(&h.storage, &run.id).await;
        assert_eq!(done.status, RunStatus::Passed);
        assert_eq!(done.results, RunResults::new(4, 0, 1));
        assert_eq!(done.results.total, 5);
        assert!(done.completed_at.is_some());
        assert!(done.duration.is_some());
        assert_eq!(done.command, run.command);
    }

    #[tokio::test]
    async fn failing_unit_run_uses_tap_counts() {
        let h = harness(|_| {}).await;
        let run = h
            .manager
            .start_run(&request(serde_json::json!({ "type": "unit" })))
            .await
            .unwrap();

        let done = wait_for_terminal(&h.storage, &run.id).await;
        assert_eq!(done.status, RunStatus::Failed);
        assert_eq!(done.results, RunResults::new(2, 1, 0));
    }

    #[tokio::test]
    async fn timeout_fails_with_zero_results() {
        let h = harness(|config| {
            config.browser_runner = "sleep 10 #".to_string();
            config.run_timeout_sec = 1;
        })
        .await;
        let run = h
            .manager
            .start_run(&RunRequest::default())
            .await
            .unwrap();

        let done = wait_for_terminal(&h.storage, &run.id).await;
        assert_eq!(done.status, RunStatus::Failed);
        assert_eq!(done.results, RunResults::default());
        assert!(done.output.contains("timed out"));
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error_run() {
        let h = harness(|config| {
            config.workspace_root = PathBuf::from("/nonexistent/qad-workspace");
        })
        .await;
        let run = h
            .manager
            .start_run(&RunRequest::default())
            .await
            .unwrap();

        let done = wait_for_terminal(&h.storage, &run.id).await;
        assert_eq!(done.status, RunStatus::Error);
        assert!(done.output.contains("failed to start test process"));
        assert_eq!(done.results, RunResults::default());
    }

    #[tokio::test]
    async fn repeated_file_runs_are_independent() {
        let h = harness(|_| {}).await;
        let file = insert_file(&h.storage, &h.dir.path().join("tests"), None).await;
        let req = request(serde_json::json!({ "fileId": file.id }));

        let first = h.manager.start_run(&req).await.unwrap();
        let second = h.manager.start_run(&req).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(first.file_id.as_ref(), Some(&file.id));

        for id in [&first.id, &second.id] {
            let done = wait_for_terminal(&h.storage, id).await;
            assert_eq!(done.status, RunStatus::Passed);
        }
    }

    #[tokio::test]
    async fn file_run_inherits_project_from_file() {
        let h = harness(|_| {}).await;
        let project_id = Id::new();
        let file = insert_file(
            &h.storage,
            &h.dir.path().join("tests"),
            Some(project_id.clone()),
        )
        .await;

        let run = h
            .manager
            .start_run(&request(serde_json::json!({ "fileId": file.id })))
            .await
            .unwrap();
        assert_eq!(run.project_id, Some(project_id));
        assert_eq!(run.category, Category::Api);
        assert!(run.command.contains("login.spec.js"));
        wait_for_terminal(&h.storage, &run.id).await;
    }

    #[tokio::test]
    async fn project_without_tests_passes_with_zero_results() {
        let h = harness(|_| {}).await;
        let now = Utc::now();
        let project = Project {
            id: Id::new(),
            name: "empty".to_string(),
            description: String::new(),
            base_url: String::new(),
            project_type: ProjectType::Mixed,
            created_at: now,
            updated_at: now,
        };
        h.storage.insert_document(&project).await.unwrap();

        let run = h
            .manager
            .start_run(&request(serde_json::json!({ "projectId": project.id })))
            .await
            .unwrap();
        let done = wait_for_terminal(&h.storage, &run.id).await;
        assert_eq!(done.status, RunStatus::Passed);
        assert_eq!(done.output, "No test files found for project\n");
        assert_eq!(done.results, RunResults::default());
    }

    #[tokio::test]
    async fn all_category_runs_both_halves() {
        let h = harness(|config| {
            config.browser_runner = "echo browser-half; false".to_string();
            config.unit_runner = "echo unit-half".to_string();
        })
        .await;
        let run = h
            .manager
            .start_run(&request(serde_json::json!({ "category": "all" })))
            .await
            .unwrap();

        let done = wait_for_terminal(&h.storage, &run.id).await;
        assert!(done.output.contains("browser-half"));
        assert!(done.output.contains("unit-half"));
        assert_eq!(done.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn all_category_fails_when_only_unit_half_fails() {
        let h = harness(|config| {
            config.browser_runner = "echo '3 passed'; true".to_string();
            config.unit_runner = "echo unit-half; false".to_string();
        })
        .await;
        let run = h
            .manager
            .start_run(&request(serde_json::json!({ "category": "all" })))
            .await
            .unwrap();

        let done = wait_for_terminal(&h.storage, &run.id).await;
        assert!(done.output.contains("3 passed"));
        assert!(done.output.contains("unit-half"));
        assert_eq!(done.status, RunStatus::Failed);
        assert_eq!(done.results, RunResults::new(3, 0, 0));
    }

    #[tokio::test]
    async fn queued_runs_stay_running_until_a_slot_frees() {
        let h = harness(|config| {
            config.max_concurrent_runs = 1;
            config.browser_runner = "sleep 0.3; echo '1 passed' #".to_string();
        })
        .await;

        let first = h.manager.start_run(&RunRequest::default()).await.unwrap();
        let second = h.manager.start_run(&RunRequest::default()).await.unwrap();

        let done = wait_for_terminal(&h.storage, &first.id).await;
        assert_eq!(done.status, RunStatus::Passed);
        let done = wait_for_terminal(&h.storage, &second.id).await;
        assert_eq!(done.status, RunStatus::Passed);
        assert!(done.started_at <= done.completed_at.unwrap());
    }

    #[tokio::test]
    async fn recover_interrupted_marks_leftovers_as_error() {
        let h = harness(|_| {}).await;
        let stale = TestRun::started(None, None, Category::Api, "true".to_string());
        h.storage.insert_run(&stale).await.unwrap();

        assert_eq!(h.manager.recover_interrupted().await.unwrap(), 1);
        let run = h.storage.get_run(&stale.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.output, RESTART_NOTE);
    }

    #[tokio::test]
    async fn shutdown_interrupts_in_flight_runs() {
        let h = harness(|config| {
            config.browser_runner = "echo warming up; sleep 10 #".to_string();
        })
        .await;
        let run = h.manager.start_run(&RunRequest::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        h.manager.shutdown().await;
        assert_eq!(h.manager.in_flight(), 0);

        let done = h.storage.get_run(&run.id).await.unwrap();
        assert_eq!(done.status, RunStatus::Error);
        assert!(done.output.contains("warming up"));
        assert!(done.output.ends_with(SHUTDOWN_NOTE));

        let err = h
            .manager
            .start_run(&RunRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::ShuttingDown));
    }

    #[test]
    fn completion_maps_outcomes() {
        let exec = |outcome, output: &str| Execution {
            outcome,
            output: output.to_string(),
            duration_ms: 5,
        };

        let passed = completion_for(exec(ExecutionOutcome::Exited(0), "3 passed"));
        assert_eq!(passed.status, RunStatus::Passed);
        assert_eq!(passed.results.total, 3);

        let failed = completion_for(exec(ExecutionOutcome::Exited(2), "1 passed\n1 failed"));
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.results, RunResults::new(1, 1, 0));

        let timed_out = completion_for(exec(ExecutionOutcome::TimedOut, "starting"));
        assert_eq!(timed_out.status, RunStatus::Failed);
        assert!(timed_out.results.is_empty());

        let cancelled = completion_for(exec(ExecutionOutcome::Cancelled, "partial"));
        assert_eq!(cancelled.status, RunStatus::Error);
        assert_eq!(cancelled.output, format!("partial\n{SHUTDOWN_NOTE}"));
    }
}
