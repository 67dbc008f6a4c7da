//! qad - QA dashboard daemon
//!
//! Library components for the daemon process: the SQLite store, the child
//! process executor, the run lifecycle manager and the HTTP API.

pub mod executor;
pub mod lifecycle;
pub mod server;
pub mod storage;

use std::net::SocketAddr;
use std::sync::Arc;

use lifecycle::RunManager;
use qa_core::Config;
use server::AppState;
use storage::{Storage, StorageError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Subdirectories of the tests directory created at startup.
const TEST_SUBDIRS: [&str; 4] = ["api", "ui", "unit", "projects"];

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("failed to prepare {path}: {source}")]
    Directory {
        path: String,
        source: std::io::Error,
    },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("HTTP server error: {0}")]
    Server(std::io::Error),
}

/// Daemon state.
#[derive(Debug)]
pub struct Daemon {
    config: Config,
    storage: Arc<Storage>,
    runs: Arc<RunManager>,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Prepare directories and storage, and settle runs left over from a
    /// previous process.
    pub async fn new(config: Config) -> Result<Self, DaemonError> {
        ensure_dir(&config.data_dir).await?;
        for sub in TEST_SUBDIRS {
            ensure_dir(&config.tests_dir.join(sub)).await?;
        }

        let storage = Storage::new(&config.db_path(), config.run_retention).await?;
        storage.migrate_embedded().await?;
        let storage = Arc::new(storage);

        let runs = Arc::new(RunManager::new(Arc::clone(&storage), &config));
        if let Err(e) = runs.recover_interrupted().await {
            warn!(error = %e, "failed to recover interrupted runs");
        }

        Ok(Self {
            config,
            storage,
            runs,
            shutdown: CancellationToken::new(),
        })
    }

    /// Get a reference to the storage backend.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Get a reference to the run manager.
    pub fn runs(&self) -> &Arc<RunManager> {
        &self.runs
    }

    /// Serve the HTTP API until shutdown, then settle in-flight runs.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let addr = SocketAddr::new(self.config.bind_addr, self.config.port);
        info!("qad starting on {}", addr);
        info!("database: {}", self.config.db_path().display());
        info!("tests directory: {}", self.config.tests_dir.display());
        info!("max concurrent runs: {}", self.config.max_concurrent_runs);
        if self.config.auth_token.is_some() {
            info!("auth token: enabled");
        }

        let state = Arc::new(AppState {
            storage: Arc::clone(&self.storage),
            runs: Arc::clone(&self.runs),
            auth_token: self.config.auth_token.clone(),
            output_preview_chars: self.config.output_preview_chars,
        });

        let served = server::start_server(state, addr, self.shutdown.clone()).await;
        self.runs.shutdown().await;
        info!("daemon stopped");

        served.map_err(DaemonError::Server)
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.cancel();
    }
}

async fn ensure_dir(path: &std::path::Path) -> Result<(), DaemonError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| DaemonError::Directory {
            path: path.display().to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use qa_core::{Category, RunStatus, TestRun};
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        Config {
            data_dir: dir.path().join("data"),
            workspace_root: dir.path().to_path_buf(),
            tests_dir: dir.path().join("tests"),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn new_creates_directories() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let _daemon = Daemon::new(config.clone()).await.unwrap();

        assert!(config.data_dir.is_dir());
        for sub in TEST_SUBDIRS {
            assert!(config.tests_dir.join(sub).is_dir(), "{sub} missing");
        }
    }

    #[tokio::test]
    async fn restart_fails_leftover_running_runs() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let run = TestRun::started(None, None, Category::Api, "sleep 100".to_string());
        {
            let daemon = Daemon::new(config.clone()).await.unwrap();
            daemon.storage().insert_run(&run).await.unwrap();
        }

        let daemon = Daemon::new(config).await.unwrap();
        let stored = daemon.storage().get_run(&run.id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Error);
        assert!(stored.completed_at.is_some_and(|at| at <= Utc::now()));
        assert!(stored.output.contains(lifecycle::RESTART_NOTE));
    }
}
