//! SQLite storage for the QA dashboard daemon.
//!
//! Test runs have their own table. Projects, test cases, test files and
//! resources are JSON documents keyed by `(kind, id)`. Every mutation holds the
//! writer lock and runs inside a transaction, so read-modify-write updates
//! from concurrent run completions never interleave.

use std::path::Path;

use chrono::{DateTime, Utc};
use qa_core::{Document, Id, Project, RunResults, RunStatus, TestCase, TestFile, TestRun};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Explicit column list for `test_runs` queries.
/// `total` is stored for ad-hoc queries but recomputed from the counters on read.
const RUNS_COLUMNS: &str = "id, project_id, file_id, category, command, status, output, \
    passed, failed, skipped, started_at, completed_at, duration_ms";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("test run not found: {0}")]
    RunNotFound(String),
    #[error("{kind} not found: {id}")]
    DocumentNotFound { kind: &'static str, id: String },
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Final state written when a run leaves `running`.
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub output: String,
    pub results: RunResults,
    pub completed_at: DateTime<Utc>,
}

/// Storage backend for the daemon.
#[derive(Debug)]
pub struct Storage {
    pool: Pool<Sqlite>,
    write_lock: Mutex<()>,
    /// Newest runs kept after each insert (0 keeps everything).
    run_retention: usize,
}

impl Storage {
    /// Open (or create) the database at `db_path`.
    pub async fn new(db_path: &Path, run_retention: usize) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
            run_retention,
        })
    }

    /// Create the schema from the migrations compiled into the binary.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if !trimmed.is_empty() {
                    sqlx::query(trimmed).execute(&self.pool).await?;
                }
            }
        }
        Ok(())
    }

    // --- Test runs ---

    /// Insert a new run, then evict runs beyond the retention limit.
    pub async fn insert_run(&self, run: &TestRun) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO test_runs (id, project_id, file_id, category, command, status, output,
                                   total, passed, failed, skipped, started_at, completed_at,
                                   duration_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(run.id.as_ref())
        .bind(run.project_id.as_ref().map(AsRef::as_ref))
        .bind(run.file_id.as_ref().map(AsRef::as_ref))
        .bind(run.category.as_str())
        .bind(&run.command)
        .bind(run.status.as_str())
        .bind(&run.output)
        .bind(run.results.total)
        .bind(run.results.passed)
        .bind(run.results.failed)
        .bind(run.results.skipped)
        .bind(run.started_at.timestamp_millis())
        .bind(run.completed_at.map(|t| t.timestamp_millis()))
        .bind(run.duration.and_then(|d| i64::try_from(d).ok()))
        .execute(&mut *tx)
        .await?;

        let mut evicted = 0;
        if self.run_retention > 0 {
            evicted = sqlx::query(
                "DELETE FROM test_runs WHERE id IN \
                 (SELECT id FROM test_runs ORDER BY started_at DESC, id DESC LIMIT -1 OFFSET ?1)",
            )
            .bind(i64::try_from(self.run_retention).unwrap_or(i64::MAX))
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;

        if evicted > 0 {
            debug!(evicted, retention = self.run_retention, "evicted old test runs");
        }
        Ok(())
    }

    /// Get a run by ID.
    pub async fn get_run(&self, id: &Id) -> Result<TestRun> {
        let query = format!("SELECT {RUNS_COLUMNS} FROM test_runs WHERE id = ?1");
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::RunNotFound(id.to_string()))?;

        Ok(row.into_run())
    }

    /// List runs newest first, optionally filtered by project.
    pub async fn list_runs(&self, project_id: Option<&Id>) -> Result<Vec<TestRun>> {
        let rows = match project_id {
            Some(project_id) => {
                let query = format!(
                    "SELECT {RUNS_COLUMNS} FROM test_runs WHERE project_id = ?1 \
                     ORDER BY started_at DESC, id DESC"
                );
                sqlx::query_as::<_, RunRow>(&query)
                    .bind(project_id.as_ref())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query =
                    format!("SELECT {RUNS_COLUMNS} FROM test_runs ORDER BY started_at DESC, id DESC");
                sqlx::query_as::<_, RunRow>(&query)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        Ok(rows.into_iter().map(RunRow::into_run).collect())
    }

    /// Number of stored runs attributed to a project.
    pub async fn count_runs(&self, project_id: &Id) -> Result<usize> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM test_runs WHERE project_id = ?1")
            .bind(project_id.as_ref())
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0 as usize)
    }

    /// Move a run to its terminal state.
    ///
    /// Only applies while the stored status is still `running`; returns
    /// whether the row was updated.
    pub async fn complete_run(&self, id: &Id, completion: &RunCompletion) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let completed_at = completion.completed_at.timestamp_millis();
        let result = sqlx::query(
            "UPDATE test_runs SET status = ?1, output = ?2, total = ?3, passed = ?4, \
             failed = ?5, skipped = ?6, completed_at = ?7, \
             duration_ms = MAX(?7 - started_at, 0) \
             WHERE id = ?8 AND status = 'running'",
        )
        .bind(completion.status.as_str())
        .bind(&completion.output)
        .bind(completion.results.total)
        .bind(completion.results.passed)
        .bind(completion.results.failed)
        .bind(completion.results.skipped)
        .bind(completed_at)
        .bind(id.as_ref())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark every run still `running` as `error`, appending `note` to its output.
    pub async fn fail_interrupted_runs(&self, note: &str) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE test_runs SET status = 'error', \
             output = CASE WHEN output = '' THEN ?1 ELSE output || char(10) || ?1 END, \
             completed_at = ?2, duration_ms = MAX(?2 - started_at, 0) \
             WHERE status = 'running'",
        )
        .bind(note)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    // --- Documents ---

    pub async fn insert_document<T: Document>(&self, doc: &T) -> Result<()> {
        let body = serde_json::to_string(doc)?;
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO documents (kind, id, project_id, created_at, body) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(T::KIND)
        .bind(doc.id().as_ref())
        .bind(doc.project_id().map(AsRef::as_ref))
        .bind(doc.created_at().timestamp_millis())
        .bind(body)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_document<T: Document>(&self, id: &Id) -> Result<T> {
        let body: Option<(String,)> =
            sqlx::query_as("SELECT body FROM documents WHERE kind = ?1 AND id = ?2")
                .bind(T::KIND)
                .bind(id.as_ref())
                .fetch_optional(&self.pool)
                .await?;

        match body {
            Some((body,)) => Ok(serde_json::from_str(&body)?),
            None => Err(not_found::<T>(id)),
        }
    }

    /// Documents of one kind in creation order, optionally for one project.
    pub async fn list_documents<T: Document>(&self, project_id: Option<&Id>) -> Result<Vec<T>> {
        let bodies: Vec<(String,)> = match project_id {
            Some(project_id) => {
                sqlx::query_as(
                    "SELECT body FROM documents WHERE kind = ?1 AND project_id = ?2 \
                     ORDER BY created_at, id",
                )
                .bind(T::KIND)
                .bind(project_id.as_ref())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT body FROM documents WHERE kind = ?1 ORDER BY created_at, id")
                    .bind(T::KIND)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        bodies
            .into_iter()
            .map(|(body,)| serde_json::from_str(&body).map_err(StorageError::from))
            .collect()
    }

    /// Number of documents of one kind belonging to a project.
    pub async fn count_documents<T: Document>(&self, project_id: &Id) -> Result<usize> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM documents WHERE kind = ?1 AND project_id = ?2")
                .bind(T::KIND)
                .bind(project_id.as_ref())
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0 as usize)
    }

    /// Read, modify and write back a document atomically.
    pub async fn update_document<T, F>(&self, id: &Id, update: F) -> Result<T>
    where
        T: Document,
        F: FnOnce(T) -> Result<T>,
    {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let body: Option<(String,)> =
            sqlx::query_as("SELECT body FROM documents WHERE kind = ?1 AND id = ?2")
                .bind(T::KIND)
                .bind(id.as_ref())
                .fetch_optional(&mut *tx)
                .await?;
        let Some((body,)) = body else {
            return Err(not_found::<T>(id));
        };

        let updated = update(serde_json::from_str(&body)?)?;
        let body = serde_json::to_string(&updated)?;

        sqlx::query("UPDATE documents SET project_id = ?1, body = ?2 WHERE kind = ?3 AND id = ?4")
            .bind(updated.project_id().map(AsRef::as_ref))
            .bind(body)
            .bind(T::KIND)
            .bind(id.as_ref())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(updated)
    }

    /// Delete a document, returning what was removed.
    pub async fn delete_document<T: Document>(&self, id: &Id) -> Result<T> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let body: Option<(String,)> =
            sqlx::query_as("SELECT body FROM documents WHERE kind = ?1 AND id = ?2")
                .bind(T::KIND)
                .bind(id.as_ref())
                .fetch_optional(&mut *tx)
                .await?;
        let Some((body,)) = body else {
            return Err(not_found::<T>(id));
        };

        sqlx::query("DELETE FROM documents WHERE kind = ?1 AND id = ?2")
            .bind(T::KIND)
            .bind(id.as_ref())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Delete a project with its test cases and test files.
    ///
    /// Test runs and resources are kept. Returns the project and the removed
    /// test files so their on-disk copies can be cleaned up.
    pub async fn delete_project(&self, id: &Id) -> Result<(Project, Vec<TestFile>)> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let body: Option<(String,)> =
            sqlx::query_as("SELECT body FROM documents WHERE kind = ?1 AND id = ?2")
                .bind(Project::KIND)
                .bind(id.as_ref())
                .fetch_optional(&mut *tx)
                .await?;
        let Some((body,)) = body else {
            return Err(not_found::<Project>(id));
        };
        let project: Project = serde_json::from_str(&body)?;

        let file_bodies: Vec<(String,)> =
            sqlx::query_as("SELECT body FROM documents WHERE kind = ?1 AND project_id = ?2")
                .bind(TestFile::KIND)
                .bind(id.as_ref())
                .fetch_all(&mut *tx)
                .await?;
        let files = file_bodies
            .into_iter()
            .map(|(body,)| serde_json::from_str(&body))
            .collect::<serde_json::Result<Vec<TestFile>>>()?;

        sqlx::query(
            "DELETE FROM documents WHERE project_id = ?1 AND kind IN (?2, ?3) \
             OR (kind = ?4 AND id = ?1)",
        )
        .bind(id.as_ref())
        .bind(TestCase::KIND)
        .bind(TestFile::KIND)
        .bind(Project::KIND)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((project, files))
    }
}

fn not_found<T: Document>(id: &Id) -> StorageError {
    StorageError::DocumentNotFound {
        kind: T::KIND,
        id: id.to_string(),
    }
}

fn count(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    project_id: Option<String>,
    file_id: Option<String>,
    category: String,
    command: String,
    status: String,
    output: String,
    passed: i64,
    failed: i64,
    skipped: i64,
    started_at: i64,
    completed_at: Option<i64>,
    duration_ms: Option<i64>,
}

impl RunRow {
    fn into_run(self) -> TestRun {
        TestRun {
            id: Id::from_string(self.id),
            project_id: self.project_id.map(Id::from_string),
            file_id: self.file_id.map(Id::from_string),
            category: self.category.parse().unwrap_or_default(),
            command: self.command,
            status: self.status.parse().unwrap_or(RunStatus::Error),
            output: self.output,
            results: RunResults::new(count(self.passed), count(self.failed), count(self.skipped)),
            started_at: DateTime::from_timestamp_millis(self.started_at).unwrap_or_default(),
            completed_at: self.completed_at.and_then(DateTime::from_timestamp_millis),
            duration: self.duration_ms.and_then(|d| u64::try_from(d).ok()),
        }
    }
}
