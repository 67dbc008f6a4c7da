//! HTTP client for the qad daemon.

use std::collections::BTreeMap;
use std::time::Duration;

use qa_core::command::RunRequest;
use qa_core::types::{Id, RunResults, RunStatus, TestResult, TestRun, TestRunListing};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n  → start with: qad\n  → or set QAD_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected: {0}")]
    BadRequest(String),

    #[error("unauthorized: check QAD_TOKEN env var or --token flag")]
    Unauthorized,

    #[error(
        "daemon not ready after {timeout_ms}ms at {addr}\n  → ensure qad is running\n  → check QAD_TOKEN if auth is enabled"
    )]
    DaemonNotReady { addr: String, timeout_ms: u64 },
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map_or_else(|| "unknown".to_string(), ToString::to_string);
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map_or(0, |s| s.as_u16()),
                message: e.to_string(),
            }
        }
    }
}

/// Error response from API.
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// The part of the run results response the CLI shows.
#[derive(Debug, Deserialize)]
pub struct RunTests {
    pub tests: Vec<TestResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseStats {
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<String, usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStats {
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
}

#[derive(Debug, Deserialize)]
pub struct RunStats {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub error: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastRun {
    pub id: Id,
    pub status: RunStatus,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub results: RunResults,
}

/// Response from GET /api/stats.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub projects: usize,
    pub test_cases: CaseStats,
    pub test_files: FileStats,
    pub test_runs: RunStats,
    pub last_run: Option<LastRun>,
}

/// Default total timeout for the daemon readiness probe.
const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;

/// Initial backoff delay for the readiness probe.
const INITIAL_BACKOFF_MS: u64 = 200;

/// HTTP client for qad.
#[derive(Debug)]
pub struct Client {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            http: reqwest::Client::new(),
        }
    }

    /// Check if daemon is healthy by probing /api/health.
    pub async fn check_health(&self) -> Result<bool, ClientError> {
        let url = self.url("/api/health", None);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Ok(response.status().is_success())
    }

    /// Wait for the daemon to answer, backing off exponentially.
    pub async fn wait_for_ready(&self) -> Result<(), ClientError> {
        let start = std::time::Instant::now();
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            match self.check_health().await {
                Ok(true) => return Ok(()),
                Ok(false) | Err(_) => {
                    let elapsed = start.elapsed().as_millis() as u64;
                    if elapsed >= DEFAULT_READY_TIMEOUT_MS {
                        return Err(ClientError::DaemonNotReady {
                            addr: self.base_url.clone(),
                            timeout_ms: DEFAULT_READY_TIMEOUT_MS,
                        });
                    }

                    eprintln!(
                        "waiting for daemon at {} (retrying in {}ms)",
                        self.base_url, backoff_ms
                    );

                    let remaining = DEFAULT_READY_TIMEOUT_MS.saturating_sub(elapsed);
                    tokio::time::sleep(Duration::from_millis(backoff_ms.min(remaining))).await;
                    backoff_ms = backoff_ms.saturating_mul(2);
                }
            }
        }
    }

    /// Build headers with optional auth token.
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    fn url(&self, path: &str, project_id: Option<&str>) -> String {
        match project_id {
            Some(id) => format!(
                "{}{}?projectId={}",
                self.base_url,
                path,
                urlencoding::encode(id)
            ),
            None => format!("{}{}", self.base_url, path),
        }
    }

    /// Map a non-success response to an error.
    async fn handle_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        if status == 401 {
            return ClientError::Unauthorized;
        }

        let message = response
            .json::<ErrorResponse>()
            .await
            .map_or_else(|_| "unknown error".to_string(), |e| e.error);

        match status {
            400 => ClientError::BadRequest(message),
            404 => ClientError::NotFound(message),
            _ => ClientError::HttpError { status, message },
        }
    }

    async fn decode<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T, ClientError> {
        let response = self.http.get(url).headers(self.headers()).send().await?;
        self.decode(response).await
    }

    /// Start a run.
    /// POST /api/test-runs
    pub async fn create_run(&self, req: &RunRequest) -> Result<TestRunListing, ClientError> {
        let url = self.url("/api/test-runs", None);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(req)
            .send()
            .await?;
        self.decode(response).await
    }

    /// List runs, newest first.
    /// GET /api/test-runs?projectId=...
    pub async fn list_runs(
        &self,
        project_id: Option<&str>,
    ) -> Result<Vec<TestRunListing>, ClientError> {
        self.get(&self.url("/api/test-runs", project_id)).await
    }

    /// Get a single run including its output.
    /// GET /api/test-runs/{id}
    pub async fn get_run(&self, run_id: &str) -> Result<TestRun, ClientError> {
        let path = format!("/api/test-runs/{}", urlencoding::encode(run_id));
        self.get(&self.url(&path, None)).await
    }

    /// Per-test results parsed from a run's output.
    /// GET /api/test-runs/{id}/results
    pub async fn get_results(&self, run_id: &str) -> Result<RunTests, ClientError> {
        let path = format!("/api/test-runs/{}/results", urlencoding::encode(run_id));
        self.get(&self.url(&path, None)).await
    }

    /// GET /api/stats?projectId=...
    pub async fn stats(&self, project_id: Option<&str>) -> Result<Stats, ClientError> {
        self.get(&self.url("/api/stats", project_id)).await
    }

    /// Poll a run until it reaches a terminal status.
    pub async fn wait_for_run(
        &self,
        run_id: &str,
        interval: Duration,
    ) -> Result<TestRun, ClientError> {
        loop {
            let run = self.get_run(run_id).await?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            tokio::time::sleep(interval).await;
        }
    }
}
