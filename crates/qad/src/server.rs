//! HTTP API for the dashboard.
//!
//! JSON over axum, bound to the configured address. When an auth token is
//! configured every route except `/api/health` requires
//! `Authorization: Bearer <token>`.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use qa_core::command::{CommandError, RunRequest};
use qa_core::parser::parse_tests;
use qa_core::{
    apply_patch, Document, Id, Priority, Project, ProjectType, Resource, ResourceKind, RunStatus,
    TestCase, TestFile, TestResult, TestRun, TestType,
};
use qa_core::{CaseResult, CaseStatus, RunResults};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::lifecycle::{LifecycleError, RunManager};
use crate::storage::{Storage, StorageError};

/// Characters of file content shown in test file listings.
const CONTENT_PREVIEW_CHARS: usize = 200;

/// Shared state for HTTP handlers.
#[derive(Debug)]
pub struct AppState {
    pub storage: Arc<Storage>,
    pub runs: Arc<RunManager>,
    pub auth_token: Option<String>,
    /// Characters of output kept in run listings.
    pub output_preview_chars: usize,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<T, ApiError>;

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/projects", get(list_projects).post(create_project))
        .route(
            "/api/projects/{id}",
            get(get_project)
                .put(update_document::<Project>)
                .delete(delete_project),
        )
        .route("/api/test-cases", get(list_test_cases).post(create_test_case))
        .route(
            "/api/test-cases/{id}",
            get(get_document::<TestCase>)
                .put(update_document::<TestCase>)
                .delete(delete_document::<TestCase>),
        )
        .route("/api/test-files", get(list_test_files).post(create_test_file))
        .route(
            "/api/test-files/{id}",
            get(get_test_file)
                .put(update_test_file)
                .delete(delete_test_file),
        )
        .route("/api/resources", get(list_resources).post(create_resource))
        .route(
            "/api/resources/{id}",
            get(get_document::<Resource>)
                .put(update_document::<Resource>)
                .delete(delete_document::<Resource>),
        )
        .route("/api/test-runs", get(list_runs).post(create_run))
        .route("/api/test-runs/{id}", get(get_run))
        .route("/api/test-runs/{id}/results", get(get_run_results))
        .route("/api/stats", get(get_stats))
        .fallback(not_found_fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn start_server(
    state: Arc<AppState>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

/// Validate auth token if configured.
fn check_auth(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    if let Some(expected) = &state.auth_token {
        let provided = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

        match provided {
            Some(token) if token == expected => Ok(()),
            Some(_) => Err(api_error(StatusCode::UNAUTHORIZED, "invalid auth token")),
            None => Err(api_error(StatusCode::UNAUTHORIZED, "missing auth token")),
        }
    } else {
        Ok(())
    }
}

// --- Errors ---

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn bad_request(message: impl Into<String>) -> ApiError {
    api_error(StatusCode::BAD_REQUEST, message)
}

fn not_found(message: impl Into<String>) -> ApiError {
    api_error(StatusCode::NOT_FOUND, message)
}

fn internal(context: &str, err: impl Display) -> ApiError {
    error!(error = %err, "{}", context);
    api_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("{context}: {err}"),
    )
}

/// Map a storage failure, turning missing records into 404s.
fn storage_error(label: &str, context: &str, err: StorageError) -> ApiError {
    match err {
        StorageError::DocumentNotFound { .. } | StorageError::RunNotFound(_) => {
            not_found(format!("{label} not found"))
        }
        other => internal(context, other),
    }
}

fn lifecycle_error(err: LifecycleError) -> ApiError {
    match err {
        LifecycleError::InvalidRequest(e) => {
            warn!(error = %e, "rejected run request");
            bad_request(e.to_string())
        }
        e @ (LifecycleError::FileNotFound(_) | LifecycleError::ProjectNotFound(_)) => {
            warn!(error = %e, "rejected run request");
            not_found(e.to_string())
        }
        LifecycleError::ShuttingDown => {
            api_error(StatusCode::SERVICE_UNAVAILABLE, "daemon is shutting down")
        }
        LifecycleError::Storage(e) => internal("failed to create test run", e),
    }
}

/// Unwrap a JSON body, reporting malformed input as 400.
fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    body.map(|Json(value)| value)
        .map_err(|rejection| bad_request(rejection.body_text()))
}

/// Treat blank strings as absent.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

fn non_empty_id(value: Option<Id>) -> Option<Id> {
    value.filter(|id| !id.0.is_empty())
}

/// Documents served through the generic CRUD handlers.
trait ApiDocument: Document + 'static {
    /// Name used in error messages.
    const LABEL: &'static str;
}

impl ApiDocument for Project {
    const LABEL: &'static str = "Project";
}

impl ApiDocument for TestCase {
    const LABEL: &'static str = "Test case";
}

impl ApiDocument for TestFile {
    const LABEL: &'static str = "Test file";
}

impl ApiDocument for Resource {
    const LABEL: &'static str = "Resource";
}

// --- Request/Response types ---

/// Query params accepted by list endpoints.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    #[serde(default)]
    pub project_id: Option<Id>,
    #[serde(default, rename = "type")]
    pub type_filter: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl ListQuery {
    fn project_id(&self) -> Option<&Id> {
        self.project_id.as_ref().filter(|id| !id.0.is_empty())
    }

    fn type_matches(&self, test_type: TestType) -> bool {
        self.type_filter
            .as_deref()
            .map_or(true, |t| t.is_empty() || t == test_type.as_str())
    }

    fn status_matches(&self, status: CaseStatus) -> bool {
        self.status
            .as_deref()
            .map_or(true, |s| s.is_empty() || s == status.as_str())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default, rename = "type")]
    pub project_type: Option<ProjectType>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTestCaseRequest {
    #[serde(default)]
    pub project_id: Option<Id>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "type")]
    pub test_type: Option<TestType>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub status: Option<CaseStatus>,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub expected_result: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub automated: bool,
    #[serde(default)]
    pub test_file_id: Option<Id>,
    #[serde(default)]
    pub last_result: Option<CaseResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTestFileRequest {
    #[serde(default)]
    pub project_id: Option<Id>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default, rename = "type")]
    pub test_type: Option<TestType>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResourceRequest {
    #[serde(default)]
    pub project_id: Option<Id>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub kind: Option<ResourceKind>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Response for GET /api/projects/{id}.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDetail {
    #[serde(flatten)]
    pub project: Project,
    pub test_case_count: usize,
    pub test_file_count: usize,
    pub last_run_count: usize,
}

/// Response for GET /api/test-runs/{id}/results.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResultsResponse {
    pub run_id: Id,
    pub status: RunStatus,
    pub results: RunResults,
    pub tests: Vec<TestResult>,
}

fn deleted() -> Json<Value> {
    Json(json!({ "message": "Deleted" }))
}

// --- Handlers: health & fallback ---

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok", "timestamp": Utc::now() }))
}

async fn not_found_fallback(uri: Uri) -> ApiError {
    debug!(path = %uri.path(), "no route");
    not_found("not found")
}

// --- Handlers: generic documents ---

async fn get_document<T: ApiDocument>(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<T>> {
    check_auth(&state, &headers)?;

    let doc = state
        .storage
        .get_document::<T>(&Id::from_string(id))
        .await
        .map_err(|e| storage_error(T::LABEL, "failed to load document", e))?;
    Ok(Json(doc))
}

/// PUT handler shared by projects, test cases and resources.
async fn update_document<T: ApiDocument>(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<T>> {
    check_auth(&state, &headers)?;
    let patch = json_body(body)?;
    let updated = patch_document::<T>(&state, &Id::from_string(id), &patch).await?;
    Ok(Json(updated))
}

async fn patch_document<T: ApiDocument>(state: &AppState, id: &Id, patch: &Value) -> ApiResult<T> {
    if !patch.is_object() {
        return Err(bad_request("update body must be a JSON object"));
    }

    let updated = state
        .storage
        .update_document(id, |doc: T| Ok(apply_patch(&doc, patch)?))
        .await
        .map_err(|e| match e {
            StorageError::Serialization(e) => bad_request(format!("invalid update: {e}")),
            other => storage_error(T::LABEL, "failed to update document", other),
        })?;

    info!(kind = T::KIND, id = %id, "updated document");
    Ok(updated)
}

async fn delete_document<T: ApiDocument>(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    check_auth(&state, &headers)?;

    let id = Id::from_string(id);
    state
        .storage
        .delete_document::<T>(&id)
        .await
        .map_err(|e| storage_error(T::LABEL, "failed to delete document", e))?;

    info!(kind = T::KIND, id = %id, "deleted document");
    Ok(deleted())
}

// --- Handlers: projects ---

async fn list_projects(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<Project>>> {
    check_auth(&state, &headers)?;

    let projects = state
        .storage
        .list_documents::<Project>(None)
        .await
        .map_err(|e| internal("failed to list projects", e))?;
    Ok(Json(projects))
}

async fn create_project(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<CreateProjectRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;
    let req = json_body(body)?;
    let name = non_empty(req.name).ok_or_else(|| bad_request("Name required"))?;

    let now = Utc::now();
    let project = Project {
        id: Id::new(),
        name,
        description: req.description.unwrap_or_default(),
        base_url: req.base_url.unwrap_or_default(),
        project_type: req.project_type.unwrap_or_default(),
        created_at: now,
        updated_at: now,
    };

    let dir = state.runs.commands().project_dir(&project.id);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| internal("failed to create project directory", e))?;

    state
        .storage
        .insert_document(&project)
        .await
        .map_err(|e| internal("failed to create project", e))?;

    info!(project_id = %project.id, name = %project.name, "created project");
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<ProjectDetail>> {
    check_auth(&state, &headers)?;

    let id = Id::from_string(id);
    let project = state
        .storage
        .get_document::<Project>(&id)
        .await
        .map_err(|e| storage_error(Project::LABEL, "failed to load project", e))?;

    let counts = async {
        Ok::<_, StorageError>((
            state.storage.count_documents::<TestCase>(&id).await?,
            state.storage.count_documents::<TestFile>(&id).await?,
            state.storage.count_runs(&id).await?,
        ))
    };
    let (test_case_count, test_file_count, last_run_count) = counts
        .await
        .map_err(|e| internal("failed to count project contents", e))?;

    Ok(Json(ProjectDetail {
        project,
        test_case_count,
        test_file_count,
        last_run_count,
    }))
}

/// Deletes the project, its test cases and test files. Runs are kept.
async fn delete_project(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    check_auth(&state, &headers)?;

    let id = Id::from_string(id);
    let (project, files) = state
        .storage
        .delete_project(&id)
        .await
        .map_err(|e| storage_error(Project::LABEL, "failed to delete project", e))?;

    for file in &files {
        remove_file_quietly(FsPath::new(&file.file_path)).await;
    }
    let dir = state.runs.commands().project_dir(&project.id);
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %dir.display(), error = %e, "failed to remove project directory"),
    }

    info!(
        project_id = %project.id,
        files = files.len(),
        "deleted project"
    );
    Ok(deleted())
}

// --- Handlers: test cases ---

async fn list_test_cases(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<TestCase>>> {
    check_auth(&state, &headers)?;

    let mut cases = state
        .storage
        .list_documents::<TestCase>(query.project_id())
        .await
        .map_err(|e| internal("failed to list test cases", e))?;
    cases.retain(|c| query.type_matches(c.test_type) && query.status_matches(c.status));

    Ok(Json(cases))
}

async fn create_test_case(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<CreateTestCaseRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;
    let req = json_body(body)?;
    let title = non_empty(req.title).ok_or_else(|| bad_request("Title required"))?;

    let now = Utc::now();
    let case = TestCase {
        id: Id::new(),
        project_id: non_empty_id(req.project_id),
        title,
        description: req.description.unwrap_or_default(),
        test_type: req.test_type.unwrap_or_default(),
        priority: req.priority.unwrap_or_default(),
        status: req.status.unwrap_or_default(),
        steps: req.steps,
        expected_result: req.expected_result.unwrap_or_default(),
        tags: req.tags,
        automated: req.automated,
        test_file_id: non_empty_id(req.test_file_id),
        last_result: req.last_result,
        created_at: now,
        updated_at: now,
    };

    state
        .storage
        .insert_document(&case)
        .await
        .map_err(|e| internal("failed to create test case", e))?;

    info!(case_id = %case.id, title = %case.title, "created test case");
    Ok((StatusCode::CREATED, Json(case)))
}

// --- Handlers: test files ---

/// A test file without its content, plus the first characters of it.
fn file_listing(file: &TestFile) -> ApiResult<Value> {
    let mut value =
        serde_json::to_value(file).map_err(|e| internal("failed to encode test file", e))?;
    if let Some(fields) = value.as_object_mut() {
        fields.remove("content");
        let preview: String = file.content.chars().take(CONTENT_PREVIEW_CHARS).collect();
        fields.insert("contentPreview".to_string(), Value::String(preview));
    }
    Ok(value)
}

fn default_file_content(filename: &str, test_type: TestType) -> String {
    format!("// {filename}\n// Type: {}\n\n", test_type.as_str())
}

fn default_filename(id: &Id, test_type: TestType) -> String {
    let suffix = match test_type {
        TestType::Unit => "test.js",
        TestType::Api | TestType::Ui => "spec.js",
    };
    format!("test_{}.{suffix}", id.short(8))
}

async fn write_test_file(path: &FsPath, content: &str) -> ApiResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| internal("failed to create test directory", e))?;
    }
    tokio::fs::write(path, content)
        .await
        .map_err(|e| internal("failed to write test file", e))
}

async fn remove_file_quietly(path: &FsPath) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove test file"),
    }
}

async fn list_test_files(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Value>>> {
    check_auth(&state, &headers)?;

    let files = state
        .storage
        .list_documents::<TestFile>(query.project_id())
        .await
        .map_err(|e| internal("failed to list test files", e))?;

    let listings = files
        .iter()
        .filter(|f| query.type_matches(f.test_type))
        .map(file_listing)
        .collect::<ApiResult<Vec<_>>>()?;
    Ok(Json(listings))
}

async fn create_test_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<CreateTestFileRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;
    let req = json_body(body)?;

    let project_id = non_empty_id(req.project_id);
    if let Some(project_id) = &project_id {
        state
            .storage
            .get_document::<Project>(project_id)
            .await
            .map_err(|e| storage_error(Project::LABEL, "failed to load project", e))?;
    }

    let id = Id::new();
    let test_type = req.test_type.unwrap_or_default();
    let filename = non_empty(req.filename).unwrap_or_else(|| default_filename(&id, test_type));
    let path = state
        .runs
        .commands()
        .file_path(project_id.as_ref(), test_type, &filename)
        .map_err(|e: CommandError| bad_request(e.to_string()))?;
    let content = req
        .content
        .unwrap_or_else(|| default_file_content(&filename, test_type));

    write_test_file(&path, &content).await?;

    let now = Utc::now();
    let file = TestFile {
        id,
        project_id,
        filename,
        file_path: path.to_string_lossy().into_owned(),
        test_type,
        language: non_empty(req.language).unwrap_or_else(|| "javascript".to_string()),
        description: req.description.unwrap_or_default(),
        content,
        created_at: now,
        updated_at: now,
    };

    state
        .storage
        .insert_document(&file)
        .await
        .map_err(|e| internal("failed to create test file", e))?;

    info!(file_id = %file.id, path = %file.file_path, "created test file");
    Ok((StatusCode::CREATED, Json(file)))
}

async fn get_test_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<TestFile>> {
    check_auth(&state, &headers)?;

    let mut file = state
        .storage
        .get_document::<TestFile>(&Id::from_string(id))
        .await
        .map_err(|e| storage_error(TestFile::LABEL, "failed to load test file", e))?;

    match tokio::fs::read_to_string(&file.file_path).await {
        Ok(content) => file.content = content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %file.file_path, error = %e, "failed to read test file"),
    }

    Ok(Json(file))
}

/// The on-disk location is fixed at creation: `filename` and `filePath`
/// cannot be patched. A new `content` is written through to disk.
async fn update_test_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<TestFile>> {
    check_auth(&state, &headers)?;
    let mut patch = json_body(body)?;

    let Some(fields) = patch.as_object_mut() else {
        return Err(bad_request("update body must be a JSON object"));
    };
    fields.remove("filename");
    fields.remove("filePath");
    let content_changed = fields.get("content").is_some_and(Value::is_string);

    let file = patch_document::<TestFile>(&state, &Id::from_string(id), &patch).await?;
    if content_changed {
        write_test_file(FsPath::new(&file.file_path), &file.content).await?;
    }

    Ok(Json(file))
}

async fn delete_test_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    check_auth(&state, &headers)?;

    let file = state
        .storage
        .delete_document::<TestFile>(&Id::from_string(id))
        .await
        .map_err(|e| storage_error(TestFile::LABEL, "failed to delete test file", e))?;
    remove_file_quietly(FsPath::new(&file.file_path)).await;

    info!(file_id = %file.id, path = %file.file_path, "deleted test file");
    Ok(deleted())
}

// --- Handlers: resources ---

async fn list_resources(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Resource>>> {
    check_auth(&state, &headers)?;

    let resources = state
        .storage
        .list_documents::<Resource>(query.project_id())
        .await
        .map_err(|e| internal("failed to list resources", e))?;
    Ok(Json(resources))
}

async fn create_resource(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<CreateResourceRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;
    let req = json_body(body)?;
    let title = non_empty(req.title).ok_or_else(|| bad_request("Title required"))?;

    let now = Utc::now();
    let resource = Resource {
        id: Id::new(),
        project_id: non_empty_id(req.project_id),
        title,
        url: req.url.unwrap_or_default(),
        kind: req.kind.unwrap_or_default(),
        notes: req.notes.unwrap_or_default(),
        tags: req.tags,
        created_at: now,
        updated_at: now,
    };

    state
        .storage
        .insert_document(&resource)
        .await
        .map_err(|e| internal("failed to create resource", e))?;

    info!(resource_id = %resource.id, title = %resource.title, "created resource");
    Ok((StatusCode::CREATED, Json(resource)))
}

// --- Handlers: test runs ---

/// POST /api/test-runs - Start a run.
async fn create_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<RunRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;
    let req = json_body(body)?;

    let run = state.runs.start_run(&req).await.map_err(lifecycle_error)?;
    Ok((
        StatusCode::CREATED,
        Json(run.listing(state.output_preview_chars)),
    ))
}

/// GET /api/test-runs - Newest first, output cut to a preview.
async fn list_runs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;

    let runs = state
        .storage
        .list_runs(query.project_id())
        .await
        .map_err(|e| internal("failed to list test runs", e))?;

    let listings: Vec<_> = runs
        .iter()
        .map(|run| run.listing(state.output_preview_chars))
        .collect();
    Ok(Json(listings))
}

async fn load_run(state: &AppState, id: String) -> ApiResult<TestRun> {
    state
        .storage
        .get_run(&Id::from_string(id))
        .await
        .map_err(|e| storage_error("Test run", "failed to load test run", e))
}

/// GET /api/test-runs/{id} - Full run including output.
async fn get_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<TestRun>> {
    check_auth(&state, &headers)?;
    Ok(Json(load_run(&state, id).await?))
}

/// GET /api/test-runs/{id}/results - Per-test detail parsed from the output.
async fn get_run_results(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<RunResultsResponse>> {
    check_auth(&state, &headers)?;

    let run = load_run(&state, id).await?;
    let tests = parse_tests(&run.output);
    Ok(Json(RunResultsResponse {
        run_id: run.id,
        status: run.status,
        results: run.results,
        tests,
    }))
}

// --- Handlers: stats ---

fn count_by<T>(items: &[T], key: impl Fn(&T) -> &'static str) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for item in items {
        *counts.entry(key(item)).or_insert(0) += 1;
    }
    counts
}

/// GET /api/stats - Aggregate counts, optionally for one project.
async fn get_stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    check_auth(&state, &headers)?;
    let project_id = query.project_id();

    let loaded = async {
        Ok::<_, StorageError>((
            state.storage.list_documents::<Project>(None).await?,
            state.storage.list_documents::<TestCase>(project_id).await?,
            state.storage.list_documents::<TestFile>(project_id).await?,
            state.storage.list_runs(project_id).await?,
        ))
    };
    let (projects, cases, files, runs) = loaded
        .await
        .map_err(|e| internal("failed to load stats", e))?;

    let runs_with = |status: RunStatus| runs.iter().filter(|r| r.status == status).count();
    let last_run = runs.first().map(|run| {
        json!({
            "id": run.id,
            "status": run.status,
            "completedAt": run.completed_at,
            "results": run.results,
        })
    });

    Ok(Json(json!({
        "projects": projects.len(),
        "testCases": {
            "total": cases.len(),
            "byType": count_by(&cases, |c| c.test_type.as_str()),
            "byStatus": count_by(&cases, |c| c.status.as_str()),
            "byPriority": count_by(&cases, |c| c.priority.as_str()),
        },
        "testFiles": {
            "total": files.len(),
            "byType": count_by(&files, |f| f.test_type.as_str()),
        },
        "testRuns": {
            "total": runs.len(),
            "passed": runs_with(RunStatus::Passed),
            "failed": runs_with(RunStatus::Failed),
            "error": runs_with(RunStatus::Error),
        },
        "lastRun": last_run,
    })))
}
