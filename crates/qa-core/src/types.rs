//! Core types for the QA dashboard daemon.
//!
//! Wire format is camelCase JSON, matching what the dashboard client reads.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for runs and stored documents.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// First `n` characters, used for generated file names.
    pub fn short(&self, n: usize) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(n)
            .map_or(self.0.len(), |(idx, _)| idx);
        &self.0[..end]
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

// --- Enumerations ---

/// Test run lifecycle status.
///
/// `Running` is the only initial state; the other three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Passed,
    Failed,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Terminal status for a process that exited with `exit_code`.
    pub fn from_exit_code(exit_code: i32) -> Self {
        if exit_code == 0 {
            Self::Passed
        } else {
            Self::Failed
        }
    }
}

impl FromStr for RunStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "passed" => Ok(Self::Passed),
            "failed" => Ok(Self::Failed),
            "error" => Ok(Self::Error),
            other => Err(UnknownVariant {
                kind: "run status",
                value: other.to_string(),
            }),
        }
    }
}

/// Run category: which slice of the test tree a run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[default]
    Api,
    Ui,
    Unit,
    All,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Ui => "ui",
            Self::Unit => "unit",
            Self::All => "all",
        }
    }
}

impl FromStr for Category {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api" => Ok(Self::Api),
            "ui" => Ok(Self::Ui),
            "unit" => Ok(Self::Unit),
            "all" => Ok(Self::All),
            other => Err(UnknownVariant {
                kind: "category",
                value: other.to_string(),
            }),
        }
    }
}

/// Category of a single test file or test case (never `all`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestType {
    #[default]
    Api,
    Ui,
    Unit,
}

impl TestType {
    pub fn as_str(&self) -> &'static str {
        self.category().as_str()
    }

    pub fn category(&self) -> Category {
        match self {
            Self::Api => Category::Api,
            Self::Ui => Category::Ui,
            Self::Unit => Category::Unit,
        }
    }
}

/// Project test focus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
    Api,
    Ui,
    Unit,
    #[default]
    Mixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseStatus {
    #[default]
    Draft,
    Ready,
    Automated,
    Deprecated,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Ready => "ready",
            Self::Automated => "automated",
            Self::Deprecated => "deprecated",
        }
    }
}

/// Last manual or automated verdict recorded on a test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseResult {
    Pass,
    Fail,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Doc,
    #[default]
    Link,
    CredentialNote,
    Other,
}

/// Status of a single parsed test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
}

// --- Results ---

/// Aggregate pass/fail counts for a run.
///
/// `total` always equals `passed + failed + skipped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunResults {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
}

impl RunResults {
    pub fn new(passed: u32, failed: u32, skipped: u32) -> Self {
        Self {
            total: passed.saturating_add(failed).saturating_add(skipped),
            passed,
            failed,
            skipped,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// One test extracted from runner output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub status: TestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TestResult {
    pub fn new(name: impl Into<String>, status: TestStatus) -> Self {
        Self {
            name: name.into(),
            status,
            duration: None,
            error: None,
        }
    }
}

// --- Entities ---

/// Persisted record of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRun {
    pub id: Id,
    pub project_id: Option<Id>,
    pub file_id: Option<Id>,
    pub category: Category,
    pub command: String,
    pub status: RunStatus,
    pub output: String,
    pub results: RunResults,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Milliseconds between `started_at` and `completed_at`.
    pub duration: Option<u64>,
}

impl TestRun {
    /// A freshly accepted run in the `running` state.
    pub fn started(
        project_id: Option<Id>,
        file_id: Option<Id>,
        category: Category,
        command: String,
    ) -> Self {
        Self {
            id: Id::new(),
            project_id,
            file_id,
            category,
            command,
            status: RunStatus::Running,
            output: String::new(),
            results: RunResults::default(),
            started_at: Utc::now(),
            completed_at: None,
            duration: None,
        }
    }

    /// List view of this run with `output` cut to `preview_chars` characters.
    pub fn listing(&self, preview_chars: usize) -> TestRunListing {
        TestRunListing {
            id: self.id.clone(),
            project_id: self.project_id.clone(),
            file_id: self.file_id.clone(),
            category: self.category,
            command: self.command.clone(),
            status: self.status,
            output_preview: self.output.chars().take(preview_chars).collect(),
            results: self.results,
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration: self.duration,
        }
    }
}

/// A run without its full output, for list views and creation responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunListing {
    pub id: Id,
    pub project_id: Option<Id>,
    pub file_id: Option<Id>,
    pub category: Category,
    pub command: String,
    pub status: RunStatus,
    pub output_preview: String,
    pub results: RunResults,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: Id,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default, rename = "type")]
    pub project_type: ProjectType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub id: Id,
    #[serde(default)]
    pub project_id: Option<Id>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "type")]
    pub test_type: TestType,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub status: CaseStatus,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub expected_result: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub automated: bool,
    #[serde(default)]
    pub test_file_id: Option<Id>,
    #[serde(default)]
    pub last_result: Option<CaseResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestFile {
    pub id: Id,
    #[serde(default)]
    pub project_id: Option<Id>,
    pub filename: String,
    pub file_path: String,
    #[serde(default, rename = "type")]
    pub test_type: TestType,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_language() -> String {
    "javascript".to_string()
}

/// Reference material attached to a project (docs, links, notes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub id: Id,
    #[serde(default)]
    pub project_id: Option<Id>,
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub kind: ResourceKind,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// --- Document store support ---

/// An entity persisted as a JSON document, keyed by kind and id.
pub trait Document: Serialize + DeserializeOwned + Send + Sync {
    /// Storage discriminator (e.g. `project`).
    const KIND: &'static str;

    fn id(&self) -> &Id;
    fn project_id(&self) -> Option<&Id>;
    fn created_at(&self) -> DateTime<Utc>;
}

macro_rules! impl_document {
    ($ty:ty, $kind:literal) => {
        impl Document for $ty {
            const KIND: &'static str = $kind;

            fn id(&self) -> &Id {
                &self.id
            }

            fn project_id(&self) -> Option<&Id> {
                self.project_id.as_ref()
            }

            fn created_at(&self) -> DateTime<Utc> {
                self.created_at
            }
        }
    };
}

impl Document for Project {
    const KIND: &'static str = "project";

    fn id(&self) -> &Id {
        &self.id
    }

    fn project_id(&self) -> Option<&Id> {
        Some(&self.id)
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl_document!(TestCase, "test_case");
impl_document!(TestFile, "test_file");
impl_document!(Resource, "resource");

/// Fields a partial update may never change.
const IMMUTABLE_FIELDS: [&str; 2] = ["id", "createdAt"];

/// Apply a partial JSON update to a document.
///
/// Keys in `patch` overwrite the document's fields, except `id` and
/// `createdAt`; `updatedAt` is refreshed. The merged value is re-validated by
/// deserializing it back into `T`.
pub fn apply_patch<T: Document>(doc: &T, patch: &serde_json::Value) -> serde_json::Result<T> {
    let mut merged = serde_json::to_value(doc)?;
    if let (Some(target), Some(fields)) = (merged.as_object_mut(), patch.as_object()) {
        for (key, value) in fields {
            if IMMUTABLE_FIELDS.contains(&key.as_str()) {
                continue;
            }
            target.insert(key.clone(), value.clone());
        }
        if target.contains_key("updatedAt") {
            target.insert("updatedAt".to_string(), serde_json::to_value(Utc::now())?);
        }
    }
    serde_json::from_value(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_project() -> Project {
        let now = Utc::now();
        Project {
            id: Id::new(),
            name: "checkout".to_string(),
            description: String::new(),
            base_url: "https://staging.example.com".to_string(),
            project_type: ProjectType::Mixed,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn run_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Running).unwrap(),
            "\"running\""
        );
        assert_eq!("error".parse::<RunStatus>().unwrap(), RunStatus::Error);
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn exit_code_maps_to_terminal_status() {
        assert_eq!(RunStatus::from_exit_code(0), RunStatus::Passed);
        assert_eq!(RunStatus::from_exit_code(1), RunStatus::Failed);
        assert_eq!(RunStatus::from_exit_code(-1), RunStatus::Failed);
    }

    #[test]
    fn category_rejects_unknown_values() {
        assert_eq!("all".parse::<Category>().unwrap(), Category::All);
        let err = "smoke".parse::<Category>().unwrap_err();
        assert_eq!(err.to_string(), "unknown category 'smoke'");
    }

    #[test]
    fn results_total_is_sum_of_parts() {
        let results = RunResults::new(12, 3, 1);
        assert_eq!(results.total, 16);
        assert!(!results.is_empty());
        assert!(RunResults::default().is_empty());
    }

    #[test]
    fn started_run_has_zeroed_results() {
        let run = TestRun::started(None, None, Category::Api, "true".to_string());
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.results, RunResults::default());
        assert!(run.completed_at.is_none());
        assert!(run.duration.is_none());
    }

    #[test]
    fn listing_truncates_output_by_chars() {
        let mut run = TestRun::started(None, None, Category::Unit, "node --test".to_string());
        run.output = "✓✓✓✓✓".to_string();
        let listing = run.listing(3);
        assert_eq!(listing.output_preview, "✓✓✓");

        let json = serde_json::to_value(&listing).unwrap();
        assert!(json.get("output").is_none());
        assert_eq!(json["outputPreview"], "✓✓✓");
        assert_eq!(json["status"], "running");
    }

    #[test]
    fn test_result_omits_missing_optionals() {
        let result = TestResult::new("adds numbers", TestStatus::Passed);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json, serde_json::json!({"name": "adds numbers", "status": "passed"}));
    }

    #[test]
    fn id_short_takes_prefix() {
        let id = Id::from_string("0192f3a4-aaaa");
        assert_eq!(id.short(8), "0192f3a4");
        assert_eq!(Id::from_string("abc").short(8), "abc");
    }

    #[test]
    fn apply_patch_merges_and_protects_identity() {
        let project = sample_project();
        let patch = serde_json::json!({
            "id": "hijacked",
            "name": "checkout v2",
            "type": "ui"
        });

        let updated = apply_patch(&project, &patch).unwrap();
        assert_eq!(updated.id, project.id);
        assert_eq!(updated.created_at, project.created_at);
        assert_eq!(updated.name, "checkout v2");
        assert_eq!(updated.project_type, ProjectType::Ui);
        assert_eq!(updated.base_url, project.base_url);
        assert!(updated.updated_at >= project.updated_at);
    }

    #[test]
    fn apply_patch_rejects_invalid_values() {
        let project = sample_project();
        let patch = serde_json::json!({ "type": "desktop" });
        assert!(apply_patch(&project, &patch).is_err());
    }

    #[test]
    fn test_case_defaults_fill_missing_fields() {
        let json = serde_json::json!({
            "id": "case-1",
            "title": "login works",
            "createdAt": "2026-01-01T00:00:00Z",
            "updatedAt": "2026-01-01T00:00:00Z"
        });
        let case: TestCase = serde_json::from_value(json).unwrap();
        assert_eq!(case.priority, Priority::Medium);
        assert_eq!(case.status, CaseStatus::Draft);
        assert_eq!(case.test_type, TestType::Api);
        assert!(case.steps.is_empty());
    }

    #[test]
    fn resource_kind_uses_kebab_case() {
        assert_eq!(
            serde_json::to_string(&ResourceKind::CredentialNote).unwrap(),
            "\"credential-note\""
        );
    }
}
