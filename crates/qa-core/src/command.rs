//! Command construction for test runs.
//!
//! A run request resolves to exactly one [`CommandTemplate`]; the template
//! renders to the shell command line that is executed and stored on the run.
//! Request input only ever selects a template and supplies ids; paths come
//! from the store and runner programs come from operator configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Config;
use crate::types::{Category, Id, TestFile, TestType, UnknownVariant};

/// Message printed when a project has no test directory yet.
pub const NO_PROJECT_TESTS: &str = "No test files found for project";

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("custom commands are not supported; run a test file, project, or category instead")]
    CustomCommandUnsupported,
    #[error(transparent)]
    InvalidCategory(#[from] UnknownVariant),
    #[error("invalid file name '{0}': must be a plain file name")]
    InvalidFilename(String),
}

pub type Result<T> = std::result::Result<T, CommandError>;

/// Body of a run request.
///
/// At most one target is honored, in the order command > file > project >
/// category. Empty strings count as absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Id>,
    #[serde(default, alias = "type", skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// What a run request targets once validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunScope {
    File(Id),
    Project(Id),
    Category(Category),
}

fn present(id: Option<&Id>) -> Option<&Id> {
    id.filter(|id| !id.0.trim().is_empty())
}

impl RunRequest {
    /// Validate the request and pick its target.
    pub fn scope(&self) -> Result<RunScope> {
        if self.command.as_deref().is_some_and(|c| !c.trim().is_empty()) {
            return Err(CommandError::CustomCommandUnsupported);
        }
        if let Some(file_id) = present(self.file_id.as_ref()) {
            return Ok(RunScope::File(file_id.clone()));
        }
        if let Some(project_id) = present(self.project_id.as_ref()) {
            return Ok(RunScope::Project(project_id.clone()));
        }
        let category = match self.category.as_deref().map(str::trim) {
            None | Some("") => Category::default(),
            Some(raw) => raw.parse()?,
        };
        Ok(RunScope::Category(category))
    }

    /// Project id supplied alongside the target, if any.
    pub fn project_id(&self) -> Option<&Id> {
        present(self.project_id.as_ref())
    }
}

/// The closed set of commands the daemon will run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandTemplate {
    /// A single file under the unit-test runner.
    UnitFile(PathBuf),
    /// A single file under the browser runner with the list reporter.
    BrowserFile(PathBuf),
    /// Every file below a directory under the browser runner.
    BrowserDir(PathBuf),
    /// Every file below a directory under the unit-test runner.
    UnitDir(PathBuf),
    /// Browser runner over the whole tree, then the unit runner over `unit`.
    /// Both halves always run; the exit status fails if either half failed.
    Combined { tests_dir: PathBuf, unit_dir: PathBuf },
    /// Succeeds without running anything, printing the message.
    NoTests(&'static str),
}

impl CommandTemplate {
    /// Render the template to a `sh -c` command line.
    pub fn render(&self, browser_runner: &str, unit_runner: &str) -> String {
        match self {
            Self::UnitFile(path) => format!("{unit_runner} {}", shell_quote(path)),
            Self::BrowserFile(path) | Self::BrowserDir(path) => {
                format!("{browser_runner} {} --reporter=list", shell_quote(path))
            }
            Self::UnitDir(dir) => format!("{unit_runner} {}", shell_quote_dir(dir)),
            Self::Combined {
                tests_dir,
                unit_dir,
            } => format!(
                "status=0; {browser_runner} {} --reporter=list || status=1; {unit_runner} {} || status=1; exit $status",
                shell_quote(tests_dir),
                shell_quote_dir(unit_dir),
            ),
            Self::NoTests(message) => format!("echo '{message}'"),
        }
    }

    /// File a file-scoped template targets.
    pub fn target_path(&self) -> Option<&Path> {
        match self {
            Self::UnitFile(path) | Self::BrowserFile(path) => Some(path),
            _ => None,
        }
    }
}

/// A resolved, ready-to-execute command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCommand {
    pub category: Category,
    pub template: CommandTemplate,
    pub command_line: String,
    pub target_path: Option<PathBuf>,
}

/// Maps run targets to commands using the configured runners and test tree.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    browser_runner: String,
    unit_runner: String,
    tests_dir: PathBuf,
}

impl CommandBuilder {
    pub fn new(
        browser_runner: impl Into<String>,
        unit_runner: impl Into<String>,
        tests_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            browser_runner: browser_runner.into(),
            unit_runner: unit_runner.into(),
            tests_dir: tests_dir.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.browser_runner.clone(),
            config.unit_runner.clone(),
            config.tests_dir.clone(),
        )
    }

    fn finish(&self, category: Category, template: CommandTemplate) -> RunCommand {
        RunCommand {
            category,
            command_line: template.render(&self.browser_runner, &self.unit_runner),
            target_path: template.target_path().map(Path::to_path_buf),
            template,
        }
    }

    /// Run a single stored test file.
    pub fn for_file(&self, file: &TestFile) -> RunCommand {
        let path = PathBuf::from(&file.file_path);
        let template = match file.test_type {
            TestType::Unit => CommandTemplate::UnitFile(path),
            TestType::Api | TestType::Ui => CommandTemplate::BrowserFile(path),
        };
        self.finish(file.test_type.category(), template)
    }

    /// Run every file in a project's test directory.
    ///
    /// A project without a directory is a valid, passing, empty run.
    pub fn for_project(&self, project_id: &Id) -> RunCommand {
        let dir = self.project_dir(project_id);
        let template = if dir.is_dir() {
            CommandTemplate::BrowserDir(dir)
        } else {
            CommandTemplate::NoTests(NO_PROJECT_TESTS)
        };
        self.finish(Category::Api, template)
    }

    /// Run a whole category subtree.
    pub fn for_category(&self, category: Category) -> RunCommand {
        let template = match category {
            Category::All => CommandTemplate::Combined {
                tests_dir: self.tests_dir.clone(),
                unit_dir: self.tests_dir.join(Category::Unit.as_str()),
            },
            Category::Unit => CommandTemplate::UnitDir(self.tests_dir.join(category.as_str())),
            Category::Api | Category::Ui => {
                CommandTemplate::BrowserDir(self.tests_dir.join(category.as_str()))
            }
        };
        self.finish(category, template)
    }

    /// Directory holding a project's test files.
    pub fn project_dir(&self, project_id: &Id) -> PathBuf {
        self.tests_dir.join("projects").join(project_id.as_ref())
    }

    /// Where a new test file lives on disk.
    pub fn file_path(
        &self,
        project_id: Option<&Id>,
        test_type: TestType,
        filename: &str,
    ) -> Result<PathBuf> {
        validate_filename(filename)?;
        let dir = match project_id {
            Some(id) => self.project_dir(id),
            None => self.tests_dir.join(test_type.as_str()),
        };
        Ok(dir.join(filename))
    }
}

/// Reject names that could escape the test directory.
pub fn validate_filename(name: &str) -> Result<()> {
    let bad = name.trim().is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
        || name.contains("..");
    if bad {
        Err(CommandError::InvalidFilename(name.to_string()))
    } else {
        Ok(())
    }
}

/// Single-quote a path for POSIX `sh`.
pub fn shell_quote(path: &Path) -> String {
    let raw = path.to_string_lossy();
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// Quote a directory with a trailing slash, as the unit runner expects.
fn shell_quote_dir(dir: &Path) -> String {
    let mut raw = dir.to_string_lossy().into_owned();
    if !raw.ends_with('/') {
        raw.push('/');
    }
    shell_quote(Path::new(&raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn builder(tests_dir: &Path) -> CommandBuilder {
        CommandBuilder::new("npx playwright test", "node --test", tests_dir)
    }

    fn test_file(test_type: TestType, path: &str) -> TestFile {
        let now = Utc::now();
        TestFile {
            id: Id::new(),
            project_id: None,
            filename: "login.spec.js".to_string(),
            file_path: path.to_string(),
            test_type,
            language: "javascript".to_string(),
            description: String::new(),
            content: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn request(json: serde_json::Value) -> RunRequest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn explicit_command_is_rejected() {
        let req = request(serde_json::json!({ "command": "rm -rf /", "fileId": "f1" }));
        assert!(matches!(
            req.scope(),
            Err(CommandError::CustomCommandUnsupported)
        ));
    }

    #[test]
    fn blank_command_is_ignored() {
        let req = request(serde_json::json!({ "command": "  ", "category": "ui" }));
        assert_eq!(req.scope().unwrap(), RunScope::Category(Category::Ui));
    }

    #[test]
    fn file_wins_over_project_and_category() {
        let req = request(serde_json::json!({
            "fileId": "f1",
            "projectId": "p1",
            "category": "unit"
        }));
        assert_eq!(req.scope().unwrap(), RunScope::File(Id::from_string("f1")));
    }

    #[test]
    fn project_wins_over_category() {
        let req = request(serde_json::json!({ "projectId": "p1", "category": "unit" }));
        assert_eq!(
            req.scope().unwrap(),
            RunScope::Project(Id::from_string("p1"))
        );
    }

    #[test]
    fn category_defaults_to_api() {
        assert_eq!(
            RunRequest::default().scope().unwrap(),
            RunScope::Category(Category::Api)
        );
        let req = request(serde_json::json!({ "fileId": "", "category": "" }));
        assert_eq!(req.scope().unwrap(), RunScope::Category(Category::Api));
    }

    #[test]
    fn type_is_an_alias_for_category() {
        let req = request(serde_json::json!({ "type": "all" }));
        assert_eq!(req.scope().unwrap(), RunScope::Category(Category::All));
    }

    #[test]
    fn unknown_category_is_rejected() {
        let req = request(serde_json::json!({ "category": "smoke" }));
        let err = req.scope().unwrap_err();
        assert!(matches!(err, CommandError::InvalidCategory(_)));
        assert_eq!(err.to_string(), "unknown category 'smoke'");
    }

    #[test]
    fn unit_file_uses_unit_runner() {
        let b = builder(Path::new("/srv/tests"));
        let cmd = b.for_file(&test_file(TestType::Unit, "/srv/tests/unit/math.test.js"));
        assert_eq!(cmd.command_line, "node --test '/srv/tests/unit/math.test.js'");
        assert_eq!(cmd.category, Category::Unit);
        assert_eq!(
            cmd.target_path,
            Some(PathBuf::from("/srv/tests/unit/math.test.js"))
        );
    }

    #[test]
    fn api_file_uses_browser_runner_with_list_reporter() {
        let b = builder(Path::new("/srv/tests"));
        let cmd = b.for_file(&test_file(TestType::Api, "/srv/tests/api/login.spec.js"));
        assert_eq!(
            cmd.command_line,
            "npx playwright test '/srv/tests/api/login.spec.js' --reporter=list"
        );
        assert_eq!(cmd.category, Category::Api);
    }

    #[test]
    fn project_with_directory_runs_it() {
        let dir = TempDir::new().unwrap();
        let b = builder(dir.path());
        let project = Id::from_string("p1");
        std::fs::create_dir_all(b.project_dir(&project)).unwrap();

        let cmd = b.for_project(&project);
        assert!(matches!(cmd.template, CommandTemplate::BrowserDir(_)));
        assert!(cmd.command_line.ends_with("/projects/p1' --reporter=list"));
        assert!(cmd.target_path.is_none());
    }

    #[test]
    fn project_without_directory_is_a_passing_noop() {
        let dir = TempDir::new().unwrap();
        let cmd = builder(dir.path()).for_project(&Id::from_string("missing"));
        assert_eq!(cmd.template, CommandTemplate::NoTests(NO_PROJECT_TESTS));
        assert_eq!(cmd.command_line, "echo 'No test files found for project'");
    }

    #[test]
    fn category_commands() {
        let b = builder(Path::new("/srv/tests"));
        assert_eq!(
            b.for_category(Category::Unit).command_line,
            "node --test '/srv/tests/unit/'"
        );
        assert_eq!(
            b.for_category(Category::Ui).command_line,
            "npx playwright test '/srv/tests/ui' --reporter=list"
        );
    }

    #[test]
    fn all_category_runs_both_halves_and_keeps_failures() {
        let cmd = builder(Path::new("/srv/tests")).for_category(Category::All);
        assert_eq!(
            cmd.command_line,
            "status=0; npx playwright test '/srv/tests' --reporter=list || status=1; \
             node --test '/srv/tests/unit/' || status=1; exit $status"
        );
    }

    #[test]
    fn builder_is_deterministic() {
        let b = builder(Path::new("/srv/tests"));
        assert_eq!(b.for_category(Category::All), b.for_category(Category::All));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote(Path::new("/tmp/it's.js")), r"'/tmp/it'\''s.js'");
    }

    #[test]
    fn file_path_placement() {
        let b = builder(Path::new("/srv/tests"));
        assert_eq!(
            b.file_path(None, TestType::Ui, "cart.spec.js").unwrap(),
            PathBuf::from("/srv/tests/ui/cart.spec.js")
        );
        assert_eq!(
            b.file_path(Some(&Id::from_string("p1")), TestType::Unit, "a.test.js")
                .unwrap(),
            PathBuf::from("/srv/tests/projects/p1/a.test.js")
        );
    }

    #[test]
    fn filenames_with_traversal_are_rejected() {
        for name in ["../etc/passwd", "a/b.js", "..", "", "a\\b.js", "x..js"] {
            assert!(validate_filename(name).is_err(), "accepted {name:?}");
        }
        assert!(validate_filename("login.spec.js").is_ok());
    }
}
