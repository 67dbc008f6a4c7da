//! Configuration for the QA dashboard daemon.
//!
//! Uses a `key=value` file format (`#` comments, optionally quoted values).
//! Precedence: CLI flags > `--config` file > `<data_dir>/config` > defaults.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

/// Default wall-clock limit for a single test run.
pub const DEFAULT_RUN_TIMEOUT_SEC: u32 = 120;

/// Number of most recent runs kept in the store.
pub const DEFAULT_RUN_RETENTION: usize = 100;

/// Characters of output included in run list views.
pub const DEFAULT_OUTPUT_PREVIEW_CHARS: usize = 2000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid address for {key}: {value}")]
    InvalidAddr { key: String, value: String },
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // HTTP
    pub port: u16,
    pub bind_addr: IpAddr,
    /// Bearer token required on API routes when set.
    pub auth_token: Option<String>,

    // Directories
    /// Holds the SQLite database and the optional `config` file.
    pub data_dir: PathBuf,
    /// Working directory for test runner processes.
    pub workspace_root: PathBuf,
    /// Root of the test tree (`api/`, `ui/`, `unit/`, `projects/<id>/`).
    /// Relative paths are anchored at `workspace_root` by `resolve_paths`.
    pub tests_dir: PathBuf,

    // Execution
    /// Timeout per run in seconds (0 = no timeout).
    pub run_timeout_sec: u32,
    pub max_output_bytes: usize,
    pub max_concurrent_runs: usize,
    /// Browser-automation runner invocation (receives a path and `--reporter=list`).
    pub browser_runner: String,
    /// Unit-test runner invocation (receives a file or directory path).
    pub unit_runner: String,

    // History
    pub run_retention: usize,
    pub output_preview_chars: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            auth_token: None,
            data_dir: default_data_dir(),
            workspace_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            tests_dir: PathBuf::from("tests"),
            run_timeout_sec: DEFAULT_RUN_TIMEOUT_SEC,
            max_output_bytes: 10 * 1024 * 1024,
            max_concurrent_runs: 4,
            browser_runner: "npx playwright test".to_string(),
            unit_runner: "node --test".to_string(),
            run_retention: DEFAULT_RUN_RETENTION,
            output_preview_chars: DEFAULT_OUTPUT_PREVIEW_CHARS,
        }
    }
}

/// Get the default data directory (~/.local/share/qad).
fn default_data_dir() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local/share")
        });
    data_dir.join("qad")
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Build the effective config: defaults, then `<data_dir>/config` if it
    /// exists, then `explicit` if given.
    ///
    /// `data_dir` overrides the default data directory before the implicit
    /// file is looked up.
    pub fn load(data_dir: Option<&Path>, explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(dir) = data_dir {
            config.data_dir = dir.to_path_buf();
        }
        let implicit = config.default_config_path();
        if implicit.is_file() {
            config.load_file(&implicit)?;
        }
        if let Some(path) = explicit {
            config.load_file(path)?;
        }
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            // Skip empty lines and comments
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "port" => self.port = Self::parse_int(key, value)?,
            "bind_addr" => {
                self.bind_addr = value.parse().map_err(|_| ConfigError::InvalidAddr {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
            }
            "auth_token" => {
                self.auth_token = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "data_dir" => self.data_dir = PathBuf::from(value),
            "workspace_root" => self.workspace_root = PathBuf::from(value),
            "tests_dir" => self.tests_dir = PathBuf::from(value),
            "run_timeout_sec" => self.run_timeout_sec = Self::parse_int(key, value)?,
            "max_output_bytes" => self.max_output_bytes = Self::parse_int(key, value)?,
            "max_concurrent_runs" => self.max_concurrent_runs = Self::parse_int(key, value)?,
            "browser_runner" => self.browser_runner = value.to_string(),
            "unit_runner" => self.unit_runner = value.to_string(),
            "run_retention" => self.run_retention = Self::parse_int(key, value)?,
            "output_preview_chars" => self.output_preview_chars = Self::parse_int(key, value)?,
            // Dashboard-only keys
            "pin" | "theme" => {}
            _ => {
                // Warn but don't fail for unknown keys
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn parse_int<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Resolve a relative `tests_dir` against `workspace_root`.
    pub fn resolve_paths(&mut self) {
        if self.tests_dir.is_relative() {
            self.tests_dir = self.workspace_root.join(&self.tests_dir);
        }
    }

    /// Path of the implicit config file inside the data directory.
    pub fn default_config_path(&self) -> PathBuf {
        self.data_dir.join("config")
    }

    /// Path of the SQLite database.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("qad.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_values() {
        let config = Config::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.bind_addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.run_timeout_sec, 120);
        assert_eq!(config.run_retention, 100);
        assert_eq!(config.output_preview_chars, 2000);
        assert_eq!(config.browser_runner, "npx playwright test");
        assert_eq!(config.unit_runner, "node --test");
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn parse_key_values_with_quotes_and_comments() {
        let mut config = Config::default();
        let content = r#"
# daemon settings
port=8080
bind_addr = 0.0.0.0
browser_runner="npx playwright test --workers=2"
unit_runner='node --test --test-reporter=tap'
run_timeout_sec=300
"#;
        config.parse_content(content).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.bind_addr, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.browser_runner, "npx playwright test --workers=2");
        assert_eq!(config.unit_runner, "node --test --test-reporter=tap");
        assert_eq!(config.run_timeout_sec, 300);
    }

    #[test]
    fn invalid_integer_is_an_error() {
        let mut config = Config::default();
        let err = config.parse_content("run_retention=lots").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidInt { ref key, .. } if key == "run_retention"));
    }

    #[test]
    fn line_without_equals_is_an_error() {
        let mut config = Config::default();
        let err = config.parse_content("port 8080").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLine(_)));
    }

    #[test]
    fn invalid_bind_addr_is_an_error() {
        let mut config = Config::default();
        let err = config.parse_content("bind_addr=localhost:80").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddr { .. }));
    }

    #[test]
    fn empty_auth_token_clears_it() {
        let mut config = Config {
            auth_token: Some("secret".to_string()),
            ..Default::default()
        };
        config.parse_content("auth_token=").unwrap();
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn from_file_merges_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "max_concurrent_runs=2\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.max_concurrent_runs, 2);
        assert_eq!(config.port, 3000);
    }

    #[test]
    fn load_layers_implicit_then_explicit() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config"), "port=4000\nrun_retention=5\n").unwrap();
        let explicit = dir.path().join("override");
        std::fs::write(&explicit, "port=5000\n").unwrap();

        let config = Config::load(Some(dir.path()), Some(&explicit)).unwrap();
        assert_eq!(config.data_dir, dir.path());
        assert_eq!(config.port, 5000);
        assert_eq!(config.run_retention, 5);
    }

    #[test]
    fn resolve_paths_anchors_tests_dir() {
        let mut config = Config {
            workspace_root: PathBuf::from("/srv/qa"),
            tests_dir: PathBuf::from("suites"),
            ..Default::default()
        };
        config.resolve_paths();
        assert_eq!(config.tests_dir, PathBuf::from("/srv/qa/suites"));

        config.tests_dir = PathBuf::from("/abs/tests");
        config.resolve_paths();
        assert_eq!(config.tests_dir, PathBuf::from("/abs/tests"));
    }

    #[test]
    fn derived_paths() {
        let config = Config {
            data_dir: PathBuf::from("/var/lib/qad"),
            ..Default::default()
        };
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/qad/qad.db"));
        assert_eq!(
            config.default_config_path(),
            PathBuf::from("/var/lib/qad/config")
        );
    }
}
