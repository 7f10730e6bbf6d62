//! Project-level configuration.
//!
//! Handles loading and parsing `.mutest.toml` files from a project root. The
//! file maps source globs to the build, test and coverage commands used for
//! units matching them.

use crate::error::EngineError;
use serde::Deserialize;
use std::path::Path;

pub const PROJECT_CONFIG_FILE: &str = ".mutest.toml";

/// Project-level configuration loaded from `.mutest.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectConfig {
    /// Rules for matching source files to toolchain commands.
    /// Rules are evaluated in order; the first matching glob wins.
    #[serde(default)]
    pub rules: Vec<ToolRule>,
}

/// A single rule that maps a glob pattern to toolchain commands.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolRule {
    /// Glob pattern to match source paths (e.g., `"**/*.cpp"`, `"src/**/*.cs"`).
    pub glob: String,
    /// Build command template, see `adapters::render_template`.
    pub build_command: String,
    /// Test command template.
    pub test_command: String,
    /// Baseline test command that also writes a coverage report.
    #[serde(default)]
    pub coverage_command: Option<String>,
    /// Timeout in seconds for a test run; `engine.test_timeout_seconds` when unset.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Output line prefixes that mark a failing test.
    #[serde(default = "default_failure_patterns")]
    pub failure_patterns: Vec<String>,
    /// Extra build flags used for optimized builds.
    #[serde(default)]
    pub optimize_flags: Option<String>,
}

fn default_failure_patterns() -> Vec<String> {
    vec![
        "[  FAILED  ]".to_string(),
        "Failed ".to_string(),
        "  X ".to_string(),
    ]
}

impl ProjectConfig {
    /// Check if `.mutest.toml` exists in the project.
    pub fn exists(project_root: &Path) -> bool {
        project_root.join(PROJECT_CONFIG_FILE).exists()
    }

    /// Load configuration from `.mutest.toml`.
    ///
    /// Returns `Ok(None)` if the file doesn't exist and the default config if
    /// it is empty or whitespace-only.
    pub fn load(project_root: &Path) -> Result<Option<Self>, EngineError> {
        let config_path = project_root.join(PROJECT_CONFIG_FILE);
        if !config_path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&config_path).map_err(|e| EngineError::Input {
            message: format!("Unable to read {}", config_path.display()),
            details: e.to_string(),
        })?;
        if content.trim().is_empty() {
            return Ok(Some(Self::default()));
        }
        toml::from_str(&content)
            .map(Some)
            .map_err(|e| EngineError::Input {
                message: format!("Invalid settings in {}", config_path.display()),
                details: e.to_string(),
            })
    }

    /// Find the first rule matching the given path (relative to the project root).
    pub fn find_rule(&self, file_path: &str) -> Option<&ToolRule> {
        self.rules
            .iter()
            .find(|rule| glob_match::glob_match(&rule.glob, file_path))
    }

    /// Load the project settings and pick the rule for `source_file`.
    ///
    /// Every failure here is an input error: no work has started yet.
    pub fn resolve_rule(project_root: &Path, source_file: &Path) -> Result<ToolRule, EngineError> {
        let config = Self::load(project_root)?.ok_or_else(|| {
            EngineError::input(format!(
                "Settings file {} is missing in {}",
                PROJECT_CONFIG_FILE,
                project_root.display()
            ))
        })?;

        let relative = source_file
            .strip_prefix(project_root)
            .unwrap_or(source_file)
            .to_string_lossy()
            .replace('\\', "/");

        let rule = config.find_rule(&relative).cloned().ok_or_else(|| {
            EngineError::input(format!("No toolchain rule matches {}", relative))
        })?;
        rule.validate()?;
        Ok(rule)
    }
}

impl ToolRule {
    /// Reject rules with missing tool commands.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.build_command.trim().is_empty() {
            return Err(EngineError::input(format!(
                "Build tool command is missing for rule '{}'",
                self.glob
            )));
        }
        if self.test_command.trim().is_empty() {
            return Err(EngineError::input(format!(
                "Test runner command is missing for rule '{}'",
                self.glob
            )));
        }
        Ok(())
    }
}
