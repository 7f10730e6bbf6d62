//! Build and test adapters.
//!
//! Adapters drive the external toolchain. They never fail for a failed build
//! or a failing test: every outcome, including a launch failure, resolves to a
//! status plus the captured log.

pub mod build;
pub mod process;
pub mod remote;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub use build::ProcessBuildAdapter;
pub use remote::{RemoteBuildAdapter, RemoteTestAdapter};
pub use test::{parse_results, CaseOutcome, ProcessTestAdapter, TestCaseResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Success,
    Failed,
    Timeout,
    /// The runner never started, so nothing was tested
    LaunchFailed,
}

/// One build invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub descriptor: PathBuf,
    pub solution: Option<PathBuf>,
    pub configuration: String,
    pub platform: Option<String>,
    pub verbosity: String,
    pub out_dir: PathBuf,
    pub int_dir: PathBuf,
    /// Rebuild dependencies instead of an incremental build
    pub rebuild: bool,
    pub optimized: bool,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildOutcome {
    pub status: BuildStatus,
    pub log: String,
    pub duration_ms: u64,
}

impl BuildOutcome {
    pub fn is_success(&self) -> bool {
        self.status == BuildStatus::Success
    }
}

/// One test invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRequest {
    pub binary_dir: PathBuf,
    pub filter: Option<String>,
    pub result_file: PathBuf,
    /// Produce a coverage report while testing
    pub coverage_file: Option<PathBuf>,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub kill_on_first_failure: bool,
    /// Output line prefixes that mark a failing test
    pub failure_patterns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub status: TestStatus,
    pub log: String,
    pub duration_ms: u64,
    /// Per-test records from the structured result file, when one was written
    #[serde(default)]
    pub results: Vec<TestCaseResult>,
}

impl TestOutcome {
    pub fn is_success(&self) -> bool {
        self.status == TestStatus::Success
    }
}

#[async_trait]
pub trait BuildAdapter: Send + Sync {
    async fn build(&self, request: &BuildRequest) -> BuildOutcome;
}

#[async_trait]
pub trait TestAdapter: Send + Sync {
    async fn test(&self, request: &TestRequest) -> TestOutcome;
}

/// Substitute `{name}` placeholders. Unknown placeholders are left untouched.
pub fn render_template(template: &str, values: &[(&str, String)]) -> String {
    let mut rendered = template.to_string();
    for (name, value) in values {
        rendered = rendered.replace(&format!("{{{}}}", name), value);
    }
    rendered
}

/// Single-quote a path for `sh -c`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Keep at most `max_bytes` of `log`, cutting at a char boundary.
pub fn truncate_log(log: &str, max_bytes: usize) -> String {
    if log.len() <= max_bytes {
        return log.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !log.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... (truncated)", &log[..end])
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
