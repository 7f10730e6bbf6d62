use crate::error::EngineError;
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Scheduling and isolation settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Build tool settings
    #[serde(default)]
    pub build: BuildConfig,

    /// Mutant filters
    #[serde(default)]
    pub filters: FilterConfig,

    /// Result cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Remote build/test execution service
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Cache server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Data directory (where the local cache database is stored)
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// What to do with results of mutants still running when an early stop fires
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InFlightPolicy {
    /// Record them like any other result
    #[default]
    Count,
    /// Leave them `not_run`
    Discard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of parallel lanes
    #[serde(default = "default_lanes")]
    pub lanes: usize,

    /// Mutants kept per source line (< 1 means unlimited)
    #[serde(default = "default_mutants_per_line")]
    pub mutants_per_line: i32,

    /// Stop dispatching once survived/total exceeds this ratio
    #[serde(default = "default_threshold")]
    pub survived_threshold: f64,

    /// Stop dispatching once killed/total exceeds this ratio
    #[serde(default = "default_threshold")]
    pub killed_threshold: f64,

    /// Duplicate the whole build descriptor and solution per lane
    #[serde(default)]
    pub in_isolation: bool,

    /// On a failed batch build, retry fully isolated and then in place
    #[serde(default = "default_true")]
    pub build_fallback: bool,

    /// Terminate a test run as soon as one failing test is reported
    #[serde(default = "default_true")]
    pub kill_on_first_failure: bool,

    #[serde(default = "default_test_timeout")]
    pub test_timeout_seconds: u64,

    #[serde(default = "default_build_timeout")]
    pub build_timeout_seconds: u64,

    /// Keep per-mutant build/test logs in the result
    #[serde(default)]
    pub diagnostics: bool,

    #[serde(default)]
    pub in_flight_policy: InFlightPolicy,

    /// Run against a temporary copy of the project root
    #[serde(default)]
    pub sandbox: bool,

    /// Name prefixes of child processes to kill on cancellation
    #[serde(default)]
    pub kill_process_prefixes: Vec<String>,

    /// Directory under the project root holding lane output directories
    #[serde(default = "default_work_dir_name")]
    pub work_dir_name: String,

    /// Maximum log text kept per mutant or error (bytes)
    #[serde(default = "default_max_log_bytes")]
    pub max_log_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Build configuration, e.g. Debug or Release
    #[serde(default = "default_configuration")]
    pub configuration: String,

    /// Target platform, e.g. x64
    #[serde(default)]
    pub platform: Option<String>,

    #[serde(default = "default_verbosity")]
    pub verbosity: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Comma-separated regexes; mutants not matching any are skipped
    #[serde(default)]
    pub include: Option<String>,

    /// Comma-separated regexes; matching mutants are skipped
    #[serde(default)]
    pub exclude: Option<String>,

    /// Line ranges such as "5:10, 20:20"; lines outside are skipped
    #[serde(default)]
    pub specific_lines: Option<String>,

    #[serde(default)]
    pub excluded_lines: Vec<usize>,

    #[serde(default)]
    pub excluded_ids: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Consult and populate the result cache
    #[serde(default)]
    pub enabled: bool,

    /// Remote store base URL; the local database is used when unset
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_seconds: u64,

    /// Consecutive failed calls before the circuit opens
    #[serde(default = "default_breaker_failures")]
    pub breaker_failures: u32,

    #[serde(default = "default_breaker_open")]
    pub breaker_open_seconds: u64,

    #[serde(default = "default_http_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Build/test execution service URL; local processes are used when unset
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port for the cache server
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_lanes() -> usize {
    5
}

fn default_mutants_per_line() -> i32 {
    1
}

fn default_threshold() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_test_timeout() -> u64 {
    300 // 5 minutes
}

fn default_build_timeout() -> u64 {
    1800
}

fn default_work_dir_name() -> String {
    ".mutest".to_string()
}

fn default_max_log_bytes() -> usize {
    10000
}

fn default_configuration() -> String {
    "Debug".to_string()
}

fn default_verbosity() -> String {
    "quiet".to_string()
}

fn default_retries() -> u32 {
    2
}

fn default_backoff_base() -> u64 {
    2
}

fn default_breaker_failures() -> u32 {
    2
}

fn default_breaker_open() -> u64 {
    30
}

fn default_http_timeout() -> u64 {
    30
}

fn default_port() -> u16 {
    8420
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lanes: default_lanes(),
            mutants_per_line: default_mutants_per_line(),
            survived_threshold: default_threshold(),
            killed_threshold: default_threshold(),
            in_isolation: false,
            build_fallback: true,
            kill_on_first_failure: true,
            test_timeout_seconds: default_test_timeout(),
            build_timeout_seconds: default_build_timeout(),
            diagnostics: false,
            in_flight_policy: InFlightPolicy::default(),
            sandbox: false,
            kill_process_prefixes: Vec::new(),
            work_dir_name: default_work_dir_name(),
            max_log_bytes: default_max_log_bytes(),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            configuration: default_configuration(),
            platform: None,
            verbosity: default_verbosity(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            retries: default_retries(),
            backoff_base_seconds: default_backoff_base(),
            breaker_failures: default_breaker_failures(),
            breaker_open_seconds: default_breaker_open(),
            timeout_seconds: default_http_timeout(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

impl EngineConfig {
    /// Lane count clamped to at least one.
    pub fn lane_count(&self) -> usize {
        self.lanes.max(1)
    }
}

impl Config {
    /// Load configuration from file, or create default if not found
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(PathBuf::from).or_else(Self::default_config_path);

        let config = if let Some(ref path) = config_path {
            if path.exists() {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config from {:?}", path))?;
                toml::from_str(&contents)
                    .with_context(|| format!("Failed to parse config from {:?}", path))?
            } else {
                Config::default()
            }
        } else {
            Config::default()
        };

        Ok(config)
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "mutest", "mutest")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            ProjectDirs::from("com", "mutest", "mutest")
                .map(|dirs| dirs.data_dir().to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".mutest"))
        })
    }

    /// Get the database file path
    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join("mutest.db")
    }

    /// Reject settings that would make a run meaningless before any work starts.
    pub fn validate(&self) -> std::result::Result<(), EngineError> {
        for (name, value) in [
            ("survived_threshold", self.engine.survived_threshold),
            ("killed_threshold", self.engine.killed_threshold),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(EngineError::input(format!(
                    "engine.{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }
        if self.engine.work_dir_name.trim().is_empty() {
            return Err(EngineError::input("engine.work_dir_name must not be empty"));
        }
        for (name, url) in [("cache.url", &self.cache.url), ("remote.url", &self.remote.url)] {
            if let Some(url) = url {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(EngineError::input(format!(
                        "{} must be an http(s) URL, got {}",
                        name, url
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Default value tests
    // =========================================================================

    #[test]
    fn test_default_engine_config() {
        let config = EngineConfig::default();
        assert_eq!(config.lanes, 5);
        assert_eq!(config.mutants_per_line, 1);
        assert_eq!(config.survived_threshold, 1.0);
        assert_eq!(config.killed_threshold, 1.0);
        assert!(config.kill_on_first_failure);
        assert!(!config.in_isolation);
        assert_eq!(config.in_flight_policy, InFlightPolicy::Count);
        assert_eq!(config.test_timeout_seconds, 300);
    }

    #[test]
    fn test_default_cache_config() {
        let config = CacheConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.retries, 2);
        assert_eq!(config.backoff_base_seconds, 2);
        assert_eq!(config.breaker_failures, 2);
        assert_eq!(config.breaker_open_seconds, 30);
    }

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8420);
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn test_lane_count_never_zero() {
        let config = EngineConfig {
            lanes: 0,
            ..Default::default()
        };
        assert_eq!(config.lane_count(), 1);
    }

    // =========================================================================
    // Config parsing tests
    // =========================================================================

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
[general]
log_level = "debug"

[engine]
lanes = 3
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.engine.lanes, 3);
        // Defaults should still apply
        assert_eq!(config.engine.mutants_per_line, 1);
        assert_eq!(config.build.configuration, "Debug");
        assert_eq!(config.server.port, 8420);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[engine]
lanes = 8
mutants_per_line = 0
survived_threshold = 0.3
killed_threshold = 0.7
in_isolation = true
in_flight_policy = "discard"
kill_process_prefixes = ["calc_test", "msbuild"]

[build]
configuration = "Release"
platform = "x64"

[filters]
include = "Compute.*, Parse"
exclude = "Log\\("
specific_lines = "5:10"
excluded_ids = [3, 4]

[cache]
enabled = true
url = "https://cache.example.com/api/mutest"
retries = 3

[remote]
url = "http://builder:9000/"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.engine.lanes, 8);
        assert_eq!(config.engine.mutants_per_line, 0);
        assert_eq!(config.engine.survived_threshold, 0.3);
        assert!(config.engine.in_isolation);
        assert_eq!(config.engine.in_flight_policy, InFlightPolicy::Discard);
        assert_eq!(config.engine.kill_process_prefixes.len(), 2);
        assert_eq!(config.build.platform.as_deref(), Some("x64"));
        assert_eq!(config.filters.include.as_deref(), Some("Compute.*, Parse"));
        assert_eq!(config.filters.excluded_ids, vec![3, 4]);
        assert!(config.cache.enabled);
        assert_eq!(config.cache.retries, 3);
        assert_eq!(config.cache.breaker_failures, 2);
        assert_eq!(config.remote.url.as_deref(), Some("http://builder:9000/"));
    }

    #[test]
    fn test_parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.engine.lanes, 5);
        assert!(config.cache.url.is_none());
        assert!(config.data_dir.is_none());
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let toml = r#"
[engine]
in_flight_policy = "sometimes"
"#;
        assert!(toml::from_str::<Config>(toml).is_err());
    }

    // =========================================================================
    // Load tests
    // =========================================================================

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("absent.toml");
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.engine.lanes, 5);
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");

        let mut config = Config::default();
        config.engine.lanes = 2;
        config.cache.url = Some("http://localhost:8420/api/mutest".to_string());
        std::fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.engine.lanes, 2);
        assert_eq!(loaded.cache.url, config.cache.url);
    }

    #[test]
    fn test_load_malformed_file_errors() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[engine\nlanes = ").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn test_database_path_under_data_dir() {
        let config = Config {
            data_dir: Some(PathBuf::from("/tmp/mutest-data")),
            ..Default::default()
        };
        assert_eq!(
            config.database_path(),
            PathBuf::from("/tmp/mutest-data/mutest.db")
        );
    }

    // =========================================================================
    // Validation tests
    // =========================================================================

    #[test]
    fn test_validate_defaults() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_negative_threshold() {
        let mut config = Config::default();
        config.engine.killed_threshold = -0.5;
        let err = config.validate().unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_validate_rejects_non_http_cache_url() {
        let mut config = Config::default();
        config.cache.url = Some("ftp://cache".to_string());
        assert!(config.validate().is_err());
    }
}
