//! Runs one unit end to end.
//!
//! The pipeline is: load the manifest, resolve the toolchain rule, consult the
//! cache, run the baseline, map coverage, select mutants, schedule them, then
//! score and store the result. Failures before scheduling abort the unit with
//! an [`EngineError`]; everything after that degrades to per-mutant statuses.

use crate::adapters::remote::RemoteClient;
use crate::adapters::{
    truncate_log, BuildAdapter, BuildRequest, CaseOutcome, ProcessBuildAdapter,
    ProcessTestAdapter, RemoteBuildAdapter, RemoteTestAdapter, TestAdapter, TestOutcome,
    TestRequest, TestStatus,
};
use crate::cache::{cache_key, relink, CacheEntry, CacheStore, HttpCacheStore, SqliteCacheStore};
use crate::config::Config;
use crate::coverage::{CoverageMapper, CoverageOutcome, CoverageSnapshot};
use crate::error::EngineError;
use crate::mutation::events::EventSender;
use crate::mutation::manifest::load_unit;
use crate::mutation::{Mutant, UnitDetail};
use crate::project_config::{ProjectConfig, ToolRule};
use crate::scheduler::{CancelHandle, Scheduler, SchedulerSettings};
use crate::score::Summary;
use crate::selector::{self, SelectorOptions};
use crate::workspace::fs::{copy_project_to_temp, purge_stale, rebase_path, remove_lenient};
use crate::workspace::{IsolationMode, LaneFactory, WorkspaceConfig};
use anyhow::Context;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Name of the baseline output directory inside the work directory.
const BASELINE_OUT_DIR: &str = "mutest_baseline";
const COVERAGE_FILE: &str = "coverage.xml";
const RESULT_FILE: &str = "test_results.json";

/// Everything known about a finished unit.
#[derive(Debug, Serialize)]
pub struct UnitReport {
    pub unit: UnitDetail,
    pub summary: Summary,
    pub no_of_tests: usize,
    pub cache_key: String,
    pub cache_hit: bool,
    /// Mutants classified from the cache
    pub relinked: usize,
    pub not_covered: usize,
    pub skipped: usize,
    pub executed: usize,
    pub stopped_early: bool,
    pub cancelled: bool,
    /// Fallback steps taken, in order
    pub fallbacks: Vec<String>,
    pub mode: Option<IsolationMode>,
}

impl UnitReport {
    fn new(unit: UnitDetail, key: String) -> Self {
        Self {
            summary: Summary::of(&unit),
            unit,
            no_of_tests: 0,
            cache_key: key,
            cache_hit: false,
            relinked: 0,
            not_covered: 0,
            skipped: 0,
            executed: 0,
            stopped_early: false,
            cancelled: false,
            fallbacks: Vec::new(),
            mode: None,
        }
    }
}

/// Baseline results: the test count and the coverage it produced.
struct Baseline {
    no_of_tests: usize,
    coverage: Option<CoverageSnapshot>,
}

pub struct Runner {
    config: Config,
    cancel: CancelHandle,
    events: Option<EventSender>,
}

impl Runner {
    pub fn new(config: Config, cancel: CancelHandle) -> Self {
        Self {
            config,
            cancel,
            events: None,
        }
    }

    /// Forward scheduler progress events to `events`.
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Run the unit described by the manifest at `manifest`.
    pub async fn run(&self, manifest: &Path) -> anyhow::Result<UnitReport> {
        self.config.validate()?;
        let mut unit = load_unit(manifest)?;
        tracing::info!(
            "Unit {} with {} mutant(s)",
            unit.source_file.display(),
            unit.mutants().count()
        );

        let original_root = unit.project_root.clone();
        let sandbox = if self.config.engine.sandbox {
            let temp = copy_project_to_temp(&original_root)
                .await
                .context("Failed to create sandbox copy")?;
            tracing::info!("Running in sandbox {}", temp.path().display());
            rebase_unit(&mut unit, &original_root, temp.path());
            Some(temp)
        } else {
            None
        };

        let result = self.run_unit(unit).await;

        // The sandbox is dropped after this; report paths against the original tree.
        match (result, &sandbox) {
            (Ok(mut report), Some(temp)) => {
                rebase_unit(&mut report.unit, temp.path(), &original_root);
                Ok(report)
            }
            (result, _) => result,
        }
    }

    async fn run_unit(&self, mut unit: UnitDetail) -> anyhow::Result<UnitReport> {
        let rule = ProjectConfig::resolve_rule(&unit.project_root, &unit.source_path())?;

        let purged = purge_stale(&unit.project_root, &self.config.engine.work_dir_name).await?;
        if purged.restored + purged.deleted > 0 {
            tracing::info!(
                "Cleaned up a previous run: {} restored, {} deleted",
                purged.restored,
                purged.deleted
            );
        }

        let source_text = read_input(&unit.source_path(), "source file").await?;
        let test_text = read_input(&unit.test_path(), "test file").await?;
        let key = cache_key(&source_text, &test_text);

        // Capped before the cache lookup so a stored entry covers every mutant left.
        let capped = selector::apply_line_cap(&mut unit, self.config.engine.mutants_per_line);
        if !capped.is_empty() {
            tracing::info!("Line cap dropped {} mutant(s)", capped.len());
        }

        let store = self.open_store().await;
        let cached = match &store {
            Some(store) => store.get(&key).await,
            None => None,
        };

        let mut relinked = 0;
        if let Some(entry) = &cached {
            relinked = relink(&mut unit, entry);
            tracing::info!("Cache hit {}: re-linked {} mutant(s)", key, relinked);
            if unit.pending().is_empty() {
                let mut report = UnitReport::new(unit, key);
                report.cache_hit = true;
                report.relinked = relinked;
                report.no_of_tests = entry.no_of_tests;
                return Ok(report);
            }
        }

        let (build, test) = self.adapters(&rule, &unit.project_root);
        let work_dir = unit.project_root.join(&self.config.engine.work_dir_name);
        let created_work_dir = !work_dir.exists();

        let executed = self
            .execute(&mut unit, &rule, &source_text, build, test, &work_dir)
            .await;
        if created_work_dir {
            remove_lenient(&work_dir).await;
        }
        let (baseline, outcome, selection_skipped, run) = executed?;

        for (id, result) in &run.results {
            let Some(mutant) = unit.mutant_mut(*id) else {
                continue;
            };
            if let Err(e) = mutant.set_status(result.status) {
                tracing::warn!("{}", e);
            }
            mutant.diagnostics = result.diagnostics.clone();
        }

        let mut report = UnitReport::new(unit, key);
        report.no_of_tests = cached
            .as_ref()
            .map(|entry| entry.no_of_tests)
            .unwrap_or(baseline.no_of_tests);
        report.cache_hit = cached.is_some();
        report.relinked = relinked;
        report.not_covered = outcome.not_covered;
        report.skipped = outcome.skipped + selection_skipped;
        report.executed = run.results.len();
        report.stopped_early = run.stopped_early;
        report.cancelled = run.cancelled;
        report.fallbacks = run.fallbacks.iter().map(|step| step.to_string()).collect();
        report.mode = Some(run.mode);

        // Partial runs are not stored; the missing mutants would read as final.
        let complete = !run.cancelled && !run.stopped_early;
        match &store {
            Some(store) if cached.is_none() && complete => {
                let entry = CacheEntry::from_unit(
                    &report.cache_key,
                    &report.unit,
                    report.no_of_tests,
                    &report.summary,
                );
                store.put(&report.cache_key, &entry).await;
            }
            _ => {}
        }

        Ok(report)
    }

    /// Baseline, coverage mapping, selection and scheduling.
    async fn execute(
        &self,
        unit: &mut UnitDetail,
        rule: &ToolRule,
        source_text: &str,
        build: Arc<dyn BuildAdapter>,
        test: Arc<dyn TestAdapter>,
        work_dir: &Path,
    ) -> anyhow::Result<(Baseline, CoverageOutcome, usize, crate::scheduler::RunReport)> {
        let baseline = self
            .baseline(unit, rule, build.as_ref(), test.as_ref(), work_dir)
            .await?;

        let outcome = CoverageMapper::default().map(unit, baseline.coverage.as_ref());
        tracing::info!(
            "Coverage: {} eligible, {} not covered, {} skipped",
            outcome.eligible,
            outcome.not_covered,
            outcome.skipped
        );

        let options =
            SelectorOptions::from_config(&self.config.filters, self.config.engine.mutants_per_line)?;
        let selection = selector::select(unit, source_text, &options);
        tracing::info!(
            "Selected {} mutant(s), {} filtered",
            selection.selected.len(),
            selection.skipped
        );

        let mutants: Vec<Mutant> = unit.pending().into_iter().cloned().collect();
        let mode = if self.config.engine.in_isolation {
            IsolationMode::FullIsolation
        } else {
            IsolationMode::SharedBuild
        };
        let initial = WorkspaceConfig::new(mode, self.config.engine.lane_count());
        let factory = LaneFactory::new(unit, &self.config.engine.work_dir_name);
        let scheduler = Scheduler::new(
            build,
            test,
            SchedulerSettings::from_config(&self.config, rule),
            self.cancel.clone(),
        );
        let run = scheduler
            .run(&factory, initial, mutants, self.events.clone())
            .await?;

        Ok((baseline, outcome, selection.skipped, run))
    }

    /// Build and test the unmodified project.
    ///
    /// A failing build or test run means the project is not in a state where
    /// mutants can be judged, so the unit is aborted.
    async fn baseline(
        &self,
        unit: &UnitDetail,
        rule: &ToolRule,
        build: &dyn BuildAdapter,
        test: &dyn TestAdapter,
        work_dir: &Path,
    ) -> anyhow::Result<Baseline> {
        let out_dir = work_dir.join(BASELINE_OUT_DIR);
        tokio::fs::create_dir_all(&out_dir)
            .await
            .with_context(|| format!("Failed to create {}", out_dir.display()))?;
        let max_log = self.config.engine.max_log_bytes;

        tracing::info!("Building the original project");
        let built = build
            .build(&BuildRequest {
                descriptor: unit.project_path(),
                solution: unit.solution_path(),
                configuration: self.config.build.configuration.clone(),
                platform: self.config.build.platform.clone(),
                verbosity: self.config.build.verbosity.clone(),
                out_dir: out_dir.clone(),
                int_dir: work_dir.join("mutest_baseline_int"),
                rebuild: true,
                optimized: false,
                timeout: Duration::from_secs(self.config.engine.build_timeout_seconds),
            })
            .await;
        if !built.is_success() {
            return Err(EngineError::FailingBuild {
                details: truncate_log(&built.log, max_log),
            }
            .into());
        }

        let coverage_file = rule
            .coverage_command
            .as_ref()
            .map(|_| out_dir.join(COVERAGE_FILE));
        let mut request = TestRequest {
            binary_dir: out_dir.clone(),
            filter: unit.test_class.clone(),
            result_file: out_dir.join(RESULT_FILE),
            coverage_file: coverage_file.clone(),
            timeout: Duration::from_secs(
                rule.timeout_seconds
                    .unwrap_or(self.config.engine.test_timeout_seconds),
            ),
            kill_on_first_failure: false,
            failure_patterns: rule.failure_patterns.clone(),
        };

        tracing::info!("Running the original tests");
        let mut outcome = test.test(&request).await;
        check_baseline(&outcome, max_log)?;
        if outcome.results.is_empty() && request.filter.is_some() {
            tracing::info!("No test matched the filter, running the whole suite");
            request.filter = None;
            outcome = test.test(&request).await;
            check_baseline(&outcome, max_log)?;
        }

        let no_of_tests = outcome
            .results
            .iter()
            .filter(|r| r.outcome != CaseOutcome::Skipped)
            .count();
        tracing::info!("Baseline passed with {} test(s)", no_of_tests);

        let coverage = match coverage_file {
            Some(path) if path.is_file() => match CoverageSnapshot::load(&path) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    tracing::warn!("Ignoring coverage report: {:#}", e);
                    None
                }
            },
            Some(path) => {
                tracing::warn!("No coverage report at {}", path.display());
                None
            }
            None => None,
        };

        Ok(Baseline {
            no_of_tests,
            coverage,
        })
    }

    fn adapters(
        &self,
        rule: &ToolRule,
        root: &Path,
    ) -> (Arc<dyn BuildAdapter>, Arc<dyn TestAdapter>) {
        match &self.config.remote.url {
            Some(url) => {
                tracing::info!("Building and testing through {}", url);
                let client = RemoteClient::new(url);
                (
                    Arc::new(RemoteBuildAdapter::new(client.clone())),
                    Arc::new(RemoteTestAdapter::new(client)),
                )
            }
            None => (
                Arc::new(ProcessBuildAdapter::from_rule(rule, root)),
                Arc::new(ProcessTestAdapter::from_rule(rule, root)),
            ),
        }
    }

    async fn open_store(&self) -> Option<Box<dyn CacheStore>> {
        let cache = &self.config.cache;
        if !cache.enabled {
            return None;
        }
        if let Some(url) = &cache.url {
            return Some(Box::new(HttpCacheStore::new(url, cache)));
        }
        match SqliteCacheStore::new(&self.config.database_path()).await {
            Ok(store) => Some(Box::new(store)),
            Err(e) => {
                tracing::warn!("Local cache unavailable: {:#}", e);
                None
            }
        }
    }
}

fn check_baseline(outcome: &TestOutcome, max_log: usize) -> Result<(), EngineError> {
    match outcome.status {
        TestStatus::Success => Ok(()),
        TestStatus::Failed | TestStatus::Timeout => Err(EngineError::FailingTests {
            details: truncate_log(&outcome.log, max_log),
        }),
        TestStatus::LaunchFailed => Err(EngineError::Input {
            message: "Unable to start the test runner".to_string(),
            details: truncate_log(&outcome.log, max_log),
        }),
    }
}

async fn read_input(path: &Path, what: &str) -> Result<String, EngineError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| EngineError::Input {
            message: format!("Unable to read {} {}", what, path.display()),
            details: e.to_string(),
        })
}

/// Move the unit, and any absolute paths in it, from `from` to `to`.
fn rebase_unit(unit: &mut UnitDetail, from: &Path, to: &Path) {
    let rebase = |path: &PathBuf| rebase_path(from, to, path);
    unit.project_root = to.to_path_buf();
    unit.source_file = rebase(&unit.source_file);
    unit.test_file = rebase(&unit.test_file);
    unit.test_project = rebase(&unit.test_project);
    unit.source_header = unit.source_header.as_ref().map(rebase);
    unit.test_solution = unit.test_solution.as_ref().map(rebase);
}
