//! Mutant scheduling.
//!
//! Mutants are taken in id order and dispatched in batches, one mutant per
//! lane. In shared-build mode a batch is built once and its lanes tested
//! concurrently; otherwise every lane builds and tests on its own. A batch
//! whose builds all fail moves the run down the fallback chain and is retried.

pub mod fallback;
pub mod progress;

use crate::adapters::{
    truncate_log, BuildAdapter, BuildOutcome, BuildRequest, TestAdapter, TestOutcome,
    TestRequest, TestStatus,
};
use crate::config::{Config, InFlightPolicy};
use crate::mutation::apply::apply_mutant;
use crate::mutation::events::{now_timestamp_ms, EngineEvent, EventSender};
use crate::mutation::{Mutant, MutantStatus};
use crate::project_config::ToolRule;
use crate::workspace::{IsolationMode, Lane, LaneFactory, Workspace, WorkspaceConfig};
use futures::future::join_all;
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use fallback::{FallbackChain, FallbackStep};
pub use progress::{MutantResult, Progress, Thresholds};

/// Handle for cancelling a run from another task.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop dispatching; mutants already running finish.
    pub fn cancel(&self) {
        tracing::info!("Cancellation requested, no new mutants will start");
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Knobs the scheduler needs, flattened from the settings file and tool rule.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub thresholds: Thresholds,
    pub in_flight_policy: InFlightPolicy,
    pub fallback: bool,
    pub configuration: String,
    pub platform: Option<String>,
    pub verbosity: String,
    pub build_timeout: Duration,
    pub test_timeout: Duration,
    pub kill_on_first_failure: bool,
    pub failure_patterns: Vec<String>,
    pub diagnostics: bool,
    pub max_log_bytes: usize,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config, rule: &ToolRule) -> Self {
        let engine = &config.engine;
        Self {
            thresholds: Thresholds {
                survived: engine.survived_threshold,
                killed: engine.killed_threshold,
            },
            in_flight_policy: engine.in_flight_policy,
            fallback: engine.build_fallback,
            configuration: config.build.configuration.clone(),
            platform: config.build.platform.clone(),
            verbosity: config.build.verbosity.clone(),
            build_timeout: Duration::from_secs(engine.build_timeout_seconds),
            test_timeout: Duration::from_secs(
                rule.timeout_seconds.unwrap_or(engine.test_timeout_seconds),
            ),
            kill_on_first_failure: engine.kill_on_first_failure,
            failure_patterns: rule.failure_patterns.clone(),
            diagnostics: engine.diagnostics,
            max_log_bytes: engine.max_log_bytes,
        }
    }
}

/// What a run produced.
#[derive(Debug)]
pub struct RunReport {
    /// Results by mutant id; scheduled mutants missing here were not run
    pub results: BTreeMap<usize, MutantResult>,
    pub stopped_early: bool,
    pub cancelled: bool,
    pub fallbacks: Vec<FallbackStep>,
    /// Mode the run ended in
    pub mode: IsolationMode,
    pub not_run: usize,
}

enum BatchOutcome {
    Completed,
    /// Every started mutant failed to build: (mutant id, lane) plus the log
    BuildFailed {
        failed: Vec<(usize, usize)>,
        log: String,
    },
}

enum Prepared {
    Skipped,
    Ready,
    Failed(String),
}

enum LaneRun {
    Skipped,
    Done,
    BuildFailed { id: usize, lane: usize, log: String },
}

pub struct Scheduler {
    build: Arc<dyn BuildAdapter>,
    test: Arc<dyn TestAdapter>,
    settings: SchedulerSettings,
    cancel: CancelHandle,
}

impl Scheduler {
    pub fn new(
        build: Arc<dyn BuildAdapter>,
        test: Arc<dyn TestAdapter>,
        settings: SchedulerSettings,
        cancel: CancelHandle,
    ) -> Self {
        Self {
            build,
            test,
            settings,
            cancel,
        }
    }

    /// Execute `mutants` in workspaces made by `factory`, starting from `initial`.
    ///
    /// The workspace is torn down before returning, also on error.
    pub async fn run(
        &self,
        factory: &LaneFactory,
        initial: WorkspaceConfig,
        mut mutants: Vec<Mutant>,
        events: Option<EventSender>,
    ) -> anyhow::Result<RunReport> {
        mutants.sort_by_key(|m| m.id);
        let total = mutants.len();
        let progress = Progress::new(
            total,
            self.settings.thresholds,
            self.settings.in_flight_policy,
            events,
        );

        let mut slot = if total == 0 {
            None
        } else {
            Some(factory.create(initial).await?)
        };
        let lanes = slot.as_ref().map(|w| w.lanes.len()).unwrap_or(0);
        progress.emit(EngineEvent::RunStarted {
            timestamp_ms: now_timestamp_ms(),
            total,
            lanes,
        });

        let mut chain = FallbackChain::new(self.settings.fallback);
        let driven = self
            .drive(factory, &mut slot, &mut chain, mutants, &progress)
            .await;

        let mode = slot
            .as_ref()
            .map(|w| w.config.mode)
            .unwrap_or(initial.mode);
        if let Some(workspace) = slot.take() {
            workspace.teardown().await?;
        }
        let cancelled = driven?;

        let results = progress.take_results();
        let not_run = total.saturating_sub(results.len());
        progress.emit(EngineEvent::RunCompleted {
            timestamp_ms: now_timestamp_ms(),
            completed: results.len(),
            not_run,
        });
        tracing::info!(
            "Executed {} of {} mutant(s), {} not run",
            results.len(),
            total,
            not_run
        );

        Ok(RunReport {
            results,
            stopped_early: progress.is_stopped(),
            cancelled,
            fallbacks: chain.applied().to_vec(),
            mode,
            not_run,
        })
    }

    /// Batch loop. Returns whether the run was cancelled.
    async fn drive(
        &self,
        factory: &LaneFactory,
        slot: &mut Option<Workspace>,
        chain: &mut FallbackChain,
        mutants: Vec<Mutant>,
        progress: &Progress,
    ) -> anyhow::Result<bool> {
        let mut queue: VecDeque<Mutant> = mutants.into();
        let mut fresh = true;
        let mut batch_number = 0;

        while !queue.is_empty() {
            if self.cancel.is_cancelled() || progress.is_stopped() {
                break;
            }
            let Some(workspace) = slot.as_ref() else {
                break;
            };

            let take = workspace.lanes.len().min(queue.len());
            let batch: Vec<Mutant> = queue.drain(..take).collect();
            batch_number += 1;

            let outcome = match workspace.config.mode {
                IsolationMode::SharedBuild => {
                    self.run_shared_batch(workspace, &batch, fresh, progress)
                        .await?
                }
                IsolationMode::FullIsolation | IsolationMode::InPlace => {
                    self.run_isolated_batch(workspace, &batch, fresh, progress)
                        .await
                }
            };
            fresh = false;

            let BatchOutcome::BuildFailed { failed, log } = outcome else {
                continue;
            };
            progress.emit(EngineEvent::BatchBuildFailed {
                timestamp_ms: now_timestamp_ms(),
                batch: batch_number,
            });

            let current = workspace.config;
            if let Some((step, next)) = chain.next(&current) {
                tracing::warn!(
                    "Batch {} failed to build in {} mode, falling back to {}",
                    batch_number,
                    current.mode,
                    step
                );
                progress.emit(EngineEvent::FallbackApplied {
                    timestamp_ms: now_timestamp_ms(),
                    strategy: step.to_string(),
                    lanes: next.lanes,
                });
                if let Some(old) = slot.take() {
                    old.teardown().await?;
                }
                *slot = Some(factory.create(next).await?);
                fresh = true;

                for mutant in batch.into_iter().rev() {
                    if failed.iter().any(|(id, _)| *id == mutant.id) {
                        queue.push_front(mutant);
                    }
                }
                continue;
            }

            tracing::warn!(
                "Batch {} failed to build and no fallback is left",
                batch_number
            );
            for (id, lane) in failed {
                progress.record(
                    id,
                    MutantResult {
                        status: MutantStatus::BuildError,
                        lane,
                        diagnostics: self.diagnostics(&[&log]),
                    },
                );
            }
        }

        let cancelled = self.cancel.is_cancelled();
        if cancelled {
            progress.emit(EngineEvent::Cancelled {
                timestamp_ms: now_timestamp_ms(),
            });
        }
        Ok(cancelled)
    }

    async fn run_shared_batch(
        &self,
        workspace: &Workspace,
        batch: &[Mutant],
        fresh: bool,
        progress: &Progress,
    ) -> anyhow::Result<BatchOutcome> {
        let Some(shared) = workspace.shared.as_ref() else {
            anyhow::bail!("Shared-build workspace has no shared descriptor");
        };

        let mut ready: Vec<(&Lane, &Mutant)> = Vec::with_capacity(batch.len());
        for (lane, mutant) in workspace.lanes.iter().zip(batch) {
            match self.prepare(workspace, lane, mutant, progress).await {
                Prepared::Ready => ready.push((lane, mutant)),
                Prepared::Failed(reason) => self.record_unbuildable(progress, mutant, lane, &reason),
                Prepared::Skipped => {}
            }
        }
        if ready.is_empty() {
            return Ok(BatchOutcome::Completed);
        }

        let request = self.build_request(
            &shared.descriptor,
            shared.solution.clone(),
            &shared.out_dir,
            &shared.int_dir,
            fresh,
            workspace.config.optimized,
        );
        let build = self.build.build(&request).await;
        if !build.is_success() {
            tracing::debug!("Shared build failed:\n{}", build.log);
            for (lane, _) in &ready {
                self.reset(workspace, lane).await;
            }
            return Ok(BatchOutcome::BuildFailed {
                failed: ready.iter().map(|(l, m)| (m.id, l.index)).collect(),
                log: build.log,
            });
        }

        let runs = ready.iter().map(|(lane, mutant)| {
            let build = &build;
            async move {
                let test = self.test.test(&self.test_request(lane)).await;
                progress.record(mutant.id, self.classify(mutant, lane, build, &test));
            }
        });
        join_all(runs).await;

        for (lane, _) in &ready {
            self.reset(workspace, lane).await;
        }
        Ok(BatchOutcome::Completed)
    }

    async fn run_isolated_batch(
        &self,
        workspace: &Workspace,
        batch: &[Mutant],
        fresh: bool,
        progress: &Progress,
    ) -> BatchOutcome {
        let runs = workspace.lanes.iter().zip(batch).map(|(lane, mutant)| async move {
            match self.prepare(workspace, lane, mutant, progress).await {
                Prepared::Skipped => return LaneRun::Skipped,
                Prepared::Failed(reason) => {
                    self.record_unbuildable(progress, mutant, lane, &reason);
                    return LaneRun::Done;
                }
                Prepared::Ready => {}
            }

            let request = self.build_request(
                &lane.descriptor,
                lane.solution.clone(),
                &lane.out_dir,
                &lane.int_dir,
                fresh,
                workspace.config.optimized,
            );
            let build = self.build.build(&request).await;
            if !build.is_success() {
                self.reset(workspace, lane).await;
                return LaneRun::BuildFailed {
                    id: mutant.id,
                    lane: lane.index,
                    log: build.log,
                };
            }

            let test = self.test.test(&self.test_request(lane)).await;
            self.reset(workspace, lane).await;
            progress.record(mutant.id, self.classify(mutant, lane, &build, &test));
            LaneRun::Done
        });
        let runs = join_all(runs).await;

        let started = runs
            .iter()
            .filter(|r| !matches!(r, LaneRun::Skipped))
            .count();
        let failed: Vec<(usize, usize, String)> = runs
            .into_iter()
            .filter_map(|r| match r {
                LaneRun::BuildFailed { id, lane, log } => Some((id, lane, log)),
                _ => None,
            })
            .collect();

        if !failed.is_empty() && failed.len() == started {
            let log = failed
                .iter()
                .map(|(_, _, log)| log.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            return BatchOutcome::BuildFailed {
                failed: failed.into_iter().map(|(id, lane, _)| (id, lane)).collect(),
                log,
            };
        }

        // Siblings built, so these mutants are simply not compilable.
        for (id, lane, log) in failed {
            progress.record(
                id,
                MutantResult {
                    status: MutantStatus::BuildError,
                    lane,
                    diagnostics: self.diagnostics(&[&log]),
                },
            );
        }
        BatchOutcome::Completed
    }

    /// Claim a dispatch slot and write the mutated source into the lane.
    async fn prepare(
        &self,
        workspace: &Workspace,
        lane: &Lane,
        mutant: &Mutant,
        progress: &Progress,
    ) -> Prepared {
        if self.cancel.is_cancelled() || !progress.may_start() {
            return Prepared::Skipped;
        }
        progress.started(mutant.id, lane.index);

        let mutated = match apply_mutant(&lane.pristine_source, mutant) {
            Ok(mutated) => mutated,
            Err(e) => return Prepared::Failed(format!("{:#}", e)),
        };
        match workspace.write_source(lane, &mutated).await {
            Ok(()) => Prepared::Ready,
            Err(e) => Prepared::Failed(format!("{:#}", e)),
        }
    }

    fn record_unbuildable(&self, progress: &Progress, mutant: &Mutant, lane: &Lane, reason: &str) {
        tracing::warn!("Mutant {} could not be applied: {}", mutant.id, reason);
        progress.record(
            mutant.id,
            MutantResult {
                status: MutantStatus::BuildError,
                lane: lane.index,
                diagnostics: self.diagnostics(&[reason]),
            },
        );
    }

    async fn reset(&self, workspace: &Workspace, lane: &Lane) {
        if let Err(e) = workspace.reset_lane(lane).await {
            tracing::error!("Failed to reset lane {}: {:#}", lane.index, e);
        }
    }

    fn classify(
        &self,
        mutant: &Mutant,
        lane: &Lane,
        build: &BuildOutcome,
        test: &TestOutcome,
    ) -> MutantResult {
        let status = match test.status {
            TestStatus::Success => MutantStatus::Survived,
            TestStatus::Failed => MutantStatus::Killed,
            TestStatus::Timeout => MutantStatus::Timeout,
            // No test ran; counting it as a kill would inflate the score.
            TestStatus::LaunchFailed => MutantStatus::Timeout,
        };
        tracing::debug!(
            "Mutant {} ({}) on lane {}: {}",
            mutant.id,
            mutant.describe(),
            lane.index,
            status
        );
        MutantResult {
            status,
            lane: lane.index,
            diagnostics: self.diagnostics(&[&build.log, &test.log]),
        }
    }

    fn diagnostics(&self, logs: &[&str]) -> Option<String> {
        self.settings
            .diagnostics
            .then(|| truncate_log(&logs.join("\n"), self.settings.max_log_bytes))
    }

    fn build_request(
        &self,
        descriptor: &Path,
        solution: Option<PathBuf>,
        out_dir: &Path,
        int_dir: &Path,
        rebuild: bool,
        optimized: bool,
    ) -> BuildRequest {
        BuildRequest {
            descriptor: descriptor.to_path_buf(),
            solution,
            configuration: self.settings.configuration.clone(),
            platform: self.settings.platform.clone(),
            verbosity: self.settings.verbosity.clone(),
            out_dir: out_dir.to_path_buf(),
            int_dir: int_dir.to_path_buf(),
            rebuild,
            optimized,
            timeout: self.settings.build_timeout,
        }
    }

    fn test_request(&self, lane: &Lane) -> TestRequest {
        TestRequest {
            binary_dir: lane.binary_dir.clone(),
            filter: lane.test_filter.clone(),
            result_file: lane.result_file(),
            coverage_file: None,
            timeout: self.settings.test_timeout,
            kill_on_first_failure: self.settings.kill_on_first_failure,
            failure_patterns: self.settings.failure_patterns.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::BuildStatus;
    use crate::coverage::CoverageMapper;
    use crate::mutation::tests::{method, unit};
    use crate::selector::{self, SelectorOptions};
    use crate::mutation::{Location, MutatorType};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    const PROJECT: &str = "<Project>\n  <ClCompile Include=\"calc_test.cpp\" />\n</Project>\n";

    /// Source of a lane, found from a lane directory name such as `mutest_out_dir_2`.
    fn lane_sources(root: &Path, dir: &Path) -> Vec<String> {
        let lane = dir
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("mutest_out_dir_"))
            .and_then(|n| n.parse::<usize>().ok());
        let mut paths = Vec::new();
        match lane {
            Some(i) => {
                let dup = root.join(format!("src/calc_mutest_src_{}.cpp", i));
                paths.push(if dup.exists() { dup } else { root.join("src/calc.cpp") });
            }
            None => {
                for entry in std::fs::read_dir(root.join("src")).unwrap() {
                    let path = entry.unwrap().path();
                    if path.to_string_lossy().contains("_mutest_src_") {
                        paths.push(path);
                    }
                }
            }
        }
        paths
            .iter()
            .map(|p| std::fs::read_to_string(p).unwrap())
            .collect()
    }

    /// Fails to build whenever a source it compiles contains `INVALID`.
    struct FakeBuild {
        root: PathBuf,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BuildAdapter for FakeBuild {
        async fn build(&self, request: &BuildRequest) -> BuildOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let broken = lane_sources(&self.root, &request.out_dir)
                .iter()
                .any(|s| s.contains("INVALID"));
            BuildOutcome {
                status: if broken {
                    BuildStatus::Failed
                } else {
                    BuildStatus::Success
                },
                log: if broken { "error: INVALID".into() } else { "ok".into() },
                duration_ms: 1,
            }
        }
    }

    /// `KILL` fails the tests, `SLOW` times out, `NOSTART` never launches, anything else passes.
    struct FakeTest {
        root: PathBuf,
        calls: AtomicUsize,
        cancel_on_call: Option<CancelHandle>,
    }

    #[async_trait]
    impl TestAdapter for FakeTest {
        async fn test(&self, request: &TestRequest) -> TestOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(cancel) = &self.cancel_on_call {
                cancel.cancel();
            }
            let dir = request.result_file.parent().unwrap();
            let source = lane_sources(&self.root, dir).remove(0);
            let status = if source.contains("KILL") {
                TestStatus::Failed
            } else if source.contains("SLOW") {
                TestStatus::Timeout
            } else if source.contains("NOSTART") {
                TestStatus::LaunchFailed
            } else {
                TestStatus::Success
            };
            TestOutcome {
                status,
                log: "tests ran".into(),
                duration_ms: 1,
                results: vec![],
            }
        }
    }

    struct Harness {
        _temp: TempDir,
        root: PathBuf,
        factory: LaneFactory,
        build: Arc<FakeBuild>,
        test: Arc<FakeTest>,
        settings: SchedulerSettings,
        cancel: CancelHandle,
    }

    fn source() -> String {
        (1..=10).map(|i| format!("int v{} = 0;\n", i)).collect()
    }

    fn harness() -> Harness {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::create_dir_all(root.join("tests")).unwrap();
        std::fs::write(root.join("src/calc.cpp"), source()).unwrap();
        std::fs::write(
            root.join("tests/calc_test.cpp"),
            "#include \"../src/calc.cpp\"\nTEST(CalcTest, Value) { }\n",
        )
        .unwrap();
        std::fs::write(root.join("tests/calc_test.vcxproj"), PROJECT).unwrap();

        let mut unit = unit(vec![]);
        unit.project_root = root.clone();
        let factory = LaneFactory::new(&unit, ".mutest");

        let mut config = Config::default();
        config.engine.build_fallback = false;
        let rule = ToolRule {
            glob: "*.cpp".into(),
            build_command: "build".into(),
            test_command: "test".into(),
            coverage_command: None,
            failure_patterns: vec![],
            optimize_flags: None,
            timeout_seconds: None,
        };
        let cancel = CancelHandle::new();

        Harness {
            build: Arc::new(FakeBuild {
                root: root.clone(),
                calls: AtomicUsize::new(0),
            }),
            test: Arc::new(FakeTest {
                root: root.clone(),
                calls: AtomicUsize::new(0),
                cancel_on_call: None,
            }),
            settings: SchedulerSettings::from_config(&config, &rule),
            cancel,
            factory,
            root,
            _temp: temp,
        }
    }

    impl Harness {
        fn scheduler(&self) -> Scheduler {
            Scheduler::new(
                self.build.clone(),
                self.test.clone(),
                self.settings.clone(),
                self.cancel.clone(),
            )
        }

        async fn run(&self, mode: IsolationMode, lanes: usize, mutants: Vec<Mutant>) -> RunReport {
            self.scheduler()
                .run(&self.factory, WorkspaceConfig::new(mode, lanes), mutants, None)
                .await
                .unwrap()
        }
    }

    /// Mutant `id` replaces the `0` on line `id` with `marker`.
    fn mutant(id: usize, marker: &str) -> Mutant {
        Mutant::new(
            id,
            Location::single(id),
            MutatorType::Arithmetic,
            "0",
            Some(marker.to_string()),
        )
    }

    fn status_of(report: &RunReport, id: usize) -> Option<MutantStatus> {
        report.results.get(&id).map(|r| r.status)
    }

    // =========================================================================
    // Classification
    // =========================================================================

    #[tokio::test]
    async fn test_shared_build_classifies_each_lane() {
        let h = harness();
        let report = h
            .run(
                IsolationMode::SharedBuild,
                3,
                vec![mutant(1, "KILL"), mutant(2, "1"), mutant(3, "SLOW")],
            )
            .await;

        assert_eq!(status_of(&report, 1), Some(MutantStatus::Killed));
        assert_eq!(status_of(&report, 2), Some(MutantStatus::Survived));
        assert_eq!(status_of(&report, 3), Some(MutantStatus::Timeout));
        // One batch, one build.
        assert_eq!(h.build.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.test.calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.not_run, 0);
        assert!(!report.stopped_early);
    }

    #[tokio::test]
    async fn test_launch_failure_is_never_a_kill() {
        let h = harness();
        let report = h
            .run(
                IsolationMode::SharedBuild,
                2,
                vec![mutant(1, "NOSTART"), mutant(2, "KILL")],
            )
            .await;

        assert_eq!(status_of(&report, 1), Some(MutantStatus::Timeout));
        assert_eq!(status_of(&report, 2), Some(MutantStatus::Killed));
    }

    #[tokio::test]
    async fn test_isolated_lanes_build_separately() {
        let h = harness();
        let report = h
            .run(
                IsolationMode::FullIsolation,
                2,
                vec![mutant(1, "KILL"), mutant(2, "1"), mutant(3, "KILL")],
            )
            .await;

        assert_eq!(status_of(&report, 1), Some(MutantStatus::Killed));
        assert_eq!(status_of(&report, 2), Some(MutantStatus::Survived));
        assert_eq!(status_of(&report, 3), Some(MutantStatus::Killed));
        assert_eq!(h.build.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_untested_method_never_reaches_the_tools() {
        let h = harness();
        let mut untested = method("untested", 5, 8, vec![mutant(5, "SLOW"), mutant(6, "KILL")]);
        untested.tests.clear();
        let mut u = unit(vec![method("covered", 1, 4, vec![mutant(2, "KILL")]), untested]);

        let outcome = CoverageMapper::default().map(&mut u, None);
        assert_eq!(outcome.not_covered, 2);
        let source = source();
        selector::select(&mut u, &source, &SelectorOptions::default());
        let pending: Vec<Mutant> = u.pending().into_iter().cloned().collect();
        assert_eq!(pending.len(), 1);

        let report = h.run(IsolationMode::SharedBuild, 3, pending).await;
        assert_eq!(status_of(&report, 2), Some(MutantStatus::Killed));
        assert_eq!(status_of(&report, 5), None);
        assert_eq!(status_of(&report, 6), None);
        assert_eq!(h.build.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.test.calls.load(Ordering::SeqCst), 1);

        // A unit whose only method has no tests does no work at all.
        let h = harness();
        let mut alone = method("untested", 5, 8, vec![mutant(5, "SLOW")]);
        alone.tests.clear();
        let mut u = unit(vec![alone]);
        // Attribution comes from the coverage run when no method lists tests.
        let snapshot = crate::coverage::CoverageSnapshot::default();
        CoverageMapper::default().map(&mut u, Some(&snapshot));
        selector::select(&mut u, &source, &SelectorOptions::default());
        let pending: Vec<Mutant> = u.pending().into_iter().cloned().collect();
        assert!(pending.is_empty());

        let report = h.run(IsolationMode::SharedBuild, 3, pending).await;
        assert!(report.results.is_empty());
        assert_eq!(h.build.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.test.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_mutants_means_no_work() {
        let h = harness();
        let report = h.run(IsolationMode::SharedBuild, 4, vec![]).await;
        assert!(report.results.is_empty());
        assert_eq!(h.build.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.test.calls.load(Ordering::SeqCst), 0);
        assert!(!h.root.join(".mutest").exists());
    }

    #[tokio::test]
    async fn test_unapplicable_mutant_is_build_error() {
        let h = harness();
        let mut missing = mutant(1, "KILL");
        missing.original = "no such fragment".to_string();
        let report = h
            .run(IsolationMode::FullIsolation, 1, vec![missing, mutant(2, "KILL")])
            .await;

        assert_eq!(status_of(&report, 1), Some(MutantStatus::BuildError));
        assert_eq!(status_of(&report, 2), Some(MutantStatus::Killed));
        assert_eq!(h.build.calls.load(Ordering::SeqCst), 1);
    }

    // =========================================================================
    // Build failures and fallback
    // =========================================================================

    #[tokio::test]
    async fn test_shared_build_failure_fails_whole_batch() {
        let h = harness();
        let report = h
            .run(
                IsolationMode::SharedBuild,
                2,
                vec![mutant(1, "INVALID"), mutant(2, "KILL")],
            )
            .await;

        assert_eq!(status_of(&report, 1), Some(MutantStatus::BuildError));
        assert_eq!(status_of(&report, 2), Some(MutantStatus::BuildError));
        assert_eq!(h.test.calls.load(Ordering::SeqCst), 0);
        assert!(report.fallbacks.is_empty());
    }

    #[tokio::test]
    async fn test_isolated_build_failure_stays_with_its_lane() {
        let h = harness();
        let report = h
            .run(
                IsolationMode::FullIsolation,
                2,
                vec![mutant(1, "INVALID"), mutant(2, "KILL")],
            )
            .await;

        assert_eq!(status_of(&report, 1), Some(MutantStatus::BuildError));
        assert_eq!(status_of(&report, 2), Some(MutantStatus::Killed));
    }

    #[tokio::test]
    async fn test_fallback_retries_batch_in_isolation() {
        let mut h = harness();
        h.settings.fallback = true;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let report = h
            .scheduler()
            .run(
                &h.factory,
                WorkspaceConfig::new(IsolationMode::SharedBuild, 2),
                vec![mutant(1, "INVALID"), mutant(2, "KILL")],
                Some(tx),
            )
            .await
            .unwrap();

        assert_eq!(report.fallbacks, vec![FallbackStep::IsolatedRebuild]);
        assert_eq!(report.mode, IsolationMode::FullIsolation);
        assert_eq!(status_of(&report, 1), Some(MutantStatus::BuildError));
        assert_eq!(status_of(&report, 2), Some(MutantStatus::Killed));

        let mut saw_fallback = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::FallbackApplied { strategy, lanes, .. } = event {
                assert_eq!(strategy, "isolated-rebuild");
                assert_eq!(lanes, 2);
                saw_fallback = true;
            }
        }
        assert!(saw_fallback);
    }

    #[tokio::test]
    async fn test_fallback_chain_ends_in_place() {
        let mut h = harness();
        h.settings.fallback = true;
        let report = h
            .run(IsolationMode::SharedBuild, 1, vec![mutant(1, "INVALID"), mutant(2, "KILL")])
            .await;

        assert_eq!(
            report.fallbacks,
            vec![FallbackStep::IsolatedRebuild, FallbackStep::SingleLaneInPlace]
        );
        assert_eq!(report.mode, IsolationMode::InPlace);
        assert_eq!(status_of(&report, 1), Some(MutantStatus::BuildError));
        assert_eq!(status_of(&report, 2), Some(MutantStatus::Killed));

        // The original comes back and nothing is left behind.
        let restored = std::fs::read_to_string(h.root.join("src/calc.cpp")).unwrap();
        assert_eq!(restored, source());
        assert!(!h.root.join(".mutest").exists());
        let leftovers: Vec<_> = std::fs::read_dir(h.root.join("src"))
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    // =========================================================================
    // Early stop and cancellation
    // =========================================================================

    #[tokio::test]
    async fn test_early_stop_leaves_rest_not_run() {
        let mut h = harness();
        h.settings.thresholds = Thresholds {
            survived: 1.0,
            killed: 0.5,
        };
        let mutants = (1..=10).map(|id| mutant(id, "KILL")).collect();
        let report = h.run(IsolationMode::SharedBuild, 1, mutants).await;

        assert!(report.stopped_early);
        // 6/10 is the first ratio above 0.5.
        assert_eq!(report.results.len(), 6);
        assert!((7..=10).all(|id| status_of(&report, id).is_none()));
        assert_eq!(report.not_run, 4);
    }

    #[tokio::test]
    async fn test_discard_policy_drops_in_flight_results() {
        let mut h = harness();
        h.settings.thresholds = Thresholds {
            survived: 0.0,
            killed: 1.0,
        };
        h.settings.in_flight_policy = InFlightPolicy::Discard;
        let report = h
            .run(
                IsolationMode::SharedBuild,
                2,
                vec![mutant(1, "1"), mutant(2, "1"), mutant(3, "1")],
            )
            .await;

        // Both lanes were in flight; the first survivor stops the run and
        // the second result is dropped.
        assert!(report.stopped_early);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.not_run, 2);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let h = harness();
        h.cancel.cancel();
        let report = h
            .run(IsolationMode::FullIsolation, 2, vec![mutant(1, "KILL")])
            .await;
        assert!(report.cancelled);
        assert!(report.results.is_empty());
        assert_eq!(h.build.calls.load(Ordering::SeqCst), 0);
        assert!(!h.root.join("src/calc_mutest_src_0.cpp").exists());
    }

    #[tokio::test]
    async fn test_cancel_mid_run_finishes_running_mutant() {
        let mut h = harness();
        h.test = Arc::new(FakeTest {
            root: h.root.clone(),
            calls: AtomicUsize::new(0),
            cancel_on_call: Some(h.cancel.clone()),
        });
        let report = h
            .run(
                IsolationMode::FullIsolation,
                1,
                vec![mutant(1, "KILL"), mutant(2, "KILL"), mutant(3, "KILL")],
            )
            .await;

        assert!(report.cancelled);
        assert_eq!(status_of(&report, 1), Some(MutantStatus::Killed));
        assert_eq!(report.not_run, 2);
        assert_eq!(std::fs::read_to_string(h.root.join("src/calc.cpp")).unwrap(), source());
    }

    #[test]
    fn test_rule_timeout_overrides_engine_timeout() {
        let config = Config::default();
        let mut rule = ToolRule {
            glob: "*".into(),
            build_command: "b".into(),
            test_command: "t".into(),
            coverage_command: None,
            failure_patterns: vec![],
            optimize_flags: None,
            timeout_seconds: None,
        };
        let settings = SchedulerSettings::from_config(&config, &rule);
        assert_eq!(
            settings.test_timeout,
            Duration::from_secs(config.engine.test_timeout_seconds)
        );
        rule.timeout_seconds = Some(7);
        let settings = SchedulerSettings::from_config(&config, &rule);
        assert_eq!(settings.test_timeout, Duration::from_secs(7));
    }
}
