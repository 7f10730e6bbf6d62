//! Lane workspaces.
//!
//! A workspace is the set of numbered lanes a run executes mutants in. Each
//! lane owns a copy of the source file (and, depending on the mode, of the
//! build descriptor) plus private output and intermediate directories.

pub mod descriptor;
pub mod fs;

use crate::mutation::UnitDetail;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use self::descriptor::{
    duplicate_reference_lines, replace_identifier, replace_name, rewrite_reference,
};
use self::fs::{backup_path, remove_lenient, write_with_retry};

/// How lanes are separated from each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// One shared descriptor compiles every lane's test copy into one binary;
    /// each batch is built once.
    SharedBuild,
    /// Every lane has its own descriptor and solution and builds independently.
    FullIsolation,
    /// A single lane that mutates the original source behind a backup.
    InPlace,
}

impl std::fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IsolationMode::SharedBuild => "shared-build",
            IsolationMode::FullIsolation => "full-isolation",
            IsolationMode::InPlace => "in-place",
        };
        write!(f, "{}", name)
    }
}

/// Shape of a workspace to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkspaceConfig {
    pub mode: IsolationMode,
    pub lanes: usize,
    /// Build with the rule's optimisation flags
    pub optimized: bool,
}

impl WorkspaceConfig {
    pub fn new(mode: IsolationMode, lanes: usize) -> Self {
        let lanes = if mode == IsolationMode::InPlace {
            1
        } else {
            lanes.max(1)
        };
        Self {
            mode,
            lanes,
            optimized: true,
        }
    }
}

/// One exclusively owned execution slot.
#[derive(Debug, Clone)]
pub struct Lane {
    pub index: usize,
    /// File the mutated source is written to
    pub source: PathBuf,
    /// Source text for this lane before any mutation
    pub pristine_source: String,
    pub test_file: PathBuf,
    /// Build descriptor this lane is built with
    pub descriptor: PathBuf,
    pub solution: Option<PathBuf>,
    pub out_dir: PathBuf,
    pub int_dir: PathBuf,
    /// Directory holding the test binary this lane runs
    pub binary_dir: PathBuf,
    pub test_filter: Option<String>,
}

impl Lane {
    /// Structured result file for this lane's test runs.
    pub fn result_file(&self) -> PathBuf {
        self.out_dir.join("test_results.json")
    }
}

/// Build target shared by all lanes in shared-build mode.
#[derive(Debug, Clone)]
pub struct SharedBuild {
    pub descriptor: PathBuf,
    pub solution: Option<PathBuf>,
    pub out_dir: PathBuf,
    pub int_dir: PathBuf,
}

/// A prepared set of lanes. Call [`Workspace::teardown`] when done; dropping
/// without teardown still restores backed-up originals.
#[derive(Debug)]
pub struct Workspace {
    pub config: WorkspaceConfig,
    pub lanes: Vec<Lane>,
    pub shared: Option<SharedBuild>,
    created: Vec<PathBuf>,
    backups: Vec<(PathBuf, PathBuf)>,
    torn_down: bool,
}

impl Workspace {
    /// Write a lane's source file.
    pub async fn write_source(&self, lane: &Lane, content: &str) -> anyhow::Result<()> {
        write_with_retry(&lane.source, content).await
    }

    /// Put a lane's pristine source back.
    pub async fn reset_lane(&self, lane: &Lane) -> anyhow::Result<()> {
        write_with_retry(&lane.source, &lane.pristine_source).await
    }

    /// True if no two lanes share an output or intermediate directory.
    pub fn lanes_disjoint(&self) -> bool {
        let mut dirs: Vec<&Path> = Vec::new();
        for lane in &self.lanes {
            for dir in [lane.out_dir.as_path(), lane.int_dir.as_path()] {
                if dirs.contains(&dir) {
                    return false;
                }
                dirs.push(dir);
            }
        }
        true
    }

    /// Restore backups, then delete every duplicate and lane directory.
    pub async fn teardown(mut self) -> anyhow::Result<()> {
        for (backup, original) in std::mem::take(&mut self.backups) {
            tokio::fs::copy(&backup, &original)
                .await
                .with_context(|| format!("Failed to restore {}", original.display()))?;
            remove_lenient(&backup).await;
        }
        for path in std::mem::take(&mut self.created).into_iter().rev() {
            remove_lenient(&path).await;
        }
        self.torn_down = true;
        tracing::debug!("Workspace ({}) torn down", self.config.mode);
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        // Interrupted before teardown: originals must come back, duplicates
        // are left for the next run's purge.
        for (backup, original) in &self.backups {
            match std::fs::copy(backup, original) {
                Ok(_) => {
                    let _ = std::fs::remove_file(backup);
                }
                Err(e) => tracing::error!(
                    "Failed to restore {} from {}: {}",
                    original.display(),
                    backup.display(),
                    e
                ),
            }
        }
    }
}

/// Creates workspaces for one unit.
#[derive(Debug, Clone)]
pub struct LaneFactory {
    source: PathBuf,
    header: Option<PathBuf>,
    test: PathBuf,
    project: PathBuf,
    solution: Option<PathBuf>,
    test_class: Option<String>,
    namespace: Option<String>,
    work_dir: PathBuf,
}

impl LaneFactory {
    pub fn new(unit: &UnitDetail, work_dir_name: &str) -> Self {
        Self {
            source: unit.source_path(),
            header: unit.header_path(),
            test: unit.test_path(),
            project: unit.project_path(),
            solution: unit.solution_path(),
            test_class: unit.test_class.clone(),
            namespace: unit.namespace.clone(),
            work_dir: unit.project_root.join(work_dir_name),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Create the lanes for `config`.
    pub async fn create(&self, config: WorkspaceConfig) -> anyhow::Result<Workspace> {
        let mut workspace = Workspace {
            config,
            lanes: Vec::with_capacity(config.lanes),
            shared: None,
            created: Vec::new(),
            backups: Vec::new(),
            torn_down: false,
        };

        if !self.work_dir.exists() {
            tokio::fs::create_dir_all(&self.work_dir).await?;
            workspace.created.push(self.work_dir.clone());
        }

        let source_text = tokio::fs::read_to_string(&self.source)
            .await
            .with_context(|| format!("Failed to read {}", self.source.display()))?;

        let prepared = if config.mode == IsolationMode::InPlace {
            self.create_in_place(&mut workspace, source_text).await
        } else {
            self.create_duplicated(&mut workspace, source_text).await
        };
        if let Err(e) = prepared {
            if let Err(cleanup) = workspace.teardown().await {
                tracing::warn!("Cleanup after failed workspace creation: {}", cleanup);
            }
            return Err(e);
        }
        debug_assert!(workspace.lanes_disjoint());

        tracing::info!(
            "Prepared {} lane(s) in {} mode",
            workspace.lanes.len(),
            config.mode
        );
        Ok(workspace)
    }

    async fn create_in_place(
        &self,
        workspace: &mut Workspace,
        source_text: String,
    ) -> anyhow::Result<()> {
        let backup = backup_path(&self.source, chrono::Utc::now().timestamp_millis());
        tokio::fs::copy(&self.source, &backup)
            .await
            .with_context(|| format!("Failed to back up {}", self.source.display()))?;
        workspace.backups.push((backup, self.source.clone()));

        let (out_dir, int_dir) = self.lane_dirs(workspace, 0).await?;
        workspace.lanes.push(Lane {
            index: 0,
            source: self.source.clone(),
            pristine_source: source_text,
            test_file: self.test.clone(),
            descriptor: self.project.clone(),
            solution: self.solution.clone(),
            binary_dir: out_dir.clone(),
            out_dir,
            int_dir,
            test_filter: self.test_class.clone(),
        });
        Ok(())
    }

    async fn create_duplicated(
        &self,
        workspace: &mut Workspace,
        source_text: String,
    ) -> anyhow::Result<()> {
        let config = workspace.config;
        let shared = config.mode == IsolationMode::SharedBuild;
        let test_text = tokio::fs::read_to_string(&self.test)
            .await
            .with_context(|| format!("Failed to read {}", self.test.display()))?;
        let project_text = tokio::fs::read_to_string(&self.project)
            .await
            .with_context(|| format!("Failed to read {}", self.project.display()))?;
        let header_text = match &self.header {
            Some(header) => Some(
                tokio::fs::read_to_string(header)
                    .await
                    .with_context(|| format!("Failed to read {}", header.display()))?,
            ),
            None => None,
        };
        let class = self.test_class.as_deref().and_then(class_identifier);

        let mut lane_tests = Vec::with_capacity(config.lanes);
        for index in 0..config.lanes {
            let lane_source = sibling(&self.source, &format!("_mutest_src_{}", index));
            let lane_test = sibling(&self.test, &format!("_mutest_test_{}", index));

            let mut lane_source_text = source_text.clone();
            let mut lane_test_text =
                replace_name(&test_text, &name_of(&self.source), &name_of(&lane_source));

            if let (Some(header), Some(header_text)) = (&self.header, &header_text) {
                let lane_header = sibling(header, &format!("_mutest_src_{}", index));
                let (from, to) = (name_of(header), name_of(&lane_header));
                lane_source_text = replace_name(&lane_source_text, &from, &to);
                lane_test_text = replace_name(&lane_test_text, &from, &to);
                self.write_created(workspace, &lane_header, header_text).await?;
            }

            let mut filter = self.test_class.clone();
            if shared {
                // One binary holds every lane's tests, so each lane gets its own class.
                if let Some(class) = class {
                    let lane_class = format!("{}_mutest_{}", class, index);
                    lane_test_text = replace_identifier(&lane_test_text, class, &lane_class);
                    filter = filter.map(|f| replace_identifier(&f, class, &lane_class));
                }
            }

            self.write_created(workspace, &lane_source, &lane_source_text).await?;
            self.write_created(workspace, &lane_test, &lane_test_text).await?;

            let (out_dir, int_dir) = self.lane_dirs(workspace, index).await?;

            let (descriptor, solution, binary_dir) = if shared {
                (PathBuf::new(), None, PathBuf::new())
            } else {
                let (descriptor, solution) = self
                    .isolated_descriptor(workspace, &project_text, index, &lane_source, &lane_test)
                    .await?;
                (descriptor, solution, out_dir.clone())
            };

            lane_tests.push(lane_test.clone());
            workspace.lanes.push(Lane {
                index,
                source: lane_source,
                pristine_source: lane_source_text,
                test_file: lane_test,
                descriptor,
                solution,
                out_dir,
                int_dir,
                binary_dir,
                test_filter: filter,
            });
        }

        if shared {
            let shared = self
                .shared_descriptor(workspace, &project_text, &lane_tests)
                .await?;
            for lane in &mut workspace.lanes {
                lane.descriptor = shared.descriptor.clone();
                lane.solution = shared.solution.clone();
                lane.binary_dir = shared.out_dir.clone();
            }
            workspace.shared = Some(shared);
        }
        Ok(())
    }

    /// Per-lane descriptor (and solution) referencing the lane's files.
    async fn isolated_descriptor(
        &self,
        workspace: &mut Workspace,
        project_text: &str,
        index: usize,
        lane_source: &Path,
        lane_test: &Path,
    ) -> anyhow::Result<(PathBuf, Option<PathBuf>)> {
        let project_dir = parent_of(&self.project);
        let namespace = self.namespace.as_deref();

        let text = rewrite_reference(project_text, &project_dir, &self.test, lane_test, namespace)
            .with_context(|| {
                format!(
                    "{} does not reference {}",
                    self.project.display(),
                    self.test.display()
                )
            })?;
        // Sources pulled in by the test file are not listed in the descriptor.
        let text = rewrite_reference(&text, &project_dir, &self.source, lane_source, namespace)
            .unwrap_or(text);

        let lane_project = sibling(&self.project, &format!("_mutest_project_{}", index));
        self.write_created(workspace, &lane_project, &text).await?;

        let solution = match &self.solution {
            Some(solution) => {
                let lane_solution = sibling(solution, &format!("_mutest_sln_{}", index));
                self.write_solution(workspace, solution, &lane_solution, &lane_project)
                    .await?;
                Some(lane_solution)
            }
            None => None,
        };
        Ok((lane_project, solution))
    }

    /// One descriptor listing every lane's test copy in place of the original.
    async fn shared_descriptor(
        &self,
        workspace: &mut Workspace,
        project_text: &str,
        lane_tests: &[PathBuf],
    ) -> anyhow::Result<SharedBuild> {
        let project_dir = parent_of(&self.project);
        let text = duplicate_reference_lines(
            project_text,
            &project_dir,
            &self.test,
            lane_tests,
            self.namespace.as_deref(),
        )
        .with_context(|| {
            format!(
                "{} does not reference {}",
                self.project.display(),
                self.test.display()
            )
        })?;

        let descriptor = sibling(&self.project, "_mutest_project");
        self.write_created(workspace, &descriptor, &text).await?;

        let solution = match &self.solution {
            Some(solution) => {
                let shared_solution = sibling(solution, "_mutest_sln");
                self.write_solution(workspace, solution, &shared_solution, &descriptor)
                    .await?;
                Some(shared_solution)
            }
            None => None,
        };

        let out_dir = self.work_dir.join("mutest_out_dir");
        let int_dir = self.work_dir.join("mutest_int_dir");
        self.fresh_dir(workspace, &out_dir).await?;
        self.fresh_dir(workspace, &int_dir).await?;

        Ok(SharedBuild {
            descriptor,
            solution,
            out_dir,
            int_dir,
        })
    }

    async fn write_solution(
        &self,
        workspace: &mut Workspace,
        solution: &Path,
        target: &Path,
        project: &Path,
    ) -> anyhow::Result<()> {
        let text = tokio::fs::read_to_string(solution)
            .await
            .with_context(|| format!("Failed to read {}", solution.display()))?;
        let text = rewrite_reference(&text, &parent_of(solution), &self.project, project, None)
            .with_context(|| {
                format!(
                    "{} does not reference {}",
                    solution.display(),
                    self.project.display()
                )
            })?;
        self.write_created(workspace, target, &text).await
    }

    async fn lane_dirs(
        &self,
        workspace: &mut Workspace,
        index: usize,
    ) -> anyhow::Result<(PathBuf, PathBuf)> {
        let out_dir = self.work_dir.join(format!("mutest_out_dir_{}", index));
        let int_dir = self.work_dir.join(format!("mutest_int_dir_{}", index));
        self.fresh_dir(workspace, &out_dir).await?;
        self.fresh_dir(workspace, &int_dir).await?;
        Ok((out_dir, int_dir))
    }

    /// Create an empty directory, clearing what a previous run left there.
    async fn fresh_dir(&self, workspace: &mut Workspace, dir: &Path) -> anyhow::Result<()> {
        remove_lenient(dir).await;
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        workspace.created.push(dir.to_path_buf());
        Ok(())
    }

    async fn write_created(
        &self,
        workspace: &mut Workspace,
        path: &Path,
        content: &str,
    ) -> anyhow::Result<()> {
        write_with_retry(path, content).await?;
        workspace.created.push(path.to_path_buf());
        Ok(())
    }
}

/// `dir/stem<suffix>.ext` next to `path`.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}{}.{}", stem, suffix, ext.to_string_lossy()),
        None => format!("{}{}", stem, suffix),
    };
    path.with_file_name(name)
}

fn name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn parent_of(path: &Path) -> PathBuf {
    path.parent().map(Path::to_path_buf).unwrap_or_default()
}

/// The class identifier inside a test filter such as `Ns.CalcTest` or `CalcTest.*`.
fn class_identifier(filter: &str) -> Option<&str> {
    filter
        .split(['.', ':'])
        .filter(|s| !s.is_empty() && !s.contains('*'))
        .last()
}
