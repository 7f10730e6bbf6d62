//! Coverage-guided pruning.
//!
//! A baseline test run produces a coverage snapshot (line hit counts per file
//! and per method). The mapper pairs snapshot methods with the unit's methods,
//! then marks every mutant no test can reach as `NotCovered` before any
//! mutant is scheduled.

pub mod cobertura;
pub mod matcher;

use crate::mutation::{Location, MethodDetail, MutantStatus, UnitDetail};
use anyhow::{Context, Result};
use matcher::{default_matchers, MethodMatcher};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Hit counts for one source file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileCoverage {
    pub path: String,
    /// line number -> hits
    #[serde(default)]
    pub lines: BTreeMap<usize, u64>,
}

/// Hit counts and test attribution for one method.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MethodCoverage {
    pub name: String,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub lines: BTreeMap<usize, u64>,
    /// Test cases that executed this method, when the tool reports them
    #[serde(default)]
    pub tests: Vec<String>,
}

impl MethodCoverage {
    pub fn first_line(&self) -> Option<usize> {
        self.lines.keys().next().copied()
    }
}

/// Read-only line coverage from one baseline execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoverageSnapshot {
    #[serde(default)]
    pub files: Vec<FileCoverage>,
    #[serde(default)]
    pub methods: Vec<MethodCoverage>,
}

impl CoverageSnapshot {
    /// Load a report: Cobertura XML for `.xml` files, the JSON snapshot format otherwise.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read coverage report {:?}", path))?;
        let is_xml = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("xml"))
            .unwrap_or(false);
        if is_xml {
            Ok(cobertura::parse_cobertura(&contents))
        } else {
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse coverage report {:?}", path))
        }
    }

    /// Line hits recorded for `source`, matched by trailing path components.
    pub fn lines_for(&self, source: &Path) -> Option<&BTreeMap<usize, u64>> {
        let wanted = normalize_path(&source.to_string_lossy());
        self.files
            .iter()
            .filter(|f| {
                let path = normalize_path(&f.path);
                wanted.ends_with(&path) || path.ends_with(&wanted)
            })
            .max_by_key(|f| f.path.len())
            .map(|f| &f.lines)
    }
}

fn normalize_path(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches("./").to_lowercase()
}

/// Counts produced by one mapping pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoverageOutcome {
    pub eligible: usize,
    pub not_covered: usize,
    pub skipped: usize,
}

/// Marks unreachable mutants before scheduling.
pub struct CoverageMapper {
    matchers: Vec<Box<dyn MethodMatcher>>,
}

impl Default for CoverageMapper {
    fn default() -> Self {
        Self {
            matchers: default_matchers(),
        }
    }
}

impl CoverageMapper {
    /// Classify the unit's pending mutants against `snapshot`.
    ///
    /// Order of checks per mutant:
    /// 1. the owning method has no tests: `NotCovered`, whatever the hit data says
    /// 2. the start line was never hit: `NotCovered`
    /// 3. a multi-line mutant with no hit after its start line: `Skipped`
    ///
    /// Without a snapshot only the first rule applies, and only when the unit
    /// carries test attribution at all.
    pub fn map(&self, unit: &mut UnitDetail, snapshot: Option<&CoverageSnapshot>) -> CoverageOutcome {
        let source = unit.source_path();
        let mut method_lines: Vec<BTreeMap<usize, u64>> = vec![BTreeMap::new(); unit.methods.len()];

        if let Some(snapshot) = snapshot {
            let siblings = unit.methods.clone();
            for (index, method) in unit.methods.iter_mut().enumerate() {
                let Some(found) = self.match_method(method, &siblings, &snapshot.methods) else {
                    tracing::debug!("No coverage record for method {}", method.name);
                    continue;
                };
                let record = &snapshot.methods[found];
                for test in &record.tests {
                    if !method.tests.contains(test) {
                        method.tests.push(test.clone());
                    }
                }
                method_lines[index] = record.lines.clone();
            }
        }

        let has_attribution = snapshot.is_some() || unit.methods.iter().any(|m| !m.tests.is_empty());
        let file_lines = snapshot.and_then(|s| s.lines_for(&source)).cloned();

        let mut outcome = CoverageOutcome::default();
        for (index, method) in unit.methods.iter_mut().enumerate() {
            let mut lines = file_lines.clone().unwrap_or_default();
            for (line, hits) in &method_lines[index] {
                let entry = lines.entry(*line).or_insert(0);
                *entry = (*entry).max(*hits);
            }
            let no_tests = has_attribution && method.tests.is_empty();

            for mutant in method.mutants.iter_mut() {
                if mutant.status() != MutantStatus::NotRun {
                    continue;
                }
                let verdict = if no_tests {
                    Some(MutantStatus::NotCovered)
                } else if snapshot.is_some() {
                    classify_lines(&mutant.location, &lines)
                } else {
                    None
                };

                match verdict {
                    Some(status) => {
                        if let Err(e) = mutant.set_status(status) {
                            tracing::warn!("{}", e);
                            continue;
                        }
                        if status == MutantStatus::NotCovered {
                            outcome.not_covered += 1;
                        } else {
                            outcome.skipped += 1;
                        }
                    }
                    None => outcome.eligible += 1,
                }
            }
        }

        tracing::info!(
            "Coverage mapping: {} eligible, {} not covered, {} skipped",
            outcome.eligible,
            outcome.not_covered,
            outcome.skipped
        );
        outcome
    }

    fn match_method(
        &self,
        method: &MethodDetail,
        siblings: &[MethodDetail],
        candidates: &[MethodCoverage],
    ) -> Option<usize> {
        self.matchers.iter().find_map(|matcher| {
            let found = matcher.find(method, siblings, candidates);
            if found.is_some() {
                tracing::debug!("Matched method {} by {}", method.name, matcher.name());
            }
            found
        })
    }
}

/// Line-level verdict for a mutant whose method has tests.
fn classify_lines(location: &Location, lines: &BTreeMap<usize, u64>) -> Option<MutantStatus> {
    // A start line without instrumentation (brace, `else`) borrows the first
    // instrumented line inside the span.
    let start_hits = lines.get(&location.line).copied().or_else(|| {
        lines
            .range(location.line..=location.last_line())
            .next()
            .map(|(_, hits)| *hits)
    });

    match start_hits {
        None | Some(0) => Some(MutantStatus::NotCovered),
        Some(_) if location.is_multi_line() => {
            let rest_hit = lines
                .range(location.line + 1..=location.last_line())
                .any(|(_, hits)| *hits > 0);
            if rest_hit {
                None
            } else {
                Some(MutantStatus::Skipped)
            }
        }
        Some(_) => None,
    }
}
