//! Mutation data model.
//!
//! This module provides:
//! - Mutants and their write-once status
//! - Mutator category tags used for prioritisation and reporting
//! - Method and unit groupings as handed over by the mutant generator

pub mod apply;
pub mod events;
pub mod manifest;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Classification of a mutant within one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutantStatus {
    /// Not classified yet (also what an early stop leaves behind)
    #[default]
    NotRun,
    /// No test reaches the mutated line
    NotCovered,
    /// Excluded by a filter
    Skipped,
    /// All tests passed against the mutant
    Survived,
    /// A test failed against the mutant
    Killed,
    /// The test run hit its wall-clock limit
    Timeout,
    /// The mutant did not compile
    BuildError,
}

impl MutantStatus {
    /// True once a status has been assigned in this run.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::NotRun)
    }
}

impl std::fmt::Display for MutantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRun => write!(f, "not_run"),
            Self::NotCovered => write!(f, "not_covered"),
            Self::Skipped => write!(f, "skipped"),
            Self::Survived => write!(f, "survived"),
            Self::Killed => write!(f, "killed"),
            Self::Timeout => write!(f, "timeout"),
            Self::BuildError => write!(f, "build_error"),
        }
    }
}

/// Rejected status transition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatusError {
    #[error("mutant {id} is already {current}, cannot become {requested}")]
    AlreadyClassified {
        id: usize,
        current: MutantStatus,
        requested: MutantStatus,
    },
    #[error("mutant {id} cannot be reset to not_run")]
    Reset { id: usize },
}

/// Category of the rule that produced a mutant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MutatorType {
    Arithmetic,
    Relational,
    Boolean,
    Logical,
    Assignment,
    Unary,
    Checked,
    Linq,
    Negate,
    String,
    MethodCall,
    Bitwise,
    Block,
    /// A tag this build does not know about
    Other(String),
}

impl MutatorType {
    /// Human-readable description used in summaries.
    pub fn description(&self) -> &str {
        match self {
            Self::Arithmetic => "Arithmetic operators",
            Self::Relational => "Relational operators",
            Self::Boolean => "Boolean literals",
            Self::Logical => "Logical operators",
            Self::Assignment => "Assignment statements",
            Self::Unary => "Unary operators",
            Self::Checked => "Checked statements",
            Self::Linq => "Linq methods",
            Self::Negate => "Negate literals",
            Self::String => "String literals",
            Self::MethodCall => "Method calls",
            Self::Bitwise => "Bitwise operators",
            Self::Block => "Block statement",
            Self::Other(name) => name,
        }
    }

    /// Rank for the per-line cap, lower runs first.
    pub fn priority(&self) -> usize {
        match self {
            Self::Relational => 0,
            Self::Logical => 1,
            Self::Block => 2,
            Self::Arithmetic => 3,
            Self::Unary => 4,
            _ => 5,
        }
    }

    fn as_tag(&self) -> &str {
        match self {
            Self::Arithmetic => "arithmetic",
            Self::Relational => "relational",
            Self::Boolean => "boolean",
            Self::Logical => "logical",
            Self::Assignment => "assignment",
            Self::Unary => "unary",
            Self::Checked => "checked",
            Self::Linq => "linq",
            Self::Negate => "negate",
            Self::String => "string",
            Self::MethodCall => "method_call",
            Self::Bitwise => "bitwise",
            Self::Block => "block",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for MutatorType {
    fn from(value: String) -> Self {
        let normalized: String = value
            .chars()
            .filter(|c| *c != '_' && *c != '-' && !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "arithmetic" => Self::Arithmetic,
            "relational" => Self::Relational,
            "boolean" => Self::Boolean,
            "logical" => Self::Logical,
            "assignment" => Self::Assignment,
            "unary" => Self::Unary,
            "checked" => Self::Checked,
            "linq" => Self::Linq,
            "negate" => Self::Negate,
            "string" => Self::String,
            "methodcall" => Self::MethodCall,
            "bitwise" => Self::Bitwise,
            "block" => Self::Block,
            _ => Self::Other(value),
        }
    }
}

impl From<MutatorType> for String {
    fn from(value: MutatorType) -> Self {
        value.as_tag().to_string()
    }
}

impl std::fmt::Display for MutatorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_tag())
    }
}

/// Source span of a mutant, 1-indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub line: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<usize>,
}

impl Location {
    pub fn single(line: usize) -> Self {
        Self {
            line,
            end_line: None,
        }
    }

    pub fn last_line(&self) -> usize {
        self.end_line.unwrap_or(self.line).max(self.line)
    }

    pub fn is_multi_line(&self) -> bool {
        self.last_line() > self.line
    }

    pub fn contains(&self, line: usize) -> bool {
        line >= self.line && line <= self.last_line()
    }
}

/// One candidate source transformation and its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mutant {
    /// Sequential within the unit
    pub id: usize,
    #[serde(flatten)]
    pub location: Location,
    pub mutator: MutatorType,
    /// Text to find on the mutated line(s)
    pub original: String,
    /// Replacement text; `None` deletes the original fragment
    #[serde(default)]
    pub replacement: Option<String>,
    #[serde(default)]
    status: MutantStatus,
    /// Build/test log, kept only when diagnostics are enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

impl Mutant {
    pub fn new(
        id: usize,
        location: Location,
        mutator: MutatorType,
        original: impl Into<String>,
        replacement: Option<String>,
    ) -> Self {
        Self {
            id,
            location,
            mutator,
            original: original.into(),
            replacement,
            status: MutantStatus::NotRun,
            diagnostics: None,
        }
    }

    pub fn status(&self) -> MutantStatus {
        self.status
    }

    /// Assign a terminal status. Fails if one was already assigned.
    pub fn set_status(&mut self, status: MutantStatus) -> Result<(), StatusError> {
        if status == MutantStatus::NotRun {
            return Err(StatusError::Reset { id: self.id });
        }
        if self.status.is_terminal() {
            if self.status == status {
                return Ok(());
            }
            return Err(StatusError::AlreadyClassified {
                id: self.id,
                current: self.status,
                requested: status,
            });
        }
        self.status = status;
        Ok(())
    }

    /// Clear the status at the start of a new run.
    pub fn reset(&mut self) {
        self.status = MutantStatus::NotRun;
        self.diagnostics = None;
    }

    /// Short human-readable description, e.g. `line 12: a > b -> a >= b`.
    pub fn describe(&self) -> String {
        format!(
            "line {}: {} -> {}",
            self.location.line,
            self.original.trim(),
            self.replacement.as_deref().map(str::trim).unwrap_or("<removed>")
        )
    }
}

/// Mutants grouped by the method they fall in, with the tests reaching it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodDetail {
    pub name: String,
    #[serde(default)]
    pub signature: Option<String>,
    pub start_line: usize,
    pub end_line: usize,
    /// Test cases whose coverage reaches this method
    #[serde(default)]
    pub tests: Vec<String>,
    #[serde(default)]
    pub mutants: Vec<Mutant>,
}

/// One source file under test, paired with its test file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitDetail {
    /// Root of the project; relative paths below resolve against it
    pub project_root: PathBuf,
    pub source_file: PathBuf,
    #[serde(default)]
    pub source_header: Option<PathBuf>,
    pub test_file: PathBuf,
    /// Fully qualified test class or test-case filter
    #[serde(default)]
    pub test_class: Option<String>,
    /// Build descriptor of the test project
    pub test_project: PathBuf,
    /// Workspace/solution file that references `test_project`
    #[serde(default)]
    pub test_solution: Option<PathBuf>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub methods: Vec<MethodDetail>,
}

impl UnitDetail {
    /// Resolve a unit path against the project root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }

    pub fn source_path(&self) -> PathBuf {
        self.resolve(&self.source_file)
    }

    pub fn test_path(&self) -> PathBuf {
        self.resolve(&self.test_file)
    }

    pub fn project_path(&self) -> PathBuf {
        self.resolve(&self.test_project)
    }

    pub fn solution_path(&self) -> Option<PathBuf> {
        self.test_solution.as_deref().map(|p| self.resolve(p))
    }

    pub fn header_path(&self) -> Option<PathBuf> {
        self.source_header.as_deref().map(|p| self.resolve(p))
    }

    /// Iterate over every mutant in the unit.
    pub fn mutants(&self) -> impl Iterator<Item = &Mutant> {
        self.methods.iter().flat_map(|m| m.mutants.iter())
    }

    pub fn mutants_mut(&mut self) -> impl Iterator<Item = &mut Mutant> {
        self.methods.iter_mut().flat_map(|m| m.mutants.iter_mut())
    }

    pub fn mutant(&self, id: usize) -> Option<&Mutant> {
        self.mutants().find(|m| m.id == id)
    }

    pub fn mutant_mut(&mut self, id: usize) -> Option<&mut Mutant> {
        self.mutants_mut().find(|m| m.id == id)
    }

    /// Mutants still waiting for a classification, in id order.
    pub fn pending(&self) -> Vec<&Mutant> {
        let mut pending: Vec<&Mutant> = self
            .mutants()
            .filter(|m| m.status() == MutantStatus::NotRun)
            .collect();
        pending.sort_by_key(|m| m.id);
        pending
    }

    pub fn count(&self, status: MutantStatus) -> usize {
        self.mutants().filter(|m| m.status() == status).count()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn mutant(id: usize, line: usize, mutator: MutatorType) -> Mutant {
        Mutant::new(
            id,
            Location::single(line),
            mutator,
            ">",
            Some(">=".to_string()),
        )
    }

    pub(crate) fn method(name: &str, start: usize, end: usize, mutants: Vec<Mutant>) -> MethodDetail {
        MethodDetail {
            name: name.to_string(),
            signature: None,
            start_line: start,
            end_line: end,
            tests: vec!["CalcTest.Compare".to_string()],
            mutants,
        }
    }

    pub(crate) fn unit(methods: Vec<MethodDetail>) -> UnitDetail {
        UnitDetail {
            project_root: PathBuf::from("/project"),
            source_file: PathBuf::from("src/calc.cpp"),
            source_header: None,
            test_file: PathBuf::from("tests/calc_test.cpp"),
            test_class: Some("CalcTest".to_string()),
            test_project: PathBuf::from("tests/calc_test.vcxproj"),
            test_solution: None,
            namespace: None,
            methods,
        }
    }

    // =========================================================================
    // Status tests
    // =========================================================================

    #[test]
    fn test_status_is_write_once() {
        let mut m = mutant(1, 10, MutatorType::Relational);
        assert_eq!(m.status(), MutantStatus::NotRun);

        m.set_status(MutantStatus::Killed).unwrap();
        assert_eq!(m.status(), MutantStatus::Killed);

        let err = m.set_status(MutantStatus::Survived).unwrap_err();
        assert_eq!(
            err,
            StatusError::AlreadyClassified {
                id: 1,
                current: MutantStatus::Killed,
                requested: MutantStatus::Survived,
            }
        );
        assert_eq!(m.status(), MutantStatus::Killed);
    }

    #[test]
    fn test_status_same_value_is_idempotent() {
        let mut m = mutant(1, 10, MutatorType::Relational);
        m.set_status(MutantStatus::Skipped).unwrap();
        assert!(m.set_status(MutantStatus::Skipped).is_ok());
    }

    #[test]
    fn test_status_cannot_reset_to_not_run() {
        let mut m = mutant(3, 10, MutatorType::Relational);
        assert_eq!(
            m.set_status(MutantStatus::NotRun),
            Err(StatusError::Reset { id: 3 })
        );
    }

    #[test]
    fn test_status_display() {
        assert_eq!(MutantStatus::NotRun.to_string(), "not_run");
        assert_eq!(MutantStatus::BuildError.to_string(), "build_error");
        assert_eq!(MutantStatus::NotCovered.to_string(), "not_covered");
    }

    // =========================================================================
    // MutatorType tests
    // =========================================================================

    #[test]
    fn test_mutator_parse_variants() {
        assert_eq!(
            MutatorType::from("Relational".to_string()),
            MutatorType::Relational
        );
        assert_eq!(
            MutatorType::from("method_call".to_string()),
            MutatorType::MethodCall
        );
        assert_eq!(
            MutatorType::from("MethodCall".to_string()),
            MutatorType::MethodCall
        );
        assert_eq!(
            MutatorType::from("pointer".to_string()),
            MutatorType::Other("pointer".to_string())
        );
    }

    #[test]
    fn test_mutator_priority_order() {
        let mut all = vec![
            MutatorType::String,
            MutatorType::Unary,
            MutatorType::Arithmetic,
            MutatorType::Block,
            MutatorType::Logical,
            MutatorType::Relational,
        ];
        all.sort_by_key(|m| m.priority());
        assert_eq!(
            all,
            vec![
                MutatorType::Relational,
                MutatorType::Logical,
                MutatorType::Block,
                MutatorType::Arithmetic,
                MutatorType::Unary,
                MutatorType::String,
            ]
        );
    }

    #[test]
    fn test_mutant_serde_shape() {
        let json = r#"{"id":4,"line":12,"mutator":"relational","original":">","replacement":">="}"#;
        let m: Mutant = serde_json::from_str(json).unwrap();
        assert_eq!(m.id, 4);
        assert_eq!(m.location, Location::single(12));
        assert_eq!(m.mutator, MutatorType::Relational);
        assert_eq!(m.status(), MutantStatus::NotRun);

        let back = serde_json::to_value(&m).unwrap();
        assert_eq!(back["mutator"], "relational");
        assert_eq!(back["status"], "not_run");
        assert!(back.get("end_line").is_none());
    }

    // =========================================================================
    // Location / unit tests
    // =========================================================================

    #[test]
    fn test_location_multi_line() {
        let loc = Location {
            line: 5,
            end_line: Some(8),
        };
        assert!(loc.is_multi_line());
        assert!(loc.contains(7));
        assert!(!loc.contains(9));
        assert_eq!(loc.last_line(), 8);
        assert!(!Location::single(5).is_multi_line());
    }

    #[test]
    fn test_unit_pending_sorted_by_id() {
        let mut u = unit(vec![
            method("b", 20, 30, vec![mutant(3, 21, MutatorType::Unary)]),
            method(
                "a",
                1,
                10,
                vec![
                    mutant(1, 2, MutatorType::Relational),
                    mutant(2, 3, MutatorType::Logical),
                ],
            ),
        ]);
        u.mutant_mut(2)
            .unwrap()
            .set_status(MutantStatus::Skipped)
            .unwrap();

        let ids: Vec<usize> = u.pending().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(u.count(MutantStatus::Skipped), 1);
    }

    #[test]
    fn test_unit_resolves_relative_paths() {
        let u = unit(vec![]);
        assert_eq!(u.source_path(), PathBuf::from("/project/src/calc.cpp"));
        assert_eq!(
            u.project_path(),
            PathBuf::from("/project/tests/calc_test.vcxproj")
        );
        assert!(u.solution_path().is_none());
    }
}
