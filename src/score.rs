//! Mutation scores and the printed summary.

use crate::mutation::{MutantStatus, MutatorType, UnitDetail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Status counts for a group of mutants and the coverage derived from them.
///
/// `covered` is the countable denominator: mutants that were reached by a
/// test, minus timeouts, build errors and skipped ones. Mutants left
/// `not_run` by an early stop stay in it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MutationScore {
    pub survived: usize,
    pub killed: usize,
    pub uncovered: usize,
    pub timeout: usize,
    #[serde(rename = "build-errors")]
    pub build_errors: usize,
    pub skipped: usize,
    #[serde(default, rename = "not-run")]
    pub not_run: usize,
    pub covered: usize,
    /// killed / covered, with a denominator of 1 when nothing is countable
    pub coverage: f64,
}

impl MutationScore {
    pub fn from_statuses(statuses: impl IntoIterator<Item = MutantStatus>) -> Self {
        let mut score = Self::default();
        let mut total = 0;
        for status in statuses {
            total += 1;
            match status {
                MutantStatus::Survived => score.survived += 1,
                MutantStatus::Killed => score.killed += 1,
                MutantStatus::NotCovered => score.uncovered += 1,
                MutantStatus::Timeout => score.timeout += 1,
                MutantStatus::BuildError => score.build_errors += 1,
                MutantStatus::Skipped => score.skipped += 1,
                MutantStatus::NotRun => score.not_run += 1,
            }
        }
        score.covered = (total - score.uncovered)
            .saturating_sub(score.timeout + score.build_errors + score.skipped);
        score.coverage = score.killed as f64 / score.covered.max(1) as f64;
        score
    }

    /// `killed/covered[pct]`, or `N/A` when nothing is countable.
    pub fn mutation(&self) -> String {
        if self.covered == 0 {
            return "N/A".to_string();
        }
        format!(
            "{}/{}[{}]",
            self.killed,
            self.covered,
            percent(self.coverage)
        )
    }

    /// Mutants whose outcome was decided by the tests.
    pub fn decided(&self) -> usize {
        self.killed + self.survived
    }

    /// killed / (killed + survived), 0 when nothing was decided.
    pub fn mutation_score(&self) -> f64 {
        if self.decided() == 0 {
            0.0
        } else {
            self.killed as f64 / self.decided() as f64
        }
    }

    pub fn status_line(&self) -> String {
        format!(
            "Mutation Status: Survived({}) Killed({}) Not Covered({}) Timeout({}) Build Errors({}) Skipped({})",
            self.survived, self.killed, self.uncovered, self.timeout, self.build_errors, self.skipped
        )
    }
}

fn percent(ratio: f64) -> String {
    format!("{:.2}%", ratio * 100.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodScore {
    pub name: String,
    pub score: MutationScore,
}

/// Scores for a finished unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub unit: MutationScore,
    pub methods: Vec<MethodScore>,
    /// Keyed by mutator tag
    pub mutators: BTreeMap<MutatorType, MutationScore>,
}

impl Summary {
    pub fn of(unit: &UnitDetail) -> Self {
        let methods = unit
            .methods
            .iter()
            .map(|method| MethodScore {
                name: method.name.clone(),
                score: MutationScore::from_statuses(method.mutants.iter().map(|m| m.status())),
            })
            .collect();

        let mut grouped: BTreeMap<MutatorType, Vec<MutantStatus>> = BTreeMap::new();
        for mutant in unit.mutants() {
            grouped
                .entry(mutant.mutator.clone())
                .or_default()
                .push(mutant.status());
        }
        let mutators = grouped
            .into_iter()
            .map(|(mutator, statuses)| (mutator, MutationScore::from_statuses(statuses)))
            .collect();

        Self {
            unit: MutationScore::from_statuses(unit.mutants().map(|m| m.status())),
            methods,
            mutators,
        }
    }

    /// Human-readable summary: one line per mutator, then the unit totals.
    pub fn lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .mutators
            .iter()
            .map(|(mutator, score)| {
                format!("Coverage: {} {}", score.mutation(), mutator.description())
            })
            .collect();
        lines.push(self.unit.status_line());
        lines.push(format!(
            "Mutation Score: {}/{}[{}]",
            self.unit.killed,
            self.unit.decided(),
            percent(self.unit.mutation_score())
        ));
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::tests::{mutant, unit};
    use crate::mutation::MethodDetail;

    fn method(name: &str, statuses: &[(MutatorType, MutantStatus)]) -> MethodDetail {
        let mutants = statuses
            .iter()
            .enumerate()
            .map(|(i, (mutator, status))| {
                let mut m = mutant(i + 1, 10 + i, mutator.clone());
                if *status != MutantStatus::NotRun {
                    m.set_status(*status).unwrap();
                }
                m
            })
            .collect();
        MethodDetail {
            name: name.to_string(),
            signature: None,
            start_line: 1,
            end_line: 100,
            tests: vec!["CalcTest.Compare".to_string()],
            mutants,
        }
    }

    #[test]
    fn test_coverage_excludes_uncountable_mutants() {
        let score = MutationScore::from_statuses([
            MutantStatus::Killed,
            MutantStatus::Killed,
            MutantStatus::Survived,
            MutantStatus::NotCovered,
            MutantStatus::Timeout,
            MutantStatus::BuildError,
            MutantStatus::Skipped,
        ]);
        assert_eq!(score.covered, 3);
        assert_eq!(score.mutation(), "2/3[66.67%]");
        assert!((score.mutation_score() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_not_run_stays_in_denominator() {
        let score = MutationScore::from_statuses([
            MutantStatus::Killed,
            MutantStatus::NotRun,
            MutantStatus::NotRun,
            MutantStatus::NotRun,
        ]);
        assert_eq!(score.covered, 4);
        assert_eq!(score.not_run, 3);
        assert_eq!(score.mutation(), "1/4[25.00%]");
        assert_eq!(score.mutation_score(), 1.0);
    }

    #[test]
    fn test_nothing_countable_is_not_applicable() {
        let score = MutationScore::from_statuses([MutantStatus::NotCovered, MutantStatus::BuildError]);
        assert_eq!(score.covered, 0);
        assert_eq!(score.coverage, 0.0);
        assert_eq!(score.mutation(), "N/A");
        assert_eq!(score.mutation_score(), 0.0);
    }

    #[test]
    fn test_summary_lines() {
        let mut unit = unit(vec![method(
            "Calc::max",
            &[
                (MutatorType::Relational, MutantStatus::Killed),
                (MutatorType::Relational, MutantStatus::Survived),
                (MutatorType::Arithmetic, MutantStatus::NotCovered),
            ],
        )]);
        unit.methods.push(method("Calc::min", &[(MutatorType::Relational, MutantStatus::Killed)]));

        let summary = Summary::of(&unit);
        assert_eq!(summary.methods.len(), 2);
        assert_eq!(summary.methods[1].score.mutation(), "1/1[100.00%]");
        assert_eq!(summary.mutators[&MutatorType::Relational].killed, 2);

        let lines = summary.lines();
        assert_eq!(
            lines,
            vec![
                "Coverage: N/A Arithmetic operators".to_string(),
                "Coverage: 2/3[66.67%] Relational operators".to_string(),
                "Mutation Status: Survived(1) Killed(2) Not Covered(1) Timeout(0) Build Errors(0) Skipped(0)".to_string(),
                "Mutation Score: 2/3[66.67%]".to_string(),
            ]
        );
    }

    #[test]
    fn test_score_serializes_with_dashed_names() {
        let score = MutationScore::from_statuses([MutantStatus::BuildError]);
        let json = serde_json::to_value(score).unwrap();
        assert_eq!(json["build-errors"], 1);
        assert_eq!(json["covered"], 0);
    }
}
