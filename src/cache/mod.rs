//! Result cache keyed by the content of a source/test pair.
//!
//! A hit lets a unit skip building and testing: cached classifications are
//! re-linked onto the current mutants. The cache is best effort; every
//! failure degrades to a miss or a dropped write.

mod http;
mod resilience;
mod sqlite;

pub use http::HttpCacheStore;
pub use resilience::{CircuitBreaker, Resilience, RetryPolicy};
pub use sqlite::SqliteCacheStore;

use crate::mutation::{MutantStatus, MutatorType, UnitDetail};
use crate::score::{MutationScore, Summary};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

/// Hex SHA-256 of `content`.
pub fn sha256_hex(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Cache key of a source/test pair: `H(H(source) + "-" + H(test))`.
pub fn cache_key(source: &str, test: &str) -> String {
    sha256_hex(&format!("{}-{}", sha256_hex(source), sha256_hex(test)))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationCounts {
    pub survived: usize,
    pub killed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageCounts {
    pub covered: usize,
    pub uncovered: usize,
}

/// A mutant as stored in a cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedMutant {
    pub id: usize,
    pub line: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<usize>,
    pub mutator: MutatorType,
    pub original: String,
    #[serde(default)]
    pub replacement: Option<String>,
    pub status: MutantStatus,
}

/// Stored analysis of one source/test pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub source: String,
    pub test: String,
    pub no_of_tests: usize,
    pub date_created: DateTime<Utc>,
    pub mutation: MutationCounts,
    pub coverage: CoverageCounts,
    #[serde(default)]
    pub mutator_wise: BTreeMap<MutatorType, MutationScore>,
    #[serde(default)]
    pub mutants: Vec<CachedMutant>,
}

impl CacheEntry {
    pub fn from_unit(key: &str, unit: &UnitDetail, no_of_tests: usize, summary: &Summary) -> Self {
        let mut mutants: Vec<CachedMutant> = unit
            .mutants()
            .map(|m| CachedMutant {
                id: m.id,
                line: m.location.line,
                end_line: m.location.end_line,
                mutator: m.mutator.clone(),
                original: m.original.clone(),
                replacement: m.replacement.clone(),
                status: m.status(),
            })
            .collect();
        mutants.sort_by_key(|m| m.id);

        let total = mutants.len();
        Self {
            key: key.to_string(),
            source: unit.source_file.display().to_string(),
            test: unit.test_file.display().to_string(),
            no_of_tests,
            date_created: Utc::now(),
            mutation: MutationCounts {
                survived: summary.unit.survived,
                killed: summary.unit.killed,
            },
            coverage: CoverageCounts {
                covered: total - summary.unit.uncovered,
                uncovered: summary.unit.uncovered,
            },
            mutator_wise: summary.mutators.clone(),
            mutants,
        }
    }

    /// Number of stored mutants with `status`.
    pub fn count(&self, status: MutantStatus) -> usize {
        self.mutants.iter().filter(|m| m.status == status).count()
    }
}

/// Copy cached classifications onto the unit's unclassified mutants.
///
/// Mutants are matched by `(line, mutator, original, replacement)`, then by
/// id. Each cached mutant is used once. Unmatched mutants stay `NotRun`.
/// Returns the number of mutants linked.
pub fn relink(unit: &mut UnitDetail, entry: &CacheEntry) -> usize {
    let mut used: HashSet<usize> = HashSet::new();
    let mut linked = 0;

    for mutant in unit.mutants_mut() {
        if mutant.status().is_terminal() {
            continue;
        }
        let available = |c: &&CachedMutant| !used.contains(&c.id) && c.status.is_terminal();
        let cached = entry
            .mutants
            .iter()
            .filter(available)
            .find(|c| {
                c.line == mutant.location.line
                    && c.mutator == mutant.mutator
                    && c.original == mutant.original
                    && c.replacement == mutant.replacement
            })
            .or_else(|| entry.mutants.iter().filter(available).find(|c| c.id == mutant.id));

        let Some(cached) = cached else {
            continue;
        };
        let id = cached.id;
        if mutant.set_status(cached.status).is_ok() {
            used.insert(id);
            linked += 1;
        }
    }

    tracing::debug!("Re-linked {} of {} cached mutant(s)", linked, entry.mutants.len());
    linked
}

/// Where cache entries live.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Look up an entry; any failure is a miss.
    async fn get(&self, hash: &str) -> Option<CacheEntry>;

    /// Store an entry; failures are logged and dropped.
    async fn put(&self, hash: &str, entry: &CacheEntry);
}
