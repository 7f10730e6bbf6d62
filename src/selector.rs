//! Shrinking the eligible mutant set before execution.
//!
//! Three mechanisms, applied in order:
//! 1. a per-line cap that keeps the highest-priority mutants of each line and
//!    drops the rest from the unit entirely
//! 2. explicit id/line exclusions and specific-line ranges (`Skipped`)
//! 3. regex exclude/include lists matched against the mutated fragment and the
//!    call enclosing it (`Skipped`)
//!
//! The cap ranks every mutant on a line whatever its status, so a unit loses
//! the same mutants on every run. The filters only touch `NotRun` mutants.
//! Running the selector again on its own output changes nothing.

use crate::config::FilterConfig;
use crate::error::EngineError;
use crate::mutation::{Mutant, MutantStatus, UnitDetail};
use regex::Regex;
use std::collections::{BTreeMap, HashSet};

/// Compiled selection settings.
#[derive(Debug, Clone, Default)]
pub struct SelectorOptions {
    /// Mutants kept per line; < 1 keeps all
    pub mutants_per_line: i32,
    pub excluded_ids: HashSet<usize>,
    pub excluded_lines: HashSet<usize>,
    /// Inclusive `(start, end)` ranges; empty means every line
    pub specific_lines: Vec<(usize, usize)>,
    pub include: Vec<Regex>,
    pub exclude: Vec<Regex>,
}

impl SelectorOptions {
    /// Build options from config, rejecting malformed patterns and ranges.
    pub fn from_config(filters: &FilterConfig, mutants_per_line: i32) -> Result<Self, EngineError> {
        Ok(Self {
            mutants_per_line,
            excluded_ids: filters.excluded_ids.iter().copied().collect(),
            excluded_lines: filters.excluded_lines.iter().copied().collect(),
            specific_lines: parse_line_ranges(filters.specific_lines.as_deref().unwrap_or(""))?,
            include: compile_patterns(filters.include.as_deref())?,
            exclude: compile_patterns(filters.exclude.as_deref())?,
        })
    }
}

/// What a selection pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    /// Ids still eligible for scheduling, in id order
    pub selected: Vec<usize>,
    /// Ids removed by the per-line cap
    pub dropped: Vec<usize>,
    /// Number of mutants newly marked `Skipped`
    pub skipped: usize,
}

/// Parse `"5:10, 20:20"` into inclusive ranges.
pub fn parse_line_ranges(text: &str) -> Result<Vec<(usize, usize)>, EngineError> {
    let mut ranges = Vec::new();
    for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (start, end) = part.split_once(':').unwrap_or((part, part));
        let parse = |s: &str| {
            s.trim().parse::<usize>().map_err(|_| {
                EngineError::input(format!(
                    "Invalid line range '{}', expected start:end such as 5:10",
                    part
                ))
            })
        };
        let (start, end) = (parse(start)?, parse(end)?);
        if start > end {
            return Err(EngineError::input(format!(
                "Invalid line range '{}', start is after end",
                part
            )));
        }
        ranges.push((start, end));
    }
    Ok(ranges)
}

fn compile_patterns(list: Option<&str>) -> Result<Vec<Regex>, EngineError> {
    list.unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            Regex::new(p).map_err(|e| EngineError::Input {
                message: format!("Invalid filter pattern '{}'", p),
                details: e.to_string(),
            })
        })
        .collect()
}

/// Apply all three mechanisms to the unit's pending mutants.
pub fn select(unit: &mut UnitDetail, source: &str, options: &SelectorOptions) -> Selection {
    let dropped = apply_line_cap(unit, options.mutants_per_line);
    let lines: Vec<&str> = source.lines().collect();
    let mut skipped = 0;

    for mutant in unit.mutants_mut() {
        if mutant.status() != MutantStatus::NotRun {
            continue;
        }
        let reason = exclusion_reason(mutant, options)
            .or_else(|| pattern_reason(&pattern_targets(mutant, &lines), options));
        if let Some(reason) = reason {
            tracing::debug!("Skipping mutant {} ({})", mutant.id, reason);
            if mutant.set_status(MutantStatus::Skipped).is_ok() {
                skipped += 1;
            }
        }
    }

    let selected = unit.pending().iter().map(|m| m.id).collect();
    Selection {
        selected,
        dropped,
        skipped,
    }
}

/// Keep at most `cap` mutants per start line, by mutator priority then id.
/// Returns the dropped ids.
pub fn apply_line_cap(unit: &mut UnitDetail, cap: i32) -> Vec<usize> {
    if cap < 1 {
        return Vec::new();
    }
    let cap = cap as usize;

    let mut by_line: BTreeMap<usize, Vec<(usize, usize)>> = BTreeMap::new();
    for mutant in unit.mutants() {
        by_line
            .entry(mutant.location.line)
            .or_default()
            .push((mutant.mutator.priority(), mutant.id));
    }

    let mut dropped: HashSet<usize> = HashSet::new();
    for candidates in by_line.values_mut() {
        candidates.sort();
        dropped.extend(candidates.iter().skip(cap).map(|(_, id)| *id));
    }

    for method in unit.methods.iter_mut() {
        method.mutants.retain(|m| !dropped.contains(&m.id));
    }

    let mut dropped: Vec<usize> = dropped.into_iter().collect();
    dropped.sort_unstable();
    dropped
}

fn exclusion_reason(mutant: &Mutant, options: &SelectorOptions) -> Option<&'static str> {
    if options.excluded_ids.contains(&mutant.id) {
        return Some("excluded id");
    }
    if options.excluded_lines.contains(&mutant.location.line) {
        return Some("excluded line");
    }
    if !options.specific_lines.is_empty()
        && !options
            .specific_lines
            .iter()
            .any(|(start, end)| mutant.location.line >= *start && mutant.location.line <= *end)
    {
        return Some("outside specific lines");
    }
    None
}

fn pattern_reason(targets: &[String], options: &SelectorOptions) -> Option<&'static str> {
    let matches = |re: &Regex| targets.iter().any(|t| re.is_match(t));
    if options.exclude.iter().any(matches) {
        return Some("matches exclude pattern");
    }
    if !options.include.is_empty() && !options.include.iter().any(matches) {
        return Some("does not match include pattern");
    }
    None
}

/// Texts a pattern is matched against: the mutated fragment, then the
/// invocation or object creation around it.
fn pattern_targets(mutant: &Mutant, lines: &[&str]) -> Vec<String> {
    let mut targets = vec![mutant.original.clone()];
    if let Some(call) = enclosing_call(&mutant_text(mutant, lines), &mutant.original) {
        targets.push(call);
    }
    targets
}

/// The mutated lines, or the fragment alone when the location is out of range.
fn mutant_text(mutant: &Mutant, lines: &[&str]) -> String {
    let start = mutant.location.line;
    let end = mutant.location.last_line().min(lines.len());
    if start == 0 || start > end {
        return mutant.original.clone();
    }
    lines[start - 1..end].join("\n")
}

const NOT_CALLS: &[&str] = &["if", "while", "for", "switch", "return", "catch", "sizeof"];

/// Innermost `name(...)` or `new Name(...)` in `text` that contains `fragment`.
fn enclosing_call(text: &str, fragment: &str) -> Option<String> {
    if fragment.is_empty() {
        return None;
    }
    let bytes = text.as_bytes();
    let mut open = text.find(fragment)?;
    let mut depth = 0usize;
    while open > 0 {
        open -= 1;
        match bytes[open] {
            b')' => depth += 1,
            b'(' if depth > 0 => depth -= 1,
            b'(' => {
                if let Some(start) = callee_start(&text[..open]) {
                    let end = closing_paren(bytes, open).map_or(text.len(), |i| i + 1);
                    return Some(text[start..end].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Start of the callee name that ends `prefix`, widened over a leading `new`.
fn callee_start(prefix: &str) -> Option<usize> {
    let trimmed = prefix.trim_end();
    let is_name = |c: char| c.is_alphanumeric() || matches!(c, '_' | ':' | '.');
    let start = trimmed
        .char_indices()
        .rev()
        .take_while(|(_, c)| is_name(*c))
        .last()
        .map(|(i, _)| i)?;
    let name = &trimmed[start..];
    if NOT_CALLS.contains(&name) || name.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    let before = trimmed[..start].trim_end();
    match before.strip_suffix("new") {
        Some(rest) if !rest.ends_with(is_name) => Some(rest.len()),
        _ => Some(start),
    }
}

fn closing_paren(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, b) in bytes.iter().enumerate().skip(open) {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}
