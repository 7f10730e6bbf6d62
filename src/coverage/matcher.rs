//! Matching coverage method records to the unit's methods.
//!
//! Coverage tools name methods differently from the generator (mangled
//! signatures, generic arity suffixes, overloads). Matching runs an ordered
//! list of strategies; the first one that returns a match wins.

use crate::coverage::MethodCoverage;
use crate::mutation::MethodDetail;

/// One way of pairing a unit method with a coverage record.
pub trait MethodMatcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Index into `candidates` of the record for `method`, if this strategy finds one.
    fn find(
        &self,
        method: &MethodDetail,
        siblings: &[MethodDetail],
        candidates: &[MethodCoverage],
    ) -> Option<usize>;
}

/// The default strategy order.
pub fn default_matchers() -> Vec<Box<dyn MethodMatcher>> {
    vec![
        Box::new(ExactSignature),
        Box::new(OverloadOrder),
        Box::new(GenericName),
    ]
}

/// Signatures equal after whitespace normalisation.
pub struct ExactSignature;

impl MethodMatcher for ExactSignature {
    fn name(&self) -> &'static str {
        "exact-signature"
    }

    fn find(
        &self,
        method: &MethodDetail,
        _siblings: &[MethodDetail],
        candidates: &[MethodCoverage],
    ) -> Option<usize> {
        let wanted = normalize_signature(method.signature.as_deref()?);
        candidates.iter().position(|c| {
            c.signature
                .as_deref()
                .map(|s| normalize_signature(s) == wanted)
                .unwrap_or(false)
        })
    }
}

/// Same short name, paired by declaration order when the overload counts agree.
pub struct OverloadOrder;

impl MethodMatcher for OverloadOrder {
    fn name(&self) -> &'static str {
        "overload-order"
    }

    fn find(
        &self,
        method: &MethodDetail,
        siblings: &[MethodDetail],
        candidates: &[MethodCoverage],
    ) -> Option<usize> {
        let name = short_name(&method.name);
        let same_name: Vec<&MethodDetail> = siblings
            .iter()
            .filter(|m| short_name(&m.name) == name)
            .collect();
        let mut matching: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| short_name(&c.name) == name)
            .map(|(i, _)| i)
            .collect();

        if matching.is_empty() || matching.len() != same_name.len() {
            return None;
        }

        // Order coverage records by first instrumented line when known.
        matching.sort_by_key(|i| candidates[*i].first_line().unwrap_or(usize::MAX));
        let mut ordered_siblings = same_name;
        ordered_siblings.sort_by_key(|m| m.start_line);

        let position = ordered_siblings
            .iter()
            .position(|m| m.start_line == method.start_line && m.name == method.name)?;
        matching.get(position).copied()
    }
}

/// Names equal once generic arguments and arity suffixes are stripped.
pub struct GenericName;

impl MethodMatcher for GenericName {
    fn name(&self) -> &'static str {
        "generic-name"
    }

    fn find(
        &self,
        method: &MethodDetail,
        _siblings: &[MethodDetail],
        candidates: &[MethodCoverage],
    ) -> Option<usize> {
        let wanted = strip_generics(short_name(&method.name));
        let mut matches = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| strip_generics(short_name(&c.name)) == wanted);
        let (first, _) = matches.next()?;
        // Ambiguous without more information.
        if matches.next().is_some() {
            return None;
        }
        Some(first)
    }
}

fn normalize_signature(signature: &str) -> String {
    signature.split_whitespace().collect::<Vec<_>>().join("")
}

/// Last path segment of a qualified name, without a parameter list.
fn short_name(name: &str) -> &str {
    let without_params = name.split('(').next().unwrap_or(name);
    without_params
        .rsplit(|c| c == ':' || c == '.')
        .next()
        .unwrap_or(without_params)
}

fn strip_generics(name: &str) -> String {
    let base = name.split('<').next().unwrap_or(name);
    base.split('`').next().unwrap_or(base).to_string()
}
