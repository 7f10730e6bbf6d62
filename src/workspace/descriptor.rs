//! Text rewrites of build descriptors, solution files and test code.
//!
//! Descriptors reference files in many spellings (relative paths with either
//! separator, a folder named after the namespace, a bare file name). A
//! reference is located by trying an ordered list of match strategies; the
//! first strategy that matches anywhere decides what gets replaced.

use regex::{Regex, RegexBuilder};
use std::path::{Component, Path, PathBuf};

/// Start of a name: the start of a line or any character that cannot be part
/// of a longer file name.
const NAME_START: &str = r"(?:^|[^\w.-])";

/// How a file reference is spelled inside a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceStrategy {
    /// The path relative to the descriptor's directory
    ExactRelative,
    /// `<last namespace segment>\<file name>`
    NamespaceQualified,
    /// Any directory followed by `\<file name>`
    AnyDirectory,
    /// The file name right after a quote
    QuotedFileName,
    /// The file name as a whole token
    BareFileName,
}

impl ReferenceStrategy {
    pub const ORDER: [ReferenceStrategy; 5] = [
        Self::ExactRelative,
        Self::NamespaceQualified,
        Self::AnyDirectory,
        Self::QuotedFileName,
        Self::BareFileName,
    ];

    fn pattern(&self, relative: &str, file_name: &str, namespace: Option<&str>) -> Option<String> {
        let name = regex::escape(file_name);
        match self {
            Self::ExactRelative => {
                let parts: Vec<String> = relative
                    .split(['/', '\\'])
                    .filter(|p| !p.is_empty())
                    .map(regex::escape)
                    .collect();
                Some(format!("{}{}", NAME_START, parts.join(r"[\\/]")))
            }
            Self::NamespaceQualified => {
                let segment = namespace?.rsplit(['.', ':']).find(|s| !s.is_empty())?;
                Some(format!(r"{}[\\/]{}", regex::escape(segment), name))
            }
            Self::AnyDirectory => Some(format!(r#"[^"'<>\s]*[\\/]{}"#, name)),
            Self::QuotedFileName => Some(format!(r#"["']{}"#, name)),
            Self::BareFileName => Some(format!("{}{}", NAME_START, name)),
        }
    }
}

/// A located reference: the strategy that found it and the regex that matches it.
///
/// Every match ends in the referenced file name. Lane files always sit next
/// to the file they copy, so a rewrite only swaps that trailing name and keeps
/// whatever directory spelling the descriptor used.
pub struct Reference {
    pub strategy: ReferenceStrategy,
    regex: Regex,
    name_len: usize,
}

impl Reference {
    /// Locate `target` inside `text`, as referenced from `base_dir`.
    pub fn locate(text: &str, base_dir: &Path, target: &Path, namespace: Option<&str>) -> Option<Self> {
        let relative = relative_path(base_dir, target);
        let relative = relative.to_string_lossy();
        let file_name = target.file_name()?.to_string_lossy().to_string();

        ReferenceStrategy::ORDER.iter().find_map(|strategy| {
            let pattern = strategy.pattern(&relative, &file_name, namespace)?;
            let regex = RegexBuilder::new(&pattern)
                .case_insensitive(true)
                .multi_line(true)
                .build()
                .ok()?;
            if regex.is_match(text) {
                Some(Self {
                    strategy: *strategy,
                    regex,
                    name_len: file_name.len(),
                })
            } else {
                None
            }
        })
    }

    /// Replace the file name of every occurrence with `new_name`.
    pub fn replace_all(&self, text: &str, new_name: &str) -> String {
        self.regex
            .replace_all(text, |caps: &regex::Captures| {
                let found = &caps[0];
                let prefix = &found[..found.len().saturating_sub(self.name_len)];
                format!("{}{}", prefix, new_name)
            })
            .into_owned()
    }

    /// True if `line` contains the reference.
    pub fn is_match(&self, line: &str) -> bool {
        self.regex.is_match(line)
    }
}

/// Rewrite references to `from` so they point at `to`. Returns `None` when
/// no strategy finds a reference.
pub fn rewrite_reference(
    text: &str,
    base_dir: &Path,
    from: &Path,
    to: &Path,
    namespace: Option<&str>,
) -> Option<String> {
    let reference = Reference::locate(text, base_dir, from, namespace)?;
    Some(reference.replace_all(text, &file_name(to)))
}

/// Replace each line referencing `from` with one copy per entry of `to`.
///
/// Used for the shared build descriptor, which must compile every lane's
/// test file instead of the original one.
pub fn duplicate_reference_lines(
    text: &str,
    base_dir: &Path,
    from: &Path,
    to: &[PathBuf],
    namespace: Option<&str>,
) -> Option<String> {
    let reference = Reference::locate(text, base_dir, from, namespace)?;
    let line_ending = if text.contains("\r\n") { "\r\n" } else { "\n" };

    let mut out: Vec<String> = Vec::new();
    for line in text.lines() {
        if reference.is_match(line) {
            for target in to {
                out.push(reference.replace_all(line, &file_name(target)));
            }
        } else {
            out.push(line.to_string());
        }
    }

    let mut joined = out.join(line_ending);
    if text.ends_with('\n') {
        joined.push_str(line_ending);
    }
    Some(joined)
}

/// Case-insensitive replacement of a plain name (file name or class name).
/// `mycalc.cpp` is not a match for `calc.cpp`.
pub fn replace_name(text: &str, from: &str, to: &str) -> String {
    if from.is_empty() {
        return text.to_string();
    }
    match RegexBuilder::new(&format!("({}){}", NAME_START, regex::escape(from)))
        .case_insensitive(true)
        .multi_line(true)
        .build()
    {
        Ok(re) => re
            .replace_all(text, |caps: &regex::Captures| format!("{}{}", &caps[1], to))
            .into_owned(),
        Err(_) => text.replace(from, to),
    }
}

/// Case-sensitive replacement of a whole identifier.
pub fn replace_identifier(text: &str, from: &str, to: &str) -> String {
    if from.is_empty() {
        return text.to_string();
    }
    match Regex::new(&format!(r"\b{}\b", regex::escape(from))) {
        Ok(re) => re.replace_all(text, regex::NoExpand(to)).into_owned(),
        Err(_) => text.to_string(),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Path of `target` relative to `base`, using `..` where needed.
pub fn relative_path(base: &Path, target: &Path) -> PathBuf {
    let base: Vec<Component> = base.components().collect();
    let target_components: Vec<Component> = target.components().collect();
    let common = base
        .iter()
        .zip(target_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    // Different roots (e.g. another drive) cannot be made relative.
    if common == 0 && target.is_absolute() {
        return target.to_path_buf();
    }

    let mut relative = PathBuf::new();
    for _ in common..base.len() {
        relative.push("..");
    }
    for component in &target_components[common..] {
        relative.push(component.as_os_str());
    }
    relative
}
