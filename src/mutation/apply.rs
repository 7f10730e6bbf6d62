//! Applying a mutant to source text.

use crate::mutation::Mutant;
use anyhow::Result;

/// Line tolerance when locating the original fragment (search nearby lines).
const LINE_TOLERANCE: usize = 3;

/// Produce the mutated version of `content`.
///
/// Searches for `mutant.original` within a window around the mutant's start
/// line and replaces the first occurrence. A multi-line fragment is matched
/// against the joined span starting at the candidate line. Falls back to the
/// whole file if the window has no match.
pub fn apply_mutant(content: &str, mutant: &Mutant) -> Result<String> {
    let line_ending = if content.contains("\r\n") {
        "\r\n"
    } else {
        "\n"
    };
    let lines: Vec<&str> = content.lines().collect();
    let line_count = lines.len();
    let start = mutant.location.line;

    if start == 0 || start > line_count + LINE_TOLERANCE {
        anyhow::bail!(
            "Line number {} out of range (file has {} lines)",
            start,
            line_count
        );
    }

    let original = normalize_endings(&mutant.original);
    if original.is_empty() {
        anyhow::bail!("Mutant {} has an empty original fragment", mutant.id);
    }
    let span = original.lines().count().max(1);
    let replacement = normalize_endings(mutant.replacement.as_deref().unwrap_or(""));

    let window_start = start.saturating_sub(LINE_TOLERANCE).max(1);
    let window_end = (start + LINE_TOLERANCE).min(line_count);

    // Nearest line first, so a duplicate fragment a few lines away loses.
    let mut candidates: Vec<usize> = (window_start..=window_end).collect();
    candidates.sort_by_key(|ln| ln.abs_diff(start));

    let target = candidates
        .into_iter()
        .find(|ln| span_text(&lines, *ln, span).contains(&original))
        .or_else(|| (1..=line_count).find(|ln| span_text(&lines, *ln, span).contains(&original)))
        .ok_or_else(|| {
            anyhow::anyhow!(
                "Could not find '{}' in file (searched around line {})",
                mutant.original.trim(),
                start
            )
        })?;

    let mutated_span = span_text(&lines, target, span).replacen(&original, &replacement, 1);

    let mut new_lines: Vec<String> = Vec::with_capacity(line_count);
    new_lines.extend(lines[..target - 1].iter().map(|l| l.to_string()));
    new_lines.push(mutated_span);
    let after = (target - 1 + span).min(line_count);
    new_lines.extend(lines[after..].iter().map(|l| l.to_string()));

    let mut mutated = new_lines.join("\n");
    if content.ends_with('\n') {
        mutated.push('\n');
    }
    if line_ending == "\r\n" {
        mutated = mutated.replace('\n', "\r\n");
    }
    Ok(mutated)
}

fn span_text(lines: &[&str], first: usize, span: usize) -> String {
    let end = (first - 1 + span).min(lines.len());
    lines[first - 1..end].join("\n")
}

fn normalize_endings(text: &str) -> String {
    text.replace("\r\n", "\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::{Location, MutatorType};

    fn relational(line: usize, original: &str, replacement: Option<&str>) -> Mutant {
        Mutant::new(
            1,
            Location::single(line),
            MutatorType::Relational,
            original,
            replacement.map(str::to_string),
        )
    }

    #[test]
    fn test_apply_on_exact_line() {
        let src = "int max(int a, int b) {\n  if (a > b) return a;\n  return b;\n}\n";
        let out = apply_mutant(src, &relational(2, "a > b", Some("a >= b"))).unwrap();
        assert_eq!(
            out,
            "int max(int a, int b) {\n  if (a >= b) return a;\n  return b;\n}\n"
        );
    }

    #[test]
    fn test_apply_prefers_nearest_line() {
        let src = "x > y\nfoo\nbar\nx > y\n";
        let out = apply_mutant(src, &relational(4, "x > y", Some("x < y"))).unwrap();
        assert_eq!(out, "x > y\nfoo\nbar\nx < y\n");
    }

    #[test]
    fn test_apply_within_tolerance() {
        let src = "a\nb\nc\nif (a > b)\ne\n";
        let out = apply_mutant(src, &relational(2, "a > b", Some("a <= b"))).unwrap();
        assert!(out.contains("if (a <= b)"));
    }

    #[test]
    fn test_apply_falls_back_to_whole_file() {
        let src = "if (a > b)\n1\n2\n3\n4\n5\n6\n7\n8\n";
        let out = apply_mutant(src, &relational(9, "a > b", Some("a != b"))).unwrap();
        assert!(out.starts_with("if (a != b)"));
    }

    #[test]
    fn test_apply_deletes_when_no_replacement() {
        let src = "void f() {\n  counter++;\n}\n";
        let mut m = relational(2, "counter++;", None);
        m.mutator = MutatorType::Block;
        let out = apply_mutant(src, &m).unwrap();
        assert_eq!(out, "void f() {\n  \n}\n");
    }

    #[test]
    fn test_apply_multi_line_fragment() {
        let src = "void f() {\n  if (x) {\n    go();\n  }\n}\n";
        let m = Mutant::new(
            2,
            Location {
                line: 2,
                end_line: Some(4),
            },
            MutatorType::Block,
            "{\n    go();\n  }",
            Some("{\n  }".to_string()),
        );
        let out = apply_mutant(src, &m).unwrap();
        assert_eq!(out, "void f() {\n  if (x) {\n  }\n}\n");
    }

    #[test]
    fn test_apply_preserves_crlf() {
        let src = "a > b\r\nnext\r\n";
        let out = apply_mutant(src, &relational(1, "a > b", Some("a < b"))).unwrap();
        assert_eq!(out, "a < b\r\nnext\r\n");
    }

    #[test]
    fn test_apply_missing_fragment_errors() {
        let src = "nothing here\n";
        let err = apply_mutant(src, &relational(1, "a > b", Some("a < b"))).unwrap_err();
        assert!(err.to_string().contains("Could not find"));
    }

    #[test]
    fn test_apply_line_out_of_range() {
        let src = "one\n";
        assert!(apply_mutant(src, &relational(50, "one", Some("two"))).is_err());
    }
}
