//! Cobertura XML coverage reports.
//!
//! Only the parts the mapper needs are read: class file names, method names
//! and signatures, and per-line hit counts.

use crate::coverage::{CoverageSnapshot, FileCoverage, MethodCoverage};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

fn tag_regex() -> &'static Regex {
    static TAG: OnceLock<Regex> = OnceLock::new();
    TAG.get_or_init(|| {
        Regex::new(r"<(/?)(class|method|line)\b([^>]*?)(/?)>").expect("static regex is valid")
    })
}

fn attr_regex() -> &'static Regex {
    static ATTR: OnceLock<Regex> = OnceLock::new();
    ATTR.get_or_init(|| Regex::new(r#"([\w-]+)\s*=\s*"([^"]*)""#).expect("static regex is valid"))
}

/// Parse a Cobertura report into a snapshot.
pub fn parse_cobertura(xml: &str) -> CoverageSnapshot {
    let mut files: BTreeMap<String, BTreeMap<usize, u64>> = BTreeMap::new();
    let mut methods: Vec<MethodCoverage> = Vec::new();
    let mut current_file: Option<String> = None;
    let mut current_method: Option<MethodCoverage> = None;

    for caps in tag_regex().captures_iter(xml) {
        let closing = &caps[1] == "/";
        let self_closing = &caps[4] == "/";
        let tag = &caps[2];
        let attrs = attributes(&caps[3]);

        match (tag, closing) {
            ("class", false) => {
                current_file = attrs.get("filename").cloned();
                if let Some(file) = &current_file {
                    files.entry(file.clone()).or_default();
                }
            }
            ("class", true) => current_file = None,
            ("method", false) => {
                let method = MethodCoverage {
                    name: attrs.get("name").cloned().unwrap_or_default(),
                    signature: attrs.get("signature").cloned().filter(|s| !s.is_empty()),
                    file: current_file.clone(),
                    lines: BTreeMap::new(),
                    tests: Vec::new(),
                };
                if self_closing {
                    methods.push(method);
                } else {
                    current_method = Some(method);
                }
            }
            ("method", true) => {
                if let Some(method) = current_method.take() {
                    methods.push(method);
                }
            }
            ("line", false) => {
                let number = attrs.get("number").and_then(|n| n.parse::<usize>().ok());
                let hits = attrs
                    .get("hits")
                    .and_then(|h| h.parse::<u64>().ok())
                    .unwrap_or(0);
                let Some(number) = number else { continue };

                if let Some(method) = current_method.as_mut() {
                    let entry = method.lines.entry(number).or_insert(0);
                    *entry = (*entry).max(hits);
                }
                if let Some(file) = &current_file {
                    let entry = files.entry(file.clone()).or_default().entry(number).or_insert(0);
                    *entry = (*entry).max(hits);
                }
            }
            _ => {}
        }
    }

    CoverageSnapshot {
        files: files
            .into_iter()
            .map(|(path, lines)| FileCoverage { path, lines })
            .collect(),
        methods,
    }
}

fn attributes(raw: &str) -> BTreeMap<String, String> {
    attr_regex()
        .captures_iter(raw)
        .map(|c| (c[1].to_string(), unescape(&c[2])))
        .collect()
}

fn unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<coverage line-rate="0.5" version="1.9">
  <packages>
    <package name="calc">
      <classes>
        <class name="calc.cpp" filename="src\calc.cpp" line-rate="0.5">
          <methods>
            <method name="Calc::Max" signature="int Calc::Max(int,int)" line-rate="1">
              <lines>
                <line number="3" hits="4"/>
                <line number="4" hits="2"/>
              </lines>
            </method>
            <method name="Calc::Helper&lt;T&gt;" signature="" line-rate="0"/>
          </methods>
          <lines>
            <line number="3" hits="4"/>
            <line number="4" hits="2"/>
            <line number="9" hits="0"/>
          </lines>
        </class>
      </classes>
    </package>
  </packages>
</coverage>"#;

    #[test]
    fn test_parse_file_lines() {
        let snapshot = parse_cobertura(REPORT);
        assert_eq!(snapshot.files.len(), 1);
        let file = &snapshot.files[0];
        assert_eq!(file.path, "src\\calc.cpp");
        assert_eq!(file.lines.get(&3), Some(&4));
        assert_eq!(file.lines.get(&9), Some(&0));
    }

    #[test]
    fn test_parse_methods() {
        let snapshot = parse_cobertura(REPORT);
        assert_eq!(snapshot.methods.len(), 2);

        let max = &snapshot.methods[0];
        assert_eq!(max.name, "Calc::Max");
        assert_eq!(max.signature.as_deref(), Some("int Calc::Max(int,int)"));
        assert_eq!(max.lines.len(), 2);
        assert_eq!(max.file.as_deref(), Some("src\\calc.cpp"));

        let helper = &snapshot.methods[1];
        assert_eq!(helper.name, "Calc::Helper<T>");
        assert!(helper.signature.is_none());
        assert!(helper.lines.is_empty());
    }

    #[test]
    fn test_parse_empty_report() {
        let snapshot = parse_cobertura("<coverage></coverage>");
        assert!(snapshot.files.is_empty());
        assert!(snapshot.methods.is_empty());
    }
}
