//! Loading the unit manifest produced by the mutant generator.

use crate::error::EngineError;
use crate::mutation::{MutantStatus, UnitDetail};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Load and validate a unit manifest.
///
/// A relative `project_root` is resolved against the manifest's directory.
pub fn load_unit(path: &Path) -> Result<UnitDetail, EngineError> {
    let contents = std::fs::read_to_string(path).map_err(|e| EngineError::Input {
        message: format!("Unable to read unit manifest {}", path.display()),
        details: e.to_string(),
    })?;
    let mut unit: UnitDetail = serde_json::from_str(&contents).map_err(|e| EngineError::Input {
        message: format!("Invalid unit manifest {}", path.display()),
        details: e.to_string(),
    })?;

    if unit.project_root.is_relative() {
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        unit.project_root = base.join(&unit.project_root);
    }

    validate_unit(&unit)?;
    Ok(unit)
}

/// Check that referenced files exist and mutant ids are unique.
pub fn validate_unit(unit: &UnitDetail) -> Result<(), EngineError> {
    let mut required: Vec<(&str, PathBuf)> = vec![
        ("source file", unit.source_path()),
        ("test file", unit.test_path()),
        ("test project", unit.project_path()),
    ];
    if let Some(solution) = unit.solution_path() {
        required.push(("test solution", solution));
    }
    if let Some(header) = unit.header_path() {
        required.push(("source header", header));
    }

    for (what, path) in required {
        if !path.is_file() {
            return Err(EngineError::input(format!(
                "The {} {} does not exist",
                what,
                path.display()
            )));
        }
    }

    let mut seen = HashSet::new();
    for mutant in unit.mutants() {
        if !seen.insert(mutant.id) {
            return Err(EngineError::input(format!(
                "Duplicate mutant id {} in unit {}",
                mutant.id,
                unit.source_file.display()
            )));
        }
        // Outcomes are decided here, never carried in by the generator.
        if mutant.status() != MutantStatus::NotRun {
            return Err(EngineError::input(format!(
                "Mutant {} arrives with status {}, expected not_run",
                mutant.id,
                mutant.status()
            )));
        }
    }

    for method in &unit.methods {
        if method.start_line > method.end_line {
            return Err(EngineError::input(format!(
                "Method {} ends (line {}) before it starts (line {})",
                method.name, method.end_line, method.start_line
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::MutatorType;
    use tempfile::TempDir;

    fn write_project(dir: &Path) {
        std::fs::create_dir_all(dir.join("src")).unwrap();
        std::fs::create_dir_all(dir.join("tests")).unwrap();
        std::fs::write(dir.join("src/calc.cpp"), "int add(int a, int b) { return a + b; }\n")
            .unwrap();
        std::fs::write(dir.join("tests/calc_test.cpp"), "TEST(CalcTest, Add) {}\n").unwrap();
        std::fs::write(dir.join("tests/calc_test.vcxproj"), "<Project/>\n").unwrap();
    }

    fn manifest(mutants: &str) -> String {
        format!(
            r#"{{
  "project_root": ".",
  "source_file": "src/calc.cpp",
  "test_file": "tests/calc_test.cpp",
  "test_project": "tests/calc_test.vcxproj",
  "test_class": "CalcTest",
  "methods": [
    {{ "name": "add", "start_line": 1, "end_line": 1, "tests": ["CalcTest.Add"],
       "mutants": {} }}
  ]
}}"#,
            mutants
        )
    }

    #[test]
    fn test_load_unit_resolves_root() {
        let temp_dir = TempDir::new().unwrap();
        write_project(temp_dir.path());
        let path = temp_dir.path().join("unit.json");
        std::fs::write(
            &path,
            manifest(r#"[{"id":1,"line":1,"mutator":"arithmetic","original":"+","replacement":"-"}]"#),
        )
        .unwrap();

        let unit = load_unit(&path).unwrap();
        assert_eq!(unit.project_root, temp_dir.path().join("."));
        assert_eq!(unit.mutants().count(), 1);
        assert_eq!(unit.mutant(1).unwrap().mutator, MutatorType::Arithmetic);
    }

    #[test]
    fn test_load_unit_missing_file_is_input_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("unit.json");
        std::fs::write(&path, manifest("[]")).unwrap();

        let err = load_unit(&path).unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_load_unit_duplicate_ids() {
        let temp_dir = TempDir::new().unwrap();
        write_project(temp_dir.path());
        let path = temp_dir.path().join("unit.json");
        std::fs::write(
            &path,
            manifest(
                r#"[{"id":1,"line":1,"mutator":"arithmetic","original":"+","replacement":"-"},
                    {"id":1,"line":1,"mutator":"arithmetic","original":"+","replacement":"*"}]"#,
            ),
        )
        .unwrap();

        let err = load_unit(&path).unwrap_err();
        assert!(err.to_string().contains("Duplicate mutant id 1"));
    }

    #[test]
    fn test_load_unit_rejects_decided_status() {
        let temp_dir = TempDir::new().unwrap();
        write_project(temp_dir.path());
        let path = temp_dir.path().join("unit.json");
        std::fs::write(
            &path,
            manifest(
                r#"[{"id":1,"line":1,"mutator":"arithmetic","original":"+","replacement":"-","status":"killed"}]"#,
            ),
        )
        .unwrap();

        let err = load_unit(&path).unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("Mutant 1 arrives with status"));
    }

    #[test]
    fn test_load_unit_invalid_json() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("unit.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            load_unit(&path),
            Err(EngineError::Input { .. })
        ));
    }
}
