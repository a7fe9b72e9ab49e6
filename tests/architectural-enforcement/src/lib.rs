//! Architectural Enforcement Integration Tests
//!
//! This package contains tests that scan the workspace sources and enforce
//! production-code rules:
//! - No blocking `std::thread::sleep` in async code
//! - No `.unwrap()` / `.expect(` outside tests; errors are propagated
//!
//! Only the code before a file's first `#[cfg(test)]` is checked.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// A rule broken at a specific line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File containing the violation
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// Pattern that matched
    pub pattern: &'static str,
}

/// Patterns forbidden in production code
pub const FORBIDDEN: &[&str] = &["thread::sleep", ".unwrap()", ".expect("];

/// Workspace root, two levels above this crate
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Every `.rs` file under a crate's `src/` directory
pub fn production_sources(crate_dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(crate_dir.join("src"))
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|entry| entry.into_path())
        .collect()
}

/// Find forbidden patterns in the production part of `source`
///
/// Scanning stops at the first `#[cfg(test)]`. Line comments and doc
/// comments are ignored.
pub fn scan_source(path: &Path, source: &str) -> Vec<Violation> {
    let mut violations = Vec::new();

    for (index, line) in source.lines().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("#[cfg(test)]") {
            break;
        }
        if trimmed.starts_with("//") {
            continue;
        }
        for pattern in FORBIDDEN {
            if line.contains(pattern) {
                violations.push(Violation {
                    path: path.to_path_buf(),
                    line: index + 1,
                    pattern: *pattern,
                });
            }
        }
    }

    violations
}

/// Scan every production source of the given crates
pub fn scan_crates(crate_dirs: &[PathBuf]) -> std::io::Result<Vec<Violation>> {
    let mut violations = Vec::new();
    for dir in crate_dirs {
        for path in production_sources(dir) {
            let source = fs::read_to_string(&path)?;
            violations.extend(scan_source(&path, &source));
        }
    }
    Ok(violations)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay_crates() -> Vec<PathBuf> {
        let root = workspace_root();
        vec![root.join("relay/core"), root.join("relay/daemon")]
    }

    #[test]
    fn test_scan_stops_at_test_module() {
        let source = "fn a() -> u8 { 1 }\n#[cfg(test)]\nmod tests { fn b() { x.unwrap(); } }\n";
        assert!(scan_source(Path::new("a.rs"), source).is_empty());
    }

    #[test]
    fn test_scan_reports_line_and_pattern() {
        let source = concat!(
            "fn a() {\n",
            "    // .unwrap() in a comment is fine\n",
            "    let x = y.expect(\"boom\");\n",
            "}\n",
        );
        let violations = scan_source(Path::new("a.rs"), source);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].line, 3);
        assert_eq!(violations[0].pattern, ".expect(");
    }

    #[test]
    fn test_unwrap_or_variants_allowed() {
        let source = "fn a() { x.unwrap_or_default(); y.unwrap_or_else(|_| 0); }\n";
        assert!(scan_source(Path::new("a.rs"), source).is_empty());
    }

    #[test]
    fn test_workspace_sources_found() {
        let sources: Vec<_> = relay_crates()
            .iter()
            .flat_map(|dir| production_sources(dir))
            .collect();
        assert!(sources.iter().any(|p| p.ends_with("relay/core/src/router.rs")));
        assert!(sources.iter().any(|p| p.ends_with("relay/daemon/src/main.rs")));
    }

    #[test]
    fn test_no_forbidden_patterns_in_production_code() {
        let violations = scan_crates(&relay_crates()).unwrap();
        assert!(
            violations.is_empty(),
            "forbidden patterns in production code:\n{}",
            violations
                .iter()
                .map(|v| format!("  {}:{} {}", v.path.display(), v.line, v.pattern))
                .collect::<Vec<_>>()
                .join("\n")
        );
    }
}
