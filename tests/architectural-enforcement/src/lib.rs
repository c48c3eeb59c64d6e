//! Architectural Enforcement Integration Tests
//!
//! Source scans that keep the library honest:
//! - No blocking sleeps in production code
//! - No `unwrap()` / `expect()` outside tests
//! - No blocking process or network I/O
//!
//! "Production code" is every line of a `.rs` file under a crate's `src/`
//! before its first `#[cfg(test)]`.

use std::fs;
use std::path::{Path, PathBuf};

/// One offending line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File containing the line
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// The line, trimmed
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.line, self.text)
    }
}

/// Workspace root, two levels above this crate
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
}

/// Source directories of the crates under enforcement
#[must_use]
pub fn production_dirs() -> Vec<PathBuf> {
    let root = workspace_root();
    vec![root.join("bridge/core/src"), root.join("bridge/cli/src")]
}

/// Lines of `content` that belong to production code, with 1-based numbers
///
/// Stops at the first `#[cfg(test)]` and skips comment lines.
#[must_use]
pub fn production_lines(content: &str) -> Vec<(usize, &str)> {
    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| !line.trim_start().starts_with("#[cfg(test)]"))
        .filter(|(_, line)| !line.trim_start().starts_with("//"))
        .map(|(idx, line)| (idx + 1, line))
        .collect()
}

/// Scan every `.rs` file under `dirs`, reporting production lines matching
/// `is_violation`
pub fn scan<F>(dirs: &[PathBuf], is_violation: F) -> Vec<Violation>
where
    F: Fn(&Path, &str) -> bool,
{
    let mut violations = Vec::new();
    for dir in dirs {
        for entry in walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        {
            let Ok(content) = fs::read_to_string(entry.path()) else {
                continue;
            };
            for (line, text) in production_lines(&content) {
                let code = text.split("//").next().unwrap_or(text);
                if is_violation(entry.path(), code) {
                    violations.push(Violation {
                        path: entry.path().to_path_buf(),
                        line,
                        text: text.trim().to_string(),
                    });
                }
            }
        }
    }
    violations
}

/// Panic with a readable report if `violations` is not empty
pub fn assert_clean(rule: &str, violations: &[Violation]) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n❌ {rule}\n");
    for violation in violations {
        eprintln!("  ❌ {violation}");
    }
    panic!("\nFound {} violation(s): {rule}", violations.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let src = "fn a() {}\n// note\nfn b() {}\n#[cfg(test)]\nmod tests { fn c() {} }\n";
        let lines: Vec<usize> = production_lines(src).into_iter().map(|(n, _)| n).collect();
        assert_eq!(lines, vec![1, 3]);
    }

    #[test]
    fn test_production_dirs_exist() {
        for dir in production_dirs() {
            assert!(dir.exists(), "missing source dir {}", dir.display());
        }
    }
}
