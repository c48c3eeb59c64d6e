//! Integration Test: Error Propagation
//!
//! **Policy**: Production code returns errors with `?` instead of panicking.
//! `unwrap()` and `expect()` are for tests only. `unwrap_or*` is fine.

use architectural_enforcement::{assert_clean, production_dirs, scan};

#[test]
fn test_no_unwrap_or_expect_in_production_code() {
    let violations = scan(&production_dirs(), |_, code| {
        code.contains(".unwrap()") || code.contains(".expect(")
    });
    assert_clean("unwrap()/expect() in production code", &violations);
}

#[test]
fn test_no_panicking_macros_in_library() {
    let root = architectural_enforcement::workspace_root();
    let violations = scan(&[root.join("bridge/core/src")], |_, code| {
        code.contains("panic!(") || code.contains("todo!(") || code.contains("unimplemented!(")
    });
    assert_clean("Panicking macro in library code", &violations);
}
