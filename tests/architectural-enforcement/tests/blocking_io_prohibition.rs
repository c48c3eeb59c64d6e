//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Talking to the container engine goes through `tokio::process`.
//! **Allowed**: `std::fs` in `config.rs`, which runs before any transport does.

use std::path::Path;

use architectural_enforcement::{assert_clean, production_dirs, scan};

fn is_config(path: &Path) -> bool {
    path.file_name().and_then(|n| n.to_str()) == Some("config.rs")
}

#[test]
fn test_no_blocking_process_io() {
    let violations = scan(&production_dirs(), |_, code| {
        code.contains("std::process::Command")
    });
    assert_clean("Blocking process I/O, use tokio::process::Command", &violations);
}

#[test]
fn test_no_blocking_network_io() {
    let violations = scan(&production_dirs(), |_, code| code.contains("std::net::"));
    assert_clean("Blocking network I/O", &violations);
}

#[test]
fn test_filesystem_access_only_in_config() {
    let root = architectural_enforcement::workspace_root();
    let violations = scan(&[root.join("bridge/core/src")], |path, code| {
        code.contains("std::fs") && !is_config(path)
    });
    assert_clean("Filesystem access outside config loading", &violations);
}
