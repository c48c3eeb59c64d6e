//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Library and CLI code never block a runtime thread with
//! `std::thread::sleep`. Retry delays and poll intervals use
//! `tokio::time::sleep`; remote poll loops sleep inside the sandbox, not here.

use architectural_enforcement::{assert_clean, production_dirs, scan};

#[test]
fn test_no_blocking_sleep_in_production_code() {
    let violations = scan(&production_dirs(), |_, code| {
        code.contains("thread::sleep") || code.contains("std::thread::park_timeout")
    });
    assert_clean("Blocking sleep in production code, use tokio::time::sleep", &violations);
}
