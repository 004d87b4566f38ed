//! Scratch pool-file paths for tests, grounded on pynvm's
//! `tests/support.py` (`_test_fn`): one throwaway path per test name, under
//! the OS temp directory, cleaned up before use so a leftover file from a
//! previous run never leaks state into the next one.

#![cfg(test)]

use std::path::PathBuf;

pub fn scratch(module: &str, name: &str) -> PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("pmemobj-{}-test-{}-{}", module, std::process::id(), name));
    let _ = std::fs::remove_file(&p);
    p
}
