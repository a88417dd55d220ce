//! Integration tests for zencage
//!
//! These tests drive the real `zencage-worker` binary built alongside them,
//! so no extra setup is needed:
//!   cargo test -p zencage --test integration

use std::path::PathBuf;

use zencage::config::Config;

mod config_loading;
mod isolation;

const FIXTURES_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

/// A config pointing at the worker binary built for this test run
pub(crate) fn test_config() -> Config {
    Config {
        worker_path: Some(PathBuf::from(env!("CARGO_BIN_EXE_zencage-worker"))),
        ..Config::empty()
    }
}
