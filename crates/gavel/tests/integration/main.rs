//! Integration tests for gavel
//!
//! These tests need a running Docker daemon with the language images
//! provisioned (`gavel provision`).
//! Run with: cargo test -p gavel --features integration-tests
//!
//! Tests that need the daemon are marked `#[ignore]`. To include them:
//!    cargo test -p gavel --features integration-tests -- --include-ignored

#![cfg(feature = "integration-tests")]

use std::fs;

use gavel::{Config, Engine};

mod config_loading;
mod execution;
mod isolation;
mod legacy_fallback;
mod lifecycle;
mod resource_limits;

const FIXTURES_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

/// Helper to get fixture file content
pub(crate) fn fixture_source(name: &str) -> String {
    let path = format!("{FIXTURES_PATH}/sources/{name}");
    fs::read_to_string(&path).unwrap_or_else(|e| panic!("Failed to read fixture {path}: {e}"))
}

/// Path of a fixture configuration file
pub(crate) fn fixture_config(name: &str) -> String {
    format!("{FIXTURES_PATH}/configs/{name}")
}

/// Engine connected to the local Docker daemon, never falling back to the host.
pub(crate) async fn docker_engine() -> Engine {
    let config = Config::default();
    let engine = Engine::connect(&config).await.expect("Failed to build engine");
    assert!(!engine.is_insecure());
    engine
}
