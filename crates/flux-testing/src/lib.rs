//! Testing utilities and fixtures for flux-stream
//!
//! This crate provides a fault-injecting backend, data fixtures, assertions
//! and helpers for testing code built on flux-stream readers and writers.

use anyhow::Result;
use flux_stream::StreamConfig;
use std::path::{Path, PathBuf};
use std::sync::Once;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

pub mod assertions;
pub mod fixtures;
pub mod flaky;
pub mod helpers;

pub use flaky::{Fault, FlakyObject};

/// Install a `tracing` subscriber for tests, once per process
///
/// Honors `RUST_LOG`; defaults to warnings only.
pub fn init_tracing() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Creates a temporary test directory with cleanup on drop
pub struct TestDir {
    dir: TempDir,
}

impl TestDir {
    /// Creates a new temporary test directory
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: TempDir::new()?,
        })
    }

    /// Returns the path to the temporary directory
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Creates a file with the given name and content in the test directory
    pub fn create_file(&self, name: &str, content: &[u8]) -> Result<PathBuf> {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Saves `config` as TOML under `name`
    pub fn write_config(&self, name: &str, config: &StreamConfig) -> Result<PathBuf> {
        let path = self.dir.path().join(name);
        config.save(&path)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_file() {
        let test_dir = TestDir::new().unwrap();
        let file_path = test_dir.create_file("conf/stream.toml", b"max_workers = 2\n").unwrap();
        assert!(file_path.exists());
        assert_eq!(std::fs::read(&file_path).unwrap(), b"max_workers = 2\n");
    }

    #[test]
    fn test_write_config() {
        let test_dir = TestDir::new().unwrap();
        let path = test_dir
            .write_config("stream.toml", &StreamConfig::default())
            .unwrap();
        assert_eq!(StreamConfig::load(&path).unwrap(), StreamConfig::default());
    }
}
