//! Test manifest files
//!
//! ```toml
//! [[test]]
//! path = "basic_call.sh"
//!
//! [[test]]
//! path = "renegotiate.sh"
//! disabled = "flaky on the relay"
//! ```
//!
//! Paths are relative to the manifest's own directory, which becomes the
//! tests root both harness clients run from.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

use steeplechase_common::Manifest;

use crate::error::{RunnerError, RunnerResult};

#[derive(Debug, Deserialize)]
struct ManifestFile {
    #[serde(default, rename = "test")]
    tests: Vec<TestEntry>,
}

/// One `[[test]]` table
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TestEntry {
    pub path: String,

    /// Reason the test is skipped
    #[serde(default)]
    pub disabled: Option<String>,
}

/// A parsed manifest file
#[derive(Debug, Clone)]
pub struct TestManifest {
    root: PathBuf,
    entries: Vec<TestEntry>,
}

impl TestManifest {
    pub fn load(path: &Path) -> RunnerResult<Self> {
        let error = |reason: String| RunnerError::Manifest {
            path: path.to_path_buf(),
            reason,
        };
        let content = std::fs::read_to_string(path).map_err(|e| error(e.to_string()))?;
        let file: ManifestFile = toml::from_str(&content).map_err(|e| error(e.to_string()))?;

        let root = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        Ok(Self {
            root,
            entries: file.tests,
        })
    }

    /// Directory test paths are relative to
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entries(&self) -> &[TestEntry] {
        &self.entries
    }

    /// The tests to run, in file order
    pub fn active(&self) -> Manifest {
        Manifest::from_paths(self.entries.iter().filter_map(|entry| match &entry.disabled {
            Some(reason) => {
                debug!("Skipping disabled test {}: {}", entry.path, reason);
                None
            }
            None => Some(entry.path.clone()),
        }))
    }
}
