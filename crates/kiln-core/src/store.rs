//! On-disk layout owned by one orchestrator instance.
//!
//! The store groups the artifact cache, install prefixes, persistent state
//! directories, build logs, and scratch space under a single root. It is
//! created once per orchestrator and passed by handle to the components
//! that need it, keeping the resolver and plan builder free of filesystem
//! concerns.
//!
//! ```text
//! <root>/
//! ├── cache/      # Fetched artifacts, content-addressed by digest
//! ├── prefix/     # Install prefixes by name/version
//! ├── state/      # Persistent package-family state records
//! ├── logs/       # Per-build tool output
//! └── tmp/        # Scoped build working directories
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use kiln_schema::{PackageName, Version};

/// Receipt written into an install prefix after a completed install.
///
/// Its presence is how re-runs detect an already-installed (name, version)
/// and skip it. `verified` records the smoke-test outcome: `None` when the
/// test was not requested, `Some(false)` when it ran and failed (the
/// install stands but is flagged unverified).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    /// Installed package name.
    pub name: PackageName,
    /// Installed version.
    pub version: Version,
    /// Digest of the source artifact the install was built from.
    pub source_digest: String,
    /// Smoke-test outcome, if a test ran.
    pub verified: Option<bool>,
}

const RECEIPT_FILE: &str = "receipt.json";

/// Handle over the orchestrator's on-disk layout.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Open (and create if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the layout directories cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let store = Self { root: root.into() };
        for dir in [
            store.cache_dir(),
            store.prefix_root(),
            store.state_dir(),
            store.log_dir(),
            store.tmp_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(store)
    }

    /// The default store root: `$KILN_HOME`, or `~/.kiln`.
    pub fn default_root() -> Option<PathBuf> {
        if let Ok(val) = std::env::var("KILN_HOME") {
            return Some(PathBuf::from(val));
        }
        dirs::home_dir().map(|h| h.join(".kiln"))
    }

    /// Root of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Artifact cache: `<root>/cache`
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// Root of all install prefixes: `<root>/prefix`
    pub fn prefix_root(&self) -> PathBuf {
        self.root.join("prefix")
    }

    /// Install prefix for one package version: `<root>/prefix/<name>/<version>`
    pub fn prefix_dir(&self, name: &PackageName, version: &Version) -> PathBuf {
        self.prefix_root().join(name).join(version)
    }

    /// Persistent state records: `<root>/state`
    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    /// Build logs: `<root>/logs`
    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Scratch space for build working directories, guaranteed on the same
    /// volume as the prefixes so renames stay cheap: `<root>/tmp`
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Log file for one package build.
    pub fn build_log_path(&self, name: &PackageName, version: &Version) -> PathBuf {
        self.log_dir().join(format!("build-{name}-{version}.log"))
    }

    /// Read the install receipt for a package version, if one exists.
    ///
    /// An unreadable or malformed receipt is treated as absent so a broken
    /// prefix gets rebuilt rather than trusted.
    pub fn read_receipt(&self, name: &PackageName, version: &Version) -> Option<Receipt> {
        let path = self.prefix_dir(name, version).join(RECEIPT_FILE);
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Write the install receipt for a completed install.
    ///
    /// # Errors
    ///
    /// Returns an error if the receipt cannot be serialized or written.
    pub fn write_receipt(&self, receipt: &Receipt) -> std::io::Result<()> {
        let dir = self.prefix_dir(&receipt.name, &receipt.version);
        std::fs::create_dir_all(&dir)?;
        let content = serde_json::to_string_pretty(receipt).map_err(std::io::Error::other)?;
        std::fs::write(dir.join(RECEIPT_FILE), content)
    }
}
