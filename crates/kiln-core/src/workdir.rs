//! Scoped, disposable build working directories.
//!
//! Every build runs inside a [`Workdir`] created under the store's scratch
//! space. The directory is released on every exit path: deleted on success
//! and on ordinary failure, retained only when the keep-on-failure flag is
//! set so a failed build can be inspected.
//!
//! ```text
//! <workdir>/
//! ├── src/         # Staged source artifact
//! ├── resources/   # Staged resource bundles, by name
//! ├── bootstrap/   # Staged bootstrap toolchain (read-only)
//! └── test/        # Scratch for the smoke test
//! ```

use anyhow::Result;
use std::path::{Path, PathBuf};

/// A disposable build directory with staged inputs.
#[derive(Debug)]
pub struct Workdir {
    temp_dir: Option<tempfile::TempDir>,
    keep_on_failure: bool,
}

impl Workdir {
    /// Create a fresh working directory under `tmp_root`.
    ///
    /// `tmp_root` should live on the same volume as the install prefixes so
    /// staging and install renames stay cheap.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn create(tmp_root: &Path, keep_on_failure: bool) -> Result<Self> {
        std::fs::create_dir_all(tmp_root)?;
        let temp_dir = tempfile::Builder::new()
            .prefix("kiln-build-")
            .tempdir_in(tmp_root)?;

        Ok(Self {
            temp_dir: Some(temp_dir),
            keep_on_failure,
        })
    }

    /// Access the root path
    ///
    /// # Panics
    ///
    /// Panics if called after [`release`](Self::release).
    pub fn path(&self) -> &Path {
        self.temp_dir
            .as_ref()
            .expect("workdir used after release")
            .path()
    }

    /// Directory the source artifact is staged into.
    pub fn src_dir(&self) -> PathBuf {
        self.path().join("src")
    }

    /// Directory a named resource bundle is staged into.
    pub fn resource_dir(&self, name: &str) -> PathBuf {
        self.path().join("resources").join(name)
    }

    /// Directory the bootstrap toolchain is staged into.
    pub fn bootstrap_dir(&self) -> PathBuf {
        self.path().join("bootstrap")
    }

    /// Scratch directory for the smoke test.
    pub fn test_dir(&self) -> PathBuf {
        self.path().join("test")
    }

    /// Stage a single file into a subdirectory of the workdir.
    ///
    /// # Errors
    ///
    /// Returns an error if the destination cannot be created or the copy
    /// fails.
    pub fn stage_file(&self, source: &Path, target_rel: &Path) -> Result<()> {
        let dest = self.path().join(target_rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !source.exists() {
            anyhow::bail!("Source does not exist: {}", source.display());
        }
        std::fs::copy(source, &dest)?;
        Ok(())
    }

    /// Stage a directory tree into a subdirectory of the workdir.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be copied.
    pub fn stage_tree(&self, source: &Path, target_rel: &Path) -> Result<()> {
        let dest = self.path().join(target_rel);
        std::fs::create_dir_all(&dest)?;
        fs_extra::dir::copy(
            source,
            &dest,
            &fs_extra::dir::CopyOptions::new()
                .content_only(true)
                .overwrite(true),
        )
        .map_err(|e| anyhow::anyhow!("Copy failed: {e}"))?;
        Ok(())
    }

    /// Release the directory.
    ///
    /// On success (or when keep-on-failure is off) the directory and any
    /// partial artifacts are deleted. On failure with keep-on-failure set,
    /// the directory is left on disk and its path returned for inspection.
    pub fn release(mut self, success: bool) -> Option<PathBuf> {
        let temp_dir = self.temp_dir.take()?;
        if !success && self.keep_on_failure {
            let retained = temp_dir.keep();
            tracing::warn!(path = %retained.display(), "build directory retained for inspection");
            Some(retained)
        } else {
            // TempDir deletes on drop.
            None
        }
    }
}

/// Recursively clear the write bits of every file under `root`.
///
/// Used for staged bootstrap toolchains: the build must be able to run
/// them but never modify them, since toolchain output determinism depends
/// on the exact bootstrap bytes.
pub fn make_read_only(root: &Path) -> std::io::Result<()> {
    for entry in walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(std::result::Result::ok)
    {
        if entry.file_type().is_file() {
            let mut perms = entry.metadata()?.permissions();
            perms.set_readonly(true);
            std::fs::set_permissions(entry.path(), perms)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_on_success_deletes() {
        let tmp = tempfile::tempdir().unwrap();
        let workdir = Workdir::create(tmp.path(), true).unwrap();
        let path = workdir.path().to_path_buf();
        assert!(path.exists());

        assert!(workdir.release(true).is_none());
        assert!(!path.exists());
    }

    #[test]
    fn release_on_failure_deletes_by_default() {
        let tmp = tempfile::tempdir().unwrap();
        let workdir = Workdir::create(tmp.path(), false).unwrap();
        let path = workdir.path().to_path_buf();

        assert!(workdir.release(false).is_none());
        assert!(!path.exists());
    }

    #[test]
    fn release_on_failure_retains_when_asked() {
        let tmp = tempfile::tempdir().unwrap();
        let workdir = Workdir::create(tmp.path(), true).unwrap();
        let path = workdir.path().to_path_buf();

        let retained = workdir.release(false).unwrap();
        assert_eq!(retained, path);
        assert!(path.exists());
    }

    #[test]
    fn stage_file_and_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let workdir = Workdir::create(tmp.path(), false).unwrap();

        let artifact = tmp.path().join("pkg.tar.gz");
        std::fs::write(&artifact, b"bytes").unwrap();
        workdir
            .stage_file(&artifact, Path::new("src/pkg.tar.gz"))
            .unwrap();
        assert!(workdir.src_dir().join("pkg.tar.gz").exists());

        let tree = tmp.path().join("toolchain");
        std::fs::create_dir_all(tree.join("bin")).unwrap();
        std::fs::write(tree.join("bin/ldmd2"), b"#!/bin/sh\n").unwrap();
        workdir.stage_tree(&tree, Path::new("bootstrap")).unwrap();
        assert!(workdir.bootstrap_dir().join("bin/ldmd2").exists());
    }

    #[test]
    fn staging_missing_source_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let workdir = Workdir::create(tmp.path(), false).unwrap();
        let missing = tmp.path().join("nope");

        assert!(workdir.stage_file(&missing, Path::new("src/nope")).is_err());
    }

    #[test]
    fn read_only_clears_write_bits() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("tool");
        std::fs::write(&file, b"binary").unwrap();

        make_read_only(tmp.path()).unwrap();
        assert!(std::fs::metadata(&file).unwrap().permissions().readonly());
    }
}
