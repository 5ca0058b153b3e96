//! Bootstrap toolchain resolution.
//!
//! Some packages need a working prior version of themselves (or a closely
//! related toolchain) to build — a compiler built by an older compiler.
//! Such a descriptor carries a bootstrap table keyed by (os, arch). The
//! resolver picks the entry for the target platform, fetches it through
//! the ordinary verified-artifact path, and stages it read-only inside the
//! build working directory, where the plan builder exposes it as
//! `${bootstrap}`.
//!
//! Policy: a platform with no table entry is a hard error. Falling back to
//! a host-installed toolchain would silently change the compiler the build
//! runs under, and toolchain output determinism depends on the exact
//! bootstrap bytes.

use std::path::{Path, PathBuf};

use kiln_schema::{BootstrapEntry, Descriptor, PackageName, Platform};

use crate::error::OrchestrateError;
use crate::fetch::Fetcher;
use crate::workdir::{self, Workdir};

/// Select the bootstrap entry for a platform, if the descriptor needs one.
///
/// Returns `Ok(None)` when the descriptor declares no bootstrap table.
///
/// # Errors
///
/// Returns [`OrchestrateError::BootstrapMismatch`] when a table exists but
/// has no entry for `platform`.
pub fn select<'a>(
    desc: &'a Descriptor,
    platform: &Platform,
) -> Result<Option<&'a BootstrapEntry>, OrchestrateError> {
    let Some(table) = &desc.bootstrap else {
        return Ok(None);
    };

    table
        .select(platform)
        .map(Some)
        .ok_or_else(|| OrchestrateError::BootstrapMismatch {
            package: desc.name.clone(),
            platform: *platform,
        })
}

/// Fetch a selected bootstrap artifact and stage it read-only under the
/// working directory.
///
/// Returns the staged bootstrap root (the `${bootstrap}` substitution
/// value). The artifact file itself lands inside that root under its URL
/// basename; unpacking it, if needed, is an ordinary build stage.
///
/// # Errors
///
/// Returns a fetch error (including hash mismatch) or an IO error from
/// staging.
pub async fn stage(
    package: &PackageName,
    entry: &BootstrapEntry,
    fetcher: &Fetcher,
    workdir: &Workdir,
) -> Result<PathBuf, OrchestrateError> {
    let cached = fetcher
        .fetch(&entry.source.url, &entry.source.sha256)
        .await
        .map_err(|source| OrchestrateError::Fetch {
            package: package.clone(),
            source,
        })?;

    let filename = filename_from_url(&entry.source.url);
    workdir
        .stage_file(&cached, &Path::new("bootstrap").join(filename))
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    let root = workdir.bootstrap_dir();
    workdir::make_read_only(&root)?;

    tracing::debug!(package = %package, root = %root.display(), "bootstrap toolchain staged");
    Ok(root)
}

/// Extract the filename from a URL.
fn filename_from_url(url: &str) -> &str {
    url.split('/').next_back().unwrap_or("bootstrap")
}
