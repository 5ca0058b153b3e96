//! Reporter trait for dependency injection
//!
//! This trait allows core logic to report progress, caveats, and migration
//! guidance without being coupled to a specific console implementation.

use kiln_schema::{PackageName, Version};

/// Progress and guidance sink for one orchestration run.
pub trait Reporter: Send + Sync {
    /// A package's artifacts are being fetched.
    fn fetching(&self, name: &PackageName, version: &Version, url: &str);

    /// A package's build stages have started.
    fn building(&self, name: &PackageName, version: &Version);

    /// Marks a package operation as successfully completed.
    fn done(&self, name: &PackageName, version: &Version, detail: &str);

    /// Marks a package operation as failed with a specific reason.
    fn failed(&self, name: &PackageName, version: &Version, reason: &str);

    /// User-facing guidance emitted after a successful install (caveats,
    /// migration suggestions). Never acted on automatically.
    fn caveat(&self, name: &PackageName, text: &str);

    /// Log an informational message.
    fn info(&self, msg: &str);

    /// Log a warning message.
    fn warning(&self, msg: &str);
}

impl<T: Reporter + ?Sized> Reporter for std::sync::Arc<T> {
    fn fetching(&self, name: &PackageName, version: &Version, url: &str) {
        (**self).fetching(name, version, url);
    }
    fn building(&self, name: &PackageName, version: &Version) {
        (**self).building(name, version);
    }
    fn done(&self, name: &PackageName, version: &Version, detail: &str) {
        (**self).done(name, version, detail);
    }
    fn failed(&self, name: &PackageName, version: &Version, reason: &str) {
        (**self).failed(name, version, reason);
    }
    fn caveat(&self, name: &PackageName, text: &str) {
        (**self).caveat(name, text);
    }
    fn info(&self, msg: &str) {
        (**self).info(msg);
    }
    fn warning(&self, msg: &str) {
        (**self).warning(msg);
    }
}

/// A no-op reporter for silent operations (e.g., verification, testing).
#[derive(Debug, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn fetching(&self, _: &PackageName, _: &Version, _: &str) {}
    fn building(&self, _: &PackageName, _: &Version) {}
    fn done(&self, _: &PackageName, _: &Version, _: &str) {}
    fn failed(&self, _: &PackageName, _: &Version, _: &str) {}
    fn caveat(&self, _: &PackageName, _: &str) {}
    fn info(&self, _: &str) {}
    fn warning(&self, _: &str) {}
}
