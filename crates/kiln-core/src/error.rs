//! Error taxonomy for the orchestration engine.
//!
//! Resolution-time errors (cycle, unresolved dependency, no applicable
//! platform, bootstrap mismatch) are fatal and reported before any build
//! work starts. Fetch and stage errors abort only the affected descriptor's
//! build and, transitively, its dependents. Test failures are reported
//! distinctly and never roll back a completed install.

use kiln_schema::{PackageName, Platform, Version};
use thiserror::Error;

use crate::fetch::FetchError;

/// Everything that can go wrong in one orchestration run.
///
/// Every variant carries enough context (package, version, platform, stage
/// index) to be actionable without re-running at higher verbosity.
#[derive(Error, Debug)]
pub enum OrchestrateError {
    /// The dependency graph contains a cycle.
    #[error("dependency cycle detected: {}", cycle_list(.members))]
    Cycle {
        /// Every package participating in the cycle, in walk order.
        members: Vec<PackageName>,
    },

    /// A dependency edge points at a package not in the descriptor set.
    #[error("package '{dependent}' depends on '{missing}', which is not in the descriptor set")]
    UnresolvedDependency {
        /// The package whose edge could not be resolved.
        dependent: PackageName,
        /// The missing target.
        missing: PackageName,
    },

    /// An OS-branch group has no applicable arm and no default.
    #[error("no build stage of '{package}' applies to {platform}")]
    NoApplicablePlatform {
        /// The unbuildable package.
        package: PackageName,
        /// The platform the plan was being bound to.
        platform: Platform,
    },

    /// The bootstrap table has no entry for the target platform.
    #[error("'{package}' declares no bootstrap toolchain for {platform}")]
    BootstrapMismatch {
        /// The package that requires a bootstrap artifact.
        package: PackageName,
        /// The unlisted platform.
        platform: Platform,
    },

    /// A descriptor references something it never declared (an unknown
    /// substitution token, an undeclared resource name).
    #[error("invalid descriptor '{package}': {message}")]
    InvalidDescriptor {
        /// The descriptor with the authoring error.
        package: PackageName,
        /// What was wrong.
        message: String,
    },

    /// An artifact could not be fetched or failed hash verification.
    #[error("fetch failed for '{package}': {source}")]
    Fetch {
        /// The package whose artifact failed.
        package: PackageName,
        /// The underlying fetch failure.
        #[source]
        source: FetchError,
    },

    /// A build stage exited non-zero, timed out, or a patch did not apply.
    #[error("stage {stage} of '{package}@{version}' failed on {platform}:\n{output}")]
    StageFailed {
        /// The package being built.
        package: PackageName,
        /// Its version.
        version: Version,
        /// The platform the plan was bound to.
        platform: Platform,
        /// Zero-based index of the failed stage in the resolved plan.
        stage: usize,
        /// Tail of the captured tool output.
        output: String,
    },

    /// The post-install smoke test failed; the install itself stands.
    #[error("smoke test for '{package}@{version}' failed:\n{output}")]
    TestFailed {
        /// The installed package.
        package: PackageName,
        /// Its version.
        version: Version,
        /// Tail of the captured test output.
        output: String,
    },

    /// A dependency failed to build, so this package was never attempted.
    #[error("build of '{package}' aborted: dependency '{failed}' did not build")]
    DependencyAborted {
        /// The package whose build was abandoned.
        package: PackageName,
        /// The dependency that failed.
        failed: PackageName,
    },

    /// The run was cancelled before this package completed.
    #[error("run cancelled")]
    Cancelled,

    /// A failure first produced for another requester of the same
    /// (name, version) build; the outcome is shared, not recomputed.
    #[error("{0}")]
    Shared(std::sync::Arc<OrchestrateError>),

    /// Filesystem failure outside any single stage.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestrateError {
    /// Process exit code for a driving tool: 2 for resolution failures,
    /// 3 for fetch/build failures, 4 for test failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Cycle { .. }
            | Self::UnresolvedDependency { .. }
            | Self::NoApplicablePlatform { .. }
            | Self::BootstrapMismatch { .. }
            | Self::InvalidDescriptor { .. } => 2,
            Self::Fetch { .. }
            | Self::StageFailed { .. }
            | Self::DependencyAborted { .. }
            | Self::Cancelled
            | Self::Io(_) => 3,
            Self::TestFailed { .. } => 4,
            Self::Shared(inner) => inner.exit_code(),
        }
    }

    /// Whether this error is detected at resolution time, before any build
    /// work starts.
    pub fn is_resolution_error(&self) -> bool {
        self.exit_code() == 2
    }

    /// Strip [`Shared`](Self::Shared) wrappers to reach the original error.
    pub fn unshared(&self) -> &OrchestrateError {
        match self {
            Self::Shared(inner) => inner.unshared(),
            other => other,
        }
    }
}

fn cycle_list(members: &[PackageName]) -> String {
    members
        .iter()
        .map(PackageName::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}
