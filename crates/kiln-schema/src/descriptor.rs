//! The declarative package descriptor.
//!
//! A descriptor names a piece of third-party software, its source artifact
//! and checksum, its dependency edges, an ordered list of OS-conditional
//! build stages, an optional bootstrap-toolchain table, and an optional
//! smoke test. Descriptors are parsed from `*.toml` files in a registry
//! directory and are immutable for the lifetime of a run.
//!
//! Conditional stages are modeled as a tagged union of platform predicates
//! evaluated against an explicit [`Platform`] value — variant dispatch, not
//! inheritance.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::hash::Sha256Digest;
use crate::platform::{Arch, Os, Platform};
use crate::types::{PackageName, Version};

/// A pinned source artifact: where to get it and what it must hash to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    /// Download URL for the artifact.
    pub url: String,
    /// SHA-256 digest the fetched bytes must match.
    pub sha256: Sha256Digest,
}

/// An unpinned development source (`--head` installs).
///
/// Head sources track a moving branch, so there is no meaningful checksum;
/// the fetcher skips hash verification for this artifact only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadRef {
    /// Repository or snapshot URL.
    pub url: String,
}

/// The kind of a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DepKind {
    /// Needed only while building; not linked at runtime.
    Build,
    /// Needed at runtime (default).
    #[default]
    Runtime,
    /// Needed only to run the smoke test.
    Test,
    /// Included only when explicitly requested.
    Optional,
}

/// One edge in the dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// Name of the package this descriptor depends on.
    pub on: PackageName,
    /// Kind of the edge; defaults to runtime.
    #[serde(default)]
    pub kind: DepKind,
}

/// An auxiliary artifact fetched and staged during install only.
///
/// Resources are miniature descriptors (url + hash). They are staged under
/// the build working directory and exposed to stages as
/// `${resource:NAME}`; they are never linked at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    /// Name the staged resource is addressed by in substitutions.
    pub name: String,
    /// Download URL for the resource artifact.
    pub url: String,
    /// SHA-256 digest the fetched bytes must match.
    pub sha256: Sha256Digest,
}

/// A predicate over the target platform, evaluated at plan-build time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Predicate {
    /// Matches when the target operating system equals the given one.
    Os(Os),
    /// Matches when the target architecture equals the given one.
    Arch(Arch),
    /// Matches when the named package is part of the resolved dependency set.
    Has(PackageName),
    /// Matches when every sub-predicate matches.
    All(Vec<Predicate>),
}

impl Predicate {
    /// Evaluate this predicate against a platform and the resolved
    /// dependency set.
    pub fn matches(&self, platform: &Platform, resolved: &BTreeSet<PackageName>) -> bool {
        match self {
            Self::Os(os) => *os == platform.os,
            Self::Arch(arch) => *arch == platform.arch,
            Self::Has(name) => resolved.contains(name),
            Self::All(preds) => preds.iter().all(|p| p.matches(platform, resolved)),
        }
    }
}

/// A unit of build work: invoke an external tool, or mutate a file in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Action {
    /// Invoke an external build tool with the given argument list.
    ///
    /// Argument strings and env values may contain substitution tokens
    /// (`${prefix}`, `${prefix:NAME}`, `${bootstrap}`, `${resource:NAME}`,
    /// `${version}`, `${jobs}`) resolved at plan-build time.
    Invoke {
        /// Program to run (resolved via the build environment's `PATH`).
        program: String,
        /// Arguments passed to the program.
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment entries applied on top of the controlled
        /// build environment for this action only.
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    /// Replace a string in a file under the install prefix.
    ///
    /// Used for post-install path fix-ups (e.g. patching a hard-coded
    /// linker path in an installed Makefile).
    Patch {
        /// File to mutate, relative to the install prefix.
        file: String,
        /// Exact string that must be present in the file.
        find: String,
        /// Replacement string.
        replace: String,
    },
}

/// One arm of an OS-branch group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchArm {
    /// Predicate guarding this arm.
    pub when: Predicate,
    /// Actions emitted when this arm is selected.
    pub actions: Vec<Action>,
}

/// A conditional build stage.
///
/// `Run` stages are skipped when their guard does not match. `Select`
/// stages are OS-branch groups: exactly one arm (or the default) is taken
/// per platform, in declaration order; a `Select` with no applicable arm
/// and no default makes the whole descriptor unbuildable on that platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StageDef {
    /// Mutually exclusive alternatives; exactly one is selected.
    Select {
        /// Arms tried in declaration order; first match wins.
        select: Vec<BranchArm>,
        /// Fallback actions when no arm matches.
        #[serde(default)]
        default: Option<Vec<Action>>,
    },
    /// A single action, optionally guarded.
    Run {
        /// Guard; the stage is skipped when it does not match.
        #[serde(default)]
        when: Option<Predicate>,
        /// The action to perform.
        run: Action,
    },
}

/// One row of a bootstrap-toolchain table.
///
/// A package that needs a working prior version of itself to build declares
/// one entry per supported platform. `arch = None` means the entry covers
/// every architecture on that operating system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapEntry {
    /// Operating system this bootstrap artifact is built for.
    pub os: Os,
    /// Architecture, or `None` for any architecture on `os`.
    #[serde(default)]
    pub arch: Option<Arch>,
    /// Artifact location and checksum.
    #[serde(flatten)]
    pub source: SourceRef,
}

/// The full bootstrap table of a descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BootstrapSpec(pub Vec<BootstrapEntry>);

impl BootstrapSpec {
    /// Select the bootstrap artifact for a platform.
    ///
    /// Entries are matched in declaration order; an entry with no
    /// architecture matches any architecture on its operating system.
    /// Returns `None` when the platform is not listed — callers must treat
    /// that as a hard error, never fall back to a host toolchain.
    pub fn select(&self, platform: &Platform) -> Option<&BootstrapEntry> {
        self.0
            .iter()
            .find(|e| e.os == platform.os && e.arch.is_none_or(|a| a == platform.arch))
    }
}

/// The smoke test attached to a descriptor.
///
/// Runs in an isolated scratch directory after a successful install; a
/// failure flags the install as unverified but does not roll it back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSpec {
    /// Conditional test stages, same shape as build stages.
    pub stages: Vec<StageDef>,
}

/// How a prior installed-state record's version stamp is judged against the
/// version being installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CompatPolicy {
    /// Compatible when the major versions are equal (default).
    #[default]
    SameMajor,
    /// Compatible when the `major.minor` prefixes are equal.
    SameMajorMinor,
    /// Prior state is never considered compatible.
    Never,
}

impl CompatPolicy {
    /// Whether a prior version stamp is compatible with the target version.
    pub fn compatible(&self, prior_stamp: &str, target: &Version) -> bool {
        let prior = Version::new(prior_stamp.trim());
        match self {
            Self::SameMajor => prior.major() == target.major(),
            Self::SameMajorMinor => prior.major_minor() == target.major_minor(),
            Self::Never => false,
        }
    }
}

/// Declares that a package keeps persistent on-disk state across versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSpec {
    /// Package family the state belongs to (shared across versioned
    /// descriptors like `postgresql@14` / `postgresql@15`).
    pub family: String,
    /// Compatibility predicate for prior records; defaults to same-major.
    #[serde(default)]
    pub compat: CompatPolicy,
}

/// A complete package descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    /// Unique package name.
    pub name: PackageName,
    /// Version this descriptor builds.
    pub version: Version,
    /// License tag (SPDX-style).
    #[serde(default)]
    pub license: Option<String>,
    /// Pinned source artifact.
    pub source: SourceRef,
    /// Unpinned development source for `--head` installs.
    #[serde(default)]
    pub head: Option<HeadRef>,
    /// Dependency edges, by kind.
    #[serde(default, rename = "depends")]
    pub depends: Vec<DependencyEdge>,
    /// Install-time resource bundles.
    #[serde(default)]
    pub resources: Vec<Resource>,
    /// Ordered conditional build stages.
    #[serde(default)]
    pub stages: Vec<StageDef>,
    /// Bootstrap-toolchain table, when the package needs a prior version of
    /// itself to build.
    #[serde(default)]
    pub bootstrap: Option<BootstrapSpec>,
    /// Optional smoke test.
    #[serde(default)]
    pub test: Option<TestSpec>,
    /// Persistent-state declaration for the migration detector.
    #[serde(default)]
    pub state: Option<StateSpec>,
    /// Free-form guidance printed after a successful install.
    #[serde(default)]
    pub caveats: Option<String>,
}

impl Descriptor {
    /// Load and parse a descriptor from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error naming the offending file if it cannot be read or
    /// does not conform to the descriptor schema.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read descriptor {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse descriptor {}", path.display()))
    }

    /// Dependency edges restricted to the kinds the resolver follows.
    ///
    /// Optional edges are excluded unless `include_optional` is set.
    pub fn edges(&self, include_optional: bool) -> impl Iterator<Item = &DependencyEdge> {
        self.depends
            .iter()
            .filter(move |e| include_optional || e.kind != DepKind::Optional)
    }
}

/// The full set of descriptors known to a run, keyed by package name.
///
/// Supplied by an external loader; [`DescriptorSet::load_dir`] is a
/// convenience for the common registry-directory layout.
#[derive(Debug, Clone, Default)]
pub struct DescriptorSet {
    packages: BTreeMap<PackageName, Descriptor>,
}

impl DescriptorSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a descriptor, replacing any previous entry with the same name.
    pub fn upsert(&mut self, desc: Descriptor) {
        self.packages.insert(desc.name.clone(), desc);
    }

    /// Look up a descriptor by name.
    pub fn find(&self, name: &PackageName) -> Option<&Descriptor> {
        self.packages.get(name)
    }

    /// Iterate over all descriptors in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Descriptor> {
        self.packages.values()
    }

    /// Number of descriptors in the set.
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Load every `*.toml` descriptor in a registry directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read or any descriptor
    /// file fails to parse; the error names the offending file.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut set = Self::new();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read registry directory {}", dir.display()))?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "toml") {
                set.upsert(Descriptor::from_file(&path)?);
            }
        }

        Ok(set)
    }
}

impl FromIterator<Descriptor> for DescriptorSet {
    fn from_iter<I: IntoIterator<Item = Descriptor>>(iter: I) -> Self {
        let mut set = Self::new();
        for desc in iter {
            set.upsert(desc);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LDC_LIKE: &str = r#"
name = "ldc"
version = "1.30.0"
license = "BSD-3-Clause"

[source]
url = "https://example.com/ldc-1.30.0-src.tar.gz"
sha256 = "fdbb376f08242d917922a6a22a773980217fafa310046fc5d6459490af23dacd"

[head]
url = "https://example.com/ldc.git"

[[depends]]
on = "cmake"
kind = "build"

[[depends]]
on = "llvm"

[[bootstrap]]
os = "macos"
arch = "arm64"
url = "https://example.com/ldc2-1.28.1-osx-arm64.tar.xz"
sha256 = "9bddeb1b2c277019cf116b2572b5ee1819d9f99fe63602c869ebe42ffb813aed"

[[bootstrap]]
os = "linux"
url = "https://example.com/ldc2-1.26.0-linux-x86_64.tar.xz"
sha256 = "06063a92ab2d6c6eebc10a4a9ed4bef3d0214abc9e314e0cd0546ee0b71b341e"

[[stages]]
run = { program = "cmake", args = ["-S", ".", "-B", "build", "-DD_COMPILER=${bootstrap}/bin/ldmd2"] }

[[stages]]

[[stages.select]]
when = { os = "macos" }
actions = [{ program = "cmake", args = ["--build", "build"] }]

[[stages.select]]
when = { os = "linux" }
actions = [{ program = "cmake", args = ["--build", "build", "--", "-j${jobs}"] }]

[[stages]]
run = { program = "cmake", args = ["--install", "build"] }

[test]
stages = [{ run = { program = "${prefix}/bin/ldc2", args = ["test.d"] } }]
"#;

    #[test]
    fn parses_full_descriptor() {
        let desc: Descriptor = toml::from_str(LDC_LIKE).unwrap();
        assert_eq!(desc.name, "ldc");
        assert_eq!(desc.version, "1.30.0");
        assert_eq!(desc.depends.len(), 2);
        assert_eq!(desc.depends[0].kind, DepKind::Build);
        assert_eq!(desc.depends[1].kind, DepKind::Runtime);
        assert_eq!(desc.stages.len(), 3);
        assert!(desc.head.is_some());
        assert!(desc.test.is_some());
    }

    #[test]
    fn bootstrap_selects_by_platform() {
        let desc: Descriptor = toml::from_str(LDC_LIKE).unwrap();
        let table = desc.bootstrap.unwrap();

        let mac = table
            .select(&Platform::new(Os::Macos, Arch::Arm64))
            .unwrap();
        assert!(mac.source.url.contains("osx-arm64"));

        // Linux entry has no arch, so it covers both
        assert!(table.select(&Platform::new(Os::Linux, Arch::X86_64)).is_some());
        assert!(table.select(&Platform::new(Os::Linux, Arch::Arm64)).is_some());

        // macOS x86_64 is not listed
        assert!(table.select(&Platform::new(Os::Macos, Arch::X86_64)).is_none());
    }

    #[test]
    fn stage_variants_deserialize() {
        let desc: Descriptor = toml::from_str(LDC_LIKE).unwrap();
        assert!(matches!(desc.stages[0], StageDef::Run { .. }));
        assert!(matches!(desc.stages[1], StageDef::Select { .. }));
    }

    #[test]
    fn predicate_evaluation() {
        let resolved: BTreeSet<PackageName> = ["llvm"].into_iter().map(PackageName::new).collect();
        let linux = Platform::new(Os::Linux, Arch::X86_64);

        assert!(Predicate::Os(Os::Linux).matches(&linux, &resolved));
        assert!(!Predicate::Os(Os::Macos).matches(&linux, &resolved));
        assert!(Predicate::Has(PackageName::new("llvm")).matches(&linux, &resolved));
        assert!(!Predicate::Has(PackageName::new("gcc")).matches(&linux, &resolved));
        assert!(
            Predicate::All(vec![Predicate::Os(Os::Linux), Predicate::Arch(Arch::X86_64)])
                .matches(&linux, &resolved)
        );
        assert!(
            !Predicate::All(vec![Predicate::Os(Os::Linux), Predicate::Arch(Arch::Arm64)])
                .matches(&linux, &resolved)
        );
    }

    #[test]
    fn compat_policy_rules() {
        assert!(CompatPolicy::SameMajor.compatible("14", &Version::new("14.5")));
        assert!(!CompatPolicy::SameMajor.compatible("14", &Version::new("15.0")));
        assert!(CompatPolicy::SameMajorMinor.compatible("14.5", &Version::new("14.5.2")));
        assert!(!CompatPolicy::SameMajorMinor.compatible("14.4", &Version::new("14.5")));
        assert!(!CompatPolicy::Never.compatible("14", &Version::new("14.0")));
    }

    #[test]
    fn load_dir_reads_toml_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ldc.toml"), LDC_LIKE).unwrap();
        std::fs::write(dir.path().join("README.md"), "not a descriptor").unwrap();

        let set = DescriptorSet::load_dir(dir.path()).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.find(&PackageName::new("ldc")).is_some());
    }

    #[test]
    fn load_dir_names_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.toml"), "name = ").unwrap();

        let err = DescriptorSet::load_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("broken.toml"));
    }
}
