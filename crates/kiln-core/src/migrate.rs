//! Installed-state migration detection.
//!
//! Packages with persistent on-disk state (databases, mail indexes) keep a
//! state record per package family: a data directory plus a version stamp.
//! Older installs used an unversioned legacy location; current installs
//! use a location suffixed with the major version. On every install the
//! detector classifies the prior state:
//!
//! - no legacy record → fresh versioned record;
//! - legacy stamp compatible with the target version → keep using the
//!   legacy record and *suggest* a manual migration;
//! - incompatible → leave the legacy record untouched and create an
//!   independent versioned record.
//!
//! Cross-version data formats are not guaranteed compatible, so the
//! detector only informs, never moves or deletes data. The compatibility
//! predicate is per-family configuration ([`CompatPolicy`]), defaulting to
//! major-version equality.

use std::path::{Path, PathBuf};

use kiln_schema::{CompatPolicy, StateSpec, Version};

/// Name of the version stamp file inside a state record.
const STAMP_FILE: &str = "version";

/// Classification of pre-existing state for one package family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateDisposition {
    /// No prior record; a fresh versioned record will be created.
    NoPriorState {
        /// The versioned record location for this install.
        target: PathBuf,
    },
    /// A legacy record exists and its stamp is compatible; the install
    /// keeps using it, and the user is told how to migrate it by hand.
    CompatiblePriorState {
        /// The legacy (unversioned) record location.
        legacy: PathBuf,
        /// The versioned location a manual migration would move it to.
        target: PathBuf,
        /// The legacy record's version stamp.
        prior_stamp: String,
    },
    /// A legacy record exists with an incompatible stamp; it is left
    /// untouched and an independent versioned record is created.
    IncompatiblePriorState {
        /// The legacy (unversioned) record location, untouched.
        legacy: PathBuf,
        /// The new versioned record location.
        target: PathBuf,
        /// The legacy record's version stamp.
        prior_stamp: String,
    },
}

impl StateDisposition {
    /// User-facing migration guidance, present only for compatible prior
    /// state. Nothing is ever migrated automatically.
    pub fn migration_suggestion(&self) -> Option<String> {
        match self {
            Self::CompatiblePriorState { legacy, target, .. } => Some(format!(
                "Previous versions shared the state directory {legacy}.\n\
                 You can migrate to a versioned directory by running:\n  \
                 mv -v \"{legacy}\" \"{target}\"\n\
                 (Make sure the package's services are stopped first.)",
                legacy = legacy.display(),
                target = target.display(),
            )),
            _ => None,
        }
    }

    /// The record directory this install should use.
    pub fn record_dir(&self) -> &Path {
        match self {
            Self::NoPriorState { target } | Self::IncompatiblePriorState { target, .. } => target,
            Self::CompatiblePriorState { legacy, .. } => legacy,
        }
    }
}

/// Detects and records installed state for package families.
#[derive(Debug)]
pub struct MigrationDetector<'a> {
    state_root: &'a Path,
}

impl<'a> MigrationDetector<'a> {
    /// Create a detector over the store's state directory.
    pub fn new(state_root: &'a Path) -> Self {
        Self { state_root }
    }

    /// Legacy (unversioned) record location for a family.
    pub fn legacy_dir(&self, spec: &StateSpec) -> PathBuf {
        self.state_root.join(&spec.family)
    }

    /// Versioned record location for a family at a target version.
    pub fn versioned_dir(&self, spec: &StateSpec, target: &Version) -> PathBuf {
        self.state_root
            .join(format!("{}@{}", spec.family, target.major()))
    }

    /// Classify prior state for an install of `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing stamp file cannot be read.
    pub fn detect(
        &self,
        spec: &StateSpec,
        target: &Version,
    ) -> std::io::Result<StateDisposition> {
        let legacy = self.legacy_dir(spec);
        let versioned = self.versioned_dir(spec, target);

        let stamp_path = legacy.join(STAMP_FILE);
        if !stamp_path.exists() {
            return Ok(StateDisposition::NoPriorState { target: versioned });
        }

        let prior_stamp = std::fs::read_to_string(&stamp_path)?.trim().to_string();

        if spec.compat.compatible(&prior_stamp, target) {
            Ok(StateDisposition::CompatiblePriorState {
                legacy,
                target: versioned,
                prior_stamp,
            })
        } else {
            Ok(StateDisposition::IncompatiblePriorState {
                legacy,
                target: versioned,
                prior_stamp,
            })
        }
    }

    /// Materialize the record for a completed install.
    ///
    /// Creates the versioned record (with its stamp) for fresh and
    /// incompatible dispositions; keeps using the legacy record untouched
    /// for compatible ones. Returns the record directory in use.
    ///
    /// # Errors
    ///
    /// Returns an error if the record directory or stamp cannot be created.
    pub fn commit(
        &self,
        target: &Version,
        disposition: &StateDisposition,
    ) -> std::io::Result<PathBuf> {
        match disposition {
            StateDisposition::NoPriorState { target: dir }
            | StateDisposition::IncompatiblePriorState { target: dir, .. } => {
                std::fs::create_dir_all(dir)?;
                std::fs::write(dir.join(STAMP_FILE), target.major())?;
                Ok(dir.clone())
            }
            StateDisposition::CompatiblePriorState { legacy, .. } => Ok(legacy.clone()),
        }
    }
}
