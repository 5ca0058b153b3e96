//! Shared types and the descriptor model for kiln.
//!
//! This crate defines the declarative package descriptor (identity, source,
//! dependency edges, conditional build stages, bootstrap table, test spec)
//! and the small vocabulary types the rest of the engine speaks:
//! [`PackageName`], [`Version`], [`Sha256Digest`], [`Platform`].
//!
//! Descriptors carry no logic of their own; everything here is data that the
//! orchestration engine in `kiln-core` interprets.

pub mod descriptor;
pub mod hash;
pub mod platform;
pub mod types;

pub use descriptor::{
    Action, BootstrapEntry, BootstrapSpec, BranchArm, CompatPolicy, DepKind, DependencyEdge,
    Descriptor, DescriptorSet, HeadRef, Predicate, Resource, SourceRef, StageDef, StateSpec,
    TestSpec,
};
pub use hash::Sha256Digest;
pub use platform::{Arch, Os, Platform};
pub use types::{PackageName, Version};
