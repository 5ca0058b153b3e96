//! kiln-core: the build orchestration engine.
//!
//! Takes a set of declarative package descriptors (`kiln-schema`), resolves
//! the dependency graph, binds each descriptor to a concrete platform plan,
//! fetches and verifies artifacts, executes build stages in scoped working
//! directories, and detects installed-state migrations across versions.

pub mod bootstrap;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod invoke;
pub mod migrate;
pub mod orchestrator;
pub mod plan;
pub mod reporter;
pub mod resolver;
pub mod store;
pub mod workdir;

pub use error::OrchestrateError;
pub use orchestrator::{Orchestrator, OrchestratorOptions};
pub use reporter::{NullReporter, Reporter};
pub use store::Store;

/// User Agent string for fetch operations
pub const USER_AGENT: &str = concat!("kiln-core/", env!("CARGO_PKG_VERSION"));
