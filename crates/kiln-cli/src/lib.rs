//! kiln - a source build orchestrator
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
//!
//! Drives the `kiln-core` engine from the command line: loads a registry of
//! package descriptors, resolves the dependency graph, and builds the
//! requested package from source.
//!
//! # Exit codes
//!
//! - `0` — full success
//! - `2` — resolution failure (cycle, unresolved dependency, no applicable
//!   platform, bootstrap mismatch, bad descriptor)
//! - `3` — fetch or build failure
//! - `4` — smoke test failure (the install itself stands)

pub mod cmd;
pub mod ui;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "kiln")]
#[command(author, version, about = "kiln - a source build orchestrator")]
pub struct Cli {
    /// Root of the kiln store (defaults to $KILN_HOME or ~/.kiln)
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Build and install a package from its descriptor
    Install {
        /// Package name
        package: String,
        /// Specific version; must match what the registry provides
        #[arg(long = "version", value_name = "VERSION")]
        version: Option<String>,
        /// Build from the unpinned head source instead of the release
        #[arg(long)]
        head: bool,
        /// Run the package's smoke test after installing
        #[arg(long)]
        test: bool,
        /// Include optional dependencies
        #[arg(long)]
        optional: bool,
        /// Directory of descriptor files (defaults to <store>/registry)
        #[arg(long)]
        registry: Option<PathBuf>,
        /// Build tool parallelism (defaults to the logical CPU count)
        #[arg(long)]
        jobs: Option<usize>,
        /// Maximum packages building concurrently
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
        /// Per-invocation timeout in seconds for fetches and build tools
        #[arg(long)]
        timeout: Option<u64>,
        /// Keep the working directory of a failed build for inspection
        #[arg(long)]
        keep_failed: bool,
    },
}
