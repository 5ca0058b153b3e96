//! The `kiln install` command.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use kiln_core::fetch::{Fetcher, HttpSource};
use kiln_core::invoke::ProcessInvoker;
use kiln_core::orchestrator::{Orchestrator, OrchestratorOptions};
use kiln_core::{Reporter, Store};
use kiln_schema::{DescriptorSet, PackageName, Platform};

use crate::ui::ConsoleReporter;

/// Everything `kiln install` needs, gathered from the command line.
#[derive(Debug)]
pub struct InstallArgs {
    pub store: Option<PathBuf>,
    pub package: String,
    pub version: Option<String>,
    pub head: bool,
    pub test: bool,
    pub optional: bool,
    pub registry: Option<PathBuf>,
    pub jobs: Option<usize>,
    pub concurrency: usize,
    pub timeout: Option<u64>,
    pub keep_failed: bool,
}

/// Resolve, build, and install one package.
///
/// Orchestration failures propagate as [`kiln_core::OrchestrateError`] so
/// the caller can map them to distinct exit codes.
pub async fn run(args: InstallArgs) -> Result<()> {
    let store_root = args
        .store
        .or_else(Store::default_root)
        .context("Could not determine store root. Set KILN_HOME to override.")?;
    let store = Store::open(&store_root)
        .with_context(|| format!("Failed to open store at {}", store_root.display()))?;

    let registry = args
        .registry
        .unwrap_or_else(|| store.root().join("registry"));
    let set = DescriptorSet::load_dir(&registry)?;
    if set.is_empty() {
        bail!(
            "No descriptors found in {}. Point --registry at a descriptor directory.",
            registry.display()
        );
    }

    let name = PackageName::new(&args.package);

    // Descriptors pin one version each; a mismatched request is a
    // resolution failure, not something to silently substitute.
    if let Some(requested) = &args.version {
        let desc = set
            .find(&name)
            .with_context(|| format!("Package '{name}' not found in registry"))?;
        if desc.version != requested.as_str() {
            bail!(
                "Version {requested} of '{name}' is not available; the registry provides {}",
                desc.version
            );
        }
    }

    let reporter: Arc<dyn Reporter> = Arc::new(ConsoleReporter);
    let timeout = args.timeout.map(Duration::from_secs);
    let fetcher = Arc::new(Fetcher::new(
        Arc::new(HttpSource::new(reqwest::Client::new())),
        store.cache_dir(),
        timeout,
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        set,
        store,
        fetcher,
        Arc::new(ProcessInvoker),
        Arc::clone(&reporter),
        OrchestratorOptions {
            platform: Platform::current(),
            jobs: args.jobs.unwrap_or_else(num_cpus::get),
            concurrency: args.concurrency,
            timeout,
            include_optional: args.optional,
            keep_failed: args.keep_failed,
            head: args.head,
        },
    ));

    // Ctrl-C cancels the run: no new stages launch, in-flight tools are
    // killed, and scratch space is released as on ordinary failure.
    let cancel_handle = Arc::clone(&orchestrator);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            cancel_handle.cancel();
        }
    });

    let prefix = orchestrator.install(&name, args.test).await?;
    reporter.info(&format!("Installed to {}", prefix.display()));

    Ok(())
}
