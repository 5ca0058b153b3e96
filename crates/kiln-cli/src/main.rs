//! kiln - a source build orchestrator CLI

use clap::Parser;
use tracing_subscriber::EnvFilter;

use kiln_cli::{Cli, Commands, cmd};
use kiln_core::OrchestrateError;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Install {
            package,
            version,
            head,
            test,
            optional,
            registry,
            jobs,
            concurrency,
            timeout,
            keep_failed,
        } => {
            cmd::install::run(cmd::install::InstallArgs {
                store: cli.store,
                package,
                version,
                head,
                test,
                optional,
                registry,
                jobs,
                concurrency,
                timeout,
                keep_failed,
            })
            .await
        }
    };

    if let Err(err) = result {
        eprintln!("error: {err:#}");
        // Resolution, build, and test failures exit distinctly; anything
        // else (bad registry, unusable store) counts as resolution.
        let code = err
            .downcast_ref::<OrchestrateError>()
            .map_or(2, OrchestrateError::exit_code);
        std::process::exit(code);
    }
}
