use std::sync::Arc;

use clap::Parser;
use clusterup::cli::{exit_code, open_local_backend, Cli, Commands, PlanCommands};
use clusterup::dispatch::ExecutionContext;
use clusterup::engine::Engine;
use clusterup::updater::Updater;
use clusterup_common::{ClusterupError, PhasePath};
use clusterup_runtime::{
    telemetry, Backend, FakeKubernetesClient, InMemoryClusterBackend, InMemoryPackageService, RecordingRemoteAgent,
};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    telemetry::init(cli.verbose);

    match run(cli).await {
        Ok(()) => {}
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(exit_code(&e));
        }
    }
}

/// Resolve the hostname this process is running as, used by the Engine
/// to decide whether a server-bound phase runs locally or is delegated.
fn this_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

async fn run(cli: Cli) -> Result<(), ClusterupError> {
    let binary_version = semver::Version::parse(env!("CARGO_PKG_VERSION"))
        .map_err(|e| ClusterupError::validation(format!("invalid crate version: {e}")))?;
    let config = cli.to_config(binary_version.clone())?;

    let local_backend = open_local_backend(&config)?;
    // No real consensus-store client exists yet: this stands in for the
    // cluster backend within a single process, same as in tests.
    let cluster_backend = Arc::new(InMemoryClusterBackend::new());

    let engine = Engine {
        cluster_backend: cluster_backend.clone(),
        local_backend: local_backend.clone(),
        remote_agent: Arc::new(RecordingRemoteAgent::new()),
        execution_context: ExecutionContext {
            cluster_name: config.cluster_name.clone(),
            backend: cluster_backend.clone(),
            packages: Arc::new(InMemoryPackageService::new()),
            kubernetes: Arc::new(FakeKubernetesClient::new()),
        },
        this_hostname: this_hostname(),
        binary_version,
        skip_version_check: config.skip_version_check,
        force: config.force,
    };

    match cli.command {
        Commands::Plan { command: PlanCommands::Execute { phase, operation_id, force: _, rollback, dry_run } } => {
            let operation_id = match operation_id {
                Some(id) => id,
                None => local_backend
                    .get_last_operation(&config.cluster_name)
                    .await?
                    .ok_or_else(|| {
                        ClusterupError::not_found_with_guidance(
                            format!("no operation recorded for cluster {}", config.cluster_name),
                            "pass --operation-id, or create a plan before executing a phase",
                        )
                    })?,
            };

            if rollback {
                let plan = engine.get_plan(&config.cluster_name, operation_id).await?;
                let rolled_back = engine.rollback_plan(plan, dry_run).await?;
                for phase_id in &rolled_back {
                    println!("{phase_id}");
                }
                return Ok(());
            }

            let phase_path = PhasePath::parse(&phase)?;
            if phase_path == PhasePath::root() {
                let updater = Updater::new(engine);
                updater.run(&config.cluster_name, operation_id).await
            } else {
                engine.execute_phase(&config.cluster_name, operation_id, &phase_path).await
            }
        }
        Commands::Status { operation_id } => {
            let operation_id = match operation_id {
                Some(id) => id,
                None => local_backend
                    .get_last_operation(&config.cluster_name)
                    .await?
                    .ok_or_else(|| {
                        ClusterupError::not_found(format!("no operation recorded for cluster {}", config.cluster_name))
                    })?,
            };
            let plan = engine.get_plan(&config.cluster_name, operation_id).await?;
            let leaves = plan.phases.iter().flat_map(|p| p.iter_subtree()).filter(|p| p.is_leaf()).count();
            println!("operation {operation_id}: {leaves} leaf phase(s)");
            Ok(())
        }
    }
}
