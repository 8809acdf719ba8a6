//! CLI surface: `plan execute --phase <path> [--operation-id
//! <id>] [--force] [--rollback]`, plus `status` for the Updater's
//! progress snapshot, built with the same `Cli`/`Commands` clap-derive
//! shape used throughout this binary's `main.rs`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use clusterup_common::{ClusterupError, PhasePath};
use clusterup_runtime::{Config, ConfigBuilder, LocalFileBackend};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "clusterup")]
#[command(version, about = "Distributed cluster-upgrade orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, env = "CLUSTERUP_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    #[arg(long, global = true, env = "CLUSTERUP_CLUSTER_NAME")]
    pub cluster_name: Option<String>,

    #[arg(long, global = true, env = "CLUSTERUP_BACKEND_ENDPOINT")]
    pub backend_endpoint: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Drive a plan's phases to completion.
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },
    /// Report the current operation's progress snapshot.
    Status {
        #[arg(long)]
        operation_id: Option<Uuid>,
    },
}

#[derive(Subcommand)]
pub enum PlanCommands {
    Execute {
        /// The phase subtree to drive; defaults to the root, "/".
        #[arg(long, default_value = "/")]
        phase: String,
        #[arg(long)]
        operation_id: Option<Uuid>,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        rollback: bool,
        #[arg(long)]
        dry_run: bool,
    },
}

impl Cli {
    /// Build a runtime `Config` from parsed CLI flags, layering env vars
    /// and `clusterup.toml` underneath per `ConfigBuilder`'s precedence.
    pub fn to_config(&self, binary_version: semver::Version) -> Result<Config, ClusterupError> {
        let (operation_id, phase, force, rollback) = match &self.command {
            Commands::Plan { command: PlanCommands::Execute { operation_id, phase, force, rollback, .. } } => {
                (*operation_id, PhasePath::parse(phase)?, *force, *rollback)
            }
            Commands::Status { operation_id } => (*operation_id, PhasePath::root(), false, false),
        };
        ConfigBuilder {
            state_dir: self.state_dir.clone(),
            cluster_name: self.cluster_name.clone(),
            operation_id,
            binary_version,
            skip_version_check: false,
            force,
            rollback,
            phase,
            max_parallel: None,
            backend_endpoint: self.backend_endpoint.clone(),
            verbose: self.verbose,
        }
        .build()
    }
}

/// Map a `ClusterupError` onto a process exit code.
pub fn exit_code(err: &ClusterupError) -> i32 {
    match err {
        ClusterupError::Validation { .. } | ClusterupError::VersionMismatch { .. } | ClusterupError::Coordinator { .. } => 2,
        ClusterupError::PhaseFailure { .. } => 1,
        ClusterupError::NotFound { .. } | ClusterupError::AlreadyExists { .. } | ClusterupError::Transient { .. } => 1,
    }
}

pub fn open_local_backend(config: &Config) -> Result<Arc<LocalFileBackend>, ClusterupError> {
    config.ensure_directories()?;
    Ok(Arc::new(LocalFileBackend::open(&config.local_backend_path())?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_and_version_mismatch_map_to_exit_code_two() {
        assert_eq!(exit_code(&ClusterupError::validation("x")), 2);
        assert_eq!(
            exit_code(&ClusterupError::VersionMismatch { expected: "1.0.0".into(), found: "0.9.0".into() }),
            2
        );
    }

    #[test]
    fn phase_failure_maps_to_exit_code_one() {
        assert_eq!(exit_code(&ClusterupError::phase_failure("/a", "boom")), 1);
    }

    #[test]
    fn parses_plan_execute_with_phase_and_force() {
        let cli = Cli::parse_from([
            "clusterup",
            "--cluster-name",
            "prod",
            "plan",
            "execute",
            "--phase",
            "/masters",
            "--force",
        ]);
        match cli.command {
            Commands::Plan { command: PlanCommands::Execute { phase, force, .. } } => {
                assert_eq!(phase, "/masters");
                assert!(force);
            }
            _ => panic!("expected Plan::Execute"),
        }
    }
}
