//! Runtime configuration: a typed struct built from CLI flags, an
//! optional `clusterup.toml`, and environment variable fallbacks, in
//! that precedence order (CLI highest).

use std::path::{Path, PathBuf};

use clusterup_common::{ClusterupError, PhasePath};
use semver::Version;
use serde::Deserialize;

/// Defaults loadable from `clusterup.toml`, a file-backed config layer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileDefaults {
    pub state_dir: Option<String>,
    pub cluster_name: Option<String>,
    pub backend_endpoint: Option<String>,
    pub max_parallel: Option<usize>,
}

impl FileDefaults {
    pub fn load(path: &Path) -> Result<Self, ClusterupError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ClusterupError::transient(format!("read {}: {e}", path.display())))?;
        toml::from_str(&raw).map_err(|e| ClusterupError::validation(format!("parse {}: {e}", path.display())))
    }
}

/// Everything the Engine, Plan Builder, and CLI need to start: the
/// persisted-state layout plus the `--phase`/`--force`/`--rollback`/
/// `--operation-id` CLI surface.
#[derive(Debug, Clone)]
pub struct Config {
    pub state_dir: PathBuf,
    pub cluster_name: String,
    pub operation_id: Option<uuid::Uuid>,
    pub binary_version: Version,
    pub skip_version_check: bool,
    pub force: bool,
    pub rollback: bool,
    pub phase: PhasePath,
    pub max_parallel: usize,
    pub backend_endpoint: Option<String>,
    pub verbose: bool,
}

impl Config {
    /// Compute `<stateDir>/backup/<operationId>/backup.db`.
    pub fn backup_db_path(&self, operation_id: uuid::Uuid) -> PathBuf {
        crate::backend::backup_db_path(&self.state_dir, operation_id)
    }

    /// Local backend file path for this cluster: `<stateDir>/local.db`.
    pub fn local_backend_path(&self) -> PathBuf {
        self.state_dir.join("local.db")
    }

    pub fn ensure_directories(&self) -> Result<(), ClusterupError> {
        std::fs::create_dir_all(&self.state_dir)
            .map_err(|e| ClusterupError::transient(format!("create state dir: {e}")))
    }
}

/// Builder for `Config`: canonicalizes paths, applies env var fallbacks,
/// then directory defaults from `clusterup.toml`, with explicit
/// constructor arguments always winning.
pub struct ConfigBuilder {
    pub state_dir: Option<PathBuf>,
    pub cluster_name: Option<String>,
    pub operation_id: Option<uuid::Uuid>,
    pub binary_version: Version,
    pub skip_version_check: bool,
    pub force: bool,
    pub rollback: bool,
    pub phase: PhasePath,
    pub max_parallel: Option<usize>,
    pub backend_endpoint: Option<String>,
    pub verbose: bool,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            state_dir: None,
            cluster_name: None,
            operation_id: None,
            binary_version: Version::new(0, 1, 0),
            skip_version_check: false,
            force: false,
            rollback: false,
            phase: PhasePath::root(),
            max_parallel: None,
            backend_endpoint: None,
            verbose: false,
        }
    }
}

impl ConfigBuilder {
    pub fn build(self) -> Result<Config, ClusterupError> {
        let state_dir = self
            .state_dir
            .or_else(|| std::env::var("CLUSTERUP_STATE_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(".clusterup"));

        let defaults = FileDefaults::load(&state_dir.join("clusterup.toml")).unwrap_or_default();

        let cluster_name = self
            .cluster_name
            .or_else(|| std::env::var("CLUSTERUP_CLUSTER_NAME").ok())
            .or(defaults.cluster_name)
            .ok_or_else(|| ClusterupError::validation("cluster_name is required"))?;

        let backend_endpoint = self
            .backend_endpoint
            .or_else(|| std::env::var("CLUSTERUP_BACKEND_ENDPOINT").ok())
            .or(defaults.backend_endpoint);

        let max_parallel = self.max_parallel.or(defaults.max_parallel).unwrap_or(8);

        Ok(Config {
            state_dir,
            cluster_name,
            operation_id: self.operation_id,
            binary_version: self.binary_version,
            skip_version_check: self.skip_version_check,
            force: self.force,
            rollback: self.rollback,
            phase: self.phase,
            max_parallel,
            backend_endpoint,
            verbose: self.verbose,
        })
    }
}
