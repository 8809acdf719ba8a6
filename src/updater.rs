//! The Updater: the top-level operation controller that wraps an
//! `Engine`, exposes a point-in-time status snapshot for `clusterup
//! status`, and shuts down per-node agents once the operation finishes.
//!
//! The status/progress snapshot shape is an `Arc<RwLock<...>>` holding a
//! `status` enum plus a progress struct, read via a cheap `.clone()`
//! snapshot method.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use clusterup_common::{ClusterupError, PhasePath, Plan};
use tokio::sync::RwLock;
use tracing::{error, info};
use uuid::Uuid;

use crate::engine::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeStatus {
    Idle,
    Running,
    Completed,
    Failed,
    RollingBack,
}

impl std::fmt::Display for UpgradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpgradeStatus::Idle => "idle",
            UpgradeStatus::Running => "running",
            UpgradeStatus::Completed => "completed",
            UpgradeStatus::Failed => "failed",
            UpgradeStatus::RollingBack => "rolling_back",
        };
        f.write_str(s)
    }
}

/// A point-in-time snapshot of an operation, cheap to clone and safe to
/// hand to the CLI's `status` subcommand while the engine keeps running.
#[derive(Debug, Clone)]
pub struct UpgradeProgress {
    pub operation_id: Option<Uuid>,
    pub status: UpgradeStatus,
    pub percent: u8,
    pub current_phase: Option<PhasePath>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl UpgradeProgress {
    fn idle() -> Self {
        Self {
            operation_id: None,
            status: UpgradeStatus::Idle,
            percent: 0,
            current_phase: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Orchestrates one operation end to end: runs the engine, then shuts
/// down agents on success. Holds its status behind a lock so a
/// concurrently-running `clusterup status` call gets a consistent
/// snapshot without blocking the run.
pub struct Updater {
    engine: Engine,
    progress: Arc<RwLock<UpgradeProgress>>,
}

impl Updater {
    pub fn new(engine: Engine) -> Self {
        Self { engine, progress: Arc::new(RwLock::new(UpgradeProgress::idle())) }
    }

    pub async fn progress(&self) -> UpgradeProgress {
        self.progress.read().await.clone()
    }

    /// Run a whole plan to completion (or failure), updating the shared
    /// progress snapshot as phases advance, and finalizing via
    /// `Engine::complete` once the drive loop exits.
    pub async fn run(&self, cluster_name: &str, operation_id: Uuid) -> Result<(), ClusterupError> {
        {
            let mut progress = self.progress.write().await;
            progress.operation_id = Some(operation_id);
            progress.status = UpgradeStatus::Running;
            progress.started_at = Some(Utc::now());
        }
        info!(cluster_name, %operation_id, "starting upgrade operation");

        let outcome = self.engine.execute_plan(cluster_name, operation_id).await;
        let plan = self.engine.get_plan(cluster_name, operation_id).await;

        {
            let mut progress = self.progress.write().await;
            progress.finished_at = Some(Utc::now());
            match &outcome {
                Ok(()) => {
                    progress.status = UpgradeStatus::Completed;
                    progress.percent = 100;
                    info!(cluster_name, %operation_id, "upgrade operation completed");
                }
                Err(e) => {
                    progress.status = UpgradeStatus::Failed;
                    progress.error = Some(e.to_string());
                    error!(cluster_name, %operation_id, error = %e, "upgrade operation failed");
                }
            }
        }

        match plan {
            Ok(plan) => self.engine.complete(&plan, outcome).await,
            Err(_) => outcome,
        }
    }

    /// Roll the operation back (`rollbackPlan`), updating the shared
    /// status for the duration of the rollback.
    pub async fn rollback(&self, plan: Plan, dry_run: bool) -> Result<Vec<PhasePath>, ClusterupError> {
        {
            let mut progress = self.progress.write().await;
            progress.status = UpgradeStatus::RollingBack;
        }
        let result = self.engine.rollback_plan(plan, dry_run).await;
        {
            let mut progress = self.progress.write().await;
            progress.status = match &result {
                Ok(_) => UpgradeStatus::Idle,
                Err(_) => UpgradeStatus::Failed,
            };
        }
        result
    }
}
