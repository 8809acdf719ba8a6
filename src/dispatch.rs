//! The Dispatcher: maps a leaf phase's `ExecutorTag` onto the
//! concrete side effect that tag names, using the runtime's `Backend`,
//! `PackageService`, and `KubernetesClient` collaborators.
//!
//! Expressed as a `Send + Sync` async trait with one real implementation
//! and tests built on the fakes, rather than a bare function pointer
//! table.

use std::sync::Arc;

use async_trait::async_trait;
use clusterup_common::{ClusterupError, ExecutorTag, Phase, PhaseData, ServerRole};
use clusterup_runtime::{Backend, KubernetesClient, PackageService};

/// Everything a `PhaseExecutor` needs to carry out its tag's side effect.
/// Cheap to clone: every field is an `Arc`.
#[derive(Clone)]
pub struct ExecutionContext {
    pub cluster_name: String,
    pub backend: Arc<dyn Backend>,
    pub packages: Arc<dyn PackageService>,
    pub kubernetes: Arc<dyn KubernetesClient>,
}

/// The four-call contract every executor implements: a
/// `pre_check` gate, the side effect itself, a `post_check` that confirms
/// it landed, and `rollback` for the phases that can undo their own
/// effect in place.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn pre_check(&self, _phase: &Phase, _ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        Ok(())
    }

    async fn execute(&self, phase: &Phase, ctx: &ExecutionContext) -> Result<(), ClusterupError>;

    async fn post_check(&self, _phase: &Phase, _ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        Ok(())
    }

    async fn rollback(&self, _phase: &Phase, _ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        Ok(())
    }
}

fn server_of(phase: &Phase) -> Result<&clusterup_common::ServerRef, ClusterupError> {
    match &phase.data {
        PhaseData::Server { server } => Ok(server),
        PhaseData::ServerPackage { server, .. } => Ok(server),
        PhaseData::EtcdStep { server, .. } => Ok(server),
        _ => Err(ClusterupError::validation(format!(
            "phase {} has no server in its data payload",
            phase.id
        ))),
    }
}

struct DrainNode;
#[async_trait]
impl PhaseExecutor for DrainNode {
    async fn execute(&self, phase: &Phase, ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        ctx.kubernetes.drain_node(&server_of(phase)?.hostname).await
    }
    async fn rollback(&self, phase: &Phase, ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        ctx.kubernetes.uncordon_node(&server_of(phase)?.hostname).await
    }
}

struct UncordonNode;
#[async_trait]
impl PhaseExecutor for UncordonNode {
    async fn execute(&self, phase: &Phase, ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        ctx.kubernetes.uncordon_node(&server_of(phase)?.hostname).await
    }
    async fn rollback(&self, phase: &Phase, ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        ctx.kubernetes.cordon_node(&server_of(phase)?.hostname).await
    }
}

struct TaintNode;
#[async_trait]
impl PhaseExecutor for TaintNode {
    async fn execute(&self, phase: &Phase, ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        ctx.kubernetes.taint_node(&server_of(phase)?.hostname).await
    }
    async fn rollback(&self, phase: &Phase, ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        ctx.kubernetes.untaint_node(&server_of(phase)?.hostname).await
    }
}

struct UntaintNode;
#[async_trait]
impl PhaseExecutor for UntaintNode {
    async fn execute(&self, phase: &Phase, ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        ctx.kubernetes.untaint_node(&server_of(phase)?.hostname).await
    }
}

struct Endpoints;
#[async_trait]
impl PhaseExecutor for Endpoints {
    async fn execute(&self, phase: &Phase, ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        let server = server_of(phase)?;
        let mut services = vec!["gravity-site", "coredns"];
        if server.role == ServerRole::Node {
            services.push("coredns-worker");
        }
        for service in services {
            let count = ctx.kubernetes.ready_endpoint_count(service).await?;
            if count == 0 {
                return Err(ClusterupError::transient(format!(
                    "service {service} has no ready endpoints yet (waiting for {})",
                    server.hostname
                )));
            }
        }
        Ok(())
    }
}

struct UpdateSystem;
#[async_trait]
impl PhaseExecutor for UpdateSystem {
    async fn execute(&self, phase: &Phase, ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        if let PhaseData::ServerPackage { package, .. } = &phase.data {
            ctx.packages.read_package(package).await?;
        }
        Ok(())
    }
}

struct UpdateBootstrap;
#[async_trait]
impl PhaseExecutor for UpdateBootstrap {
    async fn execute(&self, phase: &Phase, ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        if let PhaseData::ServerPackage { package, .. } = &phase.data {
            ctx.packages.read_package(package).await?;
        }
        Ok(())
    }
}

struct UpdateInit;
#[async_trait]
impl PhaseExecutor for UpdateInit {
    async fn execute(&self, _phase: &Phase, _ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        Ok(())
    }
}

struct UpdateChecks;
#[async_trait]
impl PhaseExecutor for UpdateChecks {
    async fn pre_check(&self, _phase: &Phase, ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        if ctx.backend.ping().await.should_skip_sync() {
            return Err(ClusterupError::transient("cluster backend unreachable during preflight"));
        }
        Ok(())
    }
    async fn execute(&self, _phase: &Phase, _ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        Ok(())
    }
}

struct PreUpdate;
#[async_trait]
impl PhaseExecutor for PreUpdate {
    async fn execute(&self, _phase: &Phase, _ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        Ok(())
    }
}

struct UpdateApp;
#[async_trait]
impl PhaseExecutor for UpdateApp {
    async fn execute(&self, _phase: &Phase, _ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        Ok(())
    }
}

struct Coredns;
#[async_trait]
impl PhaseExecutor for Coredns {
    async fn execute(&self, phase: &Phase, ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        // Every coredns leaf applies the full RBAC/Corefile superset
        // regardless of which leaf in the `/coredns` subtree fired; the
        // applies are idempotent so redundant calls are harmless.
        let _ = phase;
        ctx.kubernetes.apply_cluster_role("coredns").await?;
        ctx.kubernetes.apply_cluster_role_binding("coredns").await?;
        ctx.kubernetes.apply_role("kube-system", "coredns").await?;
        ctx.kubernetes.apply_role_binding("kube-system", "coredns").await?;
        ctx.kubernetes.apply_config_map("kube-system", "coredns", "").await?;
        Ok(())
    }
}

struct Config;
#[async_trait]
impl PhaseExecutor for Config {
    async fn execute(&self, phase: &Phase, ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        let server = server_of(phase)?;
        ctx.kubernetes
            .apply_config_map("kube-system", &format!("teleport-{}", server.hostname), "")
            .await
    }
}

struct KubeletPermissions;
#[async_trait]
impl PhaseExecutor for KubeletPermissions {
    async fn execute(&self, _phase: &Phase, ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        ctx.kubernetes.apply_cluster_role_binding("kubelet-permissions").await
    }
}

struct ElectionStatus;
#[async_trait]
impl PhaseExecutor for ElectionStatus {
    async fn execute(&self, phase: &Phase, ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        if let PhaseData::Election { enable, disable } = &phase.data {
            for server in enable {
                ctx.kubernetes.label_node(&server.hostname, "election", "enabled").await?;
            }
            for server in disable {
                ctx.kubernetes.label_node(&server.hostname, "election", "disabled").await?;
            }
        }
        Ok(())
    }
}

struct Links;
#[async_trait]
impl PhaseExecutor for Links {
    async fn execute(&self, _phase: &Phase, ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        for cluster in ctx.backend.list_trusted_clusters().await? {
            ctx.backend.upsert_trusted_cluster(cluster).await?;
        }
        Ok(())
    }
}

struct Labels;
#[async_trait]
impl PhaseExecutor for Labels {
    async fn execute(&self, _phase: &Phase, _ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        Ok(())
    }
}

struct Roles;
#[async_trait]
impl PhaseExecutor for Roles {
    async fn execute(&self, _phase: &Phase, _ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        Ok(())
    }
}

struct EtcdBackup;
#[async_trait]
impl PhaseExecutor for EtcdBackup {
    async fn execute(&self, _phase: &Phase, _ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        Ok(())
    }
}

struct EtcdShutdown;
#[async_trait]
impl PhaseExecutor for EtcdShutdown {
    async fn execute(&self, _phase: &Phase, ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        // The leader's shutdown is the one that tears the consensus store
        // down; `InMemoryClusterBackend::set_available(false)` models this
        // in tests. The dispatcher itself does not flip availability —
        // that belongs to the test harness or a real etcd driver.
        let _ = ctx;
        Ok(())
    }
}

struct EtcdUpgrade;
#[async_trait]
impl PhaseExecutor for EtcdUpgrade {
    async fn execute(&self, _phase: &Phase, _ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        Ok(())
    }
}

struct EtcdMigrate;
#[async_trait]
impl PhaseExecutor for EtcdMigrate {
    async fn execute(&self, _phase: &Phase, _ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        Ok(())
    }
}

struct EtcdRestart;
#[async_trait]
impl PhaseExecutor for EtcdRestart {
    async fn pre_check(&self, _phase: &Phase, ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        if ctx.backend.ping().await.should_skip_sync() {
            return Err(ClusterupError::transient("backend still unavailable, cannot restart yet"));
        }
        Ok(())
    }
    async fn execute(&self, _phase: &Phase, _ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        Ok(())
    }
}

struct EtcdRestartGravity;
#[async_trait]
impl PhaseExecutor for EtcdRestartGravity {
    async fn execute(&self, _phase: &Phase, ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        ctx.kubernetes.run_hook_job("gravity-site-restart").await
    }
}

struct CleanupNode;
#[async_trait]
impl PhaseExecutor for CleanupNode {
    async fn execute(&self, _phase: &Phase, _ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        Ok(())
    }
}

struct Openebs;
#[async_trait]
impl PhaseExecutor for Openebs {
    async fn execute(&self, _phase: &Phase, ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        ctx.kubernetes.run_hook_job("openebs-enable").await
    }
}

struct BootstrapSelinux;
#[async_trait]
impl PhaseExecutor for BootstrapSelinux {
    async fn execute(&self, phase: &Phase, ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        ctx.kubernetes.label_node(&server_of(phase)?.hostname, "selinux", "enforcing").await
    }
}

struct Health;
#[async_trait]
impl PhaseExecutor for Health {
    async fn execute(&self, phase: &Phase, ctx: &ExecutionContext) -> Result<(), ClusterupError> {
        let server = server_of(phase)?;
        if !ctx.kubernetes.node_ready(&server.hostname).await? {
            return Err(ClusterupError::transient(format!("{} not yet healthy", server.hostname)));
        }
        Ok(())
    }
}

/// Resolve an `ExecutorTag` to its `PhaseExecutor`. The match is
/// exhaustive over the closed tag set; there is no "unknown tag" arm to
/// fall into — an unrecognized string fails earlier, at deserialization.
pub fn resolve_executor(tag: ExecutorTag) -> Box<dyn PhaseExecutor> {
    match tag {
        ExecutorTag::UpdateInit => Box::new(UpdateInit),
        ExecutorTag::UpdateChecks => Box::new(UpdateChecks),
        ExecutorTag::UpdateBootstrap => Box::new(UpdateBootstrap),
        ExecutorTag::UpdateSystem => Box::new(UpdateSystem),
        ExecutorTag::PreUpdate => Box::new(PreUpdate),
        ExecutorTag::Coredns => Box::new(Coredns),
        ExecutorTag::UpdateApp => Box::new(UpdateApp),
        ExecutorTag::ElectionStatus => Box::new(ElectionStatus),
        ExecutorTag::TaintNode => Box::new(TaintNode),
        ExecutorTag::UntaintNode => Box::new(UntaintNode),
        ExecutorTag::DrainNode => Box::new(DrainNode),
        ExecutorTag::UncordonNode => Box::new(UncordonNode),
        ExecutorTag::Endpoints => Box::new(Endpoints),
        ExecutorTag::Config => Box::new(Config),
        ExecutorTag::KubeletPermissions => Box::new(KubeletPermissions),
        ExecutorTag::Links => Box::new(Links),
        ExecutorTag::Labels => Box::new(Labels),
        ExecutorTag::Roles => Box::new(Roles),
        ExecutorTag::EtcdBackup => Box::new(EtcdBackup),
        ExecutorTag::EtcdShutdown => Box::new(EtcdShutdown),
        ExecutorTag::EtcdUpgrade => Box::new(EtcdUpgrade),
        ExecutorTag::EtcdMigrate => Box::new(EtcdMigrate),
        ExecutorTag::EtcdRestart => Box::new(EtcdRestart),
        ExecutorTag::EtcdRestartGravity => Box::new(EtcdRestartGravity),
        ExecutorTag::CleanupNode => Box::new(CleanupNode),
        ExecutorTag::Openebs => Box::new(Openebs),
        ExecutorTag::BootstrapSelinux => Box::new(BootstrapSelinux),
        ExecutorTag::Health => Box::new(Health),
    }
}

/// Dispatch a single leaf phase's full pre_check/execute/post_check
/// sequence. Grouping phases (no executor) are a programming error here —
/// the engine only ever dispatches leaves.
pub async fn dispatch(phase: &Phase, ctx: &ExecutionContext) -> Result<(), ClusterupError> {
    let tag = phase
        .executor
        .ok_or_else(|| ClusterupError::validation(format!("phase {} has no executor to dispatch", phase.id)))?;
    let executor = resolve_executor(tag);
    executor.pre_check(phase, ctx).await?;
    executor
        .execute(phase, ctx)
        .await
        .map_err(|e| ClusterupError::phase_failure(phase.id.to_string(), e.to_string()))?;
    executor.post_check(phase, ctx).await?;
    Ok(())
}

/// Roll a single leaf phase back.
pub async fn dispatch_rollback(phase: &Phase, ctx: &ExecutionContext) -> Result<(), ClusterupError> {
    let tag = phase
        .executor
        .ok_or_else(|| ClusterupError::validation(format!("phase {} has no executor to roll back", phase.id)))?;
    resolve_executor(tag).rollback(phase, ctx).await
}
