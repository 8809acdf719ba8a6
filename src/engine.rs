//! The Engine (FSM): drives a `Plan`'s phases to completion, delegating
//! to remote nodes when a phase is server-bound, recording every
//! transition as a changelog entry, and reconciling after each one.
//!
//! Built around a select-ready-node → run → record → repeat drive loop,
//! generalized to two-backend reconciliation and to remote delegation via
//! `RemoteAgent`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use clusterup_common::{ChangeEntry, ClusterupError, Phase, PhasePath, PhaseState, Plan};
use clusterup_runtime::{Backend, RemoteAgent};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::dispatch::{dispatch, dispatch_rollback, ExecutionContext};
use crate::reconciler::{ready_phases, reconcile_plan};

/// Retry cap and initial delay for `Transient` errors (backend
/// unreachable, network blip, Kubernetes API throttling).
const MAX_TRANSIENT_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(200);

/// Run `attempt` up to `MAX_TRANSIENT_ATTEMPTS` times, doubling the delay
/// between retries, as long as each failure is `Transient`. Any other
/// error, or exhausting the attempt cap, returns immediately.
async fn retry_transient<F, Fut>(phase_id: &PhasePath, mut attempt: F) -> Result<(), ClusterupError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), ClusterupError>>,
{
    let mut delay = INITIAL_BACKOFF;
    for attempt_no in 1..=MAX_TRANSIENT_ATTEMPTS {
        match attempt().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && attempt_no < MAX_TRANSIENT_ATTEMPTS => {
                warn!(phase_id = %phase_id, attempt = attempt_no, error = %e, "transient error, retrying after backoff");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("loop always returns on its final iteration")
}

/// A publish-only progress sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub phase: PhasePath,
    pub description: String,
    pub percent: u8,
}

/// Tracks the last emitted percent so `tick` can suppress duplicate
/// events at the same percentage.
#[derive(Default)]
pub struct ProgressTicker {
    last_percent: Option<u8>,
}

impl ProgressTicker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&mut self, phase: &Phase, total_leaf_phases: u32) -> Option<ProgressEvent> {
        let percent = if total_leaf_phases == 0 {
            100
        } else {
            ((100u64 * phase.step as u64) / total_leaf_phases as u64).min(100) as u8
        };
        if self.last_percent == Some(percent) {
            return None;
        }
        self.last_percent = Some(percent);
        Some(ProgressEvent { phase: phase.id.clone(), description: phase.description.clone(), percent })
    }
}

fn total_leaf_phases(plan: &Plan) -> u32 {
    plan.phases.iter().flat_map(|p| p.iter_subtree()).filter(|p| p.is_leaf()).count() as u32
}

/// Number every leaf phase with its position in discovery order, so
/// progress can be computed as a fraction of the whole plan. Called once,
/// idempotently, the first time a plan is driven.
fn assign_steps(plan: &mut Plan) {
    fn walk(phase: &mut Phase, counter: &mut u32) {
        if phase.is_leaf() {
            *counter += 1;
            phase.step = *counter;
        }
        for child in phase.phases.iter_mut() {
            walk(child, counter);
        }
    }
    let mut counter = 0;
    for root in plan.phases.iter_mut() {
        walk(root, &mut counter);
    }
}

fn find_phase<'a>(plan: &'a Plan, id: &PhasePath) -> Option<&'a Phase> {
    plan.phases.iter().flat_map(|p| p.iter_subtree()).find(|p| &p.id == id)
}

/// Drives a single operation's `Plan` through its phase-completion FSM.
/// One `Engine` instance per operation per node.
pub struct Engine {
    pub cluster_backend: Arc<dyn Backend>,
    pub local_backend: Arc<dyn Backend>,
    pub remote_agent: Arc<dyn RemoteAgent>,
    pub execution_context: ExecutionContext,
    pub this_hostname: String,
    pub binary_version: semver::Version,
    pub skip_version_check: bool,
    pub force: bool,
}

impl Engine {
    /// Load from the local backend (authoritative); absence means the
    /// operation was never initialized.
    pub async fn get_plan(&self, cluster_name: &str, operation_id: Uuid) -> Result<Plan, ClusterupError> {
        self.local_backend
            .get_operation_plan(cluster_name, operation_id)
            .await?
            .ok_or_else(|| {
                ClusterupError::not_found_with_guidance(
                    format!("no plan for operation {operation_id}"),
                    "run `clusterup upgrade` to create a plan before executing a phase",
                )
            })
    }

    /// Binary version guard: the running binary's semver must match the
    /// plan's recorded `gravity_package` semver for a non-rollback root
    /// execution, unless `skip_version_check`.
    fn check_binary_version(&self, plan: &Plan) -> Result<(), ClusterupError> {
        if self.skip_version_check {
            return Ok(());
        }
        let expected = semver::Version::parse(&plan.gravity_package.version)
            .map_err(|e| ClusterupError::validation(format!("plan has an invalid gravity version: {e}")))?;
        if expected != self.binary_version {
            return Err(ClusterupError::VersionMismatch {
                expected: expected.to_string(),
                found: self.binary_version.to_string(),
            });
        }
        Ok(())
    }

    /// Append a changelog entry to the local backend (authoritative) and
    /// trigger reconciliation.
    pub async fn change_phase_state(
        &self,
        plan: Plan,
        phase_id: &PhasePath,
        new_state: PhaseState,
        error: Option<String>,
    ) -> Result<Plan, ClusterupError> {
        let entry = ChangeEntry::new(plan.cluster_name.clone(), plan.operation_id, phase_id.as_str(), new_state, error);
        self.local_backend.create_operation_plan_change(entry).await?;
        reconcile_plan(plan, self.cluster_backend.as_ref(), self.local_backend.as_ref()).await
    }

    /// `executePlan`: drives the whole DAG (the subtree rooted at `/`).
    pub async fn execute_plan(&self, cluster_name: &str, operation_id: Uuid) -> Result<(), ClusterupError> {
        let plan = self.get_plan(cluster_name, operation_id).await?;
        if !self.force {
            self.check_binary_version(&plan)?;
        }
        self.drive(plan, &PhasePath::root()).await.map(|_| ())
    }

    /// `executePhase`: drives only the subtree rooted at `phase_id`.
    pub async fn execute_phase(
        &self,
        cluster_name: &str,
        operation_id: Uuid,
        phase_id: &PhasePath,
    ) -> Result<(), ClusterupError> {
        let plan = self.get_plan(cluster_name, operation_id).await?;
        if !self.force {
            self.check_coordinator(&plan, phase_id)?;
        }
        self.drive(plan, phase_id).await.map(|_| ())
    }

    /// A non-root `--phase` must be invoked on the plan's designated
    /// coordinator (the first master, per `reorderServers`).
    fn check_coordinator(&self, plan: &Plan, phase_id: &PhasePath) -> Result<(), ClusterupError> {
        if *phase_id == PhasePath::root() {
            return Ok(());
        }
        let coordinator = match plan.servers.first() {
            Some(server) => server,
            None => return Ok(()),
        };
        if coordinator.hostname != self.this_hostname {
            return Err(ClusterupError::coordinator(phase_id.to_string(), self.this_hostname.clone()));
        }
        Ok(())
    }

    /// The shared execution loop, scoped to phases inside `scope`. Runs
    /// every ready phase whose id is `scope` or a
    /// descendant of it; phases outside `scope` are treated as already
    /// satisfied prerequisites if complete, or otherwise block readiness
    /// normally via the dependency closure.
    async fn drive(&self, mut plan: Plan, scope: &PhasePath) -> Result<Plan, ClusterupError> {
        assign_steps(&mut plan);
        let total = total_leaf_phases(&plan);
        let mut ticker = ProgressTicker::new();

        plan = reconcile_plan(plan, self.cluster_backend.as_ref(), self.local_backend.as_ref()).await?;

        loop {
            let candidates: Vec<PhasePath> = ready_phases(&plan, scope, self.force)
                .into_iter()
                .filter(|id| scope.is_ancestor_of_or_equal(id))
                .collect();
            if candidates.is_empty() {
                break;
            }

            for phase_id in candidates {
                let phase = find_phase(&plan, &phase_id)
                    .ok_or_else(|| ClusterupError::validation(format!("phase {phase_id} vanished mid-run")))?
                    .clone();
                if let Some(event) = ticker.tick(&phase, total) {
                    info!(phase_id = %event.phase, percent = event.percent, "progress");
                }

                let span = info_span!("execute_phase", phase = %phase.id);
                plan = self.run_one(plan, &phase).instrument(span).await?;
            }
        }

        let unresolved: Vec<&Phase> = plan
            .phases
            .iter()
            .flat_map(|p| p.iter_subtree())
            .filter(|p| p.is_leaf() && scope.is_ancestor_of_or_equal(&p.id))
            .filter(|p| p.state == PhaseState::Failed)
            .collect();
        if !unresolved.is_empty() {
            let first = unresolved[0];
            return Err(ClusterupError::phase_failure(
                first.id.to_string(),
                format!("{} leaf phase(s) failed", unresolved.len()),
            ));
        }
        Ok(plan)
    }

    /// Run a single leaf phase through pre-check, (remote-or-local)
    /// execute, and the resulting changelog write.
    async fn run_one(&self, plan: Plan, phase: &Phase) -> Result<Plan, ClusterupError> {
        let server = match &phase.data {
            clusterup_common::PhaseData::Server { server } => Some(server),
            clusterup_common::PhaseData::ServerPackage { server, .. } => Some(server),
            clusterup_common::PhaseData::EtcdStep { server, .. } => Some(server),
            _ => None,
        };

        let mut plan = self
            .change_phase_state(plan, &phase.id, PhaseState::InProgress, None)
            .await?;

        let result = retry_transient(&phase.id, || async {
            if let Some(server) = server {
                if server.hostname != self.this_hostname {
                    info!(phase_id = %phase.id, node = %server.hostname, "delegating phase to remote agent");
                    self.remote_agent.run(server, &phase.id, self.force).await
                } else {
                    dispatch(phase, &self.execution_context).await
                }
            } else {
                dispatch(phase, &self.execution_context).await
            }
        })
        .await;

        plan = match result {
            Ok(()) => self.change_phase_state(plan, &phase.id, PhaseState::Completed, None).await?,
            Err(e) => {
                warn!(phase_id = %phase.id, error = %e, "phase failed");
                self.change_phase_state(plan, &phase.id, PhaseState::Failed, Some(e.to_string())).await?
            }
        };
        Ok(plan)
    }

    /// `rollbackPhase`: undo a single completed leaf phase's effect and
    /// record `RolledBack`.
    pub async fn rollback_phase(&self, plan: Plan, phase_id: &PhasePath) -> Result<Plan, ClusterupError> {
        let phase = find_phase(&plan, phase_id)
            .ok_or_else(|| ClusterupError::not_found(format!("phase {phase_id}")))?
            .clone();
        dispatch_rollback(&phase, &self.execution_context).await?;
        self.change_phase_state(plan, phase_id, PhaseState::RolledBack, None).await
    }

    /// `rollbackPlan(dryRun)`: roll every `Completed` leaf back, in
    /// reverse dependency order. With `dry_run`, only reports what would
    /// be rolled back.
    pub async fn rollback_plan(&self, mut plan: Plan, dry_run: bool) -> Result<Vec<PhasePath>, ClusterupError> {
        let mut completed: Vec<PhasePath> = plan
            .phases
            .iter()
            .flat_map(|p| p.iter_subtree())
            .filter(|p| p.is_leaf() && p.state == PhaseState::Completed)
            .map(|p| p.id.clone())
            .collect();
        completed.sort_by(|a, b| b.as_str().cmp(a.as_str()));

        if dry_run {
            return Ok(completed);
        }
        for phase_id in &completed {
            plan = self.rollback_phase(plan, phase_id).await?;
        }
        Ok(completed)
    }

    /// `complete(err)`: finalize the operation, shutting down per-node
    /// agents only when the operation succeeded.
    pub async fn complete(&self, plan: &Plan, outcome: Result<(), ClusterupError>) -> Result<(), ClusterupError> {
        if outcome.is_ok() {
            self.remote_agent.shutdown(&plan.servers).await?;
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterup_common::{ExecutorTag, PhaseData, ServerRef, ServerRole};
    use clusterup_runtime::{FakeKubernetesClient, InMemoryClusterBackend, InMemoryPackageService, RecordingRemoteAgent};

    fn engine(hostname: &str) -> (Engine, Arc<InMemoryClusterBackend>, Arc<InMemoryClusterBackend>) {
        let cluster = Arc::new(InMemoryClusterBackend::new());
        let local = Arc::new(InMemoryClusterBackend::new());
        let ctx = ExecutionContext {
            cluster_name: "prod".into(),
            backend: cluster.clone(),
            packages: Arc::new(InMemoryPackageService::new()),
            kubernetes: Arc::new(FakeKubernetesClient::new()),
        };
        let e = Engine {
            cluster_backend: cluster.clone(),
            local_backend: local.clone(),
            remote_agent: Arc::new(RecordingRemoteAgent::new()),
            execution_context: ctx,
            this_hostname: hostname.into(),
            binary_version: semver::Version::parse("2.0.0").unwrap(),
            skip_version_check: false,
            force: false,
        };
        (e, cluster, local)
    }

    fn two_phase_plan() -> Plan {
        let a = Phase::leaf(PhasePath::parse("/a").unwrap(), "a", ExecutorTag::Health, PhaseData::Server {
            server: ServerRef { hostname: "leader".into(), advertise_ip: "10.0.0.1".into(), role: ServerRole::Master },
        });
        let mut b = Phase::leaf(PhasePath::parse("/b").unwrap(), "b", ExecutorTag::UpdateApp, PhaseData::None);
        b.requires.insert(PhasePath::parse("/a").unwrap());
        let root = Phase::grouping(PhasePath::root(), "root", vec![a, b]);
        Plan {
            operation_id: Uuid::new_v4(),
            operation_type: clusterup_common::plan::OperationType::Update,
            cluster_name: "prod".into(),
            servers: vec![],
            gravity_package: clusterup_common::PackageLocator { name: "gravity".into(), version: "2.0.0".into() },
            phases: vec![root],
            dns_config: clusterup_common::plan::DnsConfig::default(),
        }
    }

    #[tokio::test]
    async fn execute_plan_drives_both_phases_to_completion() {
        let (e, _cluster, local) = engine("leader");
        let plan = two_phase_plan();
        local.create_operation_plan(&plan).await.unwrap();
        e.execute_plan(&plan.cluster_name, plan.operation_id).await.unwrap();
        let resolved = e.get_plan(&plan.cluster_name, plan.operation_id).await.unwrap();
        assert_eq!(resolved.phases[0].phases[0].state, PhaseState::Completed);
        assert_eq!(resolved.phases[0].phases[1].state, PhaseState::Completed);
    }

    #[tokio::test]
    async fn phase_bound_to_other_host_is_delegated_remotely() {
        let (e, _cluster, local) = engine("follower");
        let plan = two_phase_plan();
        local.create_operation_plan(&plan).await.unwrap();
        e.execute_plan(&plan.cluster_name, plan.operation_id).await.unwrap();
        let resolved = e.get_plan(&plan.cluster_name, plan.operation_id).await.unwrap();
        assert_eq!(resolved.phases[0].phases[0].state, PhaseState::Completed);
    }

    #[tokio::test]
    async fn version_mismatch_aborts_before_any_phase_runs() {
        let (mut e, _cluster, local) = engine("leader");
        e.binary_version = semver::Version::parse("1.0.0").unwrap();
        let plan = two_phase_plan();
        local.create_operation_plan(&plan).await.unwrap();
        let err = e.execute_plan(&plan.cluster_name, plan.operation_id).await.unwrap_err();
        assert!(matches!(err, ClusterupError::VersionMismatch { .. }));
    }

    #[tokio::test]
    async fn non_coordinator_node_is_rejected_for_a_non_root_phase() {
        let (e, _cluster, local) = engine("follower");
        let mut plan = two_phase_plan();
        plan.servers = vec![ServerRef {
            hostname: "leader".into(),
            advertise_ip: "10.0.0.1".into(),
            role: ServerRole::Master,
        }];
        local.create_operation_plan(&plan).await.unwrap();
        let err = e
            .execute_phase(&plan.cluster_name, plan.operation_id, &PhasePath::parse("/a").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterupError::Coordinator { .. }));
    }

    #[tokio::test]
    async fn force_bypasses_the_coordinator_check() {
        let (mut e, _cluster, local) = engine("follower");
        e.force = true;
        let mut plan = two_phase_plan();
        plan.servers = vec![ServerRef {
            hostname: "leader".into(),
            advertise_ip: "10.0.0.1".into(),
            role: ServerRole::Master,
        }];
        local.create_operation_plan(&plan).await.unwrap();
        e.execute_phase(&plan.cluster_name, plan.operation_id, &PhasePath::parse("/a").unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rollback_plan_dry_run_reports_without_mutating() {
        let (e, _cluster, local) = engine("leader");
        let plan = two_phase_plan();
        local.create_operation_plan(&plan).await.unwrap();
        e.execute_plan(&plan.cluster_name, plan.operation_id).await.unwrap();
        let plan = e.get_plan(&plan.cluster_name, plan.operation_id).await.unwrap();
        let report = e.rollback_plan(plan, true).await.unwrap();
        assert_eq!(report, vec![PhasePath::parse("/b").unwrap(), PhasePath::parse("/a").unwrap()]);
    }

    #[tokio::test]
    async fn retry_transient_succeeds_after_a_few_transient_failures() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let phase_id = PhasePath::parse("/a").unwrap();
        let result = retry_transient(&phase_id, || {
            let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ClusterupError::transient("backend unreachable"))
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_transient_gives_up_after_the_attempt_cap() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let phase_id = PhasePath::parse("/a").unwrap();
        let result = retry_transient(&phase_id, || {
            attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move { Err(ClusterupError::transient("backend unreachable")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), MAX_TRANSIENT_ATTEMPTS);
    }

    #[tokio::test]
    async fn retry_transient_does_not_retry_non_transient_errors() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let phase_id = PhasePath::parse("/a").unwrap();
        let result = retry_transient(&phase_id, || {
            attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move { Err(ClusterupError::validation("malformed plan")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn progress_ticker_suppresses_repeated_percent() {
        let mut ticker = ProgressTicker::new();
        let mut phase = Phase::leaf(PhasePath::parse("/a").unwrap(), "a", ExecutorTag::Health, PhaseData::None);
        phase.step = 1;
        assert!(ticker.tick(&phase, 2).is_some());
        assert!(ticker.tick(&phase, 2).is_none());
    }
}
