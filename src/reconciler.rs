//! Changelog Store & Reconciler: bidirectional merge of changelog entries
//! between the cluster consensus backend and a node's local store, then
//! projection of the merged changelog onto a plan.
//!
//! Built as an "apply state to graph" pass, generalized from a single
//! in-memory store to a two-backend merge, with a capability-based
//! `Backend::ping` preferred over a shell probe.

use clusterup_common::{ChangeEntry, ClusterupError, Phase, PhasePath, PhaseState, Plan};
use clusterup_runtime::Backend;
use std::collections::HashMap;

/// `SyncChangelog(src, dst)`: push every entry in `src` not already
/// present (by id) in `dst`, skipping nothing — dedup happens on the
/// destination backend's own `create_operation_plan_change` (idempotent
/// insert).
async fn sync_changelog(
    src: &dyn Backend,
    dst: &dyn Backend,
    cluster_name: &str,
    operation_id: uuid::Uuid,
) -> Result<(), ClusterupError> {
    let entries = src.get_operation_plan_changelog(cluster_name, operation_id).await?;
    for entry in entries {
        dst.create_operation_plan_change(entry).await?;
    }
    Ok(())
}

/// `reconcilePlan(plan) -> plan'`: probe the cluster backend; if
/// reachable, merge local and cluster changelogs in both directions, then
/// resolve the plan by projecting each leaf's highest-timestamp entry. If
/// the cluster backend is unreachable, resolve using only the local
/// changelog — the local store is authoritative during partial outages.
pub async fn reconcile_plan(
    mut plan: Plan,
    cluster_backend: &dyn Backend,
    local_backend: &dyn Backend,
) -> Result<Plan, ClusterupError> {
    let cluster_name = plan.cluster_name.clone();
    let operation_id = plan.operation_id;

    if !cluster_backend.ping().await.should_skip_sync() {
        sync_changelog(local_backend, cluster_backend, &cluster_name, operation_id).await?;
        sync_changelog(cluster_backend, local_backend, &cluster_name, operation_id).await?;
    }

    let entries = local_backend.get_operation_plan_changelog(&cluster_name, operation_id).await?;
    let resolved = resolve_latest_by_phase(&entries);
    for phase in plan.phases.iter_mut() {
        apply_resolved(phase, &resolved);
    }
    Ok(plan)
}

/// For each `phaseId`, keep only the entry with the latest `created_at`
/// ("happens-before from changelog"). Ties are broken by the entry that
/// sorts last in the stored order, matching insertion order on a tie.
fn resolve_latest_by_phase(entries: &[ChangeEntry]) -> HashMap<String, &ChangeEntry> {
    let mut latest: HashMap<String, &ChangeEntry> = HashMap::new();
    for entry in entries {
        match latest.get(&entry.phase_id) {
            Some(existing) if existing.created_at > entry.created_at => {}
            _ => {
                latest.insert(entry.phase_id.clone(), entry);
            }
        }
    }
    latest
}

/// Project resolved per-phase states onto the tree, leaf-first, then
/// derive grouping-phase states bottom-up.
fn apply_resolved(phase: &mut Phase, resolved: &HashMap<String, &ChangeEntry>) {
    for child in phase.phases.iter_mut() {
        apply_resolved(child, resolved);
    }
    if phase.is_leaf() {
        if let Some(entry) = resolved.get(phase.id.as_str()) {
            phase.state = entry.new_state;
        }
    } else {
        phase.state = phase.derived_state();
    }
}

/// The set of phases whose `requires` are all in a terminal-and-satisfied
/// state and which are themselves ready to (re-)run — the engine's ready
/// set for "select a ready phase".
///
/// A leaf is ready if it is still `Unstarted`. The leaf at `reentry` (the
/// phase the caller explicitly asked to run) is also ready if it is
/// `RolledBack` — the natural next step after an undo — or, when `force`
/// is set, if it is `Completed` or `Failed` (re-run semantics: "a phase
/// may be re-executed even if already Completed", and re-running a
/// failed phase with `--force`).
pub fn ready_phases(plan: &Plan, reentry: &PhasePath, force: bool) -> Vec<PhasePath> {
    let mut by_id: HashMap<&str, &Phase> = HashMap::new();
    for root in &plan.phases {
        for phase in root.iter_subtree() {
            by_id.insert(phase.id.as_str(), phase);
        }
    }
    let mut ready = Vec::new();
    for root in &plan.phases {
        for phase in root.iter_subtree() {
            if !phase.is_leaf() {
                continue;
            }
            let reenterable = &phase.id == reentry
                && (phase.state == PhaseState::RolledBack
                    || (force && matches!(phase.state, PhaseState::Completed | PhaseState::Failed)));
            if phase.state != PhaseState::Unstarted && !reenterable {
                continue;
            }
            let satisfied = phase
                .requires
                .iter()
                .all(|req| by_id.get(req.as_str()).map(|p| p.state == PhaseState::Completed).unwrap_or(false));
            if satisfied {
                ready.push(phase.id.clone());
            }
        }
    }
    ready
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterup_common::{ExecutorTag, PhaseData};
    use clusterup_runtime::InMemoryClusterBackend;

    fn sample_plan() -> Plan {
        let a = Phase::leaf(PhasePath::parse("/a").unwrap(), "a", ExecutorTag::Health, PhaseData::None);
        let mut b = Phase::leaf(PhasePath::parse("/b").unwrap(), "b", ExecutorTag::Health, PhaseData::None);
        b.requires.insert(PhasePath::parse("/a").unwrap());
        let root = Phase::grouping(PhasePath::root(), "root", vec![a, b]);
        Plan {
            operation_id: uuid::Uuid::new_v4(),
            operation_type: clusterup_common::plan::OperationType::Update,
            cluster_name: "prod".into(),
            servers: vec![],
            gravity_package: clusterup_common::PackageLocator { name: "gravity".into(), version: "2.0.0".into() },
            phases: vec![root],
            dns_config: clusterup_common::plan::DnsConfig::default(),
        }
    }

    #[tokio::test]
    async fn reconcile_merges_local_only_entries_into_cluster() {
        let cluster = InMemoryClusterBackend::new();
        let local = InMemoryClusterBackend::new();
        let plan = sample_plan();
        let entry = ChangeEntry::new(plan.cluster_name.clone(), plan.operation_id, "/a", PhaseState::Completed, None);
        local.create_operation_plan_change(entry).await.unwrap();

        let resolved = reconcile_plan(plan, &cluster, &local).await.unwrap();
        assert_eq!(resolved.phases[0].phases[0].state, PhaseState::Completed);
        let cluster_entries = cluster
            .get_operation_plan_changelog(&resolved.cluster_name, resolved.operation_id)
            .await
            .unwrap();
        assert_eq!(cluster_entries.len(), 1);
    }

    #[tokio::test]
    async fn unavailable_cluster_backend_still_resolves_from_local() {
        let cluster = InMemoryClusterBackend::new();
        cluster.set_available(false);
        let local = InMemoryClusterBackend::new();
        let plan = sample_plan();
        let entry = ChangeEntry::new(plan.cluster_name.clone(), plan.operation_id, "/a", PhaseState::Completed, None);
        local.create_operation_plan_change(entry).await.unwrap();

        let resolved = reconcile_plan(plan, &cluster, &local).await.unwrap();
        assert_eq!(resolved.phases[0].phases[0].state, PhaseState::Completed);
        assert!(cluster
            .get_operation_plan_changelog(&resolved.cluster_name, resolved.operation_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn latest_timestamp_wins_on_conflicting_entries() {
        let cluster = InMemoryClusterBackend::new();
        let local = InMemoryClusterBackend::new();
        let plan = sample_plan();
        let older = ChangeEntry::new(plan.cluster_name.clone(), plan.operation_id, "/a", PhaseState::InProgress, None);
        let mut newer = ChangeEntry::new(plan.cluster_name.clone(), plan.operation_id, "/a", PhaseState::Completed, None);
        newer.created_at = older.created_at + chrono::Duration::seconds(5);
        local.create_operation_plan_change(older).await.unwrap();
        local.create_operation_plan_change(newer).await.unwrap();

        let resolved = reconcile_plan(plan, &cluster, &local).await.unwrap();
        assert_eq!(resolved.phases[0].phases[0].state, PhaseState::Completed);
    }

    #[tokio::test]
    async fn ready_phases_requires_prerequisite_completed() {
        let mut plan = sample_plan();
        let root = PhasePath::root();
        assert_eq!(ready_phases(&plan, &root, false), vec![PhasePath::parse("/a").unwrap()]);
        plan.phases[0].phases[0].state = PhaseState::Completed;
        assert_eq!(ready_phases(&plan, &root, false), vec![PhasePath::parse("/b").unwrap()]);
    }

    #[tokio::test]
    async fn force_reenters_a_completed_phase_at_the_requested_path() {
        let mut plan = sample_plan();
        plan.phases[0].phases[0].state = PhaseState::Completed;
        plan.phases[0].phases[1].state = PhaseState::Completed;
        let a = PhasePath::parse("/a").unwrap();
        assert!(ready_phases(&plan, &a, false).is_empty());
        assert_eq!(ready_phases(&plan, &a, true), vec![a]);
    }

    #[tokio::test]
    async fn rolled_back_phase_is_reenterable_without_force() {
        let mut plan = sample_plan();
        plan.phases[0].phases[0].state = PhaseState::RolledBack;
        let a = PhasePath::parse("/a").unwrap();
        assert_eq!(ready_phases(&plan, &a, false), vec![a]);
    }

    #[tokio::test]
    async fn sync_then_sync_back_is_idempotent() {
        let cluster = InMemoryClusterBackend::new();
        let local = InMemoryClusterBackend::new();
        let plan = sample_plan();
        let entry = ChangeEntry::new(plan.cluster_name.clone(), plan.operation_id, "/a", PhaseState::Completed, None);
        cluster.create_operation_plan_change(entry).await.unwrap();

        sync_changelog(&cluster, &local, &plan.cluster_name, plan.operation_id).await.unwrap();
        sync_changelog(&local, &cluster, &plan.cluster_name, plan.operation_id).await.unwrap();
        sync_changelog(&cluster, &local, &plan.cluster_name, plan.operation_id).await.unwrap();

        let cluster_count = cluster
            .get_operation_plan_changelog(&plan.cluster_name, plan.operation_id)
            .await
            .unwrap()
            .len();
        let local_count = local
            .get_operation_plan_changelog(&plan.cluster_name, plan.operation_id)
            .await
            .unwrap()
            .len();
        assert_eq!(cluster_count, 1);
        assert_eq!(local_count, 1);
    }
}
