//! The rolling-update sub-template: per-node
//! drain→system-upgrade→[docker-device-migrate?]→health→[taint?]→
//! uncordon→[endpoints?]→[untaint?], plus the leader-election phases
//! inserted around the `/masters` sequence.
//!
//! The per-node upgrade sequence follows an `UpgradeCoordinator`/
//! `UpgradeStatus` shape, with `requires` edges between steps wired
//! through the same sequential-chaining helpers used elsewhere in this
//! crate's phase builders.

use clusterup_common::{ExecutorTag, Phase, PhaseData, PhasePath, ServerRef, UpdateServer};

use crate::graph::add_sequential;

/// Knobs that vary the rolling-update sequence's edge-case policies.
#[derive(Debug, Clone, Copy)]
pub struct RollingStepOptions {
    pub docker_device_migrate: bool,
    pub taints_supported: bool,
    pub endpoints: bool,
}

/// Build the per-node rolling-update phase subtree rooted at
/// `parent/<hostname>`.
pub fn build_node_sequence(
    parent: &PhasePath,
    update: &UpdateServer,
    opts: RollingStepOptions,
) -> Result<Phase, clusterup_common::ClusterupError> {
    let node_root = parent.join(&update.server.hostname)?;
    let mut steps = Vec::new();

    steps.push(Phase::leaf(
        node_root.join("drain")?,
        format!("drain workloads from {}", update.server.hostname),
        ExecutorTag::DrainNode,
        PhaseData::Server { server: update.server.clone() },
    ));
    steps.push(Phase::leaf(
        node_root.join("system-upgrade")?,
        format!("install runtime on {}", update.server.hostname),
        ExecutorTag::UpdateSystem,
        PhaseData::ServerPackage {
            server: update.server.clone(),
            package: update
                .runtime
                .update
                .as_ref()
                .map(|u| u.package.clone())
                .unwrap_or_else(|| update.runtime.installed.clone()),
        },
    ));
    if opts.docker_device_migrate {
        steps.push(Phase::leaf(
            node_root.join("docker-device-migrate")?,
            format!("migrate docker device on {}", update.server.hostname),
            ExecutorTag::UpdateSystem,
            PhaseData::Server { server: update.server.clone() },
        ));
    }
    steps.push(Phase::leaf(
        node_root.join("health")?,
        format!("probe readiness of {}", update.server.hostname),
        ExecutorTag::Health,
        PhaseData::Server { server: update.server.clone() },
    ));
    if opts.taints_supported {
        steps.push(Phase::leaf(
            node_root.join("taint")?,
            format!("taint {} during endpoint settling", update.server.hostname),
            ExecutorTag::TaintNode,
            PhaseData::Server { server: update.server.clone() },
        ));
    }
    steps.push(Phase::leaf(
        node_root.join("uncordon")?,
        format!("re-admit {}", update.server.hostname),
        ExecutorTag::UncordonNode,
        PhaseData::Server { server: update.server.clone() },
    ));
    if opts.endpoints {
        steps.push(Phase::leaf(
            node_root.join("endpoints")?,
            format!("wait for endpoints to include {}", update.server.hostname),
            ExecutorTag::Endpoints,
            PhaseData::Server { server: update.server.clone() },
        ));
    }
    if opts.taints_supported {
        steps.push(Phase::leaf(
            node_root.join("untaint")?,
            format!("untaint {}", update.server.hostname),
            ExecutorTag::UntaintNode,
            PhaseData::Server { server: update.server.clone() },
        ));
    }

    add_sequential(&mut steps);
    Ok(Phase::grouping(node_root, format!("rolling update of {}", update.server.hostname), steps))
}

/// `electionStatus` phase: enables some servers' election participation
/// and disables others'. Idempotent: re-running converges to the same
/// topology regardless of starting state.
pub fn election_phase(
    parent: &PhasePath,
    name: &str,
    enable: Vec<ServerRef>,
    disable: Vec<ServerRef>,
) -> Result<Phase, clusterup_common::ClusterupError> {
    Ok(Phase::leaf(
        parent.join(name)?,
        format!("election:{name}"),
        ExecutorTag::ElectionStatus,
        PhaseData::Election { enable, disable },
    ))
}

/// `kubelet-permissions` phase: a one-off leaf that precedes the leader's
/// stepdown in a multi-master rollout.
pub fn kubelet_permissions_phase(parent: &PhasePath) -> Result<Phase, clusterup_common::ClusterupError> {
    Ok(Phase::leaf(
        parent.join("kubelet-permissions")?,
        "grant kubelet permissions ahead of leader stepdown",
        ExecutorTag::KubeletPermissions,
        PhaseData::None,
    ))
}

/// Build the full `/masters` subtree with leader-election phases
/// interleaved around the per-node rolling-update sequence.
///
/// - Single master: no election phases; `endpoints` is enabled for the
///   lone node since workers must see it reappear.
/// - Multiple masters: `kubelet-permissions` + `election:stepdown` before
///   the leader's sequence (leader's sequence has `endpoints` disabled —
///   other masters still serve); `election:elect` after the leader's
///   sequence (enabling the leader, disabling everyone else); then, for
///   each subsequent master in order, its rolling sequence (with
///   `endpoints` enabled) followed by an `election:enable` phase for
///   that node alone.
pub fn build_masters_subtree(
    parent: &PhasePath,
    leader_and_followers: &[UpdateServer],
    opts_base: RollingStepOptions,
) -> Result<Phase, clusterup_common::ClusterupError> {
    let masters_root = parent.join("masters")?;
    let mut steps = Vec::new();

    if leader_and_followers.len() == 1 {
        let leader_opts = RollingStepOptions { endpoints: true, ..opts_base };
        steps.push(build_node_sequence(&masters_root, &leader_and_followers[0], leader_opts)?);
        add_sequential(&mut steps);
        return Ok(Phase::grouping(masters_root, "rolling update of master nodes", steps));
    }

    let leader = &leader_and_followers[0];
    let followers = &leader_and_followers[1..];
    let all_servers: Vec<ServerRef> = leader_and_followers.iter().map(|u| u.server.clone()).collect();

    steps.push(kubelet_permissions_phase(&masters_root)?);
    steps.push(election_phase(
        &masters_root,
        "stepdown",
        Vec::new(),
        vec![leader.server.clone()],
    )?);
    let leader_opts = RollingStepOptions { endpoints: false, ..opts_base };
    steps.push(build_node_sequence(&masters_root, leader, leader_opts)?);
    steps.push(election_phase(
        &masters_root,
        "elect",
        vec![leader.server.clone()],
        all_servers.iter().filter(|s| s.hostname != leader.server.hostname).cloned().collect(),
    )?);

    for follower in followers {
        let follower_opts = RollingStepOptions { endpoints: true, ..opts_base };
        steps.push(build_node_sequence(&masters_root, follower, follower_opts)?);
        steps.push(election_phase(
            &masters_root,
            &format!("enable-{}", follower.server.hostname),
            vec![follower.server.clone()],
            Vec::new(),
        )?);
    }

    add_sequential(&mut steps);
    Ok(Phase::grouping(masters_root, "rolling update of master nodes", steps))
}

/// `/nodes`: parallel rolling update of every worker. Absent entirely
/// when there are no workers.
pub fn build_nodes_subtree(
    parent: &PhasePath,
    workers: &[UpdateServer],
    opts: RollingStepOptions,
) -> Result<Option<Phase>, clusterup_common::ClusterupError> {
    if workers.is_empty() {
        return Ok(None);
    }
    let nodes_root = parent.join("nodes")?;
    let mut steps = Vec::new();
    for worker in workers {
        steps.push(build_node_sequence(&nodes_root, worker, opts)?);
    }
    // addParallel: siblings keep only what they already require (the
    // parent's own predecessor edges, added by the caller).
    Ok(Some(Phase::grouping(nodes_root, "rolling update of worker nodes", steps)))
}
