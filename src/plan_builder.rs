//! The Plan Builder: consumes (installed manifest, target manifest, server
//! list, cluster auxiliary state) and emits a fully-resolved Phase Graph
//! with correct dependency edges.
//!
//! Structured as a sequence of small `build_*` functions, each returning
//! a phase fragment the top-level `build_plan` concatenates — grounded
//! in `other_examples`' EKS upgrade operator `planning.rs`, which
//! structures its planning phase the same way, rather than one
//! monolithic function.

use clusterup_common::plan::{
    AppManifest, ClusterRole, DnsConfig, OperationType, RemoteLink, RuntimeUpdate, RuntimeUpdatePackages,
    TeleportUpdate, TeleportUpdatePackages, TrustedCluster,
};
use clusterup_common::{
    ClusterupError, ExecutorTag, PackageLocator, Phase, PhaseData, PhasePath, Plan, ServerRef, ServerRole,
    UpdateServer,
};
use uuid::Uuid;

use crate::etcd::build_etcd_subtree;
use crate::graph::{add_parallel, add_sequential, require, resolve};
use crate::rolling::{build_masters_subtree, build_node_sequence, build_nodes_subtree, RollingStepOptions};

#[derive(Debug, Clone)]
pub struct BuildInputs {
    pub cluster_name: String,
    pub servers: Vec<ServerRef>,
    pub installed_app: AppManifest,
    pub target_app: AppManifest,
    pub links: Vec<RemoteLink>,
    pub trusted_clusters: Vec<TrustedCluster>,
    pub roles: Vec<ClusterRole>,
    pub gravity_package: PackageLocator,
    pub dns_config: DnsConfig,
    /// Intermediate runtime versions to roll through first, in ascending
    /// semver order, when a direct upgrade is unsupported.
    pub intermediate_runtimes: Vec<PackageLocator>,
}

/// `reorderServers`: places the first master in the input list first;
/// all other servers (masters and workers alike) keep their relative
/// input order. This is what gives the builder byte-identical output for
/// byte-identical input.
fn reorder_servers(servers: &[ServerRef]) -> Vec<ServerRef> {
    let mut masters: Vec<ServerRef> = servers.iter().filter(|s| s.role == ServerRole::Master).cloned().collect();
    let others: Vec<ServerRef> = servers.iter().filter(|s| s.role != ServerRole::Master).cloned().collect();
    // masters is already in input order; the leader is simply the first.
    masters.extend(others);
    masters
}

fn runtime_identical(installed: &AppManifest, target: &AppManifest) -> bool {
    installed.runtime.version == target.runtime.version
}

fn taints_supported(target: &AppManifest) -> bool {
    target.runtime.supports_taints
}

fn openebs_newly_enabled(installed: &AppManifest, target: &AppManifest) -> bool {
    !installed.openebs_enabled && target.openebs_enabled
}

fn update_server_descriptor(server: &ServerRef, inputs: &BuildInputs) -> UpdateServer {
    let runtime_update = if runtime_identical(&inputs.installed_app, &inputs.target_app) {
        None
    } else {
        Some(RuntimeUpdatePackages {
            package: PackageLocator { name: "runtime".into(), version: inputs.target_app.runtime.version.clone() },
            config_package: PackageLocator { name: "runtime-config".into(), version: inputs.target_app.runtime.version.clone() },
        })
    };
    let teleport_update = if inputs.installed_app.teleport.version == inputs.target_app.teleport.version {
        None
    } else {
        Some(TeleportUpdatePackages {
            package: PackageLocator { name: "teleport".into(), version: inputs.target_app.teleport.version.clone() },
            node_config_package: None,
        })
    };
    UpdateServer {
        server: server.clone(),
        runtime: RuntimeUpdate {
            installed: PackageLocator { name: "runtime".into(), version: inputs.installed_app.runtime.version.clone() },
            secrets_package: None,
            update: runtime_update,
        },
        teleport: TeleportUpdate {
            installed: PackageLocator { name: "teleport".into(), version: inputs.installed_app.teleport.version.clone() },
            update: teleport_update,
        },
        selinux: inputs.target_app.selinux_enforcing,
        docker_device: None,
    }
}

/// `/init` — single-node, runs on the leader.
fn build_init(inputs: &BuildInputs) -> Result<Phase, ClusterupError> {
    let root = PhasePath::parse("/init")?;
    let mut steps = vec![
        Phase::leaf(root.join("admin-agent")?, "ensure admin agent", ExecutorTag::UpdateInit, PhaseData::None),
        Phase::leaf(root.join("service-user")?, "ensure service user", ExecutorTag::UpdateInit, PhaseData::None),
        Phase::leaf(root.join("rpc-credentials")?, "rotate RPC credentials", ExecutorTag::UpdateInit, PhaseData::None),
        Phase::leaf(root.join("dns-docker-defaults")?, "set DNS/Docker config defaults", ExecutorTag::UpdateInit, PhaseData::None),
    ];
    for server in &inputs.servers {
        if server.role == ServerRole::Master {
            steps.push(Phase::leaf(
                root.join(&format!("rotate-secrets-{}", server.hostname))?,
                format!("rotate planet secrets/config on {}", server.hostname),
                ExecutorTag::UpdateInit,
                PhaseData::Server { server: server.clone() },
            ));
        }
    }
    add_sequential(&mut steps);
    Ok(Phase::grouping(root, "prepare cluster-wide state", steps))
}

/// `/checks` — preflight on every server, in parallel.
fn build_checks(inputs: &BuildInputs) -> Result<Phase, ClusterupError> {
    let root = PhasePath::parse("/checks")?;
    let mut steps = Vec::new();
    for server in &inputs.servers {
        steps.push(Phase::leaf(
            root.join(&server.hostname)?,
            format!("preflight checks on {}", server.hostname),
            ExecutorTag::UpdateChecks,
            PhaseData::Server { server: server.clone() },
        ));
    }
    add_parallel(&mut steps);
    let mut phase = Phase::grouping(root.clone(), "preflight checks", steps);
    phase.requires.insert(PhasePath::parse("/init")?);
    Ok(phase)
}

/// `/pre-update` — application pre-update hook.
fn build_pre_update() -> Result<Phase, ClusterupError> {
    let root = PhasePath::parse("/pre-update")?;
    let mut phase = Phase::leaf(root, "application pre-update hook", ExecutorTag::PreUpdate, PhaseData::None);
    phase.requires.insert(PhasePath::parse("/init")?);
    Ok(phase)
}

/// `/bootstrap` — parallel per-server package staging.
fn build_bootstrap(inputs: &BuildInputs) -> Result<Phase, ClusterupError> {
    let root = PhasePath::parse("/bootstrap")?;
    let mut steps = Vec::new();
    for server in &inputs.servers {
        steps.push(Phase::leaf(
            root.join(&server.hostname)?,
            format!("export binary, pull packages, sync plan on {}", server.hostname),
            ExecutorTag::UpdateBootstrap,
            PhaseData::ServerPackage { server: server.clone(), package: inputs.gravity_package.clone() },
        ));
    }
    add_parallel(&mut steps);
    let mut phase = Phase::grouping(root, "bootstrap every server", steps);
    phase.requires.insert(PhasePath::parse("/init")?);
    Ok(phase)
}

/// `/coredns` — install RBAC resources and Corefile ConfigMap. Installs
/// the superset of RBAC objects (ClusterRole + ClusterRoleBinding +
/// namespaced Role + RoleBinding); see DESIGN.md for why.
fn build_coredns() -> Result<Phase, ClusterupError> {
    let root = PhasePath::parse("/coredns")?;
    let mut steps = vec![
        Phase::leaf(root.join("cluster-role")?, "install coredns ClusterRole", ExecutorTag::Coredns, PhaseData::None),
        Phase::leaf(root.join("cluster-role-binding")?, "install coredns ClusterRoleBinding", ExecutorTag::Coredns, PhaseData::None),
        Phase::leaf(root.join("role")?, "install coredns Role", ExecutorTag::Coredns, PhaseData::None),
        Phase::leaf(root.join("role-binding")?, "install coredns RoleBinding", ExecutorTag::Coredns, PhaseData::None),
        Phase::leaf(root.join("corefile")?, "install Corefile ConfigMap", ExecutorTag::Coredns, PhaseData::None),
    ];
    add_sequential(&mut steps);
    let mut phase = Phase::grouping(root, "coredns RBAC + Corefile bootstrap", steps);
    phase.requires.insert(PhasePath::parse("/bootstrap")?);
    Ok(phase)
}

/// `/config` — push new teleport master configs. Requires `/masters`.
fn build_config(inputs: &BuildInputs) -> Result<Phase, ClusterupError> {
    let root = PhasePath::parse("/config")?;
    let mut steps = Vec::new();
    for server in inputs.servers.iter().filter(|s| s.role == ServerRole::Master) {
        steps.push(Phase::leaf(
            root.join(&server.hostname)?,
            format!("push teleport master config to {}", server.hostname),
            ExecutorTag::Config,
            PhaseData::Server { server: server.clone() },
        ));
    }
    add_parallel(&mut steps);
    let mut phase = Phase::grouping(root, "push teleport master configs", steps);
    phase.requires.insert(PhasePath::parse("/masters")?);
    Ok(phase)
}

/// `/runtime` — install updated system applications, RBAC app first.
fn build_runtime() -> Result<Phase, ClusterupError> {
    let root = PhasePath::parse("/runtime")?;
    let rbac = Phase::leaf(root.join("rbac-app")?, "install RBAC application", ExecutorTag::UpdateApp, PhaseData::None);
    let rbac_id = rbac.id.clone();
    let mut others = vec![
        Phase::leaf(root.join("dns-app")?, "install dns-app", ExecutorTag::UpdateApp, PhaseData::None),
        Phase::leaf(root.join("logging-app")?, "install logging-app", ExecutorTag::UpdateApp, PhaseData::None),
        Phase::leaf(root.join("monitoring-app")?, "install monitoring-app", ExecutorTag::UpdateApp, PhaseData::None),
    ];
    require(&mut others, std::slice::from_ref(&rbac_id));
    let mut steps = vec![rbac];
    steps.extend(others);
    let mut phase = Phase::grouping(root, "install updated system applications", steps);
    phase.requires.insert(PhasePath::parse("/masters")?);
    Ok(phase)
}

fn build_openebs() -> Result<Phase, ClusterupError> {
    let root = PhasePath::parse("/openebs")?;
    let mut phase = Phase::leaf(root, "enable OpenEBS", ExecutorTag::Openebs, PhaseData::None);
    phase.requires.insert(PhasePath::parse("/config")?);
    Ok(phase)
}

fn build_selinux_bootstrap(inputs: &BuildInputs) -> Result<Phase, ClusterupError> {
    let root = PhasePath::parse("/selinux")?;
    let mut steps = Vec::new();
    for server in &inputs.servers {
        steps.push(Phase::leaf(
            root.join(&server.hostname)?,
            format!("bootstrap SELinux policy on {}", server.hostname),
            ExecutorTag::BootstrapSelinux,
            PhaseData::Server { server: server.clone() },
        ));
    }
    add_parallel(&mut steps);
    let mut phase = Phase::grouping(root, "SELinux bootstrap", steps);
    phase.requires.insert(PhasePath::parse("/init")?);
    Ok(phase)
}

/// `/migration` — conditional subphases: `links`, `labels`, `roles`.
fn build_migration(inputs: &BuildInputs) -> Result<Option<Phase>, ClusterupError> {
    let root = PhasePath::parse("/migration")?;
    let mut steps = Vec::new();

    let links_needed = !inputs.links.is_empty() && inputs.trusted_clusters.is_empty();
    if links_needed {
        steps.push(Phase::leaf(root.join("links")?, "migrate links to trusted clusters", ExecutorTag::Links, PhaseData::None));
    }
    if !steps.is_empty() || links_needed {
        steps.push(Phase::leaf(root.join("labels")?, "migrate legacy labels", ExecutorTag::Labels, PhaseData::None));
    }
    if inputs.roles.iter().any(|r| r.assigns_kubernetes_groups) {
        steps.push(Phase::leaf(root.join("roles")?, "migrate legacy role actions", ExecutorTag::Roles, PhaseData::None));
    }

    if steps.is_empty() {
        return Ok(None);
    }
    add_sequential(&mut steps);
    let mut phase = Phase::grouping(root, "role/link migration", steps);
    phase.requires.insert(PhasePath::parse("/masters")?);
    Ok(Some(phase))
}

/// `/app` — the user application's update hook.
fn build_app() -> Result<Phase, ClusterupError> {
    let root = PhasePath::parse("/app")?;
    let mut phase = Phase::leaf(root, "application update hook", ExecutorTag::UpdateApp, PhaseData::None);
    phase.requires.insert(PhasePath::parse("/masters")?);
    phase.requires.insert(PhasePath::parse("/runtime/rbac-app")?);
    Ok(phase)
}

/// `/gc` — per-node cleanup, parallel.
fn build_gc(inputs: &BuildInputs) -> Result<Phase, ClusterupError> {
    let root = PhasePath::parse("/gc")?;
    let mut steps = Vec::new();
    for server in &inputs.servers {
        steps.push(Phase::leaf(
            root.join(&server.hostname)?,
            format!("cleanup {}", server.hostname),
            ExecutorTag::CleanupNode,
            PhaseData::Server { server: server.clone() },
        ));
    }
    add_parallel(&mut steps);
    let mut phase = Phase::grouping(root, "per-node cleanup", steps);
    phase.requires.insert(PhasePath::parse("/app")?);
    Ok(phase)
}

/// Build the full target-runtime step's `/masters` and `/nodes`
/// subtrees for a given runtime package target.
fn build_rolling_update_step(
    inputs: &BuildInputs,
    ordered_servers: &[ServerRef],
) -> Result<(Phase, Option<Phase>), ClusterupError> {
    let opts = RollingStepOptions {
        docker_device_migrate: false,
        taints_supported: taints_supported(&inputs.target_app),
        endpoints: true,
    };

    let master_updates: Vec<UpdateServer> = ordered_servers
        .iter()
        .filter(|s| s.role == ServerRole::Master)
        .map(|s| update_server_descriptor(s, inputs))
        .collect();
    let worker_updates: Vec<UpdateServer> = ordered_servers
        .iter()
        .filter(|s| s.role == ServerRole::Node)
        .map(|s| update_server_descriptor(s, inputs))
        .collect();

    let masters = build_masters_subtree(&PhasePath::root(), &master_updates, opts)?;
    let nodes = build_nodes_subtree(&PhasePath::root(), &worker_updates, opts)?
        .map(|mut p| {
            p.requires.insert(masters.id.clone());
            p
        });
    Ok((masters, nodes))
}

/// Build a single intermediate-runtime step: its own `/masters`+`/nodes`
/// rolling update, but without coredns/etcd/config/runtime/migration —
/// those only happen on the final target version.
fn build_intermediate_step(
    inputs: &BuildInputs,
    ordered_servers: &[ServerRef],
    version: &PackageLocator,
    step_index: usize,
) -> Result<Phase, ClusterupError> {
    let root = PhasePath::parse(&format!("/intermediate-{step_index}"))?;
    let opts = RollingStepOptions {
        docker_device_migrate: false,
        taints_supported: taints_supported(&inputs.target_app),
        endpoints: true,
    };
    let mut steps = Vec::new();
    for server in ordered_servers {
        let descriptor = UpdateServer {
            server: server.clone(),
            runtime: RuntimeUpdate {
                installed: PackageLocator { name: "runtime".into(), version: inputs.installed_app.runtime.version.clone() },
                secrets_package: None,
                update: Some(RuntimeUpdatePackages {
                    package: version.clone(),
                    config_package: PackageLocator { name: "runtime-config".into(), version: version.version.clone() },
                }),
            },
            teleport: TeleportUpdate {
                installed: PackageLocator { name: "teleport".into(), version: inputs.installed_app.teleport.version.clone() },
                update: None,
            },
            selinux: false,
            docker_device: None,
        };
        steps.push(build_node_sequence(&root, &descriptor, opts)?);
    }
    add_parallel(&mut steps);
    let mut phase = Phase::grouping(root, format!("intermediate runtime step to {version}"), steps);
    phase.requires.insert(PhasePath::parse("/bootstrap")?);
    Ok(phase)
}

/// Assemble the complete phase tree for an upgrade operation.
///
/// Deterministic: identical `BuildInputs` always produce a
/// byte-identical tree, because every traversal here is over
/// caller-ordered `Vec`s (servers in input order; RBAC forced first in
/// `/runtime`, then the rest in the fixed declaration order above).
pub fn build_plan(inputs: BuildInputs) -> Result<Plan, ClusterupError> {
    if inputs.servers.is_empty() {
        return Err(ClusterupError::validation("plan requires at least one server"));
    }
    let ordered_servers = reorder_servers(&inputs.servers);
    let leader_hostname = ordered_servers
        .iter()
        .find(|s| s.role == ServerRole::Master)
        .map(|s| s.hostname.clone())
        .ok_or_else(|| ClusterupError::validation("plan requires at least one master"))?;

    let mut top_level = vec![build_init(&inputs)?, build_checks(&inputs)?, build_pre_update()?];

    if runtime_identical(&inputs.installed_app, &inputs.target_app) {
        top_level.push(build_app()?);
        top_level.push(build_gc(&inputs)?);
    } else {
        top_level.push(build_bootstrap(&inputs)?);

        for (index, version) in inputs.intermediate_runtimes.iter().enumerate() {
            top_level.push(build_intermediate_step(&inputs, &ordered_servers, version, index)?);
        }

        top_level.push(build_coredns()?);

        let (masters, nodes) = build_rolling_update_step(&inputs, &ordered_servers)?;
        top_level.push(masters);
        if let Some(nodes) = nodes {
            top_level.push(nodes);
        }

        let master_refs: Vec<ServerRef> =
            ordered_servers.iter().filter(|s| s.role == ServerRole::Master).cloned().collect();
        let worker_refs: Vec<ServerRef> =
            ordered_servers.iter().filter(|s| s.role == ServerRole::Node).cloned().collect();
        top_level.push(build_etcd_subtree(&PhasePath::root(), &master_refs, &worker_refs, &leader_hostname)?);

        top_level.push(build_config(&inputs)?);

        if openebs_newly_enabled(&inputs.installed_app, &inputs.target_app) {
            top_level.push(build_openebs()?);
        }
        top_level.push(build_runtime()?);

        if inputs.target_app.selinux_enforcing {
            top_level.push(build_selinux_bootstrap(&inputs)?);
        }

        if let Some(migration) = build_migration(&inputs)? {
            top_level.push(migration);
        }

        top_level.push(build_app()?);
        top_level.push(build_gc(&inputs)?);
    }

    let mut root = Phase::grouping(PhasePath::root(), "cluster upgrade", top_level);
    resolve(std::slice::from_mut(&mut root))?;

    Ok(Plan {
        operation_id: Uuid::new_v4(),
        operation_type: OperationType::Update,
        cluster_name: inputs.cluster_name,
        servers: ordered_servers,
        gravity_package: inputs.gravity_package,
        phases: vec![root],
        dns_config: inputs.dns_config,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterup_common::plan::{RuntimeApp, TeleportApp};

    fn manifest(runtime_version: &str, openebs: bool) -> AppManifest {
        AppManifest {
            locator: PackageLocator { name: "app".into(), version: "1.0.0".into() },
            runtime: RuntimeApp { version: runtime_version.into(), supports_taints: true },
            teleport: TeleportApp { version: "1.0.0".into() },
            openebs_enabled: openebs,
            selinux_enforcing: false,
        }
    }

    fn server(hostname: &str, role: ServerRole) -> ServerRef {
        ServerRef { hostname: hostname.into(), advertise_ip: "10.0.0.1".into(), role }
    }

    fn base_inputs(servers: Vec<ServerRef>) -> BuildInputs {
        BuildInputs {
            cluster_name: "prod".into(),
            servers,
            installed_app: manifest("1.0.0", false),
            target_app: manifest("2.0.0", false),
            links: Vec::new(),
            trusted_clusters: Vec::new(),
            roles: Vec::new(),
            gravity_package: PackageLocator { name: "gravity".into(), version: "2.0.0".into() },
            dns_config: DnsConfig::default(),
            intermediate_runtimes: Vec::new(),
        }
    }

    #[test]
    fn scenario_three_master_one_worker_top_level_order() {
        let inputs = base_inputs(vec![
            server("m1", ServerRole::Master),
            server("m2", ServerRole::Master),
            server("m3", ServerRole::Master),
            server("w1", ServerRole::Node),
        ]);
        let plan = build_plan(inputs).unwrap();
        let root = &plan.phases[0];
        let order: Vec<&str> = root.phases.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(
            order,
            vec![
                "/init", "/checks", "/pre-update", "/bootstrap", "/coredns", "/masters", "/etcd",
                "/nodes", "/config", "/runtime", "/app", "/gc",
            ]
        );
        let masters = root.phases.iter().find(|p| p.id.as_str() == "/masters").unwrap();
        assert_eq!(masters.phases.len(), 8);
    }

    #[test]
    fn scenario_single_master_two_workers_no_election() {
        let inputs = base_inputs(vec![
            server("m1", ServerRole::Master),
            server("w1", ServerRole::Node),
            server("w2", ServerRole::Node),
        ]);
        let plan = build_plan(inputs).unwrap();
        let root = &plan.phases[0];
        let masters = root.phases.iter().find(|p| p.id.as_str() == "/masters").unwrap();
        assert_eq!(masters.phases.len(), 1);
        let nodes = root.phases.iter().find(|p| p.id.as_str() == "/nodes").unwrap();
        assert_eq!(nodes.phases.len(), 2);
    }

    #[test]
    fn scenario_identical_runtime_app_only_upgrade() {
        let mut inputs = base_inputs(vec![server("m1", ServerRole::Master)]);
        inputs.target_app.runtime.version = inputs.installed_app.runtime.version.clone();
        let plan = build_plan(inputs).unwrap();
        let root = &plan.phases[0];
        let order: Vec<&str> = root.phases.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(order, vec!["/init", "/checks", "/pre-update", "/app", "/gc"]);
    }

    #[test]
    fn scenario_links_migration_emitted_when_no_trusted_clusters() {
        let mut inputs = base_inputs(vec![server("m1", ServerRole::Master)]);
        inputs.links = vec![
            RemoteLink {
                name: "remote".into(),
                proxy_address: "ops.example.com:443".into(),
                reverse_tunnel_address: "ops.example.com:3024".into(),
                token: "tok-remote".into(),
            },
            RemoteLink {
                name: "update".into(),
                proxy_address: "ops.example.com:443".into(),
                reverse_tunnel_address: "ops.example.com:3024".into(),
                token: "tok-update".into(),
            },
            RemoteLink {
                name: "wizard".into(),
                proxy_address: "ops.example.com:443".into(),
                reverse_tunnel_address: "ops.example.com:3024".into(),
                token: "tok-wizard".into(),
            },
        ];
        let plan = build_plan(inputs).unwrap();
        let root = &plan.phases[0];
        let migration = root.phases.iter().find(|p| p.id.as_str() == "/migration").unwrap();
        assert!(migration.phases.iter().any(|p| p.id.as_str() == "/migration/links"));
    }

    #[test]
    fn determinism_identical_inputs_yield_identical_plan_shape() {
        let inputs1 = base_inputs(vec![server("m1", ServerRole::Master), server("w1", ServerRole::Node)]);
        let inputs2 = base_inputs(vec![server("m1", ServerRole::Master), server("w1", ServerRole::Node)]);
        let plan1 = build_plan(inputs1).unwrap();
        let plan2 = build_plan(inputs2).unwrap();
        let ids1: Vec<String> = plan1.phases[0].iter_subtree().map(|p| p.id.to_string()).collect();
        let ids2: Vec<String> = plan2.phases[0].iter_subtree().map(|p| p.id.to_string()).collect();
        assert_eq!(ids1, ids2);
    }

    #[test]
    fn openebs_phase_inserted_between_config_and_runtime_when_newly_enabled() {
        let mut inputs = base_inputs(vec![server("m1", ServerRole::Master)]);
        inputs.target_app.openebs_enabled = true;
        let plan = build_plan(inputs).unwrap();
        let root = &plan.phases[0];
        let order: Vec<&str> = root.phases.iter().map(|p| p.id.as_str()).collect();
        let config_pos = order.iter().position(|p| *p == "/config").unwrap();
        let openebs_pos = order.iter().position(|p| *p == "/openebs").unwrap();
        let runtime_pos = order.iter().position(|p| *p == "/runtime").unwrap();
        assert!(config_pos < openebs_pos && openebs_pos < runtime_pos);
    }
}
