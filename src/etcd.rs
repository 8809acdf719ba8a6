//! The etcd barrier sub-template: a cluster-wide, non-rolling
//! stage that tears down and rebuilds the consensus store. Unlike the
//! rolling-update template, stages are per-server dependency edges rather
//! than a sequential chain, and the whole subtree intentionally does NOT
//! depend on `/masters` — during the barrier the cluster backend is
//! unreachable and remote agents cannot reconcile, so requiring
//! `/masters` first would deadlock.

use clusterup_common::{ExecutorTag, Phase, PhaseData, PhasePath, ServerRef};

fn stage_leaf(
    parent: &PhasePath,
    stage: &str,
    server: &ServerRef,
    executor: ExecutorTag,
    leader: bool,
) -> Result<Phase, clusterup_common::ClusterupError> {
    Ok(Phase::leaf(
        parent.join(&format!("{stage}-{}", server.hostname))?,
        format!("etcd {stage} on {}", server.hostname),
        executor,
        PhaseData::EtcdStep { server: server.clone(), leader },
    ))
}

/// Build `/etcd`: backup → shutdown → upgrade → migrate → restart, with
/// per-server edges (`shutdown-S` requires `backup-S`, etc.) rather than
/// a single sequential chain, and a final gravity-site restart after
/// every server's restart phase.
pub fn build_etcd_subtree(
    parent: &PhasePath,
    masters: &[ServerRef],
    workers: &[ServerRef],
    leader_hostname: &str,
) -> Result<Phase, clusterup_common::ClusterupError> {
    let etcd_root = parent.join("etcd")?;
    let mut steps = Vec::new();

    let mut backup_ids = Vec::new();
    for server in masters {
        let phase = stage_leaf(&etcd_root, "backup", server, ExecutorTag::EtcdBackup, false)?;
        backup_ids.push(phase.id.clone());
        steps.push(phase);
    }

    let mut shutdown_ids = Vec::new();
    for server in masters {
        let mut phase = stage_leaf(
            &etcd_root,
            "shutdown",
            server,
            ExecutorTag::EtcdShutdown,
            server.hostname == leader_hostname,
        )?;
        phase.requires.insert(etcd_root.join(&format!("backup-{}", server.hostname))?);
        shutdown_ids.push(phase.id.clone());
        steps.push(phase);
    }

    let mut upgrade_ids = Vec::new();
    for server in masters {
        let mut phase = stage_leaf(&etcd_root, "upgrade", server, ExecutorTag::EtcdUpgrade, false)?;
        phase.requires.insert(etcd_root.join(&format!("shutdown-{}", server.hostname))?);
        upgrade_ids.push(phase.id.clone());
        steps.push(phase);
    }

    let mut migrate_ids = Vec::new();
    for server in masters {
        let mut phase = stage_leaf(&etcd_root, "migrate", server, ExecutorTag::EtcdMigrate, false)?;
        phase.requires.insert(etcd_root.join(&format!("upgrade-{}", server.hostname))?);
        migrate_ids.push(phase.id.clone());
        steps.push(phase);
    }

    // Restart fans out to every master AND every worker so client watches
    // are re-established cluster-wide.
    let mut restart_ids = Vec::new();
    for server in masters {
        let mut phase = stage_leaf(&etcd_root, "restart", server, ExecutorTag::EtcdRestart, false)?;
        phase.requires.insert(etcd_root.join(&format!("migrate-{}", server.hostname))?);
        restart_ids.push(phase.id.clone());
        steps.push(phase);
    }
    for server in workers {
        let mut phase = stage_leaf(&etcd_root, "restart", server, ExecutorTag::EtcdRestart, false)?;
        // Workers have no backup/shutdown/upgrade/migrate of their own;
        // their restart depends on every master's migrate completing.
        phase.requires.extend(migrate_ids.iter().cloned());
        restart_ids.push(phase.id.clone());
        steps.push(phase);
    }

    let mut gravity_site_restart = Phase::leaf(
        etcd_root.join("restart-gravity-site")?,
        "restart gravity-site",
        ExecutorTag::EtcdRestartGravity,
        PhaseData::None,
    );
    gravity_site_restart.requires.extend(restart_ids);
    steps.push(gravity_site_restart);

    let _ = (backup_ids, shutdown_ids, upgrade_ids);
    Ok(Phase::grouping(etcd_root, "etcd cluster-wide upgrade barrier", steps))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterup_common::ServerRole;

    fn server(hostname: &str, role: ServerRole) -> ServerRef {
        ServerRef { hostname: hostname.into(), advertise_ip: "10.0.0.1".into(), role }
    }

    #[test]
    fn per_server_edges_chain_within_a_master() {
        let masters = vec![server("m1", ServerRole::Master)];
        let etcd = build_etcd_subtree(&PhasePath::root(), &masters, &[], "m1").unwrap();
        let shutdown = etcd.phases.iter().find(|p| p.id.as_str() == "/etcd/shutdown-m1").unwrap();
        assert!(shutdown.requires.contains(&PhasePath::parse("/etcd/backup-m1").unwrap()));
    }

    #[test]
    fn worker_restart_depends_on_every_master_migrate() {
        let masters = vec![server("m1", ServerRole::Master), server("m2", ServerRole::Master)];
        let workers = vec![server("w1", ServerRole::Node)];
        let etcd = build_etcd_subtree(&PhasePath::root(), &masters, &workers, "m1").unwrap();
        let w1_restart = etcd.phases.iter().find(|p| p.id.as_str() == "/etcd/restart-w1").unwrap();
        assert!(w1_restart.requires.contains(&PhasePath::parse("/etcd/migrate-m1").unwrap()));
        assert!(w1_restart.requires.contains(&PhasePath::parse("/etcd/migrate-m2").unwrap()));
    }

    #[test]
    fn gravity_site_restart_depends_on_all_restarts() {
        let masters = vec![server("m1", ServerRole::Master)];
        let workers = vec![server("w1", ServerRole::Node)];
        let etcd = build_etcd_subtree(&PhasePath::root(), &masters, &workers, "m1").unwrap();
        let gravity_site = etcd.phases.iter().find(|p| p.id.as_str() == "/etcd/restart-gravity-site").unwrap();
        assert!(gravity_site.requires.contains(&PhasePath::parse("/etcd/restart-m1").unwrap()));
        assert!(gravity_site.requires.contains(&PhasePath::parse("/etcd/restart-w1").unwrap()));
    }

    #[test]
    fn leader_flag_set_on_leader_shutdown_only() {
        let masters = vec![server("m1", ServerRole::Master), server("m2", ServerRole::Master)];
        let etcd = build_etcd_subtree(&PhasePath::root(), &masters, &[], "m1").unwrap();
        let m1_shutdown = etcd.phases.iter().find(|p| p.id.as_str() == "/etcd/shutdown-m1").unwrap();
        let m2_shutdown = etcd.phases.iter().find(|p| p.id.as_str() == "/etcd/shutdown-m2").unwrap();
        assert!(matches!(&m1_shutdown.data, PhaseData::EtcdStep { leader: true, .. }));
        assert!(matches!(&m2_shutdown.data, PhaseData::EtcdStep { leader: false, .. }));
    }
}
