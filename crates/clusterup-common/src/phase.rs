//! The phase data model: `Phase`, `PhasePath`, `PhaseState`, `PhaseData`,
//! and the closed set of executor tags the dispatcher switches on.
//!
//! This is the Rust re-expression of the arena-of-phases design note: a
//! `Phase` owns its children directly (a tree of structures with child
//! vectors, same as the source), but every id is validated against the
//! slash-path grammar and `requires` entries are resolved to absolute form
//! exactly once, by `crate::phase::resolve` equivalents living in the
//! graph-construction layer (see the `clusterup` root crate's `graph`
//! module), not here.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::ClusterupError;

/// A slash-delimited absolute phase id, e.g. `/masters/node-1/drain`.
///
/// Each segment matches `[A-Za-z0-9._-]+`; the root is the literal string
/// `/`. Construction validates the grammar from the external-interfaces
/// section; callers get a `Validation` error for anything else.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PhasePath(String);

impl PhasePath {
    pub const ROOT: &'static str = "/";

    pub fn root() -> Self {
        Self(Self::ROOT.to_string())
    }

    /// Parse an absolute path, validating every segment.
    pub fn parse(raw: &str) -> Result<Self, ClusterupError> {
        if raw == Self::ROOT {
            return Ok(Self::root());
        }
        if !raw.starts_with('/') {
            return Err(ClusterupError::validation(format!(
                "phase path {raw:?} must be absolute (start with '/')"
            )));
        }
        for segment in raw.trim_start_matches('/').split('/') {
            if segment.is_empty() || !segment.chars().all(is_segment_char) {
                return Err(ClusterupError::validation(format!(
                    "phase path {raw:?} has an invalid segment {segment:?}"
                )));
            }
        }
        Ok(Self(raw.trim_end_matches('/').to_string()))
    }

    /// Join a single child segment onto this path (the child's own,
    /// relative name — not yet resolved against `requires`).
    pub fn join(&self, segment: &str) -> Result<Self, ClusterupError> {
        if segment.is_empty() || !segment.chars().all(is_segment_char) {
            return Err(ClusterupError::validation(format!(
                "invalid phase segment {segment:?}"
            )));
        }
        if self.0 == Self::ROOT {
            return Ok(Self(format!("/{segment}")));
        }
        Ok(Self(format!("{}/{segment}", self.0)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if `self` is `other`, or an ancestor of `other` (used by the
    /// no-self-or-descendant-dependency invariant).
    pub fn is_ancestor_of_or_equal(&self, other: &PhasePath) -> bool {
        if self.0 == other.0 {
            return true;
        }
        if self.0 == Self::ROOT {
            return true;
        }
        other.0.starts_with(&format!("{}/", self.0))
    }
}

fn is_segment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'
}

impl fmt::Display for PhasePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The five states a leaf phase passes through.
///
/// Monotonic order (invariant 4 / the boundary law in the testable
/// properties section): `Unstarted < InProgress < {Completed, Failed} <
/// RolledBack`. `rank()` gives the total order used to compare how
/// "advanced" two projections of the same phase are; `Completed` and
/// `Failed` share a rank since neither supersedes the other — only the
/// changelog's timestamp ordering breaks that tie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    Unstarted,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

impl PhaseState {
    pub fn rank(self) -> u8 {
        match self {
            PhaseState::Unstarted => 0,
            PhaseState::InProgress => 1,
            PhaseState::Completed | PhaseState::Failed => 2,
            PhaseState::RolledBack => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PhaseState::Completed | PhaseState::Failed | PhaseState::RolledBack)
    }

    pub fn at_least_as_advanced_as(self, other: PhaseState) -> bool {
        self.rank() >= other.rank()
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PhaseState::Unstarted => "unstarted",
            PhaseState::InProgress => "in_progress",
            PhaseState::Completed => "completed",
            PhaseState::Failed => "failed",
            PhaseState::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

/// The closed set of executor tags the dispatcher switches on.
/// An unrecognized tag at dispatch time is a version mismatch, never a
/// shape the dispatcher quietly accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorTag {
    UpdateInit,
    UpdateChecks,
    UpdateBootstrap,
    UpdateSystem,
    PreUpdate,
    Coredns,
    UpdateApp,
    ElectionStatus,
    TaintNode,
    UntaintNode,
    DrainNode,
    UncordonNode,
    Endpoints,
    Config,
    KubeletPermissions,
    Links,
    Labels,
    Roles,
    EtcdBackup,
    EtcdShutdown,
    EtcdUpgrade,
    EtcdMigrate,
    EtcdRestart,
    EtcdRestartGravity,
    CleanupNode,
    Openebs,
    BootstrapSelinux,
    Health,
}

impl ExecutorTag {
    pub const ALL: &'static [ExecutorTag] = &[
        ExecutorTag::UpdateInit,
        ExecutorTag::UpdateChecks,
        ExecutorTag::UpdateBootstrap,
        ExecutorTag::UpdateSystem,
        ExecutorTag::PreUpdate,
        ExecutorTag::Coredns,
        ExecutorTag::UpdateApp,
        ExecutorTag::ElectionStatus,
        ExecutorTag::TaintNode,
        ExecutorTag::UntaintNode,
        ExecutorTag::DrainNode,
        ExecutorTag::UncordonNode,
        ExecutorTag::Endpoints,
        ExecutorTag::Config,
        ExecutorTag::KubeletPermissions,
        ExecutorTag::Links,
        ExecutorTag::Labels,
        ExecutorTag::Roles,
        ExecutorTag::EtcdBackup,
        ExecutorTag::EtcdShutdown,
        ExecutorTag::EtcdUpgrade,
        ExecutorTag::EtcdMigrate,
        ExecutorTag::EtcdRestart,
        ExecutorTag::EtcdRestartGravity,
        ExecutorTag::CleanupNode,
        ExecutorTag::Openebs,
        ExecutorTag::BootstrapSelinux,
        ExecutorTag::Health,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutorTag::UpdateInit => "update_init",
            ExecutorTag::UpdateChecks => "update_checks",
            ExecutorTag::UpdateBootstrap => "update_bootstrap",
            ExecutorTag::UpdateSystem => "update_system",
            ExecutorTag::PreUpdate => "pre_update",
            ExecutorTag::Coredns => "coredns",
            ExecutorTag::UpdateApp => "update_app",
            ExecutorTag::ElectionStatus => "election_status",
            ExecutorTag::TaintNode => "taint_node",
            ExecutorTag::UntaintNode => "untaint_node",
            ExecutorTag::DrainNode => "drain_node",
            ExecutorTag::UncordonNode => "uncordon_node",
            ExecutorTag::Endpoints => "endpoints",
            ExecutorTag::Config => "config",
            ExecutorTag::KubeletPermissions => "kubelet_permissions",
            ExecutorTag::Links => "links",
            ExecutorTag::Labels => "labels",
            ExecutorTag::Roles => "roles",
            ExecutorTag::EtcdBackup => "etcd_backup",
            ExecutorTag::EtcdShutdown => "etcd_shutdown",
            ExecutorTag::EtcdUpgrade => "etcd_upgrade",
            ExecutorTag::EtcdMigrate => "etcd_migrate",
            ExecutorTag::EtcdRestart => "etcd_restart",
            ExecutorTag::EtcdRestartGravity => "etcd_restart_gravity",
            ExecutorTag::CleanupNode => "cleanup_node",
            ExecutorTag::Openebs => "openebs",
            ExecutorTag::BootstrapSelinux => "bootstrap_selinux",
            ExecutorTag::Health => "health",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == tag)
    }
}

impl fmt::Display for ExecutorTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored phase naming an executor tag the running binary doesn't
/// recognize is a version skew between the binary that wrote the plan
/// and the one reading it back, not a malformed document.
impl<'de> Deserialize<'de> for ExecutorTag {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        ExecutorTag::parse(&raw).ok_or_else(|| {
            serde::de::Error::custom(format!(
                "requires executor {raw} (potential mismatch between upgrade versions)"
            ))
        })
    }
}

/// A server in the cluster topology, as captured in the plan's snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRef {
    pub hostname: String,
    pub advertise_ip: String,
    pub role: ServerRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerRole {
    Master,
    Node,
}

/// A content-addressed package reference (name + semver), opaque beyond
/// that per the out-of-scope package service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageLocator {
    pub name: String,
    pub version: String,
}

impl fmt::Display for PackageLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

/// Phase-type-specific opaque payload (design note §9: sum type, one
/// variant family per executor tag, rather than one struct of optionals).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhaseData {
    /// Grouping phases, and leaves with no payload (e.g. `pre_update`).
    None,
    Server { server: ServerRef },
    ServerPackage { server: ServerRef, package: PackageLocator },
    InstalledTarget { installed: PackageLocator, target: PackageLocator },
    Election { enable: Vec<ServerRef>, disable: Vec<ServerRef> },
    EtcdStep { server: ServerRef, leader: bool },
}

/// A node in the update DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub id: PhasePath,
    pub description: String,
    pub executor: Option<ExecutorTag>,
    pub requires: BTreeSet<PhasePath>,
    pub data: PhaseData,
    pub phases: Vec<Phase>,
    pub state: PhaseState,
    pub step: u32,
}

impl Phase {
    pub fn leaf(
        id: PhasePath,
        description: impl Into<String>,
        executor: ExecutorTag,
        data: PhaseData,
    ) -> Self {
        Self {
            id,
            description: description.into(),
            executor: Some(executor),
            requires: BTreeSet::new(),
            data,
            phases: Vec::new(),
            state: PhaseState::Unstarted,
            step: 0,
        }
    }

    pub fn grouping(id: PhasePath, description: impl Into<String>, phases: Vec<Phase>) -> Self {
        Self {
            id,
            description: description.into(),
            executor: None,
            requires: BTreeSet::new(),
            data: PhaseData::None,
            phases,
            state: PhaseState::Unstarted,
            step: 0,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn with_requires(mut self, requires: impl IntoIterator<Item = PhasePath>) -> Self {
        self.requires.extend(requires);
        self
    }

    /// Derive this phase's effective state from its own (for leaves) or
    /// its children's (for grouping phases) state, per invariant 3.
    pub fn derived_state(&self) -> PhaseState {
        if self.is_leaf() {
            return self.state;
        }
        let states: Vec<PhaseState> = self.phases.iter().map(|p| p.derived_state()).collect();
        if states.iter().all(|s| *s == PhaseState::Completed) {
            return PhaseState::Completed;
        }
        if states.iter().any(|s| *s == PhaseState::Failed)
            && !states.iter().any(|s| *s == PhaseState::InProgress)
        {
            return PhaseState::Failed;
        }
        let any_started = states.iter().any(|s| *s != PhaseState::Unstarted);
        let all_terminal = states.iter().all(|s| s.is_terminal());
        if any_started && !all_terminal {
            return PhaseState::InProgress;
        }
        PhaseState::Unstarted
    }

    /// Every phase in this subtree, depth-first, including `self`.
    pub fn iter_subtree(&self) -> Box<dyn Iterator<Item = &Phase> + '_> {
        Box::new(
            std::iter::once(self).chain(self.phases.iter().flat_map(|p| p.iter_subtree())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_tag_round_trips_through_json() {
        let json = serde_json::to_string(&ExecutorTag::EtcdRestartGravity).unwrap();
        assert_eq!(json, "\"etcd_restart_gravity\"");
        let tag: ExecutorTag = serde_json::from_str(&json).unwrap();
        assert_eq!(tag, ExecutorTag::EtcdRestartGravity);
    }

    #[test]
    fn unknown_executor_tag_names_itself_as_a_version_mismatch() {
        let err = serde_json::from_str::<ExecutorTag>("\"warp_drive\"").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("requires executor warp_drive"));
        assert!(msg.contains("potential mismatch between upgrade versions"));
    }

    #[test]
    fn phase_path_rejects_relative() {
        assert!(PhasePath::parse("masters").is_err());
    }

    #[test]
    fn phase_path_rejects_bad_segment() {
        assert!(PhasePath::parse("/masters/node 1").is_err());
    }

    #[test]
    fn phase_path_root_joins_without_double_slash() {
        let root = PhasePath::root();
        let child = root.join("masters").unwrap();
        assert_eq!(child.as_str(), "/masters");
    }

    #[test]
    fn ancestor_check_covers_self_and_descendants() {
        let a = PhasePath::parse("/masters").unwrap();
        let b = PhasePath::parse("/masters/node-1").unwrap();
        let c = PhasePath::parse("/nodes").unwrap();
        assert!(a.is_ancestor_of_or_equal(&a));
        assert!(a.is_ancestor_of_or_equal(&b));
        assert!(!a.is_ancestor_of_or_equal(&c));
    }

    #[test]
    fn derived_state_completed_iff_all_children_completed() {
        let mut parent = Phase::grouping(
            PhasePath::root(),
            "root",
            vec![
                Phase::leaf(
                    PhasePath::parse("/a").unwrap(),
                    "a",
                    ExecutorTag::Health,
                    PhaseData::None,
                ),
                Phase::leaf(
                    PhasePath::parse("/b").unwrap(),
                    "b",
                    ExecutorTag::Health,
                    PhaseData::None,
                ),
            ],
        );
        assert_eq!(parent.derived_state(), PhaseState::Unstarted);
        parent.phases[0].state = PhaseState::Completed;
        assert_eq!(parent.derived_state(), PhaseState::InProgress);
        parent.phases[1].state = PhaseState::Completed;
        assert_eq!(parent.derived_state(), PhaseState::Completed);
    }

    #[test]
    fn derived_state_failed_when_no_child_in_progress() {
        let mut parent = Phase::grouping(
            PhasePath::root(),
            "root",
            vec![
                Phase::leaf(
                    PhasePath::parse("/a").unwrap(),
                    "a",
                    ExecutorTag::Health,
                    PhaseData::None,
                ),
                Phase::leaf(
                    PhasePath::parse("/b").unwrap(),
                    "b",
                    ExecutorTag::Health,
                    PhaseData::None,
                ),
            ],
        );
        parent.phases[0].state = PhaseState::Completed;
        parent.phases[1].state = PhaseState::Failed;
        assert_eq!(parent.derived_state(), PhaseState::Failed);
    }

    #[test]
    fn state_rank_orders_rolled_back_highest() {
        assert!(PhaseState::RolledBack.at_least_as_advanced_as(PhaseState::Completed));
        assert!(PhaseState::Completed.at_least_as_advanced_as(PhaseState::InProgress));
        assert!(!PhaseState::Unstarted.at_least_as_advanced_as(PhaseState::InProgress));
    }

    #[test]
    fn executor_tag_round_trips_through_str() {
        for tag in ExecutorTag::ALL {
            assert_eq!(ExecutorTag::parse(tag.as_str()), Some(*tag));
        }
        assert_eq!(ExecutorTag::parse("not_a_real_tag"), None);
    }
}
