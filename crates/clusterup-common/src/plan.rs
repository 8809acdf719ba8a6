//! `Plan`, `ChangeEntry`, `UpdateServer`, and the application/runtime
//! manifests the Plan Builder consumes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::phase::{Phase, PackageLocator, ServerRef};

/// An installed-or-target application manifest: just enough structure for
/// the Plan Builder to diff versions and detect feature flags (OpenEBS,
/// legacy role actions) without understanding the rest of the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppManifest {
    pub locator: PackageLocator,
    pub runtime: RuntimeApp,
    pub teleport: TeleportApp,
    pub openebs_enabled: bool,
    pub selinux_enforcing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeApp {
    pub version: String,
    /// Minimum version (inclusive) at which taint/untaint phases apply.
    pub supports_taints: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeleportApp {
    pub version: String,
}

/// A remote-access link (Ops Center style) considered by the migration
/// sub-phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLink {
    pub name: String,
    pub proxy_address: String,
    pub reverse_tunnel_address: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedCluster {
    pub name: String,
    pub proxy_address: String,
    pub reverse_tunnel_address: String,
    pub token: String,
}

/// A cluster role; only its legacy-action flag matters to the builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRole {
    pub name: String,
    pub assigns_kubernetes_groups: bool,
}

/// Per-node upgrade descriptor, produced by the Plan Builder and consumed
/// by node-level executors and the bootstrap phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateServer {
    pub server: ServerRef,
    pub runtime: RuntimeUpdate,
    pub teleport: TeleportUpdate,
    pub selinux: bool,
    pub docker_device: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeUpdate {
    pub installed: PackageLocator,
    pub secrets_package: Option<PackageLocator>,
    pub update: Option<RuntimeUpdatePackages>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeUpdatePackages {
    pub package: PackageLocator,
    pub config_package: PackageLocator,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeleportUpdate {
    pub installed: PackageLocator,
    pub update: Option<TeleportUpdatePackages>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeleportUpdatePackages {
    pub package: PackageLocator,
    pub node_config_package: Option<PackageLocator>,
}

/// Top-level container for an upgrade operation. Immutable once created;
/// the only thing that evolves afterward is the changelog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub operation_id: Uuid,
    pub operation_type: OperationType,
    pub cluster_name: String,
    pub servers: Vec<ServerRef>,
    pub gravity_package: PackageLocator,
    pub phases: Vec<Phase>,
    pub dns_config: DnsConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Update,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
    pub cluster_dns_ip: Option<String>,
}

/// An append-only changelog entry. Never mutated or removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub id: Uuid,
    pub cluster_name: String,
    pub operation_id: Uuid,
    pub phase_id: String,
    pub new_state: crate::phase::PhaseState,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ChangeEntry {
    pub fn new(
        cluster_name: impl Into<String>,
        operation_id: Uuid,
        phase_id: impl Into<String>,
        new_state: crate::phase::PhaseState,
        error: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            cluster_name: cluster_name.into(),
            operation_id,
            phase_id: phase_id.into(),
            new_state,
            error,
            created_at: Utc::now(),
        }
    }
}
