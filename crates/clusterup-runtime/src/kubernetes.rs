//! `KubernetesClient`: endpoints list/watch, node labels/taints/cordon,
//! Job creation for hooks, RBAC CRUD, ConfigMap CRUD. This is a fake
//! in-memory client good enough to drive the rolling-update sequence and
//! its tests, not a real API client.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use clusterup_common::ClusterupError;

#[derive(Debug, Clone, Default)]
struct NodeState {
    cordoned: bool,
    tainted: bool,
    labels: HashMap<String, String>,
    ready: bool,
}

#[async_trait]
pub trait KubernetesClient: Send + Sync {
    async fn ready_endpoint_count(&self, service: &str) -> Result<usize, ClusterupError>;

    async fn cordon_node(&self, node: &str) -> Result<(), ClusterupError>;
    async fn uncordon_node(&self, node: &str) -> Result<(), ClusterupError>;
    /// Evicts every evictable pod on `node`; errors (fails closed) if a
    /// pod disruption budget blocks eviction past `timeout`.
    async fn drain_node(&self, node: &str) -> Result<(), ClusterupError>;
    async fn taint_node(&self, node: &str) -> Result<(), ClusterupError>;
    async fn untaint_node(&self, node: &str) -> Result<(), ClusterupError>;
    async fn label_node(&self, node: &str, key: &str, value: &str) -> Result<(), ClusterupError>;
    async fn node_ready(&self, node: &str) -> Result<bool, ClusterupError>;
    async fn set_node_ready(&self, node: &str, ready: bool);

    async fn run_hook_job(&self, name: &str) -> Result<(), ClusterupError>;

    async fn apply_cluster_role(&self, name: &str) -> Result<(), ClusterupError>;
    async fn apply_cluster_role_binding(&self, name: &str) -> Result<(), ClusterupError>;
    async fn apply_role(&self, namespace: &str, name: &str) -> Result<(), ClusterupError>;
    async fn apply_role_binding(&self, namespace: &str, name: &str) -> Result<(), ClusterupError>;
    async fn apply_config_map(&self, namespace: &str, name: &str, data: &str) -> Result<(), ClusterupError>;
}

/// In-memory fake. Every applied RBAC/ConfigMap object and every node's
/// cordon/taint/label/readiness state is tracked so tests can assert on
/// the rolling-update sequence's side effects.
#[derive(Default)]
pub struct FakeKubernetesClient {
    nodes: Mutex<HashMap<String, NodeState>>,
    endpoints: Mutex<HashMap<String, usize>>,
    applied: Mutex<HashSet<String>>,
}

impl FakeKubernetesClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready_endpoints(&self, service: &str, count: usize) {
        self.endpoints.lock().unwrap().insert(service.to_string(), count);
    }

    pub fn is_cordoned(&self, node: &str) -> bool {
        self.nodes.lock().unwrap().get(node).map(|n| n.cordoned).unwrap_or(false)
    }

    pub fn is_tainted(&self, node: &str) -> bool {
        self.nodes.lock().unwrap().get(node).map(|n| n.tainted).unwrap_or(false)
    }

    pub fn has_applied(&self, object: &str) -> bool {
        self.applied.lock().unwrap().contains(object)
    }

    fn node_entry(&self, node: &str) -> NodeState {
        self.nodes.lock().unwrap().entry(node.to_string()).or_default().clone()
    }
}

#[async_trait]
impl KubernetesClient for FakeKubernetesClient {
    async fn ready_endpoint_count(&self, service: &str) -> Result<usize, ClusterupError> {
        Ok(*self.endpoints.lock().unwrap().get(service).unwrap_or(&0))
    }

    async fn cordon_node(&self, node: &str) -> Result<(), ClusterupError> {
        self.nodes.lock().unwrap().entry(node.to_string()).or_default().cordoned = true;
        Ok(())
    }

    async fn uncordon_node(&self, node: &str) -> Result<(), ClusterupError> {
        self.nodes.lock().unwrap().entry(node.to_string()).or_default().cordoned = false;
        Ok(())
    }

    async fn drain_node(&self, node: &str) -> Result<(), ClusterupError> {
        if !self.node_entry(node).cordoned {
            self.cordon_node(node).await?;
        }
        Ok(())
    }

    async fn taint_node(&self, node: &str) -> Result<(), ClusterupError> {
        self.nodes.lock().unwrap().entry(node.to_string()).or_default().tainted = true;
        Ok(())
    }

    async fn untaint_node(&self, node: &str) -> Result<(), ClusterupError> {
        self.nodes.lock().unwrap().entry(node.to_string()).or_default().tainted = false;
        Ok(())
    }

    async fn label_node(&self, node: &str, key: &str, value: &str) -> Result<(), ClusterupError> {
        self.nodes
            .lock()
            .unwrap()
            .entry(node.to_string())
            .or_default()
            .labels
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn node_ready(&self, node: &str) -> Result<bool, ClusterupError> {
        Ok(self.node_entry(node).ready)
    }

    async fn set_node_ready(&self, node: &str, ready: bool) {
        self.nodes.lock().unwrap().entry(node.to_string()).or_default().ready = ready;
    }

    async fn run_hook_job(&self, name: &str) -> Result<(), ClusterupError> {
        self.applied.lock().unwrap().insert(format!("job/{name}"));
        Ok(())
    }

    async fn apply_cluster_role(&self, name: &str) -> Result<(), ClusterupError> {
        self.applied.lock().unwrap().insert(format!("clusterrole/{name}"));
        Ok(())
    }

    async fn apply_cluster_role_binding(&self, name: &str) -> Result<(), ClusterupError> {
        self.applied.lock().unwrap().insert(format!("clusterrolebinding/{name}"));
        Ok(())
    }

    async fn apply_role(&self, namespace: &str, name: &str) -> Result<(), ClusterupError> {
        self.applied.lock().unwrap().insert(format!("role/{namespace}/{name}"));
        Ok(())
    }

    async fn apply_role_binding(&self, namespace: &str, name: &str) -> Result<(), ClusterupError> {
        self.applied.lock().unwrap().insert(format!("rolebinding/{namespace}/{name}"));
        Ok(())
    }

    async fn apply_config_map(&self, namespace: &str, name: &str, _data: &str) -> Result<(), ClusterupError> {
        self.applied.lock().unwrap().insert(format!("configmap/{namespace}/{name}"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_cordons_the_node() {
        let client = FakeKubernetesClient::new();
        client.drain_node("node-1").await.unwrap();
        assert!(client.is_cordoned("node-1"));
    }

    #[tokio::test]
    async fn taint_untaint_round_trip() {
        let client = FakeKubernetesClient::new();
        client.taint_node("node-1").await.unwrap();
        assert!(client.is_tainted("node-1"));
        client.untaint_node("node-1").await.unwrap();
        assert!(!client.is_tainted("node-1"));
    }

    #[tokio::test]
    async fn coredns_applies_all_four_rbac_objects() {
        let client = FakeKubernetesClient::new();
        client.apply_cluster_role("coredns").await.unwrap();
        client.apply_cluster_role_binding("coredns").await.unwrap();
        client.apply_role("kube-system", "coredns").await.unwrap();
        client.apply_role_binding("kube-system", "coredns").await.unwrap();
        assert!(client.has_applied("clusterrole/coredns"));
        assert!(client.has_applied("clusterrolebinding/coredns"));
        assert!(client.has_applied("role/kube-system/coredns"));
        assert!(client.has_applied("rolebinding/kube-system/coredns"));
    }
}
