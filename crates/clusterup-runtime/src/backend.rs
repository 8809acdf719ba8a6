//! The `Backend` trait: the cluster-wide consensus store and the local
//! per-node store the reconciler merges between.
//!
//! A capability-based `Ping` is preferred over a fragile
//! `isEtcdAvailable` shell-out; `Backend::ping` is that capability. Two
//! implementations are provided: `LocalFileBackend` (rusqlite,
//! authoritative per node) and `InMemoryClusterBackend` (dashmap,
//! standing in for the consensus store, with a toggle to simulate an
//! etcd-upgrade-window outage).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use clusterup_common::plan::TrustedCluster;
use clusterup_common::{ChangeEntry, ClusterupError, Plan};
use dashmap::DashMap;
use uuid::Uuid;

/// Result of probing a backend's reachability, per the design note's
/// `Ping(ctx) -> Available|Unavailable|Error` capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendAvailability {
    Available,
    /// Reachable transport, but the backend reports itself disabled or
    /// masked (e.g. etcd mid-upgrade) — the reconciler treats this the
    /// same as `Unavailable`: skip sync, don't error.
    Unavailable,
    Error(String),
}

impl BackendAvailability {
    pub fn should_skip_sync(&self) -> bool {
        !matches!(self, BackendAvailability::Available)
    }
}

/// A linearizable-per-key key-value backend.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn ping(&self) -> BackendAvailability;

    async fn get_operation_plan(
        &self,
        cluster_name: &str,
        operation_id: Uuid,
    ) -> Result<Option<Plan>, ClusterupError>;

    async fn create_operation_plan(&self, plan: &Plan) -> Result<(), ClusterupError>;

    async fn get_operation_plan_changelog(
        &self,
        cluster_name: &str,
        operation_id: Uuid,
    ) -> Result<Vec<ChangeEntry>, ClusterupError>;

    async fn create_operation_plan_change(&self, entry: ChangeEntry) -> Result<(), ClusterupError>;

    async fn get_last_operation(&self, cluster_name: &str) -> Result<Option<Uuid>, ClusterupError>;

    async fn list_trusted_clusters(&self) -> Result<Vec<TrustedCluster>, ClusterupError>;

    async fn upsert_trusted_cluster(&self, cluster: TrustedCluster) -> Result<(), ClusterupError>;

    async fn delete_trusted_cluster(&self, name: &str) -> Result<(), ClusterupError>;
}

fn plan_key(cluster_name: &str, operation_id: Uuid) -> String {
    format!("{cluster_name}/{operation_id}")
}

/// Consensus-replicated stand-in: durable across "nodes" (within this
/// process) but can be flipped `Unavailable` to model the etcd upgrade
/// window in which the cluster backend is torn down.
pub struct InMemoryClusterBackend {
    plans: DashMap<String, Plan>,
    changelog: DashMap<String, Vec<ChangeEntry>>,
    last_operation: DashMap<String, Uuid>,
    trusted_clusters: DashMap<String, TrustedCluster>,
    available: AtomicBool,
}

impl Default for InMemoryClusterBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryClusterBackend {
    pub fn new() -> Self {
        Self {
            plans: DashMap::new(),
            changelog: DashMap::new(),
            last_operation: DashMap::new(),
            trusted_clusters: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the etcd barrier tearing the consensus store down.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

#[async_trait]
impl Backend for InMemoryClusterBackend {
    async fn ping(&self) -> BackendAvailability {
        if self.available.load(Ordering::SeqCst) {
            BackendAvailability::Available
        } else {
            BackendAvailability::Unavailable
        }
    }

    async fn get_operation_plan(
        &self,
        cluster_name: &str,
        operation_id: Uuid,
    ) -> Result<Option<Plan>, ClusterupError> {
        Ok(self.plans.get(&plan_key(cluster_name, operation_id)).map(|p| p.clone()))
    }

    async fn create_operation_plan(&self, plan: &Plan) -> Result<(), ClusterupError> {
        let key = plan_key(&plan.cluster_name, plan.operation_id);
        if self.plans.contains_key(&key) {
            return Err(ClusterupError::already_exists(format!("operation plan {key}")));
        }
        self.plans.insert(key, plan.clone());
        self.last_operation.insert(plan.cluster_name.clone(), plan.operation_id);
        Ok(())
    }

    async fn get_operation_plan_changelog(
        &self,
        cluster_name: &str,
        operation_id: Uuid,
    ) -> Result<Vec<ChangeEntry>, ClusterupError> {
        Ok(self
            .changelog
            .get(&plan_key(cluster_name, operation_id))
            .map(|v| v.clone())
            .unwrap_or_default())
    }

    async fn create_operation_plan_change(&self, entry: ChangeEntry) -> Result<(), ClusterupError> {
        let key = plan_key(&entry.cluster_name, entry.operation_id);
        let mut list = self.changelog.entry(key).or_default();
        if list.iter().any(|e| e.id == entry.id) {
            return Ok(());
        }
        list.push(entry);
        Ok(())
    }

    async fn get_last_operation(&self, cluster_name: &str) -> Result<Option<Uuid>, ClusterupError> {
        Ok(self.last_operation.get(cluster_name).map(|v| *v))
    }

    async fn list_trusted_clusters(&self) -> Result<Vec<TrustedCluster>, ClusterupError> {
        Ok(self.trusted_clusters.iter().map(|e| e.value().clone()).collect())
    }

    async fn upsert_trusted_cluster(&self, cluster: TrustedCluster) -> Result<(), ClusterupError> {
        self.trusted_clusters.insert(cluster.name.clone(), cluster);
        Ok(())
    }

    async fn delete_trusted_cluster(&self, name: &str) -> Result<(), ClusterupError> {
        self.trusted_clusters.remove(name);
        Ok(())
    }
}

/// Per-node filesystem-backed store, authoritative for that node's view
/// even while the cluster backend is unreachable.
pub struct LocalFileBackend {
    conn: Mutex<rusqlite::Connection>,
}

impl LocalFileBackend {
    pub fn open(path: &Path) -> Result<Self, ClusterupError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ClusterupError::transient(format!("create state dir: {e}")))?;
        }
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| ClusterupError::transient(format!("open local backend: {e}")))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS plans (key TEXT PRIMARY KEY, cluster_name TEXT NOT NULL, json TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS changelog (id TEXT PRIMARY KEY, key TEXT NOT NULL, json TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS trusted_clusters (name TEXT PRIMARY KEY, json TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS last_operation (cluster_name TEXT PRIMARY KEY, operation_id TEXT NOT NULL);",
        )
        .map_err(|e| ClusterupError::transient(format!("init local backend schema: {e}")))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, ClusterupError> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| ClusterupError::transient(format!("open in-memory local backend: {e}")))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS plans (key TEXT PRIMARY KEY, cluster_name TEXT NOT NULL, json TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS changelog (id TEXT PRIMARY KEY, key TEXT NOT NULL, json TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS trusted_clusters (name TEXT PRIMARY KEY, json TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS last_operation (cluster_name TEXT PRIMARY KEY, operation_id TEXT NOT NULL);",
        )
        .map_err(|e| ClusterupError::transient(format!("init local backend schema: {e}")))?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

#[async_trait]
impl Backend for LocalFileBackend {
    async fn ping(&self) -> BackendAvailability {
        BackendAvailability::Available
    }

    async fn get_operation_plan(
        &self,
        cluster_name: &str,
        operation_id: Uuid,
    ) -> Result<Option<Plan>, ClusterupError> {
        let conn = self.conn.lock().unwrap();
        let key = plan_key(cluster_name, operation_id);
        let result: rusqlite::Result<String> = conn.query_row(
            "SELECT json FROM plans WHERE key = ?1",
            [&key],
            |row| row.get(0),
        );
        match result {
            Ok(json) => Ok(Some(
                serde_json::from_str(&json)
                    .map_err(|e| ClusterupError::validation(format!("corrupt stored plan: {e}")))?,
            )),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(ClusterupError::transient(format!("read local plan: {e}"))),
        }
    }

    async fn create_operation_plan(&self, plan: &Plan) -> Result<(), ClusterupError> {
        let conn = self.conn.lock().unwrap();
        let key = plan_key(&plan.cluster_name, plan.operation_id);
        let exists: bool = conn
            .query_row("SELECT 1 FROM plans WHERE key = ?1", [&key], |_| Ok(true))
            .unwrap_or(false);
        if exists {
            return Err(ClusterupError::already_exists(format!("operation plan {key}")));
        }
        let json = serde_json::to_string(plan)
            .map_err(|e| ClusterupError::validation(format!("serialize plan: {e}")))?;
        conn.execute(
            "INSERT INTO plans (key, cluster_name, json) VALUES (?1, ?2, ?3)",
            rusqlite::params![key, plan.cluster_name, json],
        )
        .map_err(|e| ClusterupError::transient(format!("write local plan: {e}")))?;
        conn.execute(
            "INSERT OR REPLACE INTO last_operation (cluster_name, operation_id) VALUES (?1, ?2)",
            rusqlite::params![plan.cluster_name, plan.operation_id.to_string()],
        )
        .map_err(|e| ClusterupError::transient(format!("record last operation: {e}")))?;
        Ok(())
    }

    async fn get_operation_plan_changelog(
        &self,
        cluster_name: &str,
        operation_id: Uuid,
    ) -> Result<Vec<ChangeEntry>, ClusterupError> {
        let conn = self.conn.lock().unwrap();
        let key = plan_key(cluster_name, operation_id);
        let mut stmt = conn
            .prepare("SELECT json FROM changelog WHERE key = ?1")
            .map_err(|e| ClusterupError::transient(format!("prepare changelog read: {e}")))?;
        let rows = stmt
            .query_map([&key], |row| row.get::<_, String>(0))
            .map_err(|e| ClusterupError::transient(format!("read changelog: {e}")))?;
        let mut entries = Vec::new();
        for row in rows {
            let json = row.map_err(|e| ClusterupError::transient(format!("read changelog row: {e}")))?;
            entries.push(
                serde_json::from_str(&json)
                    .map_err(|e| ClusterupError::validation(format!("corrupt changelog entry: {e}")))?,
            );
        }
        Ok(entries)
    }

    async fn create_operation_plan_change(&self, entry: ChangeEntry) -> Result<(), ClusterupError> {
        let conn = self.conn.lock().unwrap();
        let key = plan_key(&entry.cluster_name, entry.operation_id);
        let id = entry.id.to_string();
        let json = serde_json::to_string(&entry)
            .map_err(|e| ClusterupError::validation(format!("serialize changelog entry: {e}")))?;
        conn.execute(
            "INSERT OR IGNORE INTO changelog (id, key, json) VALUES (?1, ?2, ?3)",
            rusqlite::params![id, key, json],
        )
        .map_err(|e| ClusterupError::transient(format!("append changelog entry: {e}")))?;
        Ok(())
    }

    async fn get_last_operation(&self, cluster_name: &str) -> Result<Option<Uuid>, ClusterupError> {
        let conn = self.conn.lock().unwrap();
        let result: rusqlite::Result<String> = conn.query_row(
            "SELECT operation_id FROM last_operation WHERE cluster_name = ?1",
            [cluster_name],
            |row| row.get(0),
        );
        match result {
            Ok(s) => Ok(Some(
                Uuid::parse_str(&s).map_err(|e| ClusterupError::validation(format!("corrupt operation id: {e}")))?,
            )),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(ClusterupError::transient(format!("read last operation: {e}"))),
        }
    }

    async fn list_trusted_clusters(&self) -> Result<Vec<TrustedCluster>, ClusterupError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT json FROM trusted_clusters")
            .map_err(|e| ClusterupError::transient(format!("prepare trusted cluster read: {e}")))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| ClusterupError::transient(format!("read trusted clusters: {e}")))?;
        let mut out = Vec::new();
        for row in rows {
            let json = row.map_err(|e| ClusterupError::transient(format!("read trusted cluster row: {e}")))?;
            out.push(
                serde_json::from_str(&json)
                    .map_err(|e| ClusterupError::validation(format!("corrupt trusted cluster: {e}")))?,
            );
        }
        Ok(out)
    }

    async fn upsert_trusted_cluster(&self, cluster: TrustedCluster) -> Result<(), ClusterupError> {
        let conn = self.conn.lock().unwrap();
        let json = serde_json::to_string(&cluster)
            .map_err(|e| ClusterupError::validation(format!("serialize trusted cluster: {e}")))?;
        conn.execute(
            "INSERT OR REPLACE INTO trusted_clusters (name, json) VALUES (?1, ?2)",
            rusqlite::params![cluster.name, json],
        )
        .map_err(|e| ClusterupError::transient(format!("write trusted cluster: {e}")))?;
        Ok(())
    }

    async fn delete_trusted_cluster(&self, name: &str) -> Result<(), ClusterupError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM trusted_clusters WHERE name = ?1", [name])
            .map_err(|e| ClusterupError::transient(format!("delete trusted cluster: {e}")))?;
        Ok(())
    }
}

/// Computes the per-operation backup database path:
/// `<stateDir>/backup/<operationId>/backup.db`.
pub fn backup_db_path(state_dir: &Path, operation_id: Uuid) -> PathBuf {
    state_dir.join("backup").join(operation_id.to_string()).join("backup.db")
}
