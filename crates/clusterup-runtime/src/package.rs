//! `PackageService`: opaque content-addressed blob store with labels.
//! Labels carry metadata such as `purpose=runtime-upgrade` that the Plan
//! Builder uses to discover intermediate runtimes.

use std::collections::HashMap;

use async_trait::async_trait;
use clusterup_common::{ClusterupError, PackageLocator};
use dashmap::DashMap;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct PackageEnvelope {
    pub locator: PackageLocator,
    pub labels: HashMap<String, String>,
    pub content: Vec<u8>,
}

impl PackageEnvelope {
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.content);
        hex_digest(hasher.finalize().as_slice())
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[async_trait]
pub trait PackageService: Send + Sync {
    async fn get_app(&self, locator: &PackageLocator) -> Result<PackageEnvelope, ClusterupError>;
    async fn read_package(&self, locator: &PackageLocator) -> Result<Vec<u8>, ClusterupError>;
    async fn upsert_package(
        &self,
        locator: PackageLocator,
        content: Vec<u8>,
        labels: HashMap<String, String>,
    ) -> Result<(), ClusterupError>;
    async fn delete_package(&self, locator: &PackageLocator) -> Result<(), ClusterupError>;
    async fn create_package(
        &self,
        locator: PackageLocator,
        content: Vec<u8>,
    ) -> Result<(), ClusterupError>;

    /// Linear scan over every stored package, used by the Plan Builder to
    /// discover intermediate runtimes by label.
    async fn foreach_package(
        &self,
        visit: &mut (dyn FnMut(&PackageEnvelope) + Send),
    ) -> Result<(), ClusterupError>;
}

fn key(locator: &PackageLocator) -> String {
    format!("{}:{}", locator.name, locator.version)
}

#[derive(Default)]
pub struct InMemoryPackageService {
    packages: DashMap<String, PackageEnvelope>,
}

impl InMemoryPackageService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PackageService for InMemoryPackageService {
    async fn get_app(&self, locator: &PackageLocator) -> Result<PackageEnvelope, ClusterupError> {
        self.packages
            .get(&key(locator))
            .map(|e| e.clone())
            .ok_or_else(|| ClusterupError::not_found(format!("package {locator}")))
    }

    async fn read_package(&self, locator: &PackageLocator) -> Result<Vec<u8>, ClusterupError> {
        self.get_app(locator).await.map(|e| e.content)
    }

    async fn upsert_package(
        &self,
        locator: PackageLocator,
        content: Vec<u8>,
        labels: HashMap<String, String>,
    ) -> Result<(), ClusterupError> {
        self.packages.insert(key(&locator), PackageEnvelope { locator, labels, content });
        Ok(())
    }

    async fn delete_package(&self, locator: &PackageLocator) -> Result<(), ClusterupError> {
        self.packages.remove(&key(locator));
        Ok(())
    }

    async fn create_package(
        &self,
        locator: PackageLocator,
        content: Vec<u8>,
    ) -> Result<(), ClusterupError> {
        let k = key(&locator);
        if self.packages.contains_key(&k) {
            return Err(ClusterupError::already_exists(format!("package {locator}")));
        }
        self.packages.insert(k, PackageEnvelope { locator, labels: HashMap::new(), content });
        Ok(())
    }

    async fn foreach_package(
        &self,
        visit: &mut (dyn FnMut(&PackageEnvelope) + Send),
    ) -> Result<(), ClusterupError> {
        for entry in self.packages.iter() {
            visit(entry.value());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_package_rejects_duplicate() {
        let svc = InMemoryPackageService::new();
        let locator = PackageLocator { name: "runtime".into(), version: "1.5.0".into() };
        svc.create_package(locator.clone(), vec![1, 2, 3]).await.unwrap();
        let err = svc.create_package(locator, vec![4]).await.unwrap_err();
        assert!(matches!(err, ClusterupError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn foreach_package_finds_labeled_intermediate_runtimes() {
        let svc = InMemoryPackageService::new();
        let mut labels = HashMap::new();
        labels.insert("purpose".to_string(), "runtime-upgrade".to_string());
        svc.upsert_package(
            PackageLocator { name: "runtime".into(), version: "1.5.0".into() },
            vec![],
            labels,
        )
        .await
        .unwrap();
        svc.upsert_package(
            PackageLocator { name: "runtime".into(), version: "1.0.0".into() },
            vec![],
            HashMap::new(),
        )
        .await
        .unwrap();

        let mut found = Vec::new();
        svc.foreach_package(&mut |pkg| {
            if pkg.labels.get("purpose").map(String::as_str) == Some("runtime-upgrade") {
                found.push(pkg.locator.version.clone());
            }
        })
        .await
        .unwrap();
        assert_eq!(found, vec!["1.5.0"]);
    }
}
