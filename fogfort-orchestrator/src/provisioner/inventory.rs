//! Inventory Provisioner
//!
//! Hands out pre-existing hosts listed in a JSON file. Each host is bound to
//! one node candidate; creating a node allocates the first free host for the
//! candidate and deleting it returns the host to the pool.
//!
//! ```json
//! { "hosts": [ { "id": "lab-01", "candidate_id": "small", "ip_address": "10.0.0.11",
//!                "username": "ubuntu", "private_key_path": "/etc/fogfort/lab.key" } ] }
//! ```

use async_trait::async_trait;
use fogfort_core::domain::node::{
    Cloud, Node, NodeCandidate, NodeStatus, ProvisionedNode, SshConnectionParameters,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::{NodeProvisioner, ProvisionError};

pub const PROVIDER: &str = "inventory";

#[derive(Debug, Deserialize)]
struct InventoryFile {
    hosts: Vec<InventoryHost>,
}

/// One host of the pool
#[derive(Debug, Clone, Deserialize)]
pub struct InventoryHost {
    pub id: String,
    pub candidate_id: String,
    pub ip_address: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub username: String,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    #[serde(default)]
    pub node_url: Option<String>,
}

pub struct InventoryProvisioner {
    hosts: Vec<InventoryHost>,
    /// host id -> name of the node holding it
    allocations: Mutex<HashMap<String, String>>,
}

impl InventoryProvisioner {
    pub fn from_hosts(hosts: Vec<InventoryHost>) -> Self {
        Self {
            hosts,
            allocations: Mutex::new(HashMap::new()),
        }
    }

    /// Reads the inventory file and resolves `private_key_path` entries
    pub async fn load(path: &Path) -> Result<Self, ProvisionError> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            ProvisionError::Inventory(format!("cannot read {}: {}", path.display(), e))
        })?;
        let file: InventoryFile = serde_json::from_str(&raw).map_err(|e| {
            ProvisionError::Inventory(format!("cannot parse {}: {}", path.display(), e))
        })?;

        let mut hosts = Vec::with_capacity(file.hosts.len());
        for mut host in file.hosts {
            if host.private_key.is_none() {
                let Some(key_path) = &host.private_key_path else {
                    return Err(ProvisionError::Inventory(format!(
                        "host '{}' has neither private_key nor private_key_path",
                        host.id
                    )));
                };
                let key = tokio::fs::read_to_string(key_path).await.map_err(|e| {
                    ProvisionError::Inventory(format!(
                        "cannot read key of host '{}' at {}: {}",
                        host.id,
                        key_path.display(),
                        e
                    ))
                })?;
                host.private_key = Some(key);
            }
            if hosts.iter().any(|h: &InventoryHost| h.id == host.id) {
                return Err(ProvisionError::Inventory(format!(
                    "duplicate host id '{}'",
                    host.id
                )));
            }
            hosts.push(host);
        }

        tracing::info!("Loaded {} inventory hosts from {}", hosts.len(), path.display());
        Ok(Self::from_hosts(hosts))
    }

    /// Marks hosts of already created nodes as taken, e.g. after a restart
    pub async fn restore_allocations(&self, nodes: &[Node]) -> usize {
        let mut allocations = self.allocations.lock().await;
        let mut restored = 0;
        for node in nodes {
            if node.status != NodeStatus::Created
                || node.node_candidate.cloud.provider != PROVIDER
            {
                continue;
            }
            let Some(provider_id) = &node.provider_id else {
                continue;
            };
            if self.hosts.iter().any(|h| &h.id == provider_id) {
                allocations.insert(provider_id.clone(), node.name.clone());
                restored += 1;
            }
        }
        restored
    }

    pub async fn free_hosts(&self, candidate_id: &str) -> usize {
        let allocations = self.allocations.lock().await;
        self.hosts
            .iter()
            .filter(|h| h.candidate_id == candidate_id && !allocations.contains_key(&h.id))
            .count()
    }
}

fn provisioned(host: &InventoryHost) -> ProvisionedNode {
    ProvisionedNode {
        provider_id: host.id.clone(),
        node_url: host.node_url.clone(),
        ssh_connection_parameters: SshConnectionParameters {
            ip_address: Some(host.ip_address.clone()),
            port: host.port,
            username: Some(host.username.clone()),
            private_key: host.private_key.clone(),
        },
    }
}

#[async_trait]
impl NodeProvisioner for InventoryProvisioner {
    fn provider(&self) -> &str {
        PROVIDER
    }

    async fn create_node(
        &self,
        cloud: &Cloud,
        candidate: &NodeCandidate,
        name: &str,
    ) -> Result<ProvisionedNode, ProvisionError> {
        let mut allocations = self.allocations.lock().await;

        // Same node asking again gets the host it already holds
        if let Some(host_id) = allocations
            .iter()
            .find(|(_, node)| node.as_str() == name)
            .map(|(host, _)| host.clone())
        {
            if let Some(host) = self.hosts.iter().find(|h| h.id == host_id) {
                return Ok(provisioned(host));
            }
        }

        let host = self
            .hosts
            .iter()
            .find(|h| h.candidate_id == candidate.id && !allocations.contains_key(&h.id))
            .ok_or_else(|| ProvisionError::Exhausted(candidate.id.clone()))?;

        allocations.insert(host.id.clone(), name.to_string());
        tracing::info!(
            "Allocated inventory host {} ({}) to node {} in cloud {}",
            host.id,
            host.ip_address,
            name,
            cloud.cloud_id
        );

        Ok(provisioned(host))
    }

    async fn delete_node(&self, _cloud: &Cloud, node: &Node) -> Result<(), ProvisionError> {
        let provider_id = node
            .provider_id
            .as_deref()
            .ok_or_else(|| ProvisionError::UnknownNode(node.name.clone()))?;

        if !self.hosts.iter().any(|h| h.id == provider_id) {
            return Err(ProvisionError::UnknownNode(node.name.clone()));
        }

        let mut allocations = self.allocations.lock().await;
        if allocations.remove(provider_id).is_some() {
            tracing::info!("Released inventory host {} from node {}", provider_id, node.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn host(id: &str, candidate: &str) -> InventoryHost {
        InventoryHost {
            id: id.to_string(),
            candidate_id: candidate.to_string(),
            ip_address: format!("10.0.0.{}", id.len()),
            port: None,
            username: "ubuntu".to_string(),
            private_key: Some("KEY".to_string()),
            private_key_path: None,
            node_url: None,
        }
    }

    fn candidate(id: &str) -> NodeCandidate {
        NodeCandidate {
            id: id.to_string(),
            cloud: Cloud {
                cloud_id: "lab".to_string(),
                provider: PROVIDER.to_string(),
            },
            hardware: None,
            image: None,
            location: None,
        }
    }

    #[tokio::test]
    async fn test_allocates_hosts_per_candidate_until_exhausted() {
        let inv = InventoryProvisioner::from_hosts(vec![
            host("a", "small"),
            host("b", "small"),
            host("c", "large"),
        ]);
        let small = candidate("small");

        let first = inv.create_node(&small.cloud, &small, "n1").await.unwrap();
        let second = inv.create_node(&small.cloud, &small, "n2").await.unwrap();
        assert_eq!(first.provider_id, "a");
        assert_eq!(second.provider_id, "b");

        let err = inv.create_node(&small.cloud, &small, "n3").await.unwrap_err();
        assert!(matches!(err, ProvisionError::Exhausted(c) if c == "small"));
        assert_eq!(inv.free_hosts("large").await, 1);
    }

    #[tokio::test]
    async fn test_same_node_gets_same_host() {
        let inv = InventoryProvisioner::from_hosts(vec![host("a", "small"), host("b", "small")]);
        let small = candidate("small");

        let first = inv.create_node(&small.cloud, &small, "n1").await.unwrap();
        let again = inv.create_node(&small.cloud, &small, "n1").await.unwrap();

        assert_eq!(first.provider_id, again.provider_id);
        assert_eq!(inv.free_hosts("small").await, 1);
    }

    #[tokio::test]
    async fn test_delete_returns_host_to_pool() {
        let inv = InventoryProvisioner::from_hosts(vec![host("a", "small")]);
        let small = candidate("small");

        let details = inv.create_node(&small.cloud, &small, "n1").await.unwrap();
        let mut node = Node::new("n1", small.clone());
        node.mark_created(details);

        inv.delete_node(&small.cloud, &node).await.unwrap();
        assert_eq!(inv.free_hosts("small").await, 1);

        let other = inv.create_node(&small.cloud, &small, "n2").await.unwrap();
        assert_eq!(other.provider_id, "a");
    }

    #[tokio::test]
    async fn test_delete_unprovisioned_node_fails() {
        let inv = InventoryProvisioner::from_hosts(vec![host("a", "small")]);
        let small = candidate("small");
        let node = Node::new("n1", small.clone());

        let err = inv.delete_node(&small.cloud, &node).await.unwrap_err();
        assert!(matches!(err, ProvisionError::UnknownNode(n) if n == "n1"));
    }

    #[tokio::test]
    async fn test_restore_allocations_skips_pending_nodes() {
        let inv = InventoryProvisioner::from_hosts(vec![host("a", "small"), host("b", "small")]);
        let small = candidate("small");

        let mut created = Node::new("n1", small.clone());
        created.mark_created(provisioned(&host("a", "small")));
        let pending = Node::new("n2", small.clone());

        assert_eq!(inv.restore_allocations(&[created, pending]).await, 1);
        assert_eq!(inv.free_hosts("small").await, 1);
    }

    #[tokio::test]
    async fn test_load_resolves_key_path() {
        let dir = tempdir().unwrap();
        let key_path = dir.path().join("lab.key");
        std::fs::write(&key_path, "PRIVATE").unwrap();

        let inventory_path = dir.path().join("inventory.json");
        let body = serde_json::json!({
            "hosts": [{
                "id": "lab-01",
                "candidate_id": "small",
                "ip_address": "10.0.0.11",
                "port": 2222,
                "username": "ubuntu",
                "private_key_path": key_path,
            }]
        });
        std::fs::write(&inventory_path, body.to_string()).unwrap();

        let inv = InventoryProvisioner::load(&inventory_path).await.unwrap();
        let small = candidate("small");
        let details = inv.create_node(&small.cloud, &small, "n1").await.unwrap();

        let ssh = details.ssh_connection_parameters;
        assert_eq!(ssh.private_key.as_deref(), Some("PRIVATE"));
        assert_eq!(ssh.port, Some(2222));
        assert_eq!(ssh.ip_address.as_deref(), Some("10.0.0.11"));
    }

    #[tokio::test]
    async fn test_load_rejects_host_without_key() {
        let dir = tempdir().unwrap();
        let inventory_path = dir.path().join("inventory.json");
        std::fs::write(
            &inventory_path,
            r#"{"hosts":[{"id":"a","candidate_id":"small","ip_address":"10.0.0.1","username":"u"}]}"#,
        )
        .unwrap();

        let err = InventoryProvisioner::load(&inventory_path)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProvisionError::Inventory(_)));
    }
}
