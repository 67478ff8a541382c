//! Node Provisioner Module
//!
//! Seam between the orchestrator and whatever creates raw compute
//! instances. Provisioners are looked up by the cloud provider named in a
//! node's candidate.

pub mod inventory;

use async_trait::async_trait;
use fogfort_core::domain::node::{Cloud, Node, NodeCandidate, ProvisionedNode};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub use inventory::InventoryProvisioner;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("no provisioner registered for provider '{0}'")]
    UnknownProvider(String),

    #[error("no free host left for candidate '{0}'")]
    Exhausted(String),

    #[error("node '{0}' is not known to the provisioner")]
    UnknownNode(String),

    #[error("provisioning backend error: {0}")]
    Backend(String),

    #[error("inventory error: {0}")]
    Inventory(String),
}

/// Creates and destroys compute instances for one provider
#[async_trait]
pub trait NodeProvisioner: Send + Sync {
    /// Provider name matched against `Cloud::provider`
    fn provider(&self) -> &str;

    async fn create_node(
        &self,
        cloud: &Cloud,
        candidate: &NodeCandidate,
        name: &str,
    ) -> Result<ProvisionedNode, ProvisionError>;

    async fn delete_node(&self, cloud: &Cloud, node: &Node) -> Result<(), ProvisionError>;
}

/// Provisioners keyed by provider name
#[derive(Clone, Default)]
pub struct ProvisionerRegistry {
    provisioners: HashMap<String, Arc<dyn NodeProvisioner>>,
}

impl ProvisionerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provisioner: Arc<dyn NodeProvisioner>) {
        let provider = provisioner.provider().to_string();
        if self
            .provisioners
            .insert(provider.clone(), provisioner)
            .is_some()
        {
            tracing::warn!("Provisioner for provider '{}' replaced", provider);
        }
    }

    pub fn with(mut self, provisioner: Arc<dyn NodeProvisioner>) -> Self {
        self.register(provisioner);
        self
    }

    pub fn providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.provisioners.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn lookup(&self, cloud: &Cloud) -> Result<&Arc<dyn NodeProvisioner>, ProvisionError> {
        self.provisioners
            .get(&cloud.provider)
            .ok_or_else(|| ProvisionError::UnknownProvider(cloud.provider.clone()))
    }

    /// Creates a node on the provider named by the candidate's cloud
    pub async fn create_node(
        &self,
        candidate: &NodeCandidate,
        name: &str,
    ) -> Result<ProvisionedNode, ProvisionError> {
        self.lookup(&candidate.cloud)?
            .create_node(&candidate.cloud, candidate, name)
            .await
    }

    pub async fn delete_node(&self, node: &Node) -> Result<(), ProvisionError> {
        let cloud = &node.node_candidate.cloud;
        self.lookup(cloud)?.delete_node(cloud, node).await
    }
}
