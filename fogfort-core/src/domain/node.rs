//! Node domain types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default secure shell port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// A provisioned (or to-be-provisioned) machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    /// Identifier assigned by the provisioner, absent until provisioned
    pub provider_id: Option<String>,
    pub name: String,
    pub node_candidate: NodeCandidate,
    /// Populated only after successful provisioning
    pub ssh_connection_parameters: Option<SshConnectionParameters>,
    pub node_url: Option<String>,
    pub status: NodeStatus,
}

impl Node {
    /// Creates a pending node bound to a candidate
    pub fn new(name: impl Into<String>, node_candidate: NodeCandidate) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider_id: None,
            name: name.into(),
            node_candidate,
            ssh_connection_parameters: None,
            node_url: None,
            status: NodeStatus::Pending,
        }
    }

    /// Applies a successful provisioning result. Returns false if the node
    /// already left `Pending`.
    pub fn mark_created(&mut self, provisioned: ProvisionedNode) -> bool {
        if self.status != NodeStatus::Pending {
            return false;
        }
        self.provider_id = Some(provisioned.provider_id);
        self.node_url = provisioned.node_url;
        self.ssh_connection_parameters = Some(provisioned.ssh_connection_parameters);
        self.status = NodeStatus::Created;
        true
    }

    /// Marks a provisioning failure. Returns false if the node already left `Pending`.
    pub fn mark_failed(&mut self) -> bool {
        if self.status != NodeStatus::Pending {
            return false;
        }
        self.status = NodeStatus::Failed;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Pending,
    Created,
    Failed,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Pending => "PENDING",
            NodeStatus::Created => "CREATED",
            NodeStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(NodeStatus::Pending),
            "CREATED" => Some(NodeStatus::Created),
            "FAILED" => Some(NodeStatus::Failed),
            _ => None,
        }
    }
}

/// Pre-selected hardware, image and location triple used to provision a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCandidate {
    pub id: String,
    pub cloud: Cloud,
    #[serde(default)]
    pub hardware: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

/// Infrastructure backend a candidate belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cloud {
    pub cloud_id: String,
    /// Provisioner name, e.g. "inventory"
    pub provider: String,
}

/// Remote shell connection data for a node
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConnectionParameters {
    pub ip_address: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub private_key: Option<String>,
}

impl SshConnectionParameters {
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SSH_PORT)
    }
}

// Key material never ends up in logs.
impl std::fmt::Debug for SshConnectionParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnectionParameters")
            .field("ip_address", &self.ip_address)
            .field("port", &self.port)
            .field("username", &self.username)
            .field(
                "private_key",
                &self.private_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Result of a successful `create_node` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedNode {
    pub provider_id: String,
    pub node_url: Option<String>,
    pub ssh_connection_parameters: SshConnectionParameters,
}
