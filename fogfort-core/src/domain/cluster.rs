//! Cluster domain types

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::node::Node;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClusterModelError {
    #[error("master node '{master}' not found in cluster '{cluster}'")]
    MasterNotFound { cluster: String, master: String },
}

/// A named set of nodes with one designated master
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: Uuid,
    pub name: String,
    pub master_node_name: String,
    pub nodes: Vec<Node>,
    pub status: ClusterStatus,
    /// Variables exported into every bootstrap script
    pub env_vars: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Cluster {
    /// Returns the node whose name equals `master_node_name`
    pub fn master_node(&self) -> Result<&Node, ClusterModelError> {
        self.nodes
            .iter()
            .find(|n| n.name == self.master_node_name)
            .ok_or_else(|| ClusterModelError::MasterNotFound {
                cluster: self.name.clone(),
                master: self.master_node_name.clone(),
            })
    }

    /// Every node except the master, each at most once
    pub fn worker_nodes(&self) -> Vec<&Node> {
        let mut seen = HashSet::new();
        self.nodes
            .iter()
            .filter(|n| n.name != self.master_node_name)
            .filter(|n| seen.insert(n.id))
            .collect()
    }

    pub fn find_node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Copy safe to hand out over the API: private keys removed
    pub fn without_secrets(&self) -> Cluster {
        let mut cluster = self.clone();
        for node in &mut cluster.nodes {
            if let Some(params) = node.ssh_connection_parameters.as_mut() {
                params.private_key = None;
            }
        }
        cluster
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    Defined,
    Submitted,
    Running,
    Scaling,
    Terminating,
    Failed,
}

impl ClusterStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ClusterStatus::Defined => "DEFINED",
            ClusterStatus::Submitted => "SUBMITTED",
            ClusterStatus::Running => "RUNNING",
            ClusterStatus::Scaling => "SCALING",
            ClusterStatus::Terminating => "TERMINATING",
            ClusterStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DEFINED" => Some(ClusterStatus::Defined),
            "SUBMITTED" => Some(ClusterStatus::Submitted),
            "RUNNING" => Some(ClusterStatus::Running),
            "SCALING" => Some(ClusterStatus::Scaling),
            "TERMINATING" => Some(ClusterStatus::Terminating),
            "FAILED" => Some(ClusterStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node::{Cloud, NodeCandidate};

    fn node(name: &str) -> Node {
        Node::new(
            name,
            NodeCandidate {
                id: "c1".to_string(),
                cloud: Cloud {
                    cloud_id: "lab".to_string(),
                    provider: "inventory".to_string(),
                },
                hardware: None,
                image: None,
                location: None,
            },
        )
    }

    fn cluster(master: &str, nodes: Vec<Node>) -> Cluster {
        Cluster {
            id: Uuid::new_v4(),
            name: "demo".to_string(),
            master_node_name: master.to_string(),
            nodes,
            status: ClusterStatus::Defined,
            env_vars: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_master_node_found() {
        let c = cluster("master", vec![node("worker-1"), node("master")]);
        assert_eq!(c.master_node().unwrap().name, "master");
    }

    #[test]
    fn test_master_node_missing() {
        let c = cluster("master", vec![node("worker-1")]);
        assert_eq!(
            c.master_node().unwrap_err(),
            ClusterModelError::MasterNotFound {
                cluster: "demo".to_string(),
                master: "master".to_string(),
            }
        );
    }

    #[test]
    fn test_worker_nodes_excludes_master_without_duplicates() {
        let w1 = node("worker-1");
        let c = cluster(
            "master",
            vec![node("master"), w1.clone(), node("worker-2"), w1],
        );
        let names: Vec<_> = c.worker_nodes().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["worker-1", "worker-2"]);
    }

    #[test]
    fn test_without_secrets_strips_keys() {
        use crate::domain::node::SshConnectionParameters;

        let mut master = node("master");
        master.ssh_connection_parameters = Some(SshConnectionParameters {
            ip_address: Some("10.0.0.1".to_string()),
            port: None,
            username: Some("ubuntu".to_string()),
            private_key: Some("KEY".to_string()),
        });
        let c = cluster("master", vec![master]);

        let public = c.without_secrets();
        let params = public.nodes[0].ssh_connection_parameters.as_ref().unwrap();
        assert!(params.private_key.is_none());
        assert_eq!(params.username.as_deref(), Some("ubuntu"));
        assert!(c.nodes[0].ssh_connection_parameters.as_ref().unwrap().private_key.is_some());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(ClusterStatus::parse("SCALING"), Some(ClusterStatus::Scaling));
        assert_eq!(ClusterStatus::parse("nope"), None);
    }
}
