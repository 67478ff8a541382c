//! Cluster DTOs

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::node::NodeCandidate;

/// Declarative cluster definition submitted by a caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterDefinition {
    pub name: String,
    /// Name of the node that becomes the master; must appear in `nodes`
    pub master_node: String,
    pub nodes: Vec<ClusterNodeDefinition>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
}

/// One node of a definition, bound to a pre-selected candidate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNodeDefinition {
    pub node_name: String,
    pub node_candidate: NodeCandidate,
}

/// Adds worker nodes to a running cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleOutRequest {
    pub nodes: Vec<ClusterNodeDefinition>,
}

/// Removes worker nodes by name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleInRequest {
    pub node_names: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_env_vars_default_to_empty() {
        let json = r#"{
            "name": "demo",
            "master_node": "master",
            "nodes": [{
                "node_name": "master",
                "node_candidate": {
                    "id": "c1",
                    "cloud": { "cloud_id": "lab", "provider": "inventory" }
                }
            }]
        }"#;
        let def: ClusterDefinition = serde_json::from_str(json).unwrap();
        assert!(def.env_vars.is_empty());
        assert_eq!(def.nodes[0].node_candidate.cloud.provider, "inventory");
        assert!(def.nodes[0].node_candidate.hardware.is_none());
    }
}
