//! Test doubles for the provisioner and runner seams

use async_trait::async_trait;
use chrono::Utc;
use fogfort_core::domain::cluster::{Cluster, ClusterStatus};
use fogfort_core::domain::job::TaskExecution;
use fogfort_core::domain::node::{
    Cloud, Node, NodeCandidate, ProvisionedNode, SshConnectionParameters,
};
use fogfort_runner::ssh::SshTarget;
use fogfort_runner::{LogStore, MemoryLogStore, ScriptRunner};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::ledger::{Ledger, MemoryLedger};
use crate::provisioner::{NodeProvisioner, ProvisionError, ProvisionerRegistry};
use crate::service::deploy::{DeploySettings, Orchestrator, WorkerFailurePolicy};
use crate::service::scripts::ScriptTemplates;

pub(crate) const FAKE_PROVIDER: &str = "fake";

pub(crate) fn host_of(node_name: &str) -> String {
    format!("host-{}", node_name)
}

pub(crate) fn candidate() -> NodeCandidate {
    NodeCandidate {
        id: "small".to_string(),
        cloud: Cloud {
            cloud_id: "lab".to_string(),
            provider: FAKE_PROVIDER.to_string(),
        },
        hardware: Some("2cpu-4gb".to_string()),
        image: Some("ubuntu-24.04".to_string()),
        location: None,
    }
}

/// Stores a DEFINED cluster with a node called `master` plus `workers`
pub(crate) async fn insert_cluster(ledger: &MemoryLedger, name: &str, workers: &[&str]) -> Cluster {
    let mut nodes = vec![Node::new("master", candidate())];
    nodes.extend(workers.iter().map(|w| Node::new(*w, candidate())));

    let cluster = Cluster {
        id: Uuid::new_v4(),
        name: name.to_string(),
        master_node_name: "master".to_string(),
        nodes,
        status: ClusterStatus::Defined,
        env_vars: HashMap::from([("CLUSTER_NAME".to_string(), name.to_string())]),
        created_at: Utc::now(),
    };
    ledger.insert_cluster(&cluster).await.unwrap();
    cluster
}

// =============================================================================
// Provisioner
// =============================================================================

#[derive(Default)]
pub(crate) struct FakeProvisioner {
    fail_create: HashSet<String>,
    fail_delete: HashSet<String>,
    panic_create: HashSet<String>,
    panic_delete: HashSet<String>,
    created: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
}

impl FakeProvisioner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing_create(mut self, node_name: &str) -> Self {
        self.fail_create.insert(node_name.to_string());
        self
    }

    pub(crate) fn failing_delete(mut self, node_name: &str) -> Self {
        self.fail_delete.insert(node_name.to_string());
        self
    }

    pub(crate) fn panicking_create(mut self, node_name: &str) -> Self {
        self.panic_create.insert(node_name.to_string());
        self
    }

    pub(crate) fn panicking_delete(mut self, node_name: &str) -> Self {
        self.panic_delete.insert(node_name.to_string());
        self
    }

    pub(crate) fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub(crate) fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl NodeProvisioner for FakeProvisioner {
    fn provider(&self) -> &str {
        FAKE_PROVIDER
    }

    async fn create_node(
        &self,
        _cloud: &Cloud,
        _candidate: &NodeCandidate,
        name: &str,
    ) -> Result<ProvisionedNode, ProvisionError> {
        self.created.lock().unwrap().push(name.to_string());
        if self.panic_create.contains(name) {
            panic!("provider crashed while creating {}", name);
        }
        if self.fail_create.contains(name) {
            return Err(ProvisionError::Backend("quota exceeded".to_string()));
        }

        Ok(ProvisionedNode {
            provider_id: format!("fake-{}", name),
            node_url: Some(format!("https://{}.example", name)),
            ssh_connection_parameters: SshConnectionParameters {
                ip_address: Some(host_of(name)),
                port: None,
                username: Some("ubuntu".to_string()),
                private_key: Some("KEY".to_string()),
            },
        })
    }

    async fn delete_node(&self, _cloud: &Cloud, node: &Node) -> Result<(), ProvisionError> {
        if self.panic_delete.contains(&node.name) {
            panic!("provider crashed while deleting {}", node.name);
        }
        if self.fail_delete.contains(&node.name) {
            return Err(ProvisionError::Backend("instance locked".to_string()));
        }
        self.deleted.lock().unwrap().push(node.name.clone());
        Ok(())
    }
}

// =============================================================================
// Runner
// =============================================================================

/// Echoes every command into its execution log and exits 0 unless the
/// command contains one of the configured failure fragments
#[derive(Default)]
pub(crate) struct FakeRunner {
    logs: Arc<MemoryLogStore>,
    failing: Vec<(String, String)>,
    silent: Vec<String>,
    runs: Mutex<Vec<(String, String)>>,
}

impl FakeRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Commands containing `fragment` exit 1 on `host`
    pub(crate) fn failing_on(mut self, host: &str, fragment: &str) -> Self {
        self.failing.push((host.to_string(), fragment.to_string()));
        self
    }

    /// Commands containing `fragment` succeed without printing anything
    pub(crate) fn silent(mut self, fragment: &str) -> Self {
        self.silent.push(fragment.to_string());
        self
    }

    pub(crate) fn runs_on(&self, host: &str) -> Vec<String> {
        self.runs
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub(crate) fn count_on(&self, host: &str, command: &str) -> usize {
        self.runs_on(host).iter().filter(|c| *c == command).count()
    }

    pub(crate) fn total_runs(&self) -> usize {
        self.runs.lock().unwrap().len()
    }
}

#[async_trait]
impl ScriptRunner for FakeRunner {
    async fn run(
        &self,
        command: &str,
        params: Option<&SshConnectionParameters>,
        mut execution: TaskExecution,
        _timeout: Option<Duration>,
    ) -> TaskExecution {
        execution.mark_started(Utc::now());

        let target = match SshTarget::from_params(params) {
            Ok(target) => target,
            Err(e) => {
                let line = format!("Invalid connection parameters: {}\n", e);
                self.logs.append(execution.log_id(), line.as_bytes()).await.unwrap();
                execution.finish(false, Utc::now());
                return execution;
            }
        };

        self.runs
            .lock()
            .unwrap()
            .push((target.host.clone(), command.to_string()));

        if !self.silent.iter().any(|s| command.contains(s.as_str())) {
            let output = format!("{}\n", command);
            self.logs.append(execution.log_id(), output.as_bytes()).await.unwrap();
        }

        let failed = self
            .failing
            .iter()
            .any(|(host, fragment)| *host == target.host && command.contains(fragment.as_str()));
        execution.finish(!failed, Utc::now());
        execution
    }

    fn log_store(&self) -> Arc<dyn LogStore> {
        self.logs.clone()
    }
}

pub(crate) fn templates() -> ScriptTemplates {
    ScriptTemplates::new(
        "install-master",
        "install-worker",
        "echo '!!NEB_SCRIPT_RESULT_KUBERNETES_JOIN_TOKEN:kubeadm join host-master:6443!!'",
    )
}

pub(crate) fn orchestrator(
    ledger: Arc<MemoryLedger>,
    provisioner: Arc<FakeProvisioner>,
    runner: Arc<FakeRunner>,
    policy: WorkerFailurePolicy,
) -> Orchestrator {
    let settings = DeploySettings {
        max_parallel_pipelines: 4,
        script_timeout: None,
        worker_failure_policy: policy,
    };

    Orchestrator::new(
        ledger,
        ProvisionerRegistry::new().with(provisioner),
        runner,
        templates(),
        settings,
    )
}
