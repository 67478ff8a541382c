//! Script Templates
//!
//! Bootstrap scripts run on cluster nodes. The built-in bodies are
//! placeholders; real installations override them with files from a
//! script directory.

use anyhow::Context;
use fogfort_runner::markers::{JOIN_TOKEN_KEY, marker_line};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

pub const MASTER_INSTALL_FILE: &str = "master_install.sh";
pub const WORKER_INSTALL_FILE: &str = "worker_install.sh";
pub const JOIN_TOKEN_FILE: &str = "join_token.sh";

/// Variable carrying the join command into the worker script
pub const JOIN_COMMAND_VAR: &str = "variables_kubeCommand";

/// File under the remote user's home holding the cluster variables
pub const ENV_FILE: &str = ".fogfort_env";

#[derive(Debug, Clone)]
pub struct ScriptTemplates {
    master_install: String,
    worker_install: String,
    join_token: String,
}

impl Default for ScriptTemplates {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ScriptTemplates {
    pub fn builtin() -> Self {
        Self {
            master_install: "echo 'Hello from master!' && hostname && date".to_string(),
            worker_install: format!(
                "echo 'Hello from worker!' && hostname && date && echo \"Join command: ${}\"",
                JOIN_COMMAND_VAR
            ),
            join_token: format!(
                "echo '{}'",
                marker_line(JOIN_TOKEN_KEY, "placeholder-join-token")
            ),
        }
    }

    pub fn new(
        master_install: impl Into<String>,
        worker_install: impl Into<String>,
        join_token: impl Into<String>,
    ) -> Self {
        Self {
            master_install: master_install.into(),
            worker_install: worker_install.into(),
            join_token: join_token.into(),
        }
    }

    /// Built-in templates, each replaced by the file of the same role in
    /// `dir` when that file exists
    pub async fn load(dir: Option<&Path>) -> anyhow::Result<Self> {
        let mut templates = Self::builtin();
        let Some(dir) = dir else {
            return Ok(templates);
        };

        if let Some(body) = read_override(dir, MASTER_INSTALL_FILE).await? {
            templates.master_install = body;
        }
        if let Some(body) = read_override(dir, WORKER_INSTALL_FILE).await? {
            templates.worker_install = body;
        }
        if let Some(body) = read_override(dir, JOIN_TOKEN_FILE).await? {
            templates.join_token = body;
        }

        Ok(templates)
    }

    pub fn master_script(&self, user: &str, env_vars: &HashMap<String, String>) -> String {
        with_prologue(user, env_vars, &self.master_install)
    }

    pub fn worker_script(
        &self,
        user: &str,
        env_vars: &HashMap<String, String>,
        join_command: &str,
    ) -> String {
        let mut vars = env_vars.clone();
        vars.insert(JOIN_COMMAND_VAR.to_string(), join_command.to_string());
        with_prologue(user, &vars, &self.worker_install)
    }

    pub fn join_token_script(&self) -> &str {
        &self.join_token
    }
}

async fn read_override(dir: &Path, file: &str) -> anyhow::Result<Option<String>> {
    let path = dir.join(file);
    match tokio::fs::read_to_string(&path).await {
        Ok(body) => {
            tracing::info!("Using script template {}", path.display());
            Ok(Some(body))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

fn home_dir(user: &str) -> String {
    if user == "root" {
        "/root".to_string()
    } else {
        format!("/home/{}", user)
    }
}

/// Rewrites the env file with `env_vars`, hooks it into the user's profile
/// once, sources it and runs `body`
fn with_prologue(user: &str, env_vars: &HashMap<String, String>, body: &str) -> String {
    let home = home_dir(user);
    let env_file = format!("{}/{}", home, ENV_FILE);
    let profile = format!("{}/.profile", home);
    let hook = format!(". {}", env_file);
    let sorted: BTreeMap<&String, &String> = env_vars.iter().collect();

    let mut script = format!(": > {}\n", env_file);
    for (key, value) in sorted {
        let export = format!("export {}=\"{}\"", key, escape_double_quoted(value));
        script.push_str(&format!(
            "echo '{}' >> {}\n",
            escape_single_quoted(&export),
            env_file
        ));
    }
    script.push_str(&format!(
        "grep -qxF '{hook}' {profile} || echo '{hook}' >> {profile}\n"
    ));
    script.push_str(&format!("source {}\n", env_file));
    script.push_str(body);
    script
}

fn escape_double_quoted(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn escape_single_quoted(value: &str) -> String {
    value.replace('\'', r"'\''")
}
