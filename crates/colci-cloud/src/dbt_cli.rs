//! dbt CLI runner
//!
//! Finds modified models with `dbt ls`, compiles them and everything the base
//! selector reaches with `dbt compile --favor-state`, then reads the resulting
//! artifacts from the target directory.

use crate::adapter::{CollaboratorError, CompiledProject, ModelCompiler};
use colci_core::{DbtConfig, NodeId};
use colci_dbt::{Manifest, RunResults};
use std::collections::BTreeSet;
use tokio::process::Command;
use tracing::{debug, info};

/// Models that differ from the deferred state
const MODIFIED_MODELS: &str = "state:modified,resource_type:model";

/// [`ModelCompiler`] driving a local dbt installation
pub struct DbtCli {
    config: DbtConfig,
    base_selector: String,
}

impl DbtCli {
    pub fn new(config: DbtConfig, base_selector: impl Into<String>) -> Self {
        Self {
            config,
            base_selector: base_selector.into(),
        }
    }

    /// Arguments of the `dbt ls` invocation listing modified models
    pub fn ls_args() -> Vec<String> {
        ["ls", "--select", MODIFIED_MODELS, "--output", "json", "--output-keys", "unique_id"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    /// Arguments of the `dbt compile` invocation
    pub fn compile_args(&self) -> Vec<String> {
        vec![
            "compile".to_string(),
            "--select".to_string(),
            format!("{},resource_type:model", self.base_selector),
            "--favor-state".to_string(),
        ]
    }

    async fn run(&self, args: &[String]) -> Result<String, CollaboratorError> {
        let command = format!("{} {}", self.config.executable, args.join(" "));
        debug!(command = %command, "Running dbt");

        let output = Command::new(&self.config.executable)
            .args(args)
            .current_dir(&self.config.project_dir)
            .output()
            .await
            .map_err(|e| CollaboratorError::Command {
                command: command.clone(),
                message: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CollaboratorError::Command {
                command,
                message: format!("exit status {}: {}{}", output.status, stdout.trim(), stderr.trim()),
            });
        }

        Ok(stdout)
    }
}

#[async_trait::async_trait]
impl ModelCompiler for DbtCli {
    fn name(&self) -> &'static str {
        "dbt CLI"
    }

    async fn compile(&self) -> Result<CompiledProject, CollaboratorError> {
        let listed = self.run(&Self::ls_args()).await?;
        let modified = parse_ls_output(&listed);
        info!(count = modified.len(), "Found modified models");

        if modified.is_empty() {
            return Ok(CompiledProject::default());
        }

        self.run(&self.compile_args()).await?;

        let target = self.config.target_dir();
        let manifest = Manifest::from_file(&target.join("manifest.json"))?;
        let run_results = RunResults::from_file(&target.join("run_results.json"))?;
        let compiled = run_results.compiled_code();

        let mut nodes = manifest.to_nodes();
        for node in nodes.iter_mut() {
            if let Some(code) = compiled.get(&node.unique_id) {
                node.current_compiled_code = Some(code.clone());
            }
            node.modified = modified.contains(&node.unique_id);
        }

        info!(nodes = nodes.len(), compiled = compiled.len(), "Compiled project");
        Ok(CompiledProject { nodes, modified })
    }
}

/// Unique ids from `dbt ls --output json`
///
/// dbt interleaves log lines with the JSON lines; anything that is not a JSON
/// object with a `unique_id` is skipped.
pub fn parse_ls_output(stdout: &str) -> BTreeSet<NodeId> {
    stdout
        .lines()
        .filter_map(|line| {
            let start = line.find('{')?;
            let end = line.rfind('}')?;
            if end < start {
                return None;
            }
            serde_json::from_str::<serde_json::Value>(&line[start..=end]).ok()
        })
        .filter_map(|value| value.get("unique_id")?.as_str().map(str::to_string))
        .collect()
}
