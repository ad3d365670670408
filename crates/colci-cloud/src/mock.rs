//! In-memory collaborators for testing
//!
//! These return predefined data without running dbt or touching the network.
//! They are useful for:
//! - Unit testing orchestration logic
//! - Exercising the Discovery lineage loop without dbt Cloud
//! - Simulating failures of individual collaborators
//!
//! ## Usage
//!
//! ```rust,ignore
//! let lineage = MockLineage::new();
//! lineage.add_previous("model.shop.int_orders", "select 1 as id").await;
//! lineage.add_consumers("model.shop.int_orders", "id", ["model.shop.fct_orders"]).await;
//!
//! let trigger = MockTrigger::new(RunStatus::Success);
//! ```

use crate::adapter::{
    CollaboratorError, CompiledProject, LineageSource, ModelCompiler, PreviousState, RunReporter,
    RunTrigger,
};
use colci_core::{canonical_column, CiSelection, NodeId, RunReport, RunStatus};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Compiler returning a fixed project snapshot
pub struct MockCompiler {
    project: CompiledProject,
    fail_with: Option<String>,
}

impl MockCompiler {
    pub fn new(project: CompiledProject) -> Self {
        Self { project, fail_with: None }
    }

    /// Make `compile` fail with the given message
    pub fn with_failure(mut self, message: impl Into<String>) -> Self {
        self.fail_with = Some(message.into());
        self
    }
}

#[async_trait::async_trait]
impl ModelCompiler for MockCompiler {
    fn name(&self) -> &'static str {
        "Mock"
    }

    async fn compile(&self) -> Result<CompiledProject, CollaboratorError> {
        match &self.fail_with {
            Some(message) => Err(CollaboratorError::Command {
                command: "compile".to_string(),
                message: message.clone(),
            }),
            None => Ok(self.project.clone()),
        }
    }
}

/// Lineage source backed by in-memory maps
#[derive(Clone, Default)]
pub struct MockLineage {
    /// Previous state by unique id
    previous: Arc<RwLock<HashMap<NodeId, PreviousState>>>,

    /// (unique id, canonical column) -> consuming nodes
    consumers: Arc<RwLock<HashMap<(NodeId, String), BTreeSet<NodeId>>>>,

    /// Number of column lineage lookups served
    lookups: Arc<RwLock<usize>>,
}

impl MockLineage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the previous compiled code of a node
    pub async fn add_previous(&self, unique_id: &str, compiled_code: &str) {
        self.previous.write().await.insert(
            unique_id.to_string(),
            PreviousState {
                compiled_code: Some(compiled_code.to_string()),
                columns: None,
            },
        );
    }

    /// Register the full previous state of a node
    pub async fn add_previous_state(&self, unique_id: &str, state: PreviousState) {
        self.previous.write().await.insert(unique_id.to_string(), state);
    }

    /// Register the direct consumers of one column
    pub async fn add_consumers<I, S>(&self, unique_id: &str, column: &str, consumers: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.consumers
            .write()
            .await
            .entry((unique_id.to_string(), canonical_column(column)))
            .or_default()
            .extend(consumers.into_iter().map(Into::into));
    }

    pub async fn lookup_count(&self) -> usize {
        *self.lookups.read().await
    }
}

#[async_trait::async_trait]
impl LineageSource for MockLineage {
    fn name(&self) -> &'static str {
        "Mock"
    }

    async fn previous_state(
        &self,
        unique_ids: &[NodeId],
    ) -> Result<BTreeMap<NodeId, PreviousState>, CollaboratorError> {
        let previous = self.previous.read().await;
        Ok(unique_ids
            .iter()
            .filter_map(|id| previous.get(id).map(|state| (id.clone(), state.clone())))
            .collect())
    }

    async fn column_consumers(
        &self,
        unique_id: &str,
        column: &str,
    ) -> Result<BTreeSet<NodeId>, CollaboratorError> {
        *self.lookups.write().await += 1;

        let key = (unique_id.to_string(), canonical_column(column));
        Ok(self.consumers.read().await.get(&key).cloned().unwrap_or_default())
    }
}

/// Run trigger that records selections and returns a fixed status
#[derive(Clone)]
pub struct MockTrigger {
    status: RunStatus,
    triggered: Arc<RwLock<Vec<CiSelection>>>,
}

impl MockTrigger {
    pub fn new(status: RunStatus) -> Self {
        Self {
            status,
            triggered: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Selections the job was triggered with, in order
    pub async fn triggered(&self) -> Vec<CiSelection> {
        self.triggered.read().await.clone()
    }
}

#[async_trait::async_trait]
impl RunTrigger for MockTrigger {
    fn name(&self) -> &'static str {
        "Mock"
    }

    async fn trigger_and_wait(&self, selection: &CiSelection) -> Result<RunStatus, CollaboratorError> {
        self.triggered.write().await.push(selection.clone());
        Ok(self.status)
    }
}

/// Reporter that keeps published reports in memory
#[derive(Clone, Default)]
pub struct MemoryReporter {
    published: Arc<RwLock<Vec<RunReport>>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn published(&self) -> Vec<RunReport> {
        self.published.read().await.clone()
    }
}

#[async_trait::async_trait]
impl RunReporter for MemoryReporter {
    fn name(&self) -> &'static str {
        "Memory"
    }

    async fn publish(&self, report: &RunReport) -> Result<(), CollaboratorError> {
        self.published.write().await.push(report.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lineage_lookups_are_case_insensitive() {
        let lineage = MockLineage::new();
        lineage
            .add_consumers("model.shop.int_orders", "ORDER_TOTAL", ["model.shop.fct_orders"])
            .await;

        let consumers = lineage
            .column_consumers("model.shop.int_orders", "order_total")
            .await
            .unwrap();
        assert!(consumers.contains("model.shop.fct_orders"));
        assert_eq!(lineage.lookup_count().await, 1);
    }

    #[tokio::test]
    async fn previous_state_skips_unknown_nodes() {
        let lineage = MockLineage::new();
        lineage.add_previous("model.shop.a", "select 1 as x").await;

        let state = lineage
            .previous_state(&["model.shop.a".to_string(), "model.shop.new".to_string()])
            .await
            .unwrap();
        assert_eq!(state.len(), 1);
        assert!(state.contains_key("model.shop.a"));
    }

    #[tokio::test]
    async fn compiler_failure() {
        let compiler = MockCompiler::new(CompiledProject::default()).with_failure("boom");
        assert!(compiler.compile().await.is_err());
    }

    #[tokio::test]
    async fn trigger_records_selection() {
        let trigger = MockTrigger::new(RunStatus::Success);
        let selection = CiSelection::unpruned("state:modified+");

        assert_eq!(trigger.trigger_and_wait(&selection).await.unwrap(), RunStatus::Success);
        assert_eq!(trigger.triggered().await, vec![selection]);
    }
}
