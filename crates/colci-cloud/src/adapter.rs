//! Collaborator traits
//!
//! Each trait covers one capability the engine needs from outside. The engine
//! depends only on these traits, never on a concrete client.

use colci_core::{CiSelection, Node, NodeId, RunReport, RunStatus};
use colci_dbt::ManifestError;
use std::collections::{BTreeMap, BTreeSet};

/// Errors raised by collaborators
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("Command `{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error(transparent)]
    Artifact(#[from] ManifestError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("API request failed with status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Current state of the project after compiling the branch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledProject {
    /// Every node of the project graph, with current compiled code where available
    pub nodes: Vec<Node>,

    /// Unique ids of the modified nodes
    pub modified: BTreeSet<NodeId>,
}

/// A node as it exists in the deferred (production) environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreviousState {
    pub compiled_code: Option<String>,
    pub columns: Option<Vec<String>>,
}

/// Compiles the current branch
#[async_trait::async_trait]
pub trait ModelCompiler: Send + Sync {
    /// Compiler name for logs
    fn name(&self) -> &'static str;

    /// Compile modified models and their descendants and snapshot the graph
    async fn compile(&self) -> Result<CompiledProject, CollaboratorError>;
}

/// Serves the deferred environment's state and column lineage
#[async_trait::async_trait]
pub trait LineageSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Previous compiled code and columns of the given nodes
    ///
    /// Nodes that never ran in the deferred environment are absent from the result.
    async fn previous_state(
        &self,
        unique_ids: &[NodeId],
    ) -> Result<BTreeMap<NodeId, PreviousState>, CollaboratorError>;

    /// Nodes that read `column` of `unique_id` directly
    async fn column_consumers(
        &self,
        unique_id: &str,
        column: &str,
    ) -> Result<BTreeSet<NodeId>, CollaboratorError>;
}

/// Starts the CI job and waits for a terminal status
#[async_trait::async_trait]
pub trait RunTrigger: Send + Sync {
    fn name(&self) -> &'static str;

    /// Trigger the job with the selection; only terminal statuses are returned
    async fn trigger_and_wait(&self, selection: &CiSelection) -> Result<RunStatus, CollaboratorError>;
}

/// Publishes the run summary
#[async_trait::async_trait]
pub trait RunReporter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn publish(&self, report: &RunReport) -> Result<(), CollaboratorError>;
}
