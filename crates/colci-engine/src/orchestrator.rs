//! CI run state machine
//!
//! ```text
//! FETCH_MODIFIED -> COMPILE_PAIRS -> CLASSIFY -> PRUNE -> BUILD_SELECTION
//!     -> (DRY_RUN_REPORT | TRIGGER_AND_POLL) -> REPORT
//! ```
//!
//! Run-fatal errors (unclassifiable SQL under the `abort` policy, cycles,
//! unresolved selections, collaborator failures before the trigger) stop the
//! run before anything is triggered. A failure report is still published.

use crate::lineage_usage::LineageUsage;
use crate::plan::{Plan, Planner};
use crate::pruner::{LineagePruner, PruneError};
use colci_cloud::{
    CollaboratorError, LineageSource, ModelCompiler, PreviousState, RunReporter, RunTrigger,
};
use colci_core::{
    ChangeKind, CiSelection, ClassificationError, ColumnUsageStrategy, Config, Diagnostic,
    DiagnosticCode, Node, NodeId, RunReport, RunStatus, Severity,
};
use colci_dbt::{GraphError, NodeManager};
use colci_sql::CompiledSqlUsage;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{error, info, warn};

/// Phases of a CI run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    FetchModified,
    CompilePairs,
    Classify,
    Prune,
    BuildSelection,
    DryRunReport,
    TriggerAndPoll,
    Report,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FetchModified => write!(f, "FETCH_MODIFIED"),
            Self::CompilePairs => write!(f, "COMPILE_PAIRS"),
            Self::Classify => write!(f, "CLASSIFY"),
            Self::Prune => write!(f, "PRUNE"),
            Self::BuildSelection => write!(f, "BUILD_SELECTION"),
            Self::DryRunReport => write!(f, "DRY_RUN_REPORT"),
            Self::TriggerAndPoll => write!(f, "TRIGGER_AND_POLL"),
            Self::Report => write!(f, "REPORT"),
        }
    }
}

/// Run-fatal errors
#[derive(Debug, thiserror::Error)]
pub enum CiError {
    #[error("{phase}: {collaborator} failed: {source}")]
    Collaborator {
        phase: Phase,
        collaborator: &'static str,
        #[source]
        source: CollaboratorError,
    },

    #[error(transparent)]
    Classification(#[from] ClassificationError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Prune(#[from] PruneError),
}

impl CiError {
    fn collaborator(phase: Phase, collaborator: &'static str) -> impl FnOnce(CollaboratorError) -> Self {
        move |source| Self::Collaborator {
            phase,
            collaborator,
            source,
        }
    }

    /// Diagnostic describing this error in a failure report
    pub fn to_diagnostic(&self) -> Diagnostic {
        let (code, node_id) = match self {
            Self::Classification(e) => (DiagnosticCode::ClassificationFailed, Some(e.node_id.clone())),
            Self::Graph(e) | Self::Prune(PruneError::Graph(e)) => match e {
                GraphError::Cycle(_) => (DiagnosticCode::GraphCycle, None),
                GraphError::UnresolvedSelection(_) => (DiagnosticCode::SelectionUnresolved, None),
                _ => (DiagnosticCode::Info, None),
            },
            Self::Prune(PruneError::Unclassified(id)) => (DiagnosticCode::Info, Some(id.clone())),
            Self::Collaborator { .. } => (DiagnosticCode::Info, None),
        };

        let diagnostic = Diagnostic::new(code, Severity::Error, self.to_string());
        match node_id {
            Some(id) => diagnostic.for_node(id),
            None => diagnostic,
        }
    }
}

/// Drives a CI run through its collaborators
pub struct CiOrchestrator {
    config: Config,
    planner: Planner,
    compiler: Box<dyn ModelCompiler>,
    lineage: Box<dyn LineageSource>,
    trigger: Box<dyn RunTrigger>,
    reporter: Box<dyn RunReporter>,
}

impl CiOrchestrator {
    pub fn new(
        config: Config,
        compiler: Box<dyn ModelCompiler>,
        lineage: Box<dyn LineageSource>,
        trigger: Box<dyn RunTrigger>,
        reporter: Box<dyn RunReporter>,
    ) -> Self {
        Self {
            planner: Planner::new(&config),
            config,
            compiler,
            lineage,
            trigger,
            reporter,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run every phase and return the published report
    ///
    /// On a run-fatal error a failure report is published before the error is
    /// returned.
    pub async fn run(&self) -> Result<RunReport, CiError> {
        match self.execute().await {
            Ok(report) => Ok(report),
            Err(err) => {
                error!(error = %err, "CI run aborted");
                let mut report = RunReport::new(
                    Vec::new(),
                    CiSelection::unpruned(&self.config.base_selector),
                    self.config.dry_run,
                );
                report.add_diagnostic(err.to_diagnostic());
                self.publish(&mut report).await;
                Err(err)
            }
        }
    }

    async fn execute(&self) -> Result<RunReport, CiError> {
        info!(phase = %Phase::FetchModified, compiler = self.compiler.name(), "Compiling project");
        let project = self
            .compiler
            .compile()
            .await
            .map_err(CiError::collaborator(Phase::FetchModified, self.compiler.name()))?;

        if project.modified.is_empty() {
            info!("No modified models, running the job without exclusions");
            let report = RunReport::new(
                Vec::new(),
                CiSelection::unpruned(&self.config.base_selector),
                self.config.dry_run,
            );
            return Ok(self.finish(report).await);
        }

        info!(phase = %Phase::CompilePairs, modified = project.modified.len(), "Fetching previous versions");
        let modified: Vec<NodeId> = project.modified.iter().cloned().collect();
        let previous = self
            .lineage
            .previous_state(&modified)
            .await
            .map_err(CiError::collaborator(Phase::CompilePairs, self.lineage.name()))?;

        let graph = NodeManager::new(attach_previous(project.nodes, &project.modified, previous));

        let plan = match self.config.column_usage {
            ColumnUsageStrategy::CompiledSql => {
                let usage = CompiledSqlUsage::new(&self.config.dialect);
                self.planner.plan(graph, &usage)?
            }
            ColumnUsageStrategy::Discovery => self.plan_with_lineage(graph).await?,
        };

        info!(
            phase = %Phase::BuildSelection,
            selection = %plan.selection.to_args(),
            "Selection ready"
        );
        Ok(self.finish(plan.report(self.config.dry_run)).await)
    }

    /// Classify and prune with column lineage fetched on demand
    async fn plan_with_lineage(&self, mut graph: NodeManager) -> Result<Plan, CiError> {
        info!(phase = %Phase::Classify, "Classifying modified nodes");
        let diagnostics = self.planner.classify(&mut graph)?;

        let mut usage = LineageUsage::new();
        let mut pending: BTreeSet<(NodeId, String)> = graph
            .nodes()
            .filter(|node| node.change_kind() == Some(ChangeKind::ColumnChange))
            .flat_map(|node| {
                node.classification()
                    .map(|c| c.changed_columns().clone())
                    .unwrap_or_default()
                    .into_iter()
                    .map(|column| (node.unique_id.clone(), column))
                    .collect::<Vec<_>>()
            })
            .collect();

        info!(phase = %Phase::Prune, "Pruning with column lineage");
        let outcome = loop {
            usage
                .fetch(self.lineage.as_ref(), std::mem::take(&mut pending))
                .await
                .map_err(CiError::collaborator(Phase::Prune, self.lineage.name()))?;

            let outcome = LineagePruner::new(&usage).compute_excluded(&graph)?;
            pending = usage.take_missing();
            if pending.is_empty() {
                break outcome;
            }
        };

        self.planner.assemble(graph, outcome, diagnostics)
    }

    /// Dry-run or trigger, then publish
    async fn finish(&self, mut report: RunReport) -> RunReport {
        if self.config.dry_run {
            info!(
                phase = %Phase::DryRunReport,
                excluded = report.selection.excluded.len(),
                "Dry run, not triggering the job"
            );
        } else {
            info!(phase = %Phase::TriggerAndPoll, trigger = self.trigger.name(), "Triggering CI job");
            let status = match self.trigger.trigger_and_wait(&report.selection).await {
                Ok(status) => status,
                Err(err) => {
                    error!(error = %err, "Could not run the CI job");
                    report.add_diagnostic(Diagnostic::new(
                        DiagnosticCode::RunFailed,
                        Severity::Error,
                        format!("{} failed: {}", self.trigger.name(), err),
                    ));
                    RunStatus::Error
                }
            };

            if !status.is_success() && !report.has_errors() {
                report.add_diagnostic(Diagnostic::new(
                    DiagnosticCode::RunFailed,
                    Severity::Error,
                    format!("CI job finished with status {status}"),
                ));
            }
            report = report.with_status(status);
        }

        self.publish(&mut report).await;
        report
    }

    async fn publish(&self, report: &mut RunReport) {
        info!(phase = %Phase::Report, reporter = self.reporter.name(), "Publishing summary");
        if let Err(err) = self.reporter.publish(report).await {
            warn!(error = %err, "Could not publish the summary");
            report.add_diagnostic(Diagnostic::new(
                DiagnosticCode::ReportNotPublished,
                Severity::Warn,
                format!("{} failed: {}", self.reporter.name(), err),
            ));
        }
    }
}

/// Attach previous compiled code and columns to the modified nodes
///
/// Modified nodes absent from `previous` keep no previous code and classify
/// as new.
fn attach_previous(
    nodes: Vec<Node>,
    modified: &BTreeSet<NodeId>,
    mut previous: BTreeMap<NodeId, PreviousState>,
) -> Vec<Node> {
    nodes
        .into_iter()
        .map(|mut node| {
            if modified.contains(&node.unique_id) {
                node.modified = true;
                if let Some(state) = previous.remove(&node.unique_id) {
                    node.previous_compiled_code = state.compiled_code;
                    node.previous_columns = state.columns;
                }
            }
            node
        })
        .collect()
}
