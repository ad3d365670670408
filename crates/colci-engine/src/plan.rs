//! Classification and selection rendering
//!
//! [`Planner`] runs the pure part of a CI run: classify every modified node,
//! prune, and render the selection. It never performs I/O, so `colci plan`
//! and the tests run it directly against local manifests.

use crate::orchestrator::CiError;
use crate::pruner::{LineagePruner, PruneOutcome};
use colci_core::{
    ChangeKind, CiSelection, ClassificationFallback, Classification, Config, Diagnostic,
    DiagnosticCode, NodeChange, NodeId, RunReport, Severity,
};
use colci_dbt::{GraphError, NodeManager};
use colci_sql::{BreakingChangeClassifier, ColumnUsage};
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Renders a prune outcome into the selection handed to the run trigger
pub struct SelectionBuilder<'a> {
    graph: &'a NodeManager,
    base_selector: &'a str,
    always_include: Option<&'a str>,
}

impl<'a> SelectionBuilder<'a> {
    pub fn new(graph: &'a NodeManager, base_selector: &'a str) -> Self {
        Self {
            graph,
            base_selector,
            always_include: None,
        }
    }

    /// Nodes matching these criteria are never excluded
    pub fn always_include(mut self, criteria: Option<&'a str>) -> Self {
        self.always_include = criteria.filter(|c| !c.trim().is_empty());
        self
    }

    /// Build the selection
    ///
    /// External nodes never appear in it. Unknown identifiers in
    /// `always_include` are an error.
    pub fn build(&self, outcome: &PruneOutcome) -> Result<(CiSelection, Vec<Diagnostic>), GraphError> {
        let mut diagnostics = Vec::new();

        let kept: BTreeSet<NodeId> = match self.always_include {
            Some(criteria) => {
                let resolved = self.graph.resolve_selection(criteria)?;
                outcome.excluded.intersection(&resolved).cloned().collect()
            }
            None => BTreeSet::new(),
        };
        for id in &kept {
            diagnostics.push(
                Diagnostic::new(
                    DiagnosticCode::AlwaysIncluded,
                    Severity::Info,
                    format!("{} kept in the run by always_include", self.name_of(id)),
                )
                .for_node(id.clone()),
            );
        }

        let included: BTreeSet<NodeId> = outcome
            .included
            .iter()
            .chain(kept.iter())
            .filter(|id| self.is_internal(id))
            .cloned()
            .collect();

        let excluded: BTreeSet<NodeId> = outcome
            .excluded
            .iter()
            .filter(|id| !kept.contains(*id) && self.is_internal(id))
            .cloned()
            .collect();

        let mut ancestors = BTreeSet::new();
        for id in &included {
            ancestors.extend(self.graph.get_ancestors(id)?);
        }
        let ancestors: Vec<NodeId> = ancestors
            .into_iter()
            .filter(|id| !included.contains(id) && !excluded.contains(id) && self.is_internal(id))
            .collect();

        let names: Vec<String> = excluded.iter().map(|id| self.name_of(id)).collect();
        let selection = CiSelection::new(self.base_selector, included, names, ancestors);

        Ok((selection, diagnostics))
    }

    fn is_internal(&self, id: &str) -> bool {
        self.graph.get(id).map_or(false, |node| !node.is_external())
    }

    fn name_of(&self, id: &str) -> String {
        self.graph
            .get(id)
            .map(|node| node.name.clone())
            .unwrap_or_else(|| id.to_string())
    }
}

/// Everything decided before the job is triggered
#[derive(Debug, Clone)]
pub struct Plan {
    /// The classified graph
    pub graph: NodeManager,

    pub outcome: PruneOutcome,

    pub selection: CiSelection,

    /// Diagnostics from classification, pruning and selection
    pub diagnostics: Vec<Diagnostic>,
}

impl Plan {
    /// Run report for this plan, without a run status
    pub fn report(&self, dry_run: bool) -> RunReport {
        let nodes: Vec<NodeChange> = self
            .outcome
            .modified
            .iter()
            .filter_map(|id| self.graph.get(id))
            .filter_map(NodeChange::from_node)
            .collect();

        let mut report = RunReport::new(nodes, self.selection.clone(), dry_run);
        for diagnostic in &self.diagnostics {
            report.add_diagnostic(diagnostic.clone());
        }
        report
    }
}

/// Classifies, prunes and renders the selection for one configuration
pub struct Planner {
    classifier: BreakingChangeClassifier,
    fallback: ClassificationFallback,
    base_selector: String,
    always_include: Option<String>,
}

impl Planner {
    pub fn new(config: &Config) -> Self {
        Self {
            classifier: BreakingChangeClassifier::new(&config.dialect),
            fallback: config.classification_fallback,
            base_selector: config.base_selector.clone(),
            always_include: config.always_include.clone(),
        }
    }

    /// Attach a classification to every modified node
    ///
    /// SQL that cannot be classified either aborts or is treated as
    /// node-breaking, depending on the configured fallback. Both outcomes are
    /// logged and reported.
    pub fn classify(&self, graph: &mut NodeManager) -> Result<Vec<Diagnostic>, CiError> {
        let mut diagnostics = Vec::new();

        for id in graph.modified_ids() {
            let Some(node) = graph.get(&id) else { continue };

            let classification = match self.classifier.classify(node) {
                Ok(classification) => classification,
                Err(err) => match self.fallback {
                    ClassificationFallback::Breaking => {
                        warn!(node = %id, error = %err, "Could not classify node, treating it as node-breaking");
                        diagnostics.push(
                            Diagnostic::new(
                                DiagnosticCode::ClassificationFallback,
                                Severity::Warn,
                                format!("{}; treated as a node-breaking change", err),
                            )
                            .for_node(id.clone()),
                        );
                        Classification::breaking()
                    }
                    ClassificationFallback::Abort => return Err(CiError::Classification(err)),
                },
            };

            match classification.kind() {
                ChangeKind::New => diagnostics.push(
                    Diagnostic::new(
                        DiagnosticCode::NewNode,
                        Severity::Info,
                        format!("{} is new; its descendants are never excluded", node.name),
                    )
                    .for_node(id.clone()),
                ),
                ChangeKind::ColumnChange => {
                    info!(node = %id, columns = ?classification.changed_columns(), "Column change")
                }
                kind => info!(node = %id, kind = %kind, "Classified"),
            }

            graph.annotate(&id, classification)?;
        }

        Ok(diagnostics)
    }

    /// Render a prune outcome into a selection
    pub fn select(
        &self,
        graph: &NodeManager,
        outcome: &PruneOutcome,
    ) -> Result<(CiSelection, Vec<Diagnostic>), GraphError> {
        SelectionBuilder::new(graph, &self.base_selector)
            .always_include(self.always_include.as_deref())
            .build(outcome)
    }

    /// Classify, prune and select in one step
    pub fn plan(&self, mut graph: NodeManager, usage: &dyn ColumnUsage) -> Result<Plan, CiError> {
        let diagnostics = self.classify(&mut graph)?;
        let outcome = LineagePruner::new(usage).compute_excluded(&graph)?;
        self.assemble(graph, outcome, diagnostics)
    }

    /// Render the selection of a classified and pruned graph
    pub fn assemble(
        &self,
        graph: NodeManager,
        outcome: PruneOutcome,
        mut diagnostics: Vec<Diagnostic>,
    ) -> Result<Plan, CiError> {
        diagnostics.extend(outcome.diagnostics.iter().cloned());

        let (selection, selection_diagnostics) = self.select(&graph, &outcome)?;
        diagnostics.extend(selection_diagnostics);

        info!(
            included = selection.included.len(),
            excluded = selection.excluded.len(),
            fingerprint = %selection.fingerprint(),
            "Built CI selection"
        );

        Ok(Plan {
            graph,
            outcome,
            selection,
            diagnostics,
        })
    }
}
