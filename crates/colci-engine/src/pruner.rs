//! Impact propagation and pruning
//!
//! Every modified node seeds an [`Impact`]: node-breaking and new nodes seed a
//! full impact, column changes seed the set of changed columns, unchanged
//! nodes seed nothing. Impact then flows along downstream edges in
//! topological order. At each edge the [`ColumnUsage`] strategy decides which
//! of the incoming changed columns the child actually reads and which of its
//! own outputs they reach. A child that reads none of them absorbs the impact
//! and propagates nothing further.
//!
//! Descendants of the modified set that end up with no impact, and are not
//! modified themselves, are excluded from the CI run.

use colci_core::{ChangeKind, Classification, Diagnostic, NodeId};
use colci_dbt::{GraphError, NodeManager};
use colci_sql::{ColumnUsage, Consumption};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// What reaches a node from its modified ancestors
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "columns")]
pub enum Impact {
    /// Every output column may have changed
    Full,

    /// Only these output columns may have changed
    Columns(BTreeSet<String>),
}

impl Impact {
    fn seed(classification: &Classification) -> Option<Self> {
        match classification.kind() {
            ChangeKind::Unchanged => None,
            ChangeKind::New | ChangeKind::NodeBreakingChange => Some(Self::Full),
            ChangeKind::ColumnChange => Some(Self::Columns(classification.changed_columns().clone())),
        }
    }

    fn from_consumption(consumption: Consumption) -> Option<Self> {
        match consumption {
            Consumption::None => None,
            Consumption::Full => Some(Self::Full),
            Consumption::Columns(columns) if columns.is_empty() => None,
            Consumption::Columns(columns) => Some(Self::Columns(columns)),
        }
    }

    fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::Columns(mut a), Self::Columns(b)) => {
                a.extend(b);
                Self::Columns(a)
            }
            _ => Self::Full,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full)
    }

    /// Changed columns, `None` for a full impact
    pub fn columns(&self) -> Option<&BTreeSet<String>> {
        match self {
            Self::Full => None,
            Self::Columns(columns) => Some(columns),
        }
    }
}

impl std::fmt::Display for Impact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "all columns"),
            Self::Columns(columns) => {
                let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
                write!(f, "{}", columns.join(", "))
            }
        }
    }
}

fn merge(current: Option<Impact>, incoming: Option<Impact>) -> Option<Impact> {
    match (current, incoming) {
        (Some(a), Some(b)) => Some(a.merge(b)),
        (a, b) => a.or(b),
    }
}

/// Result of pruning
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PruneOutcome {
    /// Modified nodes
    pub modified: BTreeSet<NodeId>,

    /// Descendants of the modified nodes that are not modified themselves
    pub descendants: BTreeSet<NodeId>,

    /// Impact that reached each node, modified nodes included
    pub impact: BTreeMap<NodeId, Impact>,

    /// Modified nodes plus impacted descendants
    pub included: BTreeSet<NodeId>,

    /// Descendants that no impact reached
    pub excluded: BTreeSet<NodeId>,

    /// Conservative fallbacks taken while deciding column usage
    pub diagnostics: Vec<Diagnostic>,
}

/// Pruning errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PruneError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Modified node {0} has not been classified")]
    Unclassified(NodeId),
}

/// Computes the nodes a CI run can skip
pub struct LineagePruner<'a> {
    usage: &'a dyn ColumnUsage,
}

impl<'a> LineagePruner<'a> {
    pub fn new(usage: &'a dyn ColumnUsage) -> Self {
        Self { usage }
    }

    /// Prune the descendants of every node flagged as modified
    pub fn compute_excluded(&self, graph: &NodeManager) -> Result<PruneOutcome, PruneError> {
        self.compute_excluded_for(&graph.modified_ids(), graph)
    }

    /// Prune the descendants of `modified`
    ///
    /// Every modified node must already carry a classification. The result
    /// depends only on the graph and the classifications, never on iteration
    /// order.
    pub fn compute_excluded_for(
        &self,
        modified: &BTreeSet<NodeId>,
        graph: &NodeManager,
    ) -> Result<PruneOutcome, PruneError> {
        let mut seeds: BTreeMap<&str, Impact> = BTreeMap::new();
        for id in modified {
            let node = graph.get(id).ok_or_else(|| GraphError::UnknownNode(id.clone()))?;
            let classification = node
                .classification()
                .ok_or_else(|| PruneError::Unclassified(id.clone()))?;
            if let Some(impact) = Impact::seed(classification) {
                seeds.insert(id.as_str(), impact);
            }
        }

        let mut descendants = BTreeSet::new();
        for id in modified {
            descendants.extend(graph.get_descendants(id)?);
        }
        descendants.retain(|id| !modified.contains(id));

        let region: BTreeSet<NodeId> = modified.union(&descendants).cloned().collect();
        let order = graph.topological_order(&region)?;

        let mut impact: BTreeMap<NodeId, Impact> = BTreeMap::new();
        let mut diagnostics: Vec<Diagnostic> = Vec::new();

        for id in &order {
            let Some(node) = graph.get(id) else { continue };
            // No compiled code to inspect, so anything reaching an external
            // node passes through to its children in full.
            if node.is_external() {
                if graph.parents(id).iter().any(|parent_id| impact.contains_key(parent_id)) {
                    debug!(node = %id, "Impact passes through external node");
                    impact.insert(id.clone(), Impact::Full);
                }
                continue;
            }

            let mut reached = seeds.get(id.as_str()).cloned();
            for parent_id in graph.parents(id) {
                let Some(parent_impact) = impact.get(parent_id) else { continue };

                let incoming = match parent_impact {
                    Impact::Full => Some(Impact::Full),
                    Impact::Columns(columns) => {
                        let Some(parent) = graph.get(parent_id) else { continue };
                        let verdict = self.usage.consumption(parent, node, columns);
                        if let Some(diagnostic) = verdict.diagnostic {
                            if !diagnostics.contains(&diagnostic) {
                                diagnostics.push(diagnostic);
                            }
                        }
                        Impact::from_consumption(verdict.consumption)
                    }
                };

                if let Some(incoming) = &incoming {
                    debug!(from = %parent_id, to = %id, impact = %incoming, "Impact propagated");
                }
                reached = merge(reached, incoming);
            }

            if let Some(reached) = reached {
                impact.insert(id.clone(), reached);
            }
        }

        let included: BTreeSet<NodeId> = modified
            .iter()
            .chain(impact.keys())
            .filter(|id| graph.get(id).map_or(false, |n| !n.is_external()))
            .cloned()
            .collect();

        let excluded: BTreeSet<NodeId> = descendants
            .iter()
            .filter(|id| !included.contains(*id))
            .filter(|id| graph.get(id).map_or(false, |n| !n.is_external()))
            .cloned()
            .collect();

        info!(
            modified = modified.len(),
            descendants = descendants.len(),
            included = included.len(),
            excluded = excluded.len(),
            "Pruned downstream nodes"
        );

        Ok(PruneOutcome {
            modified: modified.clone(),
            descendants,
            impact,
            included,
            excluded,
            diagnostics,
        })
    }
}
