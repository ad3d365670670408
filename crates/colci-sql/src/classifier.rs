//! Change classification
//!
//! Compares the previous and current compiled SQL of a node:
//!
//! 1. No previous code: `NEW`.
//! 2. Equal after whitespace normalization: `UNCHANGED`.
//! 3. Anything outside the top-level projection differs (filters, joins,
//!    grouping, ordering, CTE bodies, named windows, set operations),
//!    a wildcard appears or disappears, an inline window's PARTITION BY
//!    changes for a surviving column, or the projection changes under
//!    `SELECT DISTINCT`/`GROUP BY ALL`: `NODE_BREAKING_CHANGE`. Positional
//!    `GROUP BY`/`ORDER BY` references count as the expressions they name.
//! 4. Otherwise the changed output columns decide between `COLUMN_CHANGE` and
//!    `UNCHANGED`.
//!
//! SQL that does not parse as a single query is a [`ClassificationError`];
//! the caller picks the fallback.

use colci_core::{Classification, ClassificationError, DialectConfig, Node};
use std::collections::BTreeSet;
use tracing::debug;

use crate::column_tracker::ColumnTracker;
use crate::parser::SqlParser;
use crate::projection::QueryShape;

/// Classifies node changes for one dialect
pub struct BreakingChangeClassifier {
    parser: SqlParser,
}

impl BreakingChangeClassifier {
    pub fn new(dialect: &DialectConfig) -> Self {
        Self {
            parser: SqlParser::from_dialect(dialect),
        }
    }

    /// Classify a node from its two compiled versions
    pub fn classify(&self, node: &Node) -> Result<Classification, ClassificationError> {
        let Some(previous) = node.previous_compiled_code.as_deref() else {
            debug!(node = %node.unique_id, "No previous version, node is new");
            return Ok(Classification::new_node());
        };

        let Some(current) = node.current_compiled_code.as_deref() else {
            return Err(ClassificationError::new(
                node.unique_id.clone(),
                "no current compiled code",
                "",
            ));
        };

        let previous_columns = node.previous_columns.as_deref();
        self.classify_code(&node.unique_id, previous, current, previous_columns, &node.columns)
    }

    /// Classify a pair of compiled texts
    ///
    /// `previous_columns`/`current_columns` are the resolved output columns, used
    /// to see through wildcards; pass `None`/empty when unknown.
    pub fn classify_code(
        &self,
        node_id: &str,
        previous: &str,
        current: &str,
        previous_columns: Option<&[String]>,
        current_columns: &[String],
    ) -> Result<Classification, ClassificationError> {
        if normalize_whitespace(previous) == normalize_whitespace(current) {
            return Ok(Classification::unchanged());
        }

        let before = self.shape(node_id, previous)?;
        let after = self.shape(node_id, current)?;

        if let Some(reason) = structural_change(&before, &after) {
            debug!(node = %node_id, reason, "Node-breaking change");
            return Ok(Classification::breaking());
        }

        let diff = ColumnTracker::diff_projections(&before, &after);
        for (old, new) in &diff.renamed {
            debug!(node = %node_id, from = %old, to = %new, "Column renamed");
        }

        let mut changed = diff.changed();
        if after.has_wildcard() {
            if let Some(previous_columns) = previous_columns {
                changed.extend(ColumnTracker::diff(previous_columns, current_columns));
            }
        }

        debug!(node = %node_id, columns = ?changed, "Projection-only change");
        Ok(Classification::column_change(changed))
    }

    fn shape(&self, node_id: &str, sql: &str) -> Result<QueryShape, ClassificationError> {
        let query = self
            .parser
            .parse_query(sql)
            .map_err(|e| e.into_classification_error(node_id))?;

        Ok(QueryShape::from_query(&query))
    }
}

/// Describe why two shapes differ outside their projections, if they do
fn structural_change(before: &QueryShape, after: &QueryShape) -> Option<&'static str> {
    if before.skeleton != after.skeleton {
        return Some("query structure outside the projection changed");
    }

    if before.wildcards() != after.wildcards() {
        return Some("wildcard selection changed");
    }

    if (before.grain_from_projection || after.grain_from_projection)
        && before.expressions() != after.expressions()
    {
        return Some("projection decides the row grain and changed");
    }

    let surviving: BTreeSet<String> = before
        .output_columns()
        .into_iter()
        .filter(|name| after.item(name).is_some())
        .collect();

    let partition_changed = surviving.iter().any(|name| {
        let old = before.item(name).map(|i| &i.window_partitions);
        let new = after.item(name).map(|i| &i.window_partitions);
        old != new
    });

    if partition_changed {
        return Some("window partitioning changed");
    }

    None
}

fn normalize_whitespace(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}
