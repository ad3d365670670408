//! Output column diffing
//!
//! Column names are compared in canonical (lower-case, unquoted) form.
//! Reordering a SELECT list is never a change: consumers select by name.

use colci_core::canonical_column;
use std::collections::{BTreeMap, BTreeSet};

use crate::projection::QueryShape;

/// Column-level difference between two versions of a node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnDiff {
    /// Present only in the current version
    pub added: BTreeSet<String>,

    /// Present only in the previous version
    pub removed: BTreeSet<String>,

    /// Present in both, with a different defining expression
    pub modified: BTreeSet<String>,

    /// Removed column -> added column with the identical expression
    pub renamed: BTreeMap<String, String>,
}

impl ColumnDiff {
    /// Every column a consumer could observe as different
    ///
    /// A rename counts on both sides: the old name disappears and the new
    /// one appears.
    pub fn changed(&self) -> BTreeSet<String> {
        self.added
            .iter()
            .chain(&self.removed)
            .chain(&self.modified)
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// Stateless column comparison
pub struct ColumnTracker;

impl ColumnTracker {
    /// Columns added or removed between two name lists
    ///
    /// An empty `previous` makes every current column a change.
    pub fn diff(previous: &[String], current: &[String]) -> BTreeSet<String> {
        let previous: BTreeSet<String> = previous.iter().map(|c| canonical_column(c)).collect();
        let current: BTreeSet<String> = current.iter().map(|c| canonical_column(c)).collect();

        previous.symmetric_difference(&current).cloned().collect()
    }

    /// Compare the named projection items of two query shapes
    pub fn diff_projections(previous: &QueryShape, current: &QueryShape) -> ColumnDiff {
        let before: BTreeMap<&str, &str> = named_expressions(previous);
        let after: BTreeMap<&str, &str> = named_expressions(current);

        let mut diff = ColumnDiff::default();
        for (name, expression) in &after {
            match before.get(name) {
                None => {
                    diff.added.insert(name.to_string());
                }
                Some(old) if old != expression => {
                    diff.modified.insert(name.to_string());
                }
                Some(_) => {}
            }
        }

        for name in before.keys() {
            if !after.contains_key(name) {
                diff.removed.insert(name.to_string());
            }
        }

        for removed in &diff.removed {
            let expression = before.get(removed.as_str());
            let target = diff
                .added
                .iter()
                .find(|added| after.get(added.as_str()) == expression);

            if let Some(added) = target {
                diff.renamed.insert(removed.clone(), added.clone());
            }
        }

        diff
    }
}

fn named_expressions(shape: &QueryShape) -> BTreeMap<&str, &str> {
    shape
        .items
        .iter()
        .filter_map(|item| item.name.as_deref().map(|name| (name, item.expression.as_str())))
        .collect()
}
