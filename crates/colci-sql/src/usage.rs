//! Downstream column usage
//!
//! Given the columns of an upstream node that are still considered changed,
//! a [`ColumnUsage`] strategy decides how much of a downstream node is
//! affected. [`CompiledSqlUsage`] answers from the downstream node's own
//! compiled SQL:
//!
//! - a changed column read in the projection affects exactly the output
//!   columns whose expressions read it (a wildcard passes names through);
//! - a changed column read anywhere else (filter, join, grouping, CTE) affects
//!   the whole node, and so does one read in the projection of a
//!   `SELECT DISTINCT`, where the projection decides the row grain;
//! - no compiled SQL, or SQL that does not parse, falls back conservatively and
//!   reports a diagnostic.

use colci_core::{Diagnostic, DiagnosticCode, DialectConfig, Node, Severity};
use std::collections::BTreeSet;
use tracing::warn;

use crate::parser::SqlParser;
use crate::projection::{mentions_column, QueryShape};

/// How much of a downstream node a set of changed columns reaches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Consumption {
    /// None of the changed columns are read
    None,

    /// Only these output columns of the downstream node are affected
    Columns(BTreeSet<String>),

    /// The whole downstream node is affected
    Full,
}

impl Consumption {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// A consumption decision plus the fallback that produced it, if any
#[derive(Debug, Clone, PartialEq)]
pub struct UsageVerdict {
    pub consumption: Consumption,
    pub diagnostic: Option<Diagnostic>,
}

impl UsageVerdict {
    pub fn exact(consumption: Consumption) -> Self {
        Self { consumption, diagnostic: None }
    }

    pub fn fallback(consumption: Consumption, diagnostic: Diagnostic) -> Self {
        Self { consumption, diagnostic: Some(diagnostic) }
    }
}

/// Strategy deciding which changed upstream columns a downstream node consumes
pub trait ColumnUsage: Send + Sync {
    /// `changed` holds canonical column names of `upstream`
    fn consumption(&self, upstream: &Node, downstream: &Node, changed: &BTreeSet<String>) -> UsageVerdict;
}

/// Column usage read from each downstream node's compiled SQL
pub struct CompiledSqlUsage {
    parser: SqlParser,
}

impl CompiledSqlUsage {
    pub fn new(dialect: &DialectConfig) -> Self {
        Self {
            parser: SqlParser::from_dialect(dialect),
        }
    }
}

impl ColumnUsage for CompiledSqlUsage {
    fn consumption(&self, upstream: &Node, downstream: &Node, changed: &BTreeSet<String>) -> UsageVerdict {
        if changed.is_empty() {
            return UsageVerdict::exact(Consumption::None);
        }

        let Some(code) = downstream.current_compiled_code.as_deref() else {
            warn!(
                upstream = %upstream.unique_id,
                node = %downstream.unique_id,
                "No compiled code for downstream node, treating it as fully impacted"
            );
            let diagnostic = Diagnostic::new(
                DiagnosticCode::UsageMissingCode,
                Severity::Warn,
                format!("{} has no compiled code; treated as fully impacted", downstream.name),
            )
            .for_node(downstream.unique_id.clone());
            return UsageVerdict::fallback(Consumption::Full, diagnostic);
        };

        let query = match self.parser.parse_query(code) {
            Ok(query) => query,
            Err(e) => {
                let mentioned = changed.iter().any(|column| mentions_column(code, column));
                warn!(
                    node = %downstream.unique_id,
                    error = %e,
                    mentioned,
                    "Downstream SQL did not parse, scanned it for changed columns"
                );
                let diagnostic = Diagnostic::new(
                    DiagnosticCode::UsageTextualScan,
                    Severity::Warn,
                    format!("{} could not be parsed ({}); column references were scanned textually", downstream.name, e),
                )
                .for_node(downstream.unique_id.clone());
                let consumption = if mentioned { Consumption::Full } else { Consumption::None };
                return UsageVerdict::fallback(consumption, diagnostic);
            }
        };

        UsageVerdict::exact(consumption_of(&QueryShape::from_query(&query), changed))
    }
}

/// Consumption of `changed` columns by a parsed downstream query
fn consumption_of(shape: &QueryShape, changed: &BTreeSet<String>) -> Consumption {
    if changed.iter().any(|column| shape.skeleton_mentions(column)) {
        return Consumption::Full;
    }

    let mut affected = BTreeSet::new();
    for item in &shape.items {
        match &item.name {
            Some(name) => {
                if item.references.iter().any(|r| changed.contains(r)) {
                    affected.insert(name.clone());
                }
            }
            None => affected.extend(changed.iter().cloned()),
        }
    }

    if affected.is_empty() {
        Consumption::None
    } else if shape.grain_from_projection {
        Consumption::Full
    } else {
        Consumption::Columns(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colci_core::ResourceType;
    use pretty_assertions::assert_eq;

    fn upstream() -> Node {
        Node::new("model.shop.int_orders", "int_orders", ResourceType::Model)
    }

    fn downstream(sql: &str) -> Node {
        Node::new("model.shop.fct_orders", "fct_orders", ResourceType::Model).with_current_code(sql)
    }

    fn changed(columns: &[&str]) -> BTreeSet<String> {
        columns.iter().map(|c| c.to_string()).collect()
    }

    fn consumption(sql: &str, columns: &[&str]) -> Consumption {
        CompiledSqlUsage::new(&DialectConfig::Ansi)
            .consumption(&upstream(), &downstream(sql), &changed(columns))
            .consumption
    }

    #[test]
    fn projection_reference_marks_output_columns() {
        assert_eq!(
            consumption(
                "select o.order_id, o.order_total * 100 as total_cents from int_orders o",
                &["order_total"]
            ),
            Consumption::Columns(changed(&["total_cents"]))
        );
    }

    #[test]
    fn unreferenced_column_is_not_consumed() {
        assert_eq!(
            consumption("select order_id, count(*) as order_count from fct_orders group by order_id", &["order_total"]),
            Consumption::None
        );
    }

    #[test]
    fn ordinal_grouping_on_changed_column_is_full() {
        assert_eq!(
            consumption(
                "select customer_id, order_total, count(*) as n from int_orders group by 1, 2",
                &["order_total"]
            ),
            Consumption::Full
        );
    }

    #[test]
    fn ordinal_grouping_on_other_columns_marks_outputs() {
        assert_eq!(
            consumption(
                "select customer_id, sum(order_total) as revenue from int_orders group by 1",
                &["order_total"]
            ),
            Consumption::Columns(changed(&["revenue"]))
        );
    }

    #[test]
    fn distinct_over_changed_column_is_full() {
        assert_eq!(
            consumption("select distinct customer_id, order_total from int_orders", &["order_total"]),
            Consumption::Full
        );
        assert_eq!(
            consumption("select distinct customer_id from int_orders", &["order_total"]),
            Consumption::None
        );
    }

    #[test]
    fn filter_reference_is_full() {
        assert_eq!(
            consumption("select order_id from int_orders where order_total > 100", &["order_total"]),
            Consumption::Full
        );
    }

    #[test]
    fn join_reference_is_full() {
        assert_eq!(
            consumption(
                "select c.id from customers c join int_orders o on o.order_total = c.credit",
                &["order_total"]
            ),
            Consumption::Full
        );
    }

    #[test]
    fn wildcard_passes_columns_through() {
        assert_eq!(
            consumption("select * from int_orders", &["order_total"]),
            Consumption::Columns(changed(&["order_total"]))
        );
    }

    #[test]
    fn missing_code_is_full_with_diagnostic() {
        let node = Node::new("model.shop.fct_orders", "fct_orders", ResourceType::Model);
        let verdict = CompiledSqlUsage::new(&DialectConfig::Ansi)
            .consumption(&upstream(), &node, &changed(&["order_total"]));

        assert_eq!(verdict.consumption, Consumption::Full);
        assert_eq!(
            verdict.diagnostic.map(|d| d.code),
            Some(DiagnosticCode::UsageMissingCode)
        );
    }

    #[test]
    fn unparseable_code_is_scanned() {
        let usage = CompiledSqlUsage::new(&DialectConfig::Ansi);

        let hit = usage.consumption(&upstream(), &downstream("select order_total frm x where"), &changed(&["order_total"]));
        assert_eq!(hit.consumption, Consumption::Full);
        assert_eq!(hit.diagnostic.map(|d| d.code), Some(DiagnosticCode::UsageTextualScan));

        let miss = usage.consumption(&upstream(), &downstream("select order_id frm x where"), &changed(&["order_total"]));
        assert_eq!(miss.consumption, Consumption::None);
    }

    #[test]
    fn nothing_changed_is_none() {
        assert_eq!(consumption("select * from int_orders", &[]), Consumption::None);
    }
}
