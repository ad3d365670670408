//! Projection extraction
//!
//! A [`QueryShape`] splits a query into its top-level projection (the output
//! columns and their expressions) and a skeleton: the same query with the
//! projection removed, rendered back to text. Two versions of a model whose
//! skeletons render identically differ at most in their projection.
//!
//! Ordinal references (`GROUP BY 1`, `ORDER BY 2`, `DISTINCT ON (1)`) are
//! replaced in the skeleton by the projection expression they point at, so a
//! change to a grouped column shows up outside the projection.
//!
//! Only a plain top-level `SELECT` has an isolated projection. Set operations
//! (`UNION`, `INTERSECT`, ...) keep everything in the skeleton, so any change to
//! them compares as structural.

use colci_core::canonical_column;
use regex::Regex;
use sqlparser::ast::{
    visit_expressions, Distinct, Expr, GroupByExpr, Query, SelectItem, SetExpr, Value, WindowType,
};
use std::collections::BTreeSet;
use std::ops::ControlFlow;

/// One item of a SELECT list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionItem {
    /// Canonical output column name; `None` for `*` and `alias.*`
    pub name: Option<String>,

    /// Rendered expression (or the wildcard itself)
    pub expression: String,

    /// Canonical names of the columns the expression reads
    pub references: BTreeSet<String>,

    /// Rendered PARTITION BY expressions of inline window functions
    pub window_partitions: Vec<String>,
}

impl ProjectionItem {
    fn from_select_item(item: &SelectItem) -> Self {
        match item {
            SelectItem::UnnamedExpr(expr) => Self::from_expr(output_name(expr), expr),
            SelectItem::ExprWithAlias { expr, alias } => {
                Self::from_expr(canonical_column(&alias.value), expr)
            }
            wildcard => Self {
                name: None,
                expression: wildcard.to_string(),
                references: BTreeSet::new(),
                window_partitions: Vec::new(),
            },
        }
    }

    fn from_expr(name: String, expr: &Expr) -> Self {
        let mut references = BTreeSet::new();
        let mut window_partitions = Vec::new();

        let _ = visit_expressions(expr, |e| {
            match e {
                Expr::Identifier(ident) => {
                    references.insert(canonical_column(&ident.value));
                }
                Expr::CompoundIdentifier(parts) => {
                    if let Some(column) = parts.last() {
                        references.insert(canonical_column(&column.value));
                    }
                }
                Expr::Function(function) => {
                    if let Some(WindowType::WindowSpec(spec)) = &function.over {
                        window_partitions.extend(spec.partition_by.iter().map(|p| p.to_string()));
                    }
                }
                _ => {}
            }
            ControlFlow::<()>::Continue(())
        });

        Self {
            name: Some(name),
            expression: expr.to_string(),
            references,
            window_partitions,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.name.is_none()
    }
}

/// Output name of an unaliased expression
fn output_name(expr: &Expr) -> String {
    match expr {
        Expr::Identifier(ident) => canonical_column(&ident.value),
        Expr::CompoundIdentifier(parts) => parts
            .last()
            .map(|ident| canonical_column(&ident.value))
            .unwrap_or_else(|| canonical_column(&expr.to_string())),
        other => canonical_column(&other.to_string()),
    }
}

/// Projection and skeleton of one query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryShape {
    /// Top-level SELECT list, empty when the projection is not isolated
    pub items: Vec<ProjectionItem>,

    /// The query without its top-level projection
    pub skeleton: String,

    /// Whether the top level is a plain SELECT
    pub projection_isolated: bool,

    /// Whether the projection decides the row grain (`SELECT DISTINCT`, `GROUP BY ALL`)
    pub grain_from_projection: bool,
}

impl QueryShape {
    pub fn from_query(query: &Query) -> Self {
        let mut skeleton = query.clone();
        let mut grain_from_projection = false;

        let projection = match &mut *skeleton.body {
            SetExpr::Select(select) => {
                let projection = std::mem::take(&mut select.projection);

                match &mut select.group_by {
                    GroupByExpr::Expressions(exprs, _) => resolve_ordinals(exprs.iter_mut(), &projection),
                    GroupByExpr::All(_) => grain_from_projection = true,
                }
                match &mut select.distinct {
                    Some(Distinct::On(exprs)) => resolve_ordinals(exprs.iter_mut(), &projection),
                    Some(Distinct::Distinct) => grain_from_projection = true,
                    None => {}
                }

                Some(projection)
            }
            _ => None,
        };

        if let (Some(projection), Some(order_by)) = (&projection, &mut skeleton.order_by) {
            resolve_ordinals(order_by.exprs.iter_mut().map(|o| &mut o.expr), projection);
        }

        let items = projection
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(ProjectionItem::from_select_item)
            .collect();

        Self {
            items,
            skeleton: skeleton.to_string(),
            projection_isolated: projection.is_some(),
            grain_from_projection,
        }
    }

    /// Distinct item expressions, ignoring order and aliases
    pub fn expressions(&self) -> BTreeSet<&str> {
        self.items.iter().map(|item| item.expression.as_str()).collect()
    }

    /// Named output columns in SELECT order
    pub fn output_columns(&self) -> Vec<String> {
        self.items.iter().filter_map(|item| item.name.clone()).collect()
    }

    /// Rendered wildcard items (`*`, `o.*`)
    pub fn wildcards(&self) -> BTreeSet<String> {
        self.items
            .iter()
            .filter(|item| item.is_wildcard())
            .map(|item| item.expression.clone())
            .collect()
    }

    pub fn has_wildcard(&self) -> bool {
        self.items.iter().any(ProjectionItem::is_wildcard)
    }

    /// Named item by canonical output name
    pub fn item(&self, name: &str) -> Option<&ProjectionItem> {
        self.items.iter().find(|item| item.name.as_deref() == Some(name))
    }

    /// Whether the skeleton mentions a column (filters, joins, grouping, CTEs)
    pub fn skeleton_mentions(&self, column: &str) -> bool {
        mentions_column(&self.skeleton, column)
    }
}

/// Replace 1-based positional references with the projection expression
///
/// A position at or after a wildcard is left as is, since the column it
/// points at is unknown.
fn resolve_ordinals<'a>(exprs: impl Iterator<Item = &'a mut Expr>, projection: &[SelectItem]) {
    for expr in exprs {
        let Expr::Value(Value::Number(position, _)) = &*expr else { continue };
        let Some(index) = position.parse::<usize>().ok().and_then(|p| p.checked_sub(1)) else {
            continue;
        };
        let Some(items) = projection.get(..=index) else { continue };

        let mut target = None;
        for item in items {
            target = match item {
                SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } => Some(e),
                _ => None,
            };
            if target.is_none() {
                break;
            }
        }

        if let Some(target) = target {
            *expr = target.clone();
        }
    }
}

/// Case-insensitive whole-word search for a column name in SQL text
///
/// Errs on the side of a match: an unbuildable pattern counts as mentioned.
pub fn mentions_column(text: &str, column: &str) -> bool {
    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(column)))
        .map(|re| re.is_match(text))
        .unwrap_or(true)
}
