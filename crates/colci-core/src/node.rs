//! Graph nodes and change classification
//!
//! A [`Node`] is one transformation unit of a dbt project (model, seed,
//! snapshot, ...) together with the two versions of its compiled SQL and the
//! derived [`Classification`] assigned once per CI run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Node identifier (unique_id from the manifest, e.g. `model.shop.int_orders`)
pub type NodeId = String;

/// Canonical form of a column name
///
/// Column names are compared case-insensitively across the whole system.
/// Surrounding identifier quotes are dropped and the name is lower-cased.
pub fn canonical_column(name: &str) -> String {
    let trimmed = name.trim();
    let unquoted = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| trimmed.strip_prefix('`').and_then(|s| s.strip_suffix('`')))
        .or_else(|| trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')))
        .unwrap_or(trimmed);

    unquoted.to_lowercase()
}

/// dbt resource type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Model,
    Seed,
    Snapshot,
    Source,
    Test,
    Analysis,
    Exposure,
    Metric,
    /// Referenced by an edge but not part of the project graph (raw table, mesh node)
    External,
    #[serde(other)]
    Unknown,
}

impl ResourceType {
    /// Stable lowercase name, as used by dbt selectors
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Seed => "seed",
            Self::Snapshot => "snapshot",
            Self::Source => "source",
            Self::Test => "test",
            Self::Analysis => "analysis",
            Self::Exposure => "exposure",
            Self::Metric => "metric",
            Self::External => "external",
            Self::Unknown => "unknown",
        }
    }

    /// Parse a resource type name (unrecognised names map to `Unknown`)
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "model" => Self::Model,
            "seed" => Self::Seed,
            "snapshot" => Self::Snapshot,
            "source" => Self::Source,
            "test" => Self::Test,
            "analysis" => Self::Analysis,
            "exposure" => Self::Exposure,
            "metric" => Self::Metric,
            "external" => Self::External,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a modified node changed between the previous and current compiled SQL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    /// Compiled SQL is equivalent; nothing was actually touched
    Unchanged,
    /// Only the projection changed; impact is confined to specific columns
    ColumnChange,
    /// A filter, join, grouping or CTE changed; everything downstream is affected
    NodeBreakingChange,
    /// The node has no previous version
    New,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unchanged => write!(f, "unchanged"),
            Self::ColumnChange => write!(f, "column change"),
            Self::NodeBreakingChange => write!(f, "node-breaking change"),
            Self::New => write!(f, "new"),
        }
    }
}

/// Result of classifying one node
///
/// `changed_columns` is non-empty only for [`ChangeKind::ColumnChange`]; the
/// constructors are the only way to build a value, which keeps that invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    kind: ChangeKind,
    changed_columns: BTreeSet<String>,
}

impl Classification {
    pub fn unchanged() -> Self {
        Self { kind: ChangeKind::Unchanged, changed_columns: BTreeSet::new() }
    }

    pub fn new_node() -> Self {
        Self { kind: ChangeKind::New, changed_columns: BTreeSet::new() }
    }

    pub fn breaking() -> Self {
        Self { kind: ChangeKind::NodeBreakingChange, changed_columns: BTreeSet::new() }
    }

    /// Column-level change; an empty column set degrades to `Unchanged`
    pub fn column_change(columns: impl IntoIterator<Item = String>) -> Self {
        let changed_columns: BTreeSet<String> =
            columns.into_iter().map(|c| canonical_column(&c)).collect();

        if changed_columns.is_empty() {
            return Self::unchanged();
        }

        Self { kind: ChangeKind::ColumnChange, changed_columns }
    }

    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    pub fn changed_columns(&self) -> &BTreeSet<String> {
        &self.changed_columns
    }
}

/// One transformation unit in the dependency graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier (e.g., "model.shop.int_orders")
    pub unique_id: NodeId,

    /// Node name (e.g., "int_orders")
    pub name: String,

    /// Resource type
    pub resource_type: ResourceType,

    /// Compiled SQL in the deferred (production) environment; absent for new nodes
    #[serde(default)]
    pub previous_compiled_code: Option<String>,

    /// Compiled SQL of the current branch
    #[serde(default)]
    pub current_compiled_code: Option<String>,

    /// Output columns currently produced, in order
    #[serde(default)]
    pub columns: Vec<String>,

    /// Output columns of the previous version, in order
    #[serde(default)]
    pub previous_columns: Option<Vec<String>>,

    /// Nodes this node selects from
    #[serde(default)]
    pub upstream: BTreeSet<NodeId>,

    /// Nodes that select from this node
    #[serde(default)]
    pub downstream: BTreeSet<NodeId>,

    /// Whether the node is part of the modified set of this run
    #[serde(default)]
    pub modified: bool,

    /// Derived once per run by the classifier
    #[serde(default)]
    classification: Option<Classification>,
}

impl Node {
    /// Create a node with no code, columns or edges
    pub fn new(unique_id: impl Into<String>, name: impl Into<String>, resource_type: ResourceType) -> Self {
        Self {
            unique_id: unique_id.into(),
            name: name.into(),
            resource_type,
            previous_compiled_code: None,
            current_compiled_code: None,
            columns: Vec::new(),
            previous_columns: None,
            upstream: BTreeSet::new(),
            downstream: BTreeSet::new(),
            modified: false,
            classification: None,
        }
    }

    /// Opaque root for an identifier referenced by an edge but not present in the graph
    pub fn external(unique_id: impl Into<String>) -> Self {
        let unique_id = unique_id.into();
        let name = unique_id.rsplit('.').next().unwrap_or(&unique_id).to_string();
        Self::new(unique_id, name, ResourceType::External)
    }

    pub fn with_current_code(mut self, code: impl Into<String>) -> Self {
        self.current_compiled_code = Some(code.into());
        self
    }

    pub fn with_previous_code(mut self, code: impl Into<String>) -> Self {
        self.previous_compiled_code = Some(code.into());
        self
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_previous_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.previous_columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_upstream<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.upstream.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_downstream<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.downstream.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_modified(mut self, modified: bool) -> Self {
        self.modified = modified;
        self
    }

    pub fn is_external(&self) -> bool {
        self.resource_type == ResourceType::External
    }

    pub fn classification(&self) -> Option<&Classification> {
        self.classification.as_ref()
    }

    pub fn change_kind(&self) -> Option<ChangeKind> {
        self.classification.as_ref().map(Classification::kind)
    }

    /// Attach the run's classification
    ///
    /// Classification is write-once: returns `false` and leaves the node
    /// untouched when it already carries one.
    pub fn annotate(&mut self, classification: Classification) -> bool {
        if self.classification.is_some() {
            return false;
        }
        self.classification = Some(classification);
        true
    }
}
