//! Run report schema (stable v1)
//!
//! This schema is STABLE and VERSIONED.
//! Breaking changes require a new version.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use crate::diagnostic::{Diagnostic, Severity};
use crate::node::{ChangeKind, Node};
use crate::selection::CiSelection;

/// Report schema version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportVersion {
    /// Major version (breaking changes)
    pub major: u32,

    /// Minor version (backward-compatible additions)
    pub minor: u32,
}

impl ReportVersion {
    /// Current report schema version
    pub const CURRENT: ReportVersion = ReportVersion { major: 1, minor: 0 };
}

impl std::fmt::Display for ReportVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Terminal status of the triggered run
///
/// Intermediate states (queued, starting, running) never reach the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failure,
    Error,
    Cancelled,
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Error => write!(f, "error"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Classification of one modified node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeChange {
    pub unique_id: String,
    pub name: String,
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub changed_columns: BTreeSet<String>,
}

impl NodeChange {
    /// Build from a classified node; `None` when the node carries no classification
    pub fn from_node(node: &Node) -> Option<Self> {
        let classification = node.classification()?;
        Some(Self {
            unique_id: node.unique_id.clone(),
            name: node.name.clone(),
            kind: classification.kind(),
            changed_columns: classification.changed_columns().clone(),
        })
    }
}

/// Summary statistics for a report
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    /// Number of modified nodes
    pub modified: usize,

    pub unchanged: usize,
    pub column_changes: usize,
    pub breaking_changes: usize,
    pub new_nodes: usize,

    /// Nodes kept in the run
    pub included: usize,

    /// Nodes pruned from the run
    pub excluded: usize,

    /// Number of warnings
    pub warnings: usize,

    /// Number of errors
    pub errors: usize,
}

/// CI run report (report.json v1)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Schema version
    pub version: ReportVersion,

    /// Timestamp (ISO 8601)
    pub timestamp: String,

    /// Whether the job was only simulated
    pub dry_run: bool,

    /// Summary statistics
    pub summary: ReportSummary,

    /// Classified modified nodes
    pub nodes: Vec<NodeChange>,

    /// Rendered selection
    pub selection: CiSelection,

    /// Fingerprint of the rendered selection
    pub selection_fingerprint: String,

    /// All diagnostics
    pub diagnostics: Vec<Diagnostic>,

    /// Terminal status of the triggered run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
}

impl RunReport {
    /// Create a report from classified nodes and the rendered selection
    pub fn new(mut nodes: Vec<NodeChange>, selection: CiSelection, dry_run: bool) -> Self {
        nodes.sort_by(|a, b| a.unique_id.cmp(&b.unique_id));

        let count = |kind: ChangeKind| nodes.iter().filter(|n| n.kind == kind).count();
        let summary = ReportSummary {
            modified: nodes.len(),
            unchanged: count(ChangeKind::Unchanged),
            column_changes: count(ChangeKind::ColumnChange),
            breaking_changes: count(ChangeKind::NodeBreakingChange),
            new_nodes: count(ChangeKind::New),
            included: selection.included.len(),
            excluded: selection.excluded.len(),
            warnings: 0,
            errors: 0,
        };

        Self {
            version: ReportVersion::CURRENT,
            timestamp: chrono::Utc::now().to_rfc3339(),
            dry_run,
            summary,
            nodes,
            selection_fingerprint: selection.fingerprint(),
            selection,
            diagnostics: Vec::new(),
            status: None,
        }
    }

    /// Add a diagnostic to the report
    pub fn add_diagnostic(&mut self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Error => self.summary.errors += 1,
            Severity::Warn => self.summary.warnings += 1,
            Severity::Info => {}
        }

        self.diagnostics.push(diagnostic);
    }

    /// Record the terminal run status
    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Check if the report has any errors
    pub fn has_errors(&self) -> bool {
        self.summary.errors > 0
    }

    /// Markdown summary, suitable for a pull request comment
    pub fn to_markdown(&self) -> String {
        let mut md = String::new();

        if self.dry_run {
            md.push_str("## Column-aware CI Results (dry run)\n\n");
            md.push_str(&format!(
                "The total number of models that would've been excluded from the build are: {}\n",
                self.selection.excluded.len()
            ));
        } else {
            md.push_str("## Column-aware CI Results\n\n");
            md.push_str(&format!(
                "The total number of models excluded from the build are: {}\n",
                self.selection.excluded.len()
            ));
        }

        md.push_str("<details>");
        if self.dry_run {
            md.push_str("<summary>Models that would've been excluded from the build are listed below:</summary>\n\n");
        } else {
            md.push_str("<summary>Models excluded from the build are listed below:</summary>\n\n");
        }
        if self.selection.excluded.is_empty() {
            md.push_str("_No models excluded_");
        } else {
            let items: Vec<String> = self.selection.excluded.iter().map(|n| format!("* {}", n)).collect();
            md.push_str(&items.join("\n"));
        }
        md.push_str("\n</details>\n");

        if !self.nodes.is_empty() {
            md.push_str("\n| Model | Change | Columns |\n|---|---|---|\n");
            for node in &self.nodes {
                let columns: Vec<&str> = node.changed_columns.iter().map(String::as_str).collect();
                md.push_str(&format!("| {} | {} | {} |\n", node.name, node.kind, columns.join(", ")));
            }
        }

        if let Some(status) = self.status {
            md.push_str(&format!("\n**Run status:** {}\n", status));
        }

        md
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Save to file
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), std::io::Error> {
        let json = self.to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::DiagnosticCode;
    use crate::node::{Classification, ResourceType};

    fn classified(id: &str, classification: Classification) -> NodeChange {
        let mut node = Node::new(id, id.rsplit('.').next().unwrap(), ResourceType::Model);
        node.annotate(classification);
        NodeChange::from_node(&node).unwrap()
    }

    #[test]
    fn summary_counts_kinds() {
        let nodes = vec![
            classified("model.shop.b", Classification::breaking()),
            classified("model.shop.a", Classification::column_change(vec!["total".to_string()])),
            classified("model.shop.c", Classification::unchanged()),
        ];
        let selection = CiSelection::new(
            "state:modified+",
            vec!["model.shop.a".to_string()],
            vec!["d".to_string()],
            Vec::new(),
        );

        let report = RunReport::new(nodes, selection, true);
        assert_eq!(report.version, ReportVersion::CURRENT);
        assert_eq!(report.summary.modified, 3);
        assert_eq!(report.summary.breaking_changes, 1);
        assert_eq!(report.summary.column_changes, 1);
        assert_eq!(report.summary.excluded, 1);
        assert_eq!(report.nodes[0].unique_id, "model.shop.a");
    }

    #[test]
    fn diagnostics_update_summary() {
        let mut report = RunReport::new(Vec::new(), CiSelection::unpruned("state:modified+"), false);
        report.add_diagnostic(Diagnostic::new(DiagnosticCode::ClassificationFallback, Severity::Warn, "fallback"));
        report.add_diagnostic(Diagnostic::new(DiagnosticCode::RunFailed, Severity::Error, "failed"));

        assert_eq!(report.summary.warnings, 1);
        assert!(report.has_errors());
    }

    #[test]
    fn markdown_lists_exclusions() {
        let selection = CiSelection::new(
            "state:modified+",
            Vec::new(),
            vec!["rpt_revenue".to_string()],
            Vec::new(),
        );
        let report = RunReport::new(Vec::new(), selection, true);
        let md = report.to_markdown();

        assert!(md.contains("(dry run)"));
        assert!(md.contains("* rpt_revenue"));

        let empty = RunReport::new(Vec::new(), CiSelection::unpruned("state:modified+"), true);
        assert!(empty.to_markdown().contains("_No models excluded_"));
    }

    #[test]
    fn report_serialization() {
        let report = RunReport::new(Vec::new(), CiSelection::unpruned("state:modified+"), false)
            .with_status(RunStatus::Success);
        let json = report.to_json().unwrap();
        assert!(json.contains("\"version\""));
        assert!(json.contains("\"selection_fingerprint\""));
        assert!(json.contains("\"success\""));
    }
}
