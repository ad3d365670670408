//! Diagnostic codes and run notes
//!
//! IMPORTANT: Diagnostic codes are versioned and stable.
//! NEVER rename or remove codes - they are part of the public API.
//! Add new codes with new names only.

use serde::{Deserialize, Serialize};

/// Diagnostic code registry (v1)
///
/// These codes are STABLE and VERSIONED.
/// Do NOT rename or remove codes - only add new ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiagnosticCode {
    // Classification (1xxx)
    /// Compiled SQL could not be parsed; the node was treated as node-breaking
    ClassificationFallback,

    /// Compiled SQL could not be parsed and the run was aborted
    ClassificationFailed,

    /// The node has no previous version in the deferred environment
    NewNode,

    // Impact analysis (2xxx)
    /// Downstream node has no compiled SQL; treated as fully impacted
    UsageMissingCode,

    /// Downstream SQL failed to parse; column references were scanned textually
    UsageTextualScan,

    /// Node kept in the run by `always_include`
    AlwaysIncluded,

    // Graph (3xxx)
    /// Dependency cycle in the project graph
    GraphCycle,

    /// Selection references an unknown node
    SelectionUnresolved,

    // Run (4xxx)
    /// dbt Cloud run finished without success
    RunFailed,

    /// Report could not be published
    ReportNotPublished,

    // General (9xxx)
    /// General informational message
    Info,
}

impl DiagnosticCode {
    /// Get the diagnostic code as a stable string identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClassificationFallback => "CLASSIFICATION_FALLBACK",
            Self::ClassificationFailed => "CLASSIFICATION_FAILED",
            Self::NewNode => "NEW_NODE",
            Self::UsageMissingCode => "USAGE_MISSING_CODE",
            Self::UsageTextualScan => "USAGE_TEXTUAL_SCAN",
            Self::AlwaysIncluded => "ALWAYS_INCLUDED",
            Self::GraphCycle => "GRAPH_CYCLE",
            Self::SelectionUnresolved => "SELECTION_UNRESOLVED",
            Self::RunFailed => "RUN_FAILED",
            Self::ReportNotPublished => "REPORT_NOT_PUBLISHED",
            Self::Info => "INFO",
        }
    }
}

impl std::fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Diagnostic severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational message
    Info,

    /// Warning - a conservative fallback was applied
    Warn,

    /// Error - the run failed
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A diagnostic message with structured metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Stable diagnostic code
    pub code: DiagnosticCode,

    /// Severity level
    pub severity: Severity,

    /// Human-readable message
    pub message: String,

    /// Node the diagnostic is about
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,

    /// Downstream nodes affected by this diagnostic
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub impact: Vec<String>,
}

impl Diagnostic {
    /// Create a new diagnostic with minimal fields
    pub fn new(code: DiagnosticCode, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            code,
            severity,
            message: message.into(),
            node_id: None,
            impact: Vec::new(),
        }
    }

    /// Attach the node the diagnostic is about
    pub fn for_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Set downstream impact
    pub fn with_impact(mut self, impact: Vec<String>) -> Self {
        self.impact = impact;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_code_stability() {
        assert_eq!(DiagnosticCode::ClassificationFallback.as_str(), "CLASSIFICATION_FALLBACK");
        assert_eq!(DiagnosticCode::UsageMissingCode.as_str(), "USAGE_MISSING_CODE");
    }

    #[test]
    fn diagnostic_serialization() {
        let diag = Diagnostic::new(
            DiagnosticCode::ClassificationFallback,
            Severity::Warn,
            "Treating model as node-breaking",
        )
        .for_node("model.shop.int_orders");

        let json = serde_json::to_string(&diag).unwrap();
        assert!(json.contains("CLASSIFICATION_FALLBACK"));
        assert!(json.contains("\"warn\""));
        assert!(json.contains("model.shop.int_orders"));
        assert!(!json.contains("impact"));
    }
}
