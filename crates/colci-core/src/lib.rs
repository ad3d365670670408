//! colci core
//!
//! Core domain model shared by every colci crate: graph nodes and their change
//! classification, the run-fatal error taxonomy, configuration, diagnostics,
//! the versioned run report and the rendered CI selection.
//! Never rename diagnostic codes - they are part of the public API.

pub mod node;
pub mod error;
pub mod config;
pub mod diagnostic;
pub mod selection;
pub mod report;

pub use node::{Node, NodeId, ChangeKind, Classification, ResourceType, canonical_column};
pub use error::{ClassificationError, CyclicGraphError, UnresolvedSelectionError};
pub use config::{
    Config, ConfigError, DialectConfig, ClassificationFallback, ColumnUsageStrategy,
    DbtConfig, DbtCloudConfig, GithubConfig,
};
pub use diagnostic::{Diagnostic, DiagnosticCode, Severity};
pub use selection::CiSelection;
pub use report::{RunReport, ReportVersion, ReportSummary, NodeChange, RunStatus};
