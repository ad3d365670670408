//! SQL structure analysis
//!
//! This crate handles:
//! - Parsing compiled SQL for the configured dialect
//! - Separating a query's projection from the rest of its structure
//! - Diffing output columns ([`ColumnTracker`])
//! - Classifying a node's change ([`BreakingChangeClassifier`])
//! - Deciding which changed columns a downstream node consumes ([`ColumnUsage`])

pub mod parser;
pub mod projection;
pub mod column_tracker;
pub mod classifier;
pub mod usage;

pub use parser::{SqlParser, ParsedSql, ParseError};
pub use projection::{QueryShape, ProjectionItem};
pub use column_tracker::{ColumnTracker, ColumnDiff};
pub use classifier::BreakingChangeClassifier;
pub use usage::{ColumnUsage, Consumption, CompiledSqlUsage, UsageVerdict};
