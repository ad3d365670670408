//! dbt artifact parsing and the project graph
//!
//! This crate handles:
//! - Parsing manifest.json and run_results.json
//! - Building the [`NodeManager`] graph (descendants, ancestors, topological order)
//! - Resolving dbt-style selection criteria against the graph

pub mod manifest;
pub mod graph;
pub mod selection;

pub use manifest::{
    Manifest, ManifestNode, ManifestSource, ManifestMetadata, ManifestError, ColumnDefinition,
    DependsOn, FileChecksum, RunResults, RunResult,
};
pub use graph::{NodeManager, GraphError};
pub use selection::{SelectionCriteria, SelectionTerm, SelectorAtom, SelectorError, SelectorMethod};
