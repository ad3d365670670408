//! colci engine - Decision logic of a column-aware CI run
//!
//! This crate turns classified nodes into a CI selection:
//! - Impact propagation and pruning ([`LineagePruner`])
//! - Classification of modified nodes and selection rendering ([`Planner`])
//! - Discovery-backed column usage ([`LineageUsage`])
//! - The run state machine ([`CiOrchestrator`])

pub mod pruner;
pub mod plan;
pub mod lineage_usage;
pub mod orchestrator;

pub use pruner::{Impact, LineagePruner, PruneError, PruneOutcome};
pub use plan::{Plan, Planner, SelectionBuilder};
pub use lineage_usage::LineageUsage;
pub use orchestrator::{CiError, CiOrchestrator, Phase};
