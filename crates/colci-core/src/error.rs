//! Run-fatal error taxonomy
//!
//! These three errors abort a CI run before any job is triggered. Each crate
//! wraps them in its own error enum.

use crate::node::NodeId;

/// Compiled SQL of a node could not be parsed for the configured dialect
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to classify `{node_id}`: {reason}")]
pub struct ClassificationError {
    /// Node whose SQL could not be classified
    pub node_id: NodeId,

    /// Parser message or description of the unsupported construct
    pub reason: String,

    /// The raw compiled text that failed
    pub sql: String,
}

impl ClassificationError {
    pub fn new(node_id: impl Into<String>, reason: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            reason: reason.into(),
            sql: sql.into(),
        }
    }
}

/// The dependency graph contains a cycle
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("dependency cycle detected: {}", .cycle.join(" -> "))]
pub struct CyclicGraphError {
    /// Nodes along the cycle; the first node is repeated at the end
    pub cycle: Vec<NodeId>,
}

/// A selection references a node that is not in the graph
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("selection `{selector}` references unknown node `{identifier}`")]
pub struct UnresolvedSelectionError {
    /// Full selection criteria
    pub selector: String,

    /// The identifier that matched nothing
    pub identifier: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_names_the_path() {
        let err = CyclicGraphError {
            cycle: vec!["model.a.x".into(), "model.a.y".into(), "model.a.x".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle detected: model.a.x -> model.a.y -> model.a.x");
    }

    #[test]
    fn classification_error_keeps_raw_sql() {
        let err = ClassificationError::new("model.a.x", "Expected: end of statement", "SELECT FROM WHERE");
        assert_eq!(err.sql, "SELECT FROM WHERE");
        assert!(err.to_string().contains("model.a.x"));
    }
}
