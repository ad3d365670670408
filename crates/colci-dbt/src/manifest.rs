//! dbt artifact parsing
//!
//! Parses dbt-generated manifest.json and run_results.json and turns them into
//! graph [`Node`]s.

use colci_core::{Node, NodeId, ResourceType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

/// dbt manifest.json structure (subset of fields we care about)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Metadata about the manifest
    pub metadata: ManifestMetadata,

    /// Models, seeds, snapshots, tests, ...
    pub nodes: HashMap<String, ManifestNode>,

    /// Source definitions
    #[serde(default)]
    pub sources: HashMap<String, ManifestSource>,

    /// Parent map (node -> list of parent nodes)
    #[serde(default)]
    pub parent_map: HashMap<String, Vec<String>>,

    /// Child map (node -> list of child nodes)
    #[serde(default)]
    pub child_map: HashMap<String, Vec<String>>,
}

impl Manifest {
    /// Load manifest from file
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ManifestError::IoError(path.display().to_string(), e.to_string()))?;

        Self::from_str(&contents)
    }

    /// Parse manifest from JSON string
    pub fn from_str(json: &str) -> Result<Self, ManifestError> {
        serde_json::from_str(json)
            .map_err(|e| ManifestError::ParseError(e.to_string()))
    }

    /// Get all model nodes
    pub fn models(&self) -> impl Iterator<Item = &ManifestNode> {
        self.nodes.values().filter(|node| node.resource_type == "model")
    }

    /// Get a specific node by unique_id
    pub fn get_node(&self, unique_id: &str) -> Option<&ManifestNode> {
        self.nodes.get(unique_id)
    }

    /// Get a specific source by unique_id
    pub fn get_source(&self, unique_id: &str) -> Option<&ManifestSource> {
        self.sources.get(unique_id)
    }

    /// Whether an id names a manifest entry that is not part of the lineage graph
    /// (tests, analyses, operations)
    fn is_filtered(&self, unique_id: &str) -> bool {
        self.nodes
            .get(unique_id)
            .map(|node| !node.in_lineage())
            .unwrap_or(false)
    }

    /// Graph nodes of the current project state
    ///
    /// Models, seeds and snapshots carry their compiled code and declared
    /// columns; sources become roots. Edges come from `parent_map`/`child_map`
    /// when present and from `depends_on` otherwise. Edges to tests and
    /// analyses are dropped; edges to ids the manifest does not know are kept
    /// so the graph can treat them as external roots.
    pub fn to_nodes(&self) -> Vec<Node> {
        let mut nodes: BTreeMap<NodeId, Node> = BTreeMap::new();

        for (unique_id, manifest_node) in &self.nodes {
            if !manifest_node.in_lineage() {
                continue;
            }

            let mut node = Node::new(
                unique_id.clone(),
                manifest_node.name.clone(),
                ResourceType::parse(&manifest_node.resource_type),
            )
            .with_columns(manifest_node.column_names());

            node.current_compiled_code = manifest_node.compiled_code.clone();
            nodes.insert(unique_id.clone(), node);
        }

        for (unique_id, source) in &self.sources {
            let node = Node::new(unique_id.clone(), source.name.clone(), ResourceType::Source)
                .with_columns(source.column_names());
            nodes.insert(unique_id.clone(), node);
        }

        let use_maps = !self.parent_map.is_empty() || !self.child_map.is_empty();
        for (unique_id, node) in nodes.iter_mut() {
            let parents: Vec<&String> = if use_maps {
                self.parent_map.get(unique_id).map(|p| p.iter().collect()).unwrap_or_default()
            } else {
                self.nodes
                    .get(unique_id)
                    .map(|n| n.depends_on.nodes.iter().collect())
                    .unwrap_or_default()
            };

            node.upstream
                .extend(parents.into_iter().filter(|id| !self.is_filtered(id)).cloned());

            if let Some(children) = self.child_map.get(unique_id) {
                node.downstream
                    .extend(children.iter().filter(|id| !self.is_filtered(id)).cloned());
            }
        }

        nodes.into_values().collect()
    }

    /// Graph nodes of the current state compared against a previous manifest
    ///
    /// A model is marked modified when it is absent from `previous` or when its
    /// file checksum or compiled code differs. Previous compiled code and
    /// declared columns are attached to every node that exists in both.
    pub fn compare_with(&self, previous: &Manifest) -> Vec<Node> {
        let mut nodes = self.to_nodes();

        for node in nodes.iter_mut() {
            let Some(current) = self.nodes.get(&node.unique_id) else {
                continue;
            };

            match previous.nodes.get(&node.unique_id) {
                Some(before) => {
                    node.previous_compiled_code = before.compiled_code.clone();
                    node.previous_columns = Some(before.column_names());
                    node.modified = current.resource_type == "model" && current.differs_from(before);
                }
                None => {
                    node.modified = current.resource_type == "model";
                }
            }
        }

        nodes
    }

    /// Unique ids of models that differ from `previous`
    pub fn modified_models(&self, previous: &Manifest) -> BTreeSet<NodeId> {
        self.models()
            .filter(|node| {
                previous
                    .nodes
                    .get(&node.unique_id)
                    .map(|before| node.differs_from(before))
                    .unwrap_or(true)
            })
            .map(|node| node.unique_id.clone())
            .collect()
    }
}

/// Manifest metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub dbt_schema_version: String,
    pub dbt_version: String,
    #[serde(default)]
    pub generated_at: String,
    #[serde(default)]
    pub invocation_id: Option<String>,
}

/// A node in the manifest (model, test, snapshot, etc.)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestNode {
    /// Unique identifier (e.g., "model.shop.int_orders")
    pub unique_id: String,

    /// Node name (e.g., "int_orders")
    pub name: String,

    /// Resource type (model, test, snapshot, etc.)
    pub resource_type: String,

    #[serde(default)]
    pub package_name: String,

    #[serde(default)]
    pub original_file_path: String,

    /// Fully rendered SQL (absent until the node is compiled)
    #[serde(default, alias = "compiled_sql")]
    pub compiled_code: Option<String>,

    /// Hash of the raw file, as used by dbt's state comparison
    #[serde(default)]
    pub checksum: Option<FileChecksum>,

    /// Declared column definitions
    #[serde(default)]
    pub columns: BTreeMap<String, ColumnDefinition>,

    /// Dependencies
    #[serde(default)]
    pub depends_on: DependsOn,
}

impl ManifestNode {
    /// Declared column names, canonicalized
    pub fn column_names(&self) -> Vec<String> {
        self.columns.values().map(|c| colci_core::canonical_column(&c.name)).collect()
    }

    fn in_lineage(&self) -> bool {
        matches!(self.resource_type.as_str(), "model" | "seed" | "snapshot")
    }

    fn differs_from(&self, previous: &ManifestNode) -> bool {
        let checksum_changed = match (&self.checksum, &previous.checksum) {
            (Some(now), Some(before)) => now.checksum != before.checksum,
            _ => false,
        };

        checksum_changed || self.compiled_code != previous.compiled_code
    }
}

/// File checksum recorded by dbt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChecksum {
    pub name: String,
    pub checksum: String,
}

/// Column definition from manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    /// Column name
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub data_type: Option<String>,
}

/// Dependencies structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependsOn {
    /// List of node unique_ids this node depends on
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// A source in the manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestSource {
    /// Unique identifier (e.g., "source.shop.raw.orders")
    pub unique_id: String,

    /// Source name (e.g., "raw")
    pub source_name: String,

    /// Table name (e.g., "orders")
    pub name: String,

    #[serde(default)]
    pub schema: Option<String>,

    /// Column definitions
    #[serde(default)]
    pub columns: BTreeMap<String, ColumnDefinition>,
}

impl ManifestSource {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.values().map(|c| colci_core::canonical_column(&c.name)).collect()
    }
}

/// dbt run_results.json (subset)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResults {
    #[serde(default)]
    pub results: Vec<RunResult>,
}

/// One executed node in run_results.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub unique_id: String,

    #[serde(default)]
    pub status: String,

    /// Materialized relation; `None` for ephemeral models and tests
    #[serde(default)]
    pub relation_name: Option<String>,

    #[serde(default)]
    pub compiled_code: Option<String>,
}

impl RunResults {
    /// Load run results from file
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ManifestError::IoError(path.display().to_string(), e.to_string()))?;

        Self::from_str(&contents)
    }

    pub fn from_str(json: &str) -> Result<Self, ManifestError> {
        serde_json::from_str(json)
            .map_err(|e| ManifestError::ParseError(e.to_string()))
    }

    /// Compiled code of every result that materializes a relation
    pub fn compiled_code(&self) -> BTreeMap<NodeId, String> {
        self.results
            .iter()
            .filter(|result| result.relation_name.is_some())
            .filter_map(|result| {
                result
                    .compiled_code
                    .as_ref()
                    .map(|code| (result.unique_id.clone(), code.clone()))
            })
            .collect()
    }
}

/// Artifact parsing errors
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Failed to read artifact file {0}: {1}")]
    IoError(String, String),

    #[error("Failed to parse artifact JSON: {0}")]
    ParseError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MANIFEST: &str = r#"{
        "metadata": {"dbt_schema_version": "v12", "dbt_version": "1.8.0"},
        "nodes": {
            "model.shop.stg_orders": {
                "unique_id": "model.shop.stg_orders",
                "name": "stg_orders",
                "resource_type": "model",
                "compiled_code": "select id as order_id, amount from raw.orders",
                "checksum": {"name": "sha256", "checksum": "aaa"},
                "columns": {"order_id": {"name": "ORDER_ID"}},
                "depends_on": {"nodes": ["source.shop.raw.orders"]}
            },
            "model.shop.int_orders": {
                "unique_id": "model.shop.int_orders",
                "name": "int_orders",
                "resource_type": "model",
                "compiled_code": "select order_id, amount as order_total from stg_orders",
                "checksum": {"name": "sha256", "checksum": "bbb"},
                "depends_on": {"nodes": ["model.shop.stg_orders"]}
            },
            "test.shop.not_null_int_orders_order_id": {
                "unique_id": "test.shop.not_null_int_orders_order_id",
                "name": "not_null_int_orders_order_id",
                "resource_type": "test",
                "depends_on": {"nodes": ["model.shop.int_orders"]}
            }
        },
        "sources": {
            "source.shop.raw.orders": {
                "unique_id": "source.shop.raw.orders",
                "source_name": "raw",
                "name": "orders"
            }
        }
    }"#;

    #[test]
    fn parse_manifest() {
        let manifest = Manifest::from_str(MANIFEST).unwrap();
        assert_eq!(manifest.metadata.dbt_version, "1.8.0");
        assert_eq!(manifest.models().count(), 2);
        assert!(manifest.get_source("source.shop.raw.orders").is_some());
    }

    #[test]
    fn nodes_follow_depends_on_without_maps() {
        let manifest = Manifest::from_str(MANIFEST).unwrap();
        let nodes = manifest.to_nodes();

        let ids: Vec<&str> = nodes.iter().map(|n| n.unique_id.as_str()).collect();
        assert_eq!(ids, vec!["model.shop.int_orders", "model.shop.stg_orders", "source.shop.raw.orders"]);

        let stg = nodes.iter().find(|n| n.name == "stg_orders").unwrap();
        assert!(stg.upstream.contains("source.shop.raw.orders"));
        assert_eq!(stg.columns, vec!["order_id".to_string()]);
        assert!(stg.current_compiled_code.is_some());
    }

    #[test]
    fn compare_marks_changed_models() {
        let current = Manifest::from_str(MANIFEST).unwrap();
        let mut previous = current.clone();
        if let Some(node) = previous.nodes.get_mut("model.shop.int_orders") {
            node.compiled_code = Some("select order_id, amount from stg_orders".to_string());
            node.checksum = Some(FileChecksum { name: "sha256".into(), checksum: "old".into() });
        }

        let nodes = current.compare_with(&previous);
        let modified: Vec<&str> = nodes.iter().filter(|n| n.modified).map(|n| n.name.as_str()).collect();
        assert_eq!(modified, vec!["int_orders"]);

        let int_orders = nodes.iter().find(|n| n.name == "int_orders").unwrap();
        assert_eq!(
            int_orders.previous_compiled_code.as_deref(),
            Some("select order_id, amount from stg_orders")
        );
        assert_eq!(current.modified_models(&previous).len(), 1);
    }

    #[test]
    fn run_results_keep_materialized_nodes() {
        let json = r#"{"results": [
            {"unique_id": "model.shop.a", "status": "success", "relation_name": "\"db\".\"s\".\"a\"", "compiled_code": "select 1 as x"},
            {"unique_id": "model.shop.eph", "status": "success", "relation_name": null, "compiled_code": "select 2 as y"}
        ]}"#;

        let results = RunResults::from_str(json).unwrap();
        let code = results.compiled_code();
        assert_eq!(code.len(), 1);
        assert_eq!(code.get("model.shop.a").map(String::as_str), Some("select 1 as x"));
    }

    #[test]
    fn load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, MANIFEST).unwrap();

        assert!(Manifest::from_file(&path).is_ok());
        assert!(matches!(
            Manifest::from_file(&dir.path().join("missing.json")),
            Err(ManifestError::IoError(_, _))
        ));
    }
}
