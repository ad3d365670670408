//! Graph construction from the shop fixture project

use colci_core::ResourceType;
use colci_dbt::{Manifest, NodeManager, RunResults};
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;
use std::path::PathBuf;

fn fixture(path: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/shop").join(path)
}

fn ids(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| format!("model.shop.{}", n)).collect()
}

#[test]
fn fixture_graph_excludes_tests_and_keeps_sources() {
    let manifest = Manifest::from_file(&fixture("target/manifest.json")).unwrap();
    let graph = NodeManager::from_manifest(&manifest);

    assert!(graph.get("test.shop.not_null_fct_orders_order_id").is_none());
    assert_eq!(
        graph.get("source.shop.raw.orders").map(|n| n.resource_type),
        Some(ResourceType::Source)
    );
    assert_eq!(
        graph.get("seed.shop.country_codes").map(|n| n.resource_type),
        Some(ResourceType::Seed)
    );
    assert!(graph.nodes().all(|n| !n.is_external()));
}

#[test]
fn fixture_descendants_of_int_orders() {
    let manifest = Manifest::from_file(&fixture("target/manifest.json")).unwrap();
    let graph = NodeManager::from_manifest(&manifest);

    assert_eq!(
        graph.get_descendants("model.shop.int_orders").unwrap(),
        ids(&["fct_orders", "rpt_revenue", "dim_customers"])
    );
}

#[test]
fn fixture_state_comparison() {
    let current = Manifest::from_file(&fixture("target/manifest.json")).unwrap();
    let previous = Manifest::from_file(&fixture("state/manifest.json")).unwrap();
    let graph = NodeManager::new(current.compare_with(&previous));

    assert_eq!(graph.modified_ids(), ids(&["int_orders"]));
    assert_eq!(
        graph.resolve_selection("state:modified+").unwrap(),
        ids(&["int_orders", "fct_orders", "rpt_revenue", "dim_customers"])
    );

    let int_orders = graph.get("model.shop.int_orders").unwrap();
    assert!(int_orders.previous_compiled_code.as_deref().unwrap().contains("amount as order_total"));
    assert!(int_orders.current_compiled_code.as_deref().unwrap().contains("amount + tax"));
}

#[test]
fn fixture_run_results() {
    let results = RunResults::from_file(&fixture("target/run_results.json")).unwrap();
    let code = results.compiled_code();
    assert_eq!(code.keys().cloned().collect::<Vec<_>>(), vec!["model.shop.int_orders".to_string()]);
}
