//! Benchmarks for classification and pruning
//!
//! These measure the CPU-bound core of a run over generated graphs of the
//! size a large dbt project reaches.

use colci_core::{Classification, DialectConfig, Node, ResourceType};
use colci_dbt::NodeManager;
use colci_engine::LineagePruner;
use colci_sql::{BreakingChangeClassifier, CompiledSqlUsage};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn model_id(i: usize) -> String {
    format!("model.project.model_{}", i)
}

/// SQL for a model with N columns and joins to its predecessors
fn generate_sql(model_num: usize, num_columns: usize, num_joins: usize) -> String {
    let select_cols: Vec<String> = (0..num_columns)
        .map(|i| format!("    t0.col_{} AS col_{}", i, i))
        .collect();

    let joins: Vec<String> = (1..=num_joins.min(model_num))
        .map(|i| format!("LEFT JOIN model_{} t{} ON t0.id = t{}.id", model_num - i, i, i))
        .collect();

    format!(
        "SELECT\n{}\nFROM model_{} t0\n{}",
        select_cols.join(",\n"),
        model_num.saturating_sub(1),
        joins.join("\n")
    )
}

/// A layered graph where each model reads the previous two
fn generate_graph(num_models: usize, num_columns: usize) -> NodeManager {
    let nodes = (0..num_models).map(|i| {
        let parents: Vec<String> = (i.saturating_sub(2)..i).map(model_id).collect();
        let node = Node::new(model_id(i), format!("model_{}", i), ResourceType::Model)
            .with_current_code(generate_sql(i, num_columns, parents.len().saturating_sub(1)))
            .with_upstream(parents);
        if i == 0 {
            node.with_modified(true)
        } else {
            node
        }
    });

    let mut graph = NodeManager::new(nodes);
    let _ = graph.annotate(&model_id(0), Classification::column_change(vec!["col_1".to_string()]));
    graph
}

/// Benchmark: classify a column change (10, 50, 100 columns)
fn bench_classification(c: &mut Criterion) {
    let mut group = c.benchmark_group("classification");
    let classifier = BreakingChangeClassifier::new(&DialectConfig::Ansi);

    for num_columns in [10, 50, 100].iter() {
        let previous = generate_sql(10, *num_columns, 3);
        let current = previous.replacen("t0.col_1 AS col_1", "t0.col_1 + 1 AS col_1", 1);

        group.bench_with_input(BenchmarkId::from_parameter(num_columns), num_columns, |b, _| {
            b.iter(|| black_box(classifier.classify_code("model.project.model_10", &previous, &current, None, &[])));
        });
    }

    group.finish();
}

/// Benchmark: prune the descendants of one column change (100, 500, 1000 models)
fn bench_pruning(c: &mut Criterion) {
    let mut group = c.benchmark_group("pruning");
    let usage = CompiledSqlUsage::new(&DialectConfig::Ansi);

    for num_models in [100, 500, 1000].iter() {
        let graph = generate_graph(*num_models, 20);

        group.bench_with_input(BenchmarkId::from_parameter(num_models), num_models, |b, _| {
            b.iter(|| black_box(LineagePruner::new(&usage).compute_excluded(&graph)));
        });
    }

    group.finish();
}

/// Benchmark: descendant closure of the root
fn bench_descendants(c: &mut Criterion) {
    let graph = generate_graph(1000, 5);

    c.bench_function("descendants_1000", |b| {
        b.iter(|| black_box(graph.get_descendants(&model_id(0))));
    });
}

criterion_group!(benches, bench_classification, bench_pruning, bench_descendants);
criterion_main!(benches);
