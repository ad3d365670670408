//! End-to-end runs over the shop fixture with in-memory collaborators

use colci_cloud::{
    CollaboratorError, CompiledProject, MemoryReporter, MockCompiler, MockLineage, MockTrigger,
    RunTrigger,
};
use colci_core::{
    ChangeKind, CiSelection, ClassificationFallback, ColumnUsageStrategy, Config, DiagnosticCode,
    RunStatus,
};
use colci_dbt::{Manifest, NodeManager};
use colci_engine::{CiError, CiOrchestrator, Phase, Planner};
use colci_sql::CompiledSqlUsage;
use pretty_assertions::assert_eq;
use std::path::PathBuf;

fn fixture(path: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/shop").join(path)
}

fn manifests() -> (Manifest, Manifest) {
    let current = Manifest::from_file(&fixture("target/manifest.json")).unwrap();
    let previous = Manifest::from_file(&fixture("state/manifest.json")).unwrap();
    (current, previous)
}

/// Compiled project and lineage as the collaborators would report them
async fn collaborators() -> (CompiledProject, MockLineage) {
    let (current, previous) = manifests();
    let project = CompiledProject {
        nodes: current.to_nodes(),
        modified: current.modified_models(&previous),
    };

    let lineage = MockLineage::new();
    for node in previous.models() {
        if let Some(code) = &node.compiled_code {
            lineage.add_previous(&node.unique_id, code).await;
        }
    }
    (project, lineage)
}

struct FailingTrigger;

#[async_trait::async_trait]
impl RunTrigger for FailingTrigger {
    fn name(&self) -> &'static str {
        "Failing"
    }

    async fn trigger_and_wait(&self, _selection: &CiSelection) -> Result<RunStatus, CollaboratorError> {
        Err(CollaboratorError::Api {
            status: 500,
            body: "internal error".to_string(),
        })
    }
}

#[test]
fn offline_plan_over_fixture() {
    let (current, previous) = manifests();
    let graph = NodeManager::new(current.compare_with(&previous));
    let config = Config::default();

    let plan = Planner::new(&config)
        .plan(graph, &CompiledSqlUsage::new(&config.dialect))
        .unwrap();

    let int_orders = plan.graph.get("model.shop.int_orders").unwrap();
    assert_eq!(int_orders.change_kind(), Some(ChangeKind::ColumnChange));
    assert_eq!(
        int_orders.classification().unwrap().changed_columns().iter().collect::<Vec<_>>(),
        vec!["order_total"]
    );

    assert_eq!(plan.selection.excluded, vec!["dim_customers", "rpt_revenue"]);
    assert_eq!(
        plan.selection.included,
        vec!["model.shop.fct_orders", "model.shop.int_orders"]
    );
    assert!(plan.selection.ancestors.contains(&"model.shop.stg_orders".to_string()));
    assert!(plan.selection.ancestors.contains(&"source.shop.raw.orders".to_string()));
}

#[tokio::test]
async fn run_triggers_pruned_selection() {
    let (project, lineage) = collaborators().await;
    let trigger = MockTrigger::new(RunStatus::Success);
    let reporter = MemoryReporter::new();

    let orchestrator = CiOrchestrator::new(
        Config::default(),
        Box::new(MockCompiler::new(project)),
        Box::new(lineage),
        Box::new(trigger.clone()),
        Box::new(reporter.clone()),
    );
    let report = orchestrator.run().await.unwrap();

    assert_eq!(report.status, Some(RunStatus::Success));
    assert_eq!(report.summary.column_changes, 1);

    let triggered = trigger.triggered().await;
    assert_eq!(triggered.len(), 1);
    assert_eq!(triggered[0].excluded, vec!["dim_customers", "rpt_revenue"]);

    let published = reporter.published().await;
    assert_eq!(published.len(), 1);
    assert!(published[0].to_markdown().contains("* rpt_revenue"));
}

#[tokio::test]
async fn dry_run_never_triggers() {
    let (project, lineage) = collaborators().await;
    let trigger = MockTrigger::new(RunStatus::Success);
    let reporter = MemoryReporter::new();
    let config = Config {
        dry_run: true,
        ..Config::default()
    };

    let report = CiOrchestrator::new(
        config,
        Box::new(MockCompiler::new(project)),
        Box::new(lineage),
        Box::new(trigger.clone()),
        Box::new(reporter.clone()),
    )
    .run()
    .await
    .unwrap();

    assert!(trigger.triggered().await.is_empty());
    assert_eq!(report.status, None);
    assert!(report.dry_run);
    assert!(reporter.published().await[0]
        .to_markdown()
        .contains("would've been excluded"));
}

#[tokio::test]
async fn discovery_lineage_prunes_like_compiled_sql() {
    let (project, lineage) = collaborators().await;
    lineage
        .add_consumers("model.shop.int_orders", "order_total", ["model.shop.fct_orders"])
        .await;
    lineage.add_consumers("model.shop.fct_orders", "order_total", Vec::<String>::new()).await;

    let trigger = MockTrigger::new(RunStatus::Success);
    let config = Config {
        column_usage: ColumnUsageStrategy::Discovery,
        ..Config::default()
    };

    CiOrchestrator::new(
        config,
        Box::new(MockCompiler::new(project)),
        Box::new(lineage.clone()),
        Box::new(trigger.clone()),
        Box::new(MemoryReporter::new()),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(trigger.triggered().await[0].excluded, vec!["dim_customers", "rpt_revenue"]);
    assert_eq!(lineage.lookup_count().await, 2);
}

#[tokio::test]
async fn nothing_modified_runs_unpruned() {
    let trigger = MockTrigger::new(RunStatus::Success);

    CiOrchestrator::new(
        Config::default(),
        Box::new(MockCompiler::new(CompiledProject::default())),
        Box::new(MockLineage::new()),
        Box::new(trigger.clone()),
        Box::new(MemoryReporter::new()),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(
        trigger.triggered().await,
        vec![CiSelection::unpruned("state:modified+")]
    );
}

#[tokio::test]
async fn trigger_failure_is_reported_as_error_status() {
    let (project, lineage) = collaborators().await;
    let reporter = MemoryReporter::new();

    let report = CiOrchestrator::new(
        Config::default(),
        Box::new(MockCompiler::new(project)),
        Box::new(lineage),
        Box::new(FailingTrigger),
        Box::new(reporter.clone()),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.status, Some(RunStatus::Error));
    assert!(report.has_errors());
    assert!(report.diagnostics.iter().any(|d| d.code == DiagnosticCode::RunFailed));
    assert_eq!(reporter.published().await.len(), 1);
}

#[tokio::test]
async fn abort_policy_stops_before_trigger() {
    let (project, lineage) = collaborators().await;
    lineage.add_previous("model.shop.int_orders", "select order_id from (").await;

    let trigger = MockTrigger::new(RunStatus::Success);
    let reporter = MemoryReporter::new();
    let config = Config {
        classification_fallback: ClassificationFallback::Abort,
        ..Config::default()
    };

    let err = CiOrchestrator::new(
        config,
        Box::new(MockCompiler::new(project)),
        Box::new(lineage),
        Box::new(trigger.clone()),
        Box::new(reporter.clone()),
    )
    .run()
    .await
    .unwrap_err();

    assert!(matches!(err, CiError::Classification(ref e) if e.node_id == "model.shop.int_orders"));
    assert!(trigger.triggered().await.is_empty());

    let published = reporter.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].diagnostics[0].code, DiagnosticCode::ClassificationFailed);
}

#[tokio::test]
async fn compiler_failure_names_the_phase() {
    let err = CiOrchestrator::new(
        Config::default(),
        Box::new(MockCompiler::new(CompiledProject::default()).with_failure("dbt not installed")),
        Box::new(MockLineage::new()),
        Box::new(MockTrigger::new(RunStatus::Success)),
        Box::new(MemoryReporter::new()),
    )
    .run()
    .await
    .unwrap_err();

    assert!(matches!(err, CiError::Collaborator { phase: Phase::FetchModified, .. }));
}
