use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use colci_cloud::{reporter_from_config, DbtCli, DbtCloudClient};
use colci_core::{
    ChangeKind, Classification, Config, DialectConfig, Node, ResourceType, RunReport, Severity,
};
use colci_dbt::{Manifest, NodeManager};
use colci_engine::{CiOrchestrator, Impact, LineagePruner, Planner};
use colci_sql::{BreakingChangeClassifier, CompiledSqlUsage};

/// colci - Column-aware CI for dbt
#[derive(Parser)]
#[command(name = "colci")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: colci.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQL dialect, overriding the config file
    #[arg(long, global = true)]
    dialect: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile, classify, prune and trigger the dbt Cloud CI job
    Run {
        /// Report what would be excluded without triggering the job
        #[arg(long)]
        dry_run: bool,

        /// Output file for report.json
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Classify and prune offline from two manifests
    Plan {
        /// Manifest of the deferred (production) state
        #[arg(short, long, default_value = "state/manifest.json")]
        state: PathBuf,

        /// Manifest of the current branch
        #[arg(short = 'f', long, default_value = "target/manifest.json")]
        manifest: PathBuf,

        /// Output file for report.json
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also print the markdown summary
        #[arg(short, long)]
        markdown: bool,
    },

    /// Classify the change between two compiled SQL files
    Classify {
        /// Previous compiled SQL
        previous: PathBuf,

        /// Current compiled SQL
        current: PathBuf,
    },

    /// Resolve selection criteria against a manifest
    Select {
        /// Selection criteria (e.g. "int_orders+ resource_type:seed")
        criteria: String,

        /// Path to dbt manifest.json
        #[arg(short = 'f', long, default_value = "target/manifest.json")]
        manifest: PathBuf,
    },

    /// Show downstream impact for a model
    Impact {
        /// Model name to analyze (can be short name or unique_id)
        model: String,

        /// Only these columns changed; without it the change is node-breaking
        #[arg(long = "column")]
        columns: Vec<String>,

        /// Path to dbt manifest.json
        #[arg(short = 'f', long, default_value = "target/manifest.json")]
        manifest: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(&config, cli.verbose);

    match cli.command {
        Commands::Run { dry_run, output } => {
            let config = Config {
                dry_run: config.dry_run || dry_run,
                ..config
            };
            run_command(config, output.as_deref()).await
        }
        Commands::Plan {
            state,
            manifest,
            output,
            markdown,
        } => plan_command(&config, &state, &manifest, output.as_deref(), markdown),
        Commands::Classify { previous, current } => classify_command(&config, &previous, &current),
        Commands::Select { criteria, manifest } => select_command(&criteria, &manifest),
        Commands::Impact {
            model,
            columns,
            manifest,
        } => impact_command(&config, &model, &columns, &manifest),
    }
}

/// Config file, then `INPUT_*` environment, then command-line overrides
fn load_config(cli: &Cli) -> Result<Config> {
    let config = if let Some(config_path) = &cli.config {
        Config::from_file(config_path)?
    } else if Path::new("colci.toml").exists() {
        Config::from_file(Path::new("colci.toml"))?
    } else {
        Config::default()
    };

    let mut config = config.from_env()?;
    if let Some(dialect) = &cli.dialect {
        config.dialect = DialectConfig::parse(dialect)?;
    }
    Ok(config)
}

/// Log to stderr; RUST_LOG wins over the configured level
fn init_tracing(config: &Config, verbose: bool) {
    let level = if verbose { "debug" } else { config.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Run command - the full CI workflow
async fn run_command(config: Config, output: Option<&Path>) -> Result<()> {
    let cloud = DbtCloudClient::connect(&config)
        .await
        .context("Failed to set up the dbt Cloud client")?;

    let orchestrator = CiOrchestrator::new(
        config.clone(),
        Box::new(DbtCli::new(config.dbt.clone(), config.base_selector.clone())),
        Box::new(cloud.clone()),
        Box::new(cloud),
        reporter_from_config(&config.github),
    );

    let report = orchestrator.run().await?;
    finish_report(&report, output)?;

    let failed = report.has_errors() || report.status.map_or(false, |s| !s.is_success());
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Plan command - offline classification and pruning
fn plan_command(
    config: &Config,
    state: &Path,
    manifest_path: &Path,
    output: Option<&Path>,
    markdown: bool,
) -> Result<()> {
    let current = load_manifest(manifest_path)?;
    let previous = load_manifest(state)?;

    let graph = NodeManager::new(current.compare_with(&previous));
    let usage = CompiledSqlUsage::new(&config.dialect);
    let plan = Planner::new(config).plan(graph, &usage)?;

    println!("\n{}", "=".repeat(60).bright_blue());
    println!("{}", "Column-aware CI Plan".bold().bright_blue());
    println!("{}", "=".repeat(60).bright_blue());
    println!();

    for id in &plan.outcome.modified {
        let Some(node) = plan.graph.get(id) else { continue };
        let kind = node.change_kind().map(|k| k.to_string()).unwrap_or_default();
        let kind = match node.change_kind() {
            Some(ChangeKind::NodeBreakingChange) | Some(ChangeKind::New) => kind.red(),
            Some(ChangeKind::ColumnChange) => kind.yellow(),
            _ => kind.green(),
        };
        println!("  {} {}", node.name.bold(), kind);
        if let Some(impact) = plan.outcome.impact.get(id) {
            println!("      {} {}", "changed:".dimmed(), impact);
        }
    }

    println!();
    println!("{} {}", "Included:".bold(), plan.selection.included.len());
    println!("{} {}", "Excluded:".bold(), plan.selection.excluded.len());
    for name in &plan.selection.excluded {
        println!("  {} {}", "-".green(), name);
    }
    println!();
    println!("{} dbt build {}", "Selection:".bold(), plan.selection.to_args().cyan());
    println!();

    let report = plan.report(true);
    if markdown {
        println!("{}", report.to_markdown());
    }
    finish_report(&report, output)?;

    if report.has_errors() {
        std::process::exit(1);
    }
    Ok(())
}

/// Classify command - compare two compiled SQL files
fn classify_command(config: &Config, previous: &Path, current: &Path) -> Result<()> {
    let previous_sql = std::fs::read_to_string(previous)
        .with_context(|| format!("Failed to read {}", previous.display()))?;
    let current_sql = std::fs::read_to_string(current)
        .with_context(|| format!("Failed to read {}", current.display()))?;

    let classifier = BreakingChangeClassifier::new(&config.dialect);
    let node_id = current.display().to_string();
    let classification = classifier.classify_code(&node_id, &previous_sql, &current_sql, None, &[])?;

    println!("{} {}", "Change:".bold(), classification.kind().to_string().cyan());
    if !classification.changed_columns().is_empty() {
        let columns: Vec<&str> = classification.changed_columns().iter().map(String::as_str).collect();
        println!("{} {}", "Columns:".bold(), columns.join(", ").yellow());
    }
    Ok(())
}

/// Select command - resolve criteria against the manifest graph
fn select_command(criteria: &str, manifest_path: &Path) -> Result<()> {
    let manifest = load_manifest(manifest_path)?;
    let graph = NodeManager::from_manifest(&manifest);

    let selected = graph.resolve_selection(criteria)?;
    for id in &selected {
        println!("{}", id);
    }
    eprintln!("{} {} nodes", "Selected".green(), selected.len());
    Ok(())
}

/// Impact command - which descendants a change to one model reaches
fn impact_command(config: &Config, model: &str, columns: &[String], manifest_path: &Path) -> Result<()> {
    let manifest = load_manifest(manifest_path)?;
    let graph = NodeManager::from_manifest(&manifest);

    let selected = graph.resolve_selection(model)?;
    let node_id = selected
        .iter()
        .find(|id| graph.get(id).map_or(false, |n| n.resource_type != ResourceType::External))
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("Model '{}' not found in manifest", model))?;

    let classification = if columns.is_empty() {
        Classification::breaking()
    } else {
        Classification::column_change(columns.iter().cloned())
    };

    let nodes: Vec<Node> = graph
        .nodes()
        .cloned()
        .map(|node| {
            let modified = node.unique_id == node_id;
            node.with_modified(modified)
        })
        .collect();
    let mut graph = NodeManager::new(nodes);
    graph.annotate(&node_id, classification)?;

    let usage = CompiledSqlUsage::new(&config.dialect);
    let outcome = LineagePruner::new(&usage).compute_excluded(&graph)?;

    println!("\n{}", "=".repeat(60).bright_blue());
    println!("{}", "Downstream Impact Analysis".bold().bright_blue());
    println!("{}", "=".repeat(60).bright_blue());
    println!();
    println!("{} {}", "Model:".bold(), node_id.green());
    println!("{} {}", "Downstream models:".bold(), outcome.descendants.len());
    println!();

    if outcome.descendants.is_empty() {
        println!("{}", "✓ No downstream dependencies".green());
    } else {
        for id in &outcome.descendants {
            match outcome.impact.get(id) {
                Some(Impact::Full) => println!("  {} {}", id.red(), "(all columns)".dimmed()),
                Some(impact) => println!("  {} {}", id.yellow(), format!("({})", impact).dimmed()),
                None => println!("  {} {}", id.green(), "(not affected)".dimmed()),
            }
        }
    }

    for diagnostic in &outcome.diagnostics {
        println!("  {} {}", "⚠".yellow(), diagnostic.message);
    }

    println!();
    println!("{}", "=".repeat(60).bright_blue());
    Ok(())
}

fn load_manifest(path: &Path) -> Result<Manifest> {
    if !path.exists() {
        return Err(anyhow::anyhow!(
            "Manifest not found at {}. Run 'dbt compile' or 'dbt build' first.",
            path.display()
        ));
    }
    Ok(Manifest::from_file(path)?)
}

/// Print diagnostics and write report.json if requested
fn finish_report(report: &RunReport, output: Option<&Path>) -> Result<()> {
    for diagnostic in &report.diagnostics {
        let label = match diagnostic.severity {
            Severity::Error => "error".red().bold(),
            Severity::Warn => "warn".yellow().bold(),
            Severity::Info => "info".cyan(),
        };
        eprintln!("{} [{}] {}", label, diagnostic.code, diagnostic.message);
    }

    if let Some(path) = output {
        report
            .save_to_file(path)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        eprintln!("{} {}", "Report written to".green(), path.display());
    }

    eprintln!(
        "{} {} modified, {} excluded, {} warnings, {} errors",
        "Summary:".bold(),
        report.summary.modified,
        report.summary.excluded,
        report.summary.warnings,
        report.summary.errors
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn impact_accepts_repeated_columns() {
        let cli = Cli::parse_from([
            "colci",
            "impact",
            "int_orders",
            "--column",
            "order_total",
            "--column",
            "status",
        ]);
        match cli.command {
            Commands::Impact { columns, .. } => assert_eq!(columns, vec!["order_total", "status"]),
            _ => panic!("expected impact"),
        }
    }

    #[test]
    fn config_file_and_dialect_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("colci.toml");
        std::fs::write(&path, "dialect = \"snowflake\"\ndry_run = true\n").unwrap();

        let cli = Cli::parse_from([
            "colci",
            "--config",
            path.to_str().unwrap(),
            "--dialect",
            "bigquery",
            "select",
            "int_orders",
        ]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.dialect, DialectConfig::BigQuery);
        assert!(config.dry_run);
    }
}
