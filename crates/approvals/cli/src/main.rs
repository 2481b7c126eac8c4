//! approvalsctl - check template manifests and simulate approval scenarios
//!
//! Everything runs against the in-memory store:
//! - `check` imports a manifest and prints its validation report
//! - `simulate` imports a manifest, then replays a scripted scenario and
//!   prints one JSON line per step

use anyhow::{bail, Context};
use approvals_engine::{import_manifest, EngineConfig, InMemoryDirectory, TemplateManifest, WorkflowEngine};
use approvals_store::InMemoryWorkflowStore;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod scenario;

/// approvalsctl application
#[derive(Parser)]
#[command(name = "approvalsctl")]
#[command(about = "Approval workflow manifest checker and scenario simulator", long_about = None)]
#[command(version)]
struct Cli {
    /// Engine configuration file path
    #[arg(short, long, env = "APPROVALS_CONFIG", global = true)]
    config: Option<String>,

    /// Log level filter (overrides the configured level)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a template manifest
    Check {
        /// Manifest file (.json or .toml)
        manifest: PathBuf,
    },

    /// Replay a scenario against a manifest
    Simulate {
        /// Manifest file (.json or .toml)
        manifest: PathBuf,

        /// Scenario file (.json or .toml)
        #[arg(short, long)]
        scenario: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = EngineConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    init_tracing(
        cli.log_level.as_deref().unwrap_or(&config.logging.level),
        cli.json || config.logging.json,
    );

    match cli.command {
        Commands::Check { manifest } => check(&manifest, config),
        Commands::Simulate { manifest, scenario } => simulate(&manifest, &scenario, config),
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn load_manifest(path: &Path) -> anyhow::Result<TemplateManifest> {
    TemplateManifest::load(path).with_context(|| format!("failed to load manifest {}", path.display()))
}

fn check(path: &Path, config: EngineConfig) -> anyhow::Result<()> {
    let manifest = load_manifest(path)?;
    let problems = manifest.problems();
    if !problems.is_empty() {
        for problem in &problems {
            println!("error: {problem}");
        }
        bail!("{} problem(s) in {}", problems.len(), path.display());
    }

    let engine = WorkflowEngine::builder(
        Arc::new(InMemoryWorkflowStore::new()),
        Arc::new(InMemoryDirectory::new()),
    )
    .with_config(config)
    .build();
    let imported = import_manifest(engine.templates(), engine.graph(), &manifest)?;

    println!("{}", serde_json::to_string_pretty(&imported.report)?);
    if !imported.report.is_valid() {
        bail!(
            "template '{}' has {} structural problem(s)",
            manifest.code,
            imported.report.problems.len()
        );
    }
    tracing::info!(
        code = %manifest.code,
        stages = imported.stages.len(),
        transitions = imported.transitions.len(),
        "Manifest is valid"
    );
    Ok(())
}

fn simulate(manifest_path: &Path, scenario_path: &Path, config: EngineConfig) -> anyhow::Result<()> {
    let manifest = load_manifest(manifest_path)?;
    let scenario = scenario::Scenario::load(scenario_path)?;
    let outcome = scenario::run(&manifest, &scenario, config)?;
    for line in &outcome.lines {
        println!("{}", serde_json::to_string(line)?);
    }
    println!("{}", serde_json::to_string(&outcome.statistics)?);
    if outcome.failed_expectations > 0 {
        bail!("{} step(s) did not match their expectation", outcome.failed_expectations);
    }
    Ok(())
}
