//! Berth - ephemeral service dependencies for integration tests
//!
//! This is the main CLI entry point for Berth.

use anyhow::{bail, Context, Result};
use berth::fixtures::{FixtureFile, FixtureParser};
use berth::{
    ConnectionHandle, LifecycleScope, OrchestratorConfig, ScopeKind, ServiceSpec, TestOrchestrator,
};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Berth - disposable service dependencies for tests
#[derive(Parser)]
#[command(name = "berth")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Start disposable service dependencies for integration tests", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Configuration file (defaults to berth.yaml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the container engine is reachable
    Check,

    /// Parse a fixture file and list its services
    Validate {
        /// Fixture file
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Start the services of a fixture file until interrupted
    Up {
        /// Fixture file
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Print connection handles as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = OrchestratorConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Check => {
            let orchestrator = TestOrchestrator::builder()
                .config(config)
                .build()
                .context("Failed to create orchestrator")?;

            if orchestrator.engine_available().await {
                println!("Engine at {} is reachable", orchestrator.config().engine_url);
            } else {
                bail!("Engine at {} is not reachable", orchestrator.config().engine_url);
            }
        }

        Commands::Validate { file } => {
            let path = fixture_path(file)?;
            let (fixture, specs) = load_fixture(&path)?;

            println!(
                "{:<16} {:<30} {:<16} {:<30}",
                "SERVICE", "IMAGE", "PORTS", "WAIT"
            );
            for spec in &specs {
                println!(
                    "{:<16} {:<30} {:<16} {:<30}",
                    spec.name(),
                    spec.image(),
                    format_ports(spec),
                    spec.effective_wait_strategy().to_string()
                );
            }
            println!(
                "{} service(s), scope {}",
                specs.len(),
                fixture.scope.unwrap_or(ScopeKind::PerProcess)
            );
        }

        Commands::Up { file, json } => {
            let path = fixture_path(file)?;
            let (fixture, specs) = load_fixture(&path)?;
            let orchestrator = TestOrchestrator::builder()
                .config(config)
                .build()
                .context("Failed to create orchestrator")?;

            if !orchestrator.engine_available().await {
                bail!("Engine at {} is not reachable", orchestrator.config().engine_url);
            }

            let scope = orchestrator.scope(fixture.scope.unwrap_or(ScopeKind::PerProcess));
            let served = serve(&orchestrator, &scope, &specs, json).await;

            // Whatever came up is torn down, also when startup failed
            scope.shutdown().await;
            orchestrator.shutdown().await;
            served?;
        }

        Commands::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
        }
    }

    Ok(())
}

async fn serve(
    orchestrator: &TestOrchestrator,
    scope: &LifecycleScope,
    specs: &[ServiceSpec],
    json: bool,
) -> Result<()> {
    let handles = orchestrator
        .start(scope, specs)
        .await
        .context("Failed to start services")?;

    if json {
        let mut ordered: Vec<&ConnectionHandle> = handles.values().collect();
        ordered.sort_by(|a, b| a.name().cmp(b.name()));
        println!("{}", serde_json::to_string_pretty(&ordered)?);
    } else {
        print_handles(&handles);
    }

    tracing::info!("Services are up; press Ctrl-C to tear down");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    orchestrator.release_all(scope, handles).await;
    scope.close().await?;
    Ok(())
}

fn fixture_path(file: Option<PathBuf>) -> Result<PathBuf> {
    match file {
        Some(path) => Ok(path),
        None => {
            let dir = std::env::current_dir()?;
            FixtureParser::find_fixture_file(&dir)
                .with_context(|| format!("No fixture file found in {}", dir.display()))
        }
    }
}

fn load_fixture(path: &Path) -> Result<(FixtureFile, Vec<ServiceSpec>)> {
    FixtureParser::load_specs(path)
        .with_context(|| format!("Failed to load fixture file {}", path.display()))
}

fn format_ports(spec: &ServiceSpec) -> String {
    if spec.exposed_ports().is_empty() {
        return "-".to_string();
    }
    spec.exposed_ports()
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn print_handles(handles: &HashMap<String, ConnectionHandle>) {
    let mut names: Vec<&String> = handles.keys().collect();
    names.sort();

    println!(
        "{:<16} {:<14} {:<24} {:<30}",
        "SERVICE", "INSTANCE", "ENDPOINT", "CONTAINER"
    );
    for name in names {
        let handle = &handles[name];
        let id = handle.instance_id();
        println!(
            "{:<16} {:<14} {:<24} {:<30}",
            name,
            &id[..id.len().min(12)],
            handle.endpoint().unwrap_or_else(|| "-".to_string()),
            handle.container_name().unwrap_or("-")
        );
    }
}
