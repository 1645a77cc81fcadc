mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use events::{EventBus, EventSink};
use flowpilot_core::WorkflowStatus;
use incidents::{
    seed_procedures, CommandRecoveryActions, HealthMonitor, IncidentHandler, ProcedureRegistry,
};
use orchestrator::{Collaborators, WorkflowDefinition, WorkflowEngine};

use crate::config::{FlowpilotConfig, FLOWPILOT_DIR};

#[derive(Parser)]
#[command(name = "flowpilot")]
#[command(about = "Dependency-ordered workflows with automatic incident recovery", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: .flowpilot/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default .flowpilot/config.toml
    Init,
    /// Check a workflow file without running it
    Validate { file: PathBuf },
    /// Run a workflow file to completion
    Run { file: PathBuf },
    /// Print the built-in recovery procedures
    Procedures,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cwd = std::env::current_dir()?;
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| FlowpilotConfig::default_path(&cwd));

    match cli.command {
        Commands::Init => init_project(&cwd, &config_path).await,
        Commands::Validate { file } => validate(&config_path, &file).await,
        Commands::Run { file } => run(&config_path, &file).await,
        Commands::Procedures => procedures(),
    }
}

async fn init_project(cwd: &Path, config_path: &Path) -> Result<()> {
    if tokio::fs::try_exists(config_path).await.unwrap_or(false) {
        println!("Already initialized: {}", config_path.display());
        return Ok(());
    }

    FlowpilotConfig::default().write(config_path).await?;
    println!("Initialized flowpilot in {}", cwd.join(FLOWPILOT_DIR).display());
    println!("  config: {}", config_path.display());
    Ok(())
}

async fn read_definition(file: &Path) -> Result<WorkflowDefinition> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Invalid workflow definition in {}", file.display()))
}

async fn validate(config_path: &Path, file: &Path) -> Result<()> {
    let config = FlowpilotConfig::load_or_default(config_path).await;
    let definition = read_definition(file).await?;
    let name = definition.name.clone();
    let steps = definition.steps.len();

    let engine = WorkflowEngine::new(config.engine, Collaborators::new());
    engine
        .create_from_definition(definition)
        .with_context(|| format!("Workflow '{}' is not valid", name))?;

    println!("Workflow '{}' is valid ({} steps)", name, steps);
    Ok(())
}

async fn run(config_path: &Path, file: &Path) -> Result<()> {
    let config = FlowpilotConfig::load_or_default(config_path).await;
    let definition = read_definition(file).await?;

    let bus = EventBus::new();
    let sink: Arc<dyn EventSink> = Arc::new(bus.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let printer = tokio::spawn(print_events(bus.clone()));

    let engine = WorkflowEngine::new(config.engine, Collaborators::new()).with_event_sink(sink.clone());
    let metrics = engine.metrics();

    let handler = Arc::new(
        IncidentHandler::new(
            ProcedureRegistry::new(seed_procedures()),
            Arc::new(CommandRecoveryActions::new(config.recovery)),
        )
        .with_verifier(metrics.clone())
        .with_event_sink(sink.clone()),
    );
    let worker = handler.spawn_worker(shutdown_rx.clone());
    let monitor = Arc::new(
        HealthMonitor::new(config.monitor, metrics, handler.clone()).with_event_sink(sink),
    )
    .spawn(shutdown_rx);

    let engine = engine.with_incident_handler(handler.clone());
    let id = engine.create_from_definition(definition)?;
    let outcome = engine.run(id).await;

    let _ = shutdown_tx.send(true);
    if let Some(worker) = worker {
        let _ = worker.await;
    }
    let _ = monitor.await;
    let open_incidents = handler.list_open().len();

    // the printer ends once every publisher is gone
    drop(engine);
    drop(handler);
    drop(bus);
    let _ = printer.await;

    let workflow = outcome?;
    println!("{}", serde_json::to_string_pretty(&workflow.summary())?);
    if open_incidents > 0 {
        println!("{} incident(s) still open", open_incidents);
    }

    match workflow.status {
        WorkflowStatus::Completed => Ok(()),
        status => bail!(
            "Workflow ended {}: {}",
            status.as_str(),
            workflow.error.as_deref().unwrap_or("no error recorded")
        ),
    }
}

async fn print_events(bus: EventBus) {
    let mut stream = BroadcastStream::new(bus.subscribe());
    drop(bus);
    while let Some(item) = stream.next().await {
        match item {
            Ok(envelope) => {
                let record = envelope.record();
                println!(
                    "{} {:<24} {} {}",
                    record.timestamp.format("%H:%M:%S%.3f"),
                    record.event_type,
                    record.status.unwrap_or_default(),
                    record.message.unwrap_or_default()
                );
            }
            Err(e) => tracing::warn!(error = %e, "Event printer lagged"),
        }
    }
}

fn procedures() -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&seed_procedures())?);
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowpilot=info,orchestrator=info,incidents=info".into()),
        )
        .init();
}
