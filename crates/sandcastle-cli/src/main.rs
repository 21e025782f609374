// Copyright (c) 2025 Sandcastle Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sandcastle CLI: validate a workflow definition or run it end to end
//! against a locally configured sandbox backend and blob store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use colored::Colorize;
use sandcastle_core::blob_store::BlobStorage;
use sandcastle_core::config::Settings;
use sandcastle_core::dag::{self, WorkflowDefinition};
use sandcastle_core::events::EventBus;
use sandcastle_core::model::{Run, RunStatus};
use sandcastle_core::sandbox::{CancelSignal, SandboxRuntime};
use sandcastle_core::store::InMemoryStore;
use sandcastle_core::value::ValueMap;
use sandcastle_core::executor::{WorkflowExecutor, WorkflowLookup};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sandcastle")]
#[command(version, about = "Sandcastle workflow execution core", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow definition
    Validate {
        /// Path to workflow YAML file
        #[arg(value_name = "FILE")]
        file: String,
    },

    /// Run a workflow
    Run {
        /// Path to workflow YAML file
        #[arg(value_name = "FILE")]
        file: String,

        /// Input JSON string or file
        #[arg(short, long)]
        input: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("sandcastle={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = match cli.command {
        Commands::Validate { file } => validate_workflow(&file),
        Commands::Run { file, input } => run_workflow(&file, input.as_deref()).await,
    };

    if let Err(e) = result {
        error!("{}", e);
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn load_workflow(file_path: &str) -> Result<WorkflowDefinition> {
    let content =
        fs::read_to_string(file_path).with_context(|| format!("Failed to read workflow file: {}", file_path))?;
    dag::parse(&content).with_context(|| format!("Failed to parse workflow YAML: {}", file_path))
}

fn validate_workflow(file_path: &str) -> Result<()> {
    info!("Validating workflow: {}", file_path);
    println!("{} {}", "Validating workflow:".cyan().bold(), file_path);

    let workflow = load_workflow(file_path)?;
    let errors = dag::validate(&workflow);
    if !errors.is_empty() {
        println!("{}", "✗ Workflow is invalid".red().bold());
        for error in &errors {
            println!("  {} {}", "-".red(), error);
        }
        anyhow::bail!("workflow validation failed with {} error(s)", errors.len());
    }

    let plan = dag::build_plan(&workflow).with_context(|| "Failed to build execution plan (possible cycle)")?;

    println!("{}", "✓ Workflow is valid".green().bold());
    println!("  Name: {}", workflow.name);
    println!("  Steps: {}", workflow.steps.len());
    println!("  Stages: {}", plan.stages.len());

    Ok(())
}

async fn run_workflow(file_path: &str, input: Option<&str>) -> Result<()> {
    info!("Running workflow: {}", file_path);
    println!("{} {}", "Running workflow:".cyan().bold(), file_path);

    let workflow = load_workflow(file_path)?;
    let errors = dag::validate(&workflow);
    if !errors.is_empty() {
        anyhow::bail!("workflow validation failed: {:?}", errors);
    }

    let workflow_input = match input {
        Some(raw) => parse_input(raw)?,
        None => ValueMap::new(),
    };

    let settings = Settings::from_env();
    info!(backend = %settings.sandbox_backend, "starting workflow run");

    let backend = sandcastle_providers::create_backend(&settings);
    let sandbox: Arc<dyn SandboxRuntime> = Arc::new(sandcastle_providers::SandshoreRuntime::new(
        backend,
        settings.anthropic_api_key.clone(),
        settings.sandbox_max_concurrent,
    ));

    let blob: Arc<dyn BlobStorage> = match settings.storage_backend.as_str() {
        #[cfg(feature = "s3")]
        "s3" => Arc::new(
            sandcastle_storage::S3Storage::new(settings.storage_bucket.clone(), Some(settings.storage_endpoint.as_str()))
                .await,
        ),
        _ => Arc::new(
            sandcastle_storage::LocalStorage::new(settings.local_storage_dir.clone())
                .await
                .with_context(|| "Failed to initialize local storage")?,
        ),
    };

    let store = Arc::new(InMemoryStore::new());
    let events = Arc::new(EventBus::new());
    let workflows: Arc<dyn WorkflowLookup> = Arc::new(FilesystemWorkflowLookup::new(settings.workflows_dir.clone()));

    let executor = WorkflowExecutor::new(store, sandbox, blob, events, workflows, settings);

    let run = Run::new(workflow.name.clone(), workflow_input);
    println!("{}", "Executing workflow...".cyan());

    let run = executor
        .execute(&workflow, run, CancelSignal::new())
        .await
        .with_context(|| "Workflow execution failed")?;

    if run.status == RunStatus::Completed {
        println!("{}", "✓ Workflow completed successfully".green().bold());
    } else {
        println!("{} {:?}", "Workflow finished with status:".yellow().bold(), run.status);
    }

    println!("\n{}", "Outputs:".cyan().bold());
    println!("{}", serde_json::to_string_pretty(&run.outputs).unwrap_or_else(|_| format!("{:?}", run.outputs)));
    println!("\n{} ${:.4}", "Total cost:".cyan().bold(), run.total_cost);

    Ok(())
}

fn parse_input(input_str: &str) -> Result<ValueMap> {
    let raw: serde_json::Value = if Path::new(input_str).exists() {
        let content =
            fs::read_to_string(input_str).with_context(|| format!("Failed to read input file: {}", input_str))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse input JSON from file: {}", input_str))?
    } else {
        serde_json::from_str(input_str).with_context(|| "Failed to parse input JSON string")?
    };

    let object = raw.as_object().with_context(|| "Workflow input must be a JSON object")?;
    Ok(object.iter().map(|(k, v)| (k.clone(), sandcastle_core::value::Value::from_json(v.clone()))).collect())
}

/// Resolves `sub_workflow` steps by reading `{workflows_dir}/{name}.yaml`.
struct FilesystemWorkflowLookup {
    workflows_dir: String,
}

impl FilesystemWorkflowLookup {
    fn new(workflows_dir: String) -> Self {
        Self { workflows_dir }
    }
}

#[async_trait]
impl WorkflowLookup for FilesystemWorkflowLookup {
    async fn load(&self, name: &str) -> anyhow::Result<Option<WorkflowDefinition>> {
        let path = Path::new(&self.workflows_dir).join(format!("{name}.yaml"));
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(dag::parse(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
