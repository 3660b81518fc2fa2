use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scanflow_config::{ConfigLoad, ConfigLoader, ConfigLoaderOptions};
use scanflow_core::orchestration::{
    CancelMode, OrchestrationEventPayload, OrchestratorRuntime, OptimizationScope, SubmitResult,
};
use scanflow_core::types::ids::OrchestrationId;
use scanflow_server::demo::simulated_registry;
use scanflow_server::plan::PlanFile;

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "scanflowd")]
#[command(about = "Scan orchestration engine driven by JSON plan files")]
struct Cli {
    /// Path to scanflow.toml (overrides SCANFLOW_CONFIG and default locations)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to a .env file loaded before SCANFLOW_* overrides are read
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Submit every request in a plan file and wait for all of them to finish
    Run {
        plan: PathBuf,
        /// Gracefully cancel whatever is still pending after this many milliseconds
        #[arg(long)]
        cancel_after_ms: Option<u64>,
        /// Print an optimization report once the plan has finished
        #[arg(long, default_value_t = false)]
        optimize: bool,
    },
    /// Validate a plan file and print stage order and estimates without running it
    Plan { plan: PathBuf },
    /// Print the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let ConfigLoad {
        config,
        warnings: config_warnings,
    } = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: cli.config.clone(),
        env_file: cli.env_file.clone(),
        search_root: None,
    })
    .load()
    .context("failed to load configuration")?;

    let default_filter = config.log_filter.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = config.metadata.config_path.as_ref() {
        info!(path = %path.display(), "configuration loaded from file");
    }
    for warning in &config_warnings.items {
        match &warning.hint {
            Some(hint) => warn!(message = %warning.message, hint = %hint, "configuration warning"),
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    match cli.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config.orchestrator)?);
            Ok(())
        }
        Command::Plan { plan } => {
            let previews = PlanFile::load(&plan)?.preview()?;
            println!("{}", serde_json::to_string_pretty(&previews)?);
            Ok(())
        }
        Command::Run {
            plan,
            cancel_after_ms,
            optimize,
        } => {
            let plan = PlanFile::load(&plan)?;
            let runtime = OrchestratorRuntime::builder(config.orchestrator)
                .with_handlers(simulated_registry())
                .build()
                .context("failed to build orchestrator")?;
            runtime.start().await?;

            let outcome = run_plan(&runtime, plan, cancel_after_ms, optimize).await;
            if let Err(err) = runtime.shutdown().await {
                error!(error = %err, "orchestrator shutdown failed");
            }
            outcome
        }
    }
}

async fn run_plan(
    runtime: &OrchestratorRuntime,
    plan: PlanFile,
    cancel_after_ms: Option<u64>,
    optimize: bool,
) -> anyhow::Result<()> {
    let mut events = runtime
        .subscribe_events()
        .context("orchestrator has no in-process event bus")?;

    let mut submitted = Vec::with_capacity(plan.requests.len());
    let mut rejected = Vec::new();
    let mut pending: HashSet<OrchestrationId> = HashSet::new();
    for request in plan.requests {
        let name = request.name.clone();
        let result = runtime.submit(request).await?;
        match &result {
            SubmitResult::Executing { orchestration_id, .. } => {
                info!(%orchestration_id, %name, "orchestration executing");
                pending.insert(*orchestration_id);
            }
            SubmitResult::Queued {
                orchestration_id,
                position,
            } => {
                info!(%orchestration_id, %name, position, "orchestration queued");
                pending.insert(*orchestration_id);
            }
            SubmitResult::Rejected {
                orchestration_id,
                reason,
            } => {
                warn!(%orchestration_id, %name, %reason, "orchestration rejected");
            }
        }
        if matches!(result, SubmitResult::Rejected { .. }) {
            rejected.push(result);
        } else {
            submitted.push(result.orchestration_id());
        }
    }

    let cancel_timer = tokio::time::sleep(Duration::from_millis(cancel_after_ms.unwrap_or(0)));
    tokio::pin!(cancel_timer);
    let mut cancel_armed = cancel_after_ms.is_some();

    while !pending.is_empty() {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => {
                    if let OrchestrationEventPayload::Terminal { orchestration_id, status, .. } = event.payload
                        && pending.remove(&orchestration_id)
                    {
                        info!(%orchestration_id, ?status, remaining = pending.len(), "orchestration finished");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream lagged; reconciling from status");
                    reconcile(runtime, &mut pending).await;
                }
                Err(RecvError::Closed) => {
                    reconcile(runtime, &mut pending).await;
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                warn!(pending = pending.len(), "interrupted; cancelling pending orchestrations");
                cancel_all(runtime, &pending, CancelMode::Immediate).await;
                reconcile(runtime, &mut pending).await;
                break;
            }
            _ = &mut cancel_timer, if cancel_armed => {
                cancel_armed = false;
                info!(pending = pending.len(), "cancel deadline reached");
                cancel_all(runtime, &pending, CancelMode::Graceful).await;
                reconcile(runtime, &mut pending).await;
            }
        }
    }

    let mut statuses = Vec::with_capacity(submitted.len());
    for id in submitted {
        statuses.push(runtime.get_status(id).await?);
    }
    let summary = serde_json::json!({ "statuses": statuses, "rejected": rejected });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if optimize {
        let report = runtime.optimize_resources(Some(OptimizationScope::All)).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

async fn cancel_all(
    runtime: &OrchestratorRuntime,
    pending: &HashSet<OrchestrationId>,
    mode: CancelMode,
) {
    for id in pending {
        match runtime.cancel(*id, mode).await {
            Ok(result) => info!(orchestration_id = %id, outcome = ?result.outcome, "cancel requested"),
            Err(err) => warn!(orchestration_id = %id, error = %err, "cancel failed"),
        }
    }
}

/// Drops entries whose status is already terminal.
async fn reconcile(runtime: &OrchestratorRuntime, pending: &mut HashSet<OrchestrationId>) {
    let mut finished = Vec::new();
    for id in pending.iter() {
        match runtime.get_status(*id).await {
            Ok(view) if view.is_terminal() => finished.push(*id),
            Ok(_) => {}
            Err(err) => {
                warn!(orchestration_id = %id, error = %err, "status lookup failed");
                finished.push(*id);
            }
        }
    }
    for id in finished {
        pending.remove(&id);
    }
}
