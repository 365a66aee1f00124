use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stepflow::action::builtin::builtin_registry;
use stepflow::{
    ActionDispatcher, CachingDispatcher, DependencyGraph, EngineConfig, ExecutionRecorder,
    ExecutionStatus, ExecutionSummary, JsonlRecorder, LogRecorder, Plan, StepState, TaskRegistry,
};
use stepflow_cache::{CacheConfig, ResponseCache};

#[derive(Parser)]
#[command(name = "stepflow")]
#[command(about = "Run dependency-ordered step plans", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a plan file and print its execution levels
    Validate {
        /// Plan file (YAML or JSON)
        plan: PathBuf,
    },

    /// Execute a plan with the builtin actions
    Run {
        /// Plan file (YAML or JSON)
        plan: PathBuf,

        /// Engine config file (defaults to <config dir>/stepflow/config.yaml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Maximum steps dispatched per round
        #[arg(long)]
        max_in_flight: Option<usize>,

        /// Default step timeout in seconds
        #[arg(long)]
        timeout: Option<f64>,

        /// Append execution records to this JSONL file
        #[arg(long)]
        record: Option<PathBuf>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// List builtin actions
    Actions,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "stepflow=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { ref plan } => validate_plan(plan)?,

        Commands::Run {
            ref plan,
            ref config,
            max_in_flight,
            timeout,
            ref record,
            json,
        } => {
            let mut engine_config = EngineConfig::resolve(config.as_deref())?;
            if let Some(max) = max_in_flight {
                engine_config.max_in_flight = max;
            }
            if let Some(secs) = timeout {
                engine_config.default_step_timeout = Duration::try_from_secs_f64(secs)
                    .with_context(|| format!("invalid timeout: {}", secs))?;
            }
            engine_config.validate()?;

            let summary = run_plan(plan, engine_config, record.as_deref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
            if summary.status != ExecutionStatus::Completed {
                std::process::exit(1);
            }
        }

        Commands::Actions => {
            let registry = builtin_registry();
            println!("Builtin actions:");
            for name in registry.names() {
                let kind = registry
                    .kind_of(&name)
                    .map(|k| k.to_string())
                    .unwrap_or_default();
                let cached = if registry.is_cacheable(&name) { " (cacheable)" } else { "" };
                println!("  {:<12} {}{}", name, kind, cached);
            }
        }
    }

    Ok(())
}

fn load_plan(path: &Path) -> Result<Plan> {
    Plan::from_file(path).with_context(|| format!("failed to load plan {:?}", path))
}

fn validate_plan(path: &Path) -> Result<()> {
    let plan = load_plan(path)?;
    plan.validate_shape()?;
    let graph = DependencyGraph::from_plan(&plan)?;

    let registry = builtin_registry();
    let unknown: Vec<String> = plan
        .steps
        .iter()
        .filter(|s| !registry.supports(&s.action))
        .map(|s| format!("{} ({})", s.id, s.action))
        .collect();
    if !unknown.is_empty() {
        bail!("unknown actions: {}", unknown.join(", "));
    }

    println!("Plan {} is valid: {} steps", plan.id, plan.len());
    if !plan.task.is_empty() {
        println!("  Task: {}", plan.task);
    }
    for (i, level) in graph.levels()?.iter().enumerate() {
        println!("  Level {}: {}", i + 1, level.join(", "));
    }
    Ok(())
}

async fn run_plan(
    path: &Path,
    config: EngineConfig,
    record: Option<&Path>,
) -> Result<ExecutionSummary> {
    let plan = load_plan(path)?;

    let dispatcher: Arc<dyn ActionDispatcher> = if config.cache_responses {
        let cache_config = CacheConfig::builder().default_ttl(config.cache_ttl).build();
        let cache = Arc::new(ResponseCache::new(cache_config));
        tokio::spawn(stepflow_cache::start_auto_cleanup(Arc::clone(&cache)));
        Arc::new(CachingDispatcher::new(builtin_registry(), cache))
    } else {
        Arc::new(builtin_registry())
    };
    let recorder: Arc<dyn ExecutionRecorder> = match record {
        Some(path) => Arc::new(JsonlRecorder::new(path)?),
        None => Arc::new(LogRecorder),
    };

    let registry = TaskRegistry::new(config, dispatcher, recorder)?;
    let execution_id = registry.submit(plan).await?;

    let snapshot = tokio::select! {
        snapshot = registry.wait(&execution_id) => snapshot?,
        _ = tokio::signal::ctrl_c() => {
            warn!(execution_id = %execution_id, "Interrupted, cancelling execution");
            registry.cancel(&execution_id).await;
            registry.wait(&execution_id).await?
        }
    };
    registry.shutdown().await;

    Ok(snapshot.summary())
}

fn print_summary(summary: &ExecutionSummary) {
    println!(
        "Execution {} (plan {}): {}",
        summary.execution_id, summary.plan_id, summary.status
    );
    if !summary.task.is_empty() {
        println!("  Task:     {}", summary.task);
    }
    let duration = summary
        .duration_ms
        .map(|ms| format!("{}ms", ms))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "  Rounds:   {}  Dispatches: {}  Duration: {}",
        summary.rounds, summary.dispatches, duration
    );

    println!("\nSteps:");
    for step in &summary.steps {
        let (icon, detail) = match step.state {
            StepState::Completed => ("●", format!("completed ({} attempt(s))", step.attempts)),
            StepState::Failed => (
                "✗",
                format!(
                    "failed after {} attempt(s): {}",
                    step.attempts,
                    step.error.as_ref().map(|e| e.to_string()).unwrap_or_default()
                ),
            ),
            StepState::Pending => ("○", "not run".to_string()),
        };
        println!("  {} {:<16} {}", icon, step.step_id, detail);
    }

    if let Some(error) = &summary.error {
        println!("\nError: {}", error);
    }
}
