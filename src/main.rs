mod runtime;

use std::io::{self, Read};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use evoflow_agent::{EvaluationInput, WorkflowInput};
use evoflow_core::config::AppConfig;
use evoflow_core::event::EventBus;
use evoflow_core::types::WorkflowEvent;
use evoflow_core::workflow::WorkflowConfig;
use evoflow_gp::{load_seed_population, EvolutionTask};
use evoflow_tools::ToolRegistry;

use crate::runtime::Runtime;

#[derive(Parser)]
#[command(name = "evoflow", version, about = "Run and evolve multi-agent workflows")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "evoflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow once on a prompt
    Run {
        /// Workflow definition (JSON)
        workflow: PathBuf,
        /// Prompt for the entry node (read from stdin when empty)
        #[arg(trailing_var_arg = true)]
        prompt: Vec<String>,
        /// Score the result against this expected answer or rubric
        #[arg(long)]
        rubric: Option<String>,
        /// Feedback from an earlier run, used by node self-improvement
        #[arg(long)]
        feedback: Option<String>,
    },
    /// Check a workflow definition for structural problems
    Verify {
        workflow: PathBuf,
    },
    /// Print the orchestration edges of a workflow
    Edges {
        workflow: PathBuf,
    },
    /// Evolve workflows for a task
    Evolve {
        /// The task every candidate workflow is run on
        #[arg(long)]
        prompt: String,
        /// Expected answer or grading rubric for the judge
        #[arg(long)]
        rubric: String,
        /// JSON file with one workflow or an array of workflows to start from
        #[arg(long)]
        seeds: Option<PathBuf>,
        /// Write the best workflow here instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("evoflow=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    // Commands that never touch a model.
    match &cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            return Ok(());
        }
        Commands::Edges { workflow } => {
            let workflow = WorkflowConfig::load(workflow)?;
            for edge in workflow.edges() {
                println!("{}", edge);
            }
            return Ok(());
        }
        Commands::Verify { workflow } => return verify(&config, workflow),
        _ => {}
    }

    let client = evoflow_llm::create_client(&config.model)?;
    let runtime = Runtime::build(config, client)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; finishing in-flight work");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Commands::Run {
            workflow,
            prompt,
            rubric,
            feedback,
        } => {
            let text = if prompt.is_empty() {
                let mut input = String::new();
                io::stdin().read_to_string(&mut input)?;
                input.trim().to_string()
            } else {
                prompt.join(" ")
            };
            run_once(&runtime, &workflow, text, rubric, feedback, &cancel).await
        }
        Commands::Evolve {
            prompt,
            rubric,
            seeds,
            output,
        } => evolve(&runtime, prompt, rubric, seeds, output, &cancel).await,
        Commands::Config | Commands::Edges { .. } | Commands::Verify { .. } => Ok(()),
    }
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        Ok(AppConfig::load(path)?)
    } else {
        eprintln!(
            "Warning: {} not found, using defaults (OPENAI_API_KEY from the environment)",
            path.display()
        );
        Ok(AppConfig::default())
    }
}

fn verify(config: &AppConfig, path: &Path) -> anyhow::Result<()> {
    let workflow = WorkflowConfig::load(path)?;
    let options = runtime::verify_options(config, &ToolRegistry::with_builtins());
    let errors = workflow.verify(&options);
    if errors.is_empty() {
        println!("{}: ok ({} nodes)", path.display(), workflow.nodes.len());
        return Ok(());
    }
    for error in &errors {
        println!("{}: {}", path.display(), error);
    }
    anyhow::bail!("{} verification error(s)", errors.len())
}

/// Print progress events to stderr until the bus closes or the handle is aborted.
fn spawn_event_printer(event_bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut rx = event_bus.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            };
            match event {
                WorkflowEvent::NodeStarted { node_id, .. } => eprintln!("[node: {}]", node_id),
                WorkflowEvent::NodeCompleted {
                    node_id,
                    usd_cost,
                    failed: true,
                    ..
                } => eprintln!("[node: {} failed, ${:.4}]", node_id, usd_cost),
                WorkflowEvent::HandoffResolved {
                    from_node_id,
                    next_node_ids,
                } if !next_node_ids.is_empty() => {
                    eprintln!("[handoff: {} -> {}]", from_node_id, next_node_ids.join(", "))
                }
                WorkflowEvent::JoinReleased { node_id, inputs } => {
                    eprintln!("[join: {} released with {} inputs]", node_id, inputs)
                }
                WorkflowEvent::AdmissionRejected { rejection } => {
                    eprintln!("[admission: {}]", rejection)
                }
                WorkflowEvent::GenerationCompleted {
                    generation,
                    best_fitness,
                    avg_fitness,
                    evaluation_cost,
                } => eprintln!(
                    "[generation {}: best {:.1}, avg {:.1}, cost ${:.4}]",
                    generation, best_fitness, avg_fitness, evaluation_cost
                ),
                _ => {}
            }
        }
    })
}

async fn run_once(
    runtime: &Runtime,
    path: &Path,
    prompt: String,
    rubric: Option<String>,
    feedback: Option<String>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let workflow = WorkflowConfig::load(path)?;
    let printer = spawn_event_printer(&runtime.event_bus);

    let mut input = WorkflowInput::new(prompt);
    if let Some(feedback) = feedback {
        input = input.with_feedback(feedback);
    }
    let result = runtime.orchestrator.invoke(&workflow, input, cancel).await;
    printer.abort();
    let result = result?;

    println!("{}", result.final_output());
    eprintln!(
        "\n[{} nodes, {} failed, ${:.4}, {}ms]",
        result.node_results.len(),
        result.failed_nodes(),
        result.usd_cost,
        result.elapsed_ms
    );
    for join in &result.unfired_joins {
        eprintln!(
            "[join {} never fired, missing: {}]",
            join.node_id,
            join.missing.join(", ")
        );
    }
    if result.invocation_limit_reached {
        eprintln!("[stopped at the node invocation limit]");
    }

    if let Some(rubric) = rubric {
        let fitness = runtime
            .evaluator()
            .evaluate(&EvaluationInput::from_run(&result, rubric), cancel)
            .await?;
        eprintln!(
            "[fitness {:.1} (accuracy {:.0}), total ${:.4}]\n{}",
            fitness.score, fitness.accuracy, fitness.total_cost_usd, fitness.feedback
        );
    }
    Ok(())
}

async fn evolve(
    runtime: &Runtime,
    prompt: String,
    rubric: String,
    seeds: Option<PathBuf>,
    output: Option<PathBuf>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let seed_path = seeds.or_else(|| runtime.config.gp.seed_file.as_ref().map(PathBuf::from));
    let seeds = match seed_path {
        Some(path) => load_seed_population(&path)?,
        None => Vec::new(),
    };

    let improver = runtime.improver();
    let printer = spawn_event_printer(&runtime.event_bus);
    let result = improver
        .evolve(&EvolutionTask::new(prompt, rubric), seeds, cancel)
        .await;
    printer.abort();
    let result = result?;

    eprintln!(
        "[{} generations, stopped by {:?}, ${:.4}]",
        result.generations_run, result.stopped_by, result.total_cost_usd
    );
    let Some(best) = result.best else {
        anyhow::bail!("no workflow was evaluated successfully");
    };
    eprintln!(
        "[best {} (generation {}, {}): fitness {:.1}]",
        best.wf_version_id,
        best.generation,
        best.origin.as_str(),
        best.score().unwrap_or(0.0)
    );

    let json = serde_json::to_string_pretty(&best.config)?;
    match output {
        Some(path) => {
            std::fs::write(&path, json)?;
            println!("{}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}
