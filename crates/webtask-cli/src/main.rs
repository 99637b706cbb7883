use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use webtask_core::{EarlyStopConfig, Service, TaskConfig, DEFAULT_NETWORK};
use webtask_runner::batch::{run_batch, BatchConfig, SolverFactory};
use webtask_runner::sink::JsonlResultSink;
use webtask_runner::{CommandSolver, ContainmentJudge, Solver};
use webtask_session::{ImagePolicy, SessionConfig};

#[derive(Parser)]
#[command(name = "webtask", version, about = "Containerized web task evaluation harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a batch of tasks and write results as JSONL
    Run {
        /// Task config file or a directory of them
        tasks: PathBuf,
        /// Command invoked once per step; the prompt arrives on stdin
        #[arg(long, num_args = 1.., value_delimiter = ' ', required = true)]
        solver_cmd: Vec<String>,
        #[arg(long, default_value_t = 1)]
        workers: usize,
        /// Directory run output lands under
        #[arg(long, default_value = "runs")]
        output: PathBuf,
        #[arg(long)]
        run_id: Option<String>,
        /// Base name for per-worker networks
        #[arg(long, default_value = DEFAULT_NETWORK)]
        network: String,
        /// Never pull or download images; local and cached only
        #[arg(long)]
        offline: bool,
        /// Publish service ports on the host for debugging
        #[arg(long)]
        publish_ports: bool,
        #[arg(long)]
        max_steps: Option<usize>,
    },
    /// List the service catalog
    Services,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            tasks,
            solver_cmd,
            workers,
            output,
            run_id,
            network,
            offline,
            publish_ports,
            max_steps,
        } => run_command(
            &tasks,
            solver_cmd,
            workers,
            &output,
            run_id,
            network,
            offline,
            publish_ports,
            max_steps,
        ),
        Commands::Services => {
            for service in Service::ALL {
                match service.internal_port() {
                    Some(port) => println!(
                        "{:<16} image={} port={} url={}",
                        service.name(),
                        service.image(),
                        port,
                        service.public_url().unwrap_or_default()
                    ),
                    None => println!("{:<16} image={}", service.name(), service.image()),
                }
            }
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_command(
    tasks_path: &Path,
    solver_cmd: Vec<String>,
    workers: usize,
    output: &Path,
    run_id: Option<String>,
    network: String,
    offline: bool,
    publish_ports: bool,
    max_steps: Option<usize>,
) -> Result<()> {
    let tasks = load_tasks(tasks_path)?;
    if tasks.is_empty() {
        return Err(anyhow!("no tasks found under {}", tasks_path.display()));
    }
    // Validate the solver command shape up front, before containers start.
    CommandSolver::new(solver_cmd.clone())?;

    let run_id = run_id.unwrap_or_else(|| format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S")));
    let run_dir = output.join(&run_id);
    let mut sink = JsonlResultSink::new(&run_dir)
        .with_context(|| format!("opening run directory {}", run_dir.display()))?;

    let mut caps = EarlyStopConfig::default();
    if let Some(steps) = max_steps {
        caps.max_steps = steps;
    }
    let config = BatchConfig {
        run_id: run_id.clone(),
        workers,
        caps,
        session: SessionConfig {
            network,
            image_policy: if offline {
                ImagePolicy::offline()
            } else {
                ImagePolicy::default()
            },
            publish_ports,
            ..SessionConfig::default()
        },
    };

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        ctrlc::set_handler(move || {
            warn!("interrupt received, finishing in-flight tasks");
            cancel.store(true, std::sync::atomic::Ordering::SeqCst);
        })
        .context("installing interrupt handler")?;
    }

    let factory: SolverFactory = Arc::new(move || {
        Ok(Box::new(CommandSolver::new(solver_cmd.clone())?) as Box<dyn Solver>)
    });
    let summary = run_batch(
        tasks,
        config,
        factory,
        Arc::new(ContainmentJudge),
        &mut sink,
        cancel,
    )?;

    println!("run_id: {run_id}");
    println!("run_dir: {}", run_dir.display());
    println!(
        "tasks: {} completed: {} errored: {}",
        summary.total, summary.completed, summary.errored
    );
    println!(
        "success_rate: {:.3} mean_score: {:.3}",
        if summary.completed == 0 {
            0.0
        } else {
            summary.success_count as f64 / summary.completed as f64
        },
        summary.mean_score()
    );
    Ok(())
}

/// Read task configs from one file or every `.json`/`.jsonl` file in a
/// directory. A `.json` file may hold a single config or an array; a
/// `.jsonl` file holds one config per line.
fn load_tasks(path: &Path) -> Result<Vec<TaskConfig>> {
    let mut files = Vec::new();
    if path.is_dir() {
        for entry in fs::read_dir(path)
            .with_context(|| format!("reading task directory {}", path.display()))?
        {
            let entry = entry?;
            let p = entry.path();
            if p.extension().is_some_and(|e| e == "json" || e == "jsonl") {
                files.push(p);
            }
        }
        files.sort();
    } else {
        files.push(path.to_path_buf());
    }
    let mut tasks = Vec::new();
    for file in files {
        let text = fs::read_to_string(&file)
            .with_context(|| format!("reading task file {}", file.display()))?;
        if file.extension().is_some_and(|e| e == "jsonl") {
            for (lineno, line) in text.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                tasks.push(serde_json::from_str(line).with_context(|| {
                    format!("invalid task at {}:{}", file.display(), lineno + 1)
                })?);
            }
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", file.display()))?;
        match value {
            serde_json::Value::Array(items) => {
                for item in items {
                    tasks.push(
                        serde_json::from_value(item)
                            .with_context(|| format!("invalid task in {}", file.display()))?,
                    );
                }
            }
            other => tasks.push(
                serde_json::from_value(other)
                    .with_context(|| format!("invalid task in {}", file.display()))?,
            ),
        }
    }
    Ok(tasks)
}
