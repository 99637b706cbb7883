//! Fan a task list out over worker threads. Each worker owns one
//! container session on its own network, brings up the union of
//! services its tasks need, then runs its tasks back to back. Results
//! stream back over a channel so a single thread owns the sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use anyhow::{anyhow, Result};
use chrono::Utc;
use tracing::{error, info, warn};

use webtask_core::{EarlyStopConfig, Service, TaskConfig};
use webtask_env::build_environment;
use webtask_session::{ContainerSession, SessionConfig};

use crate::evaluators::FuzzyJudge;
use crate::sink::{record_for_error, records_for_outcome, ResultSink, RunManifestRecord};
use crate::solver::Solver;
use crate::{run_task, TaskOutcome};

/// Builds a fresh solver per worker thread.
pub type SolverFactory = Arc<dyn Fn() -> Result<Box<dyn Solver>> + Send + Sync>;

pub struct BatchConfig {
    pub run_id: String,
    pub workers: usize,
    pub caps: EarlyStopConfig,
    /// Template for per-worker sessions. The network name gets a
    /// worker-index suffix so sessions never share resources.
    pub session: SessionConfig,
}

#[derive(Debug, Default, Clone)]
pub struct BatchSummary {
    pub total: usize,
    pub completed: usize,
    pub errored: usize,
    pub score_sum: f64,
    pub success_count: usize,
}

impl BatchSummary {
    pub fn mean_score(&self) -> f64 {
        if self.completed == 0 {
            0.0
        } else {
            self.score_sum / self.completed as f64
        }
    }
}

enum WorkerEvent {
    Finished {
        task: TaskConfig,
        result: Result<TaskOutcome>,
        started_at: String,
        finished_at: String,
    },
    ProvisioningFailed {
        worker: usize,
        error: String,
    },
}

fn union_of_services(tasks: &[TaskConfig]) -> Vec<Service> {
    let mut services: Vec<Service> = tasks.iter().flat_map(|t| t.required_services()).collect();
    services.sort();
    services.dedup();
    services
}

fn worker_loop(
    worker: usize,
    tasks: Vec<TaskConfig>,
    config: &BatchConfig,
    solver_factory: &SolverFactory,
    judge: &dyn FuzzyJudge,
    cancel: &AtomicBool,
    events: &mpsc::Sender<WorkerEvent>,
) {
    let session_config = SessionConfig {
        network: format!("{}_{}", config.session.network, worker),
        ..config.session.clone()
    };
    let session = Arc::new(ContainerSession::new(session_config));
    let services = union_of_services(&tasks);
    info!(worker, tasks = tasks.len(), "worker provisioning");
    if let Err(e) = session.enter(&services) {
        let _ = events.send(WorkerEvent::ProvisioningFailed {
            worker,
            error: format!("{e:#}"),
        });
        return;
    }
    for task in tasks {
        if cancel.load(Ordering::SeqCst) {
            warn!(worker, task_id = task.task_id(), "cancelled, skipping");
            continue;
        }
        let started_at = Utc::now().to_rfc3339();
        let result = solver_factory().and_then(|mut solver| {
            let mut env = build_environment(Arc::clone(&session), &task);
            run_task(env.as_mut(), solver.as_mut(), &task, &config.caps, judge)
        });
        let finished_at = Utc::now().to_rfc3339();
        let _ = events.send(WorkerEvent::Finished {
            task,
            result,
            started_at,
            finished_at,
        });
    }
    session.close();
}

/// Run every task and write rows to the sink as workers finish them.
/// A worker that fails to provision cancels the remaining tasks and
/// fails the batch; task-level errors only mark their own row.
pub fn run_batch(
    tasks: Vec<TaskConfig>,
    config: BatchConfig,
    solver_factory: SolverFactory,
    judge: Arc<dyn FuzzyJudge>,
    sink: &mut dyn ResultSink,
    cancel: Arc<AtomicBool>,
) -> Result<BatchSummary> {
    if config.workers == 0 {
        return Err(anyhow!("batch requires at least one worker"));
    }
    let mut summary = BatchSummary {
        total: tasks.len(),
        ..BatchSummary::default()
    };
    sink.write_run_manifest(&RunManifestRecord {
        schema_version: "run_manifest_v1".to_string(),
        run_id: config.run_id.clone(),
        created_at: Utc::now().to_rfc3339(),
        task_ids: tasks.iter().map(|t| t.task_id()).collect(),
        workers: config.workers,
    })?;

    let mut chunks: Vec<Vec<TaskConfig>> = (0..config.workers).map(|_| Vec::new()).collect();
    for (idx, task) in tasks.into_iter().enumerate() {
        chunks[idx % config.workers].push(task);
    }

    let config = Arc::new(config);
    let (tx, rx) = mpsc::channel();
    let mut handles = Vec::new();
    for (worker, chunk) in chunks.into_iter().enumerate() {
        if chunk.is_empty() {
            continue;
        }
        let config = Arc::clone(&config);
        let solver_factory = Arc::clone(&solver_factory);
        let judge = Arc::clone(&judge);
        let cancel = Arc::clone(&cancel);
        let tx = tx.clone();
        handles.push(thread::spawn(move || {
            worker_loop(
                worker,
                chunk,
                &config,
                &solver_factory,
                judge.as_ref(),
                &cancel,
                &tx,
            );
        }));
    }
    drop(tx);

    let mut provisioning_error: Option<String> = None;
    for event in rx {
        match event {
            WorkerEvent::Finished {
                task,
                result,
                started_at,
                finished_at,
            } => match result {
                Ok(outcome) => {
                    summary.completed += 1;
                    summary.score_sum += outcome.score;
                    if outcome.score >= 1.0 {
                        summary.success_count += 1;
                    }
                    let (row, steps) = records_for_outcome(
                        &config.run_id,
                        &task,
                        &outcome,
                        &started_at,
                        &finished_at,
                    );
                    sink.append_result(&row)?;
                    sink.append_step_rows(&steps)?;
                }
                Err(e) => {
                    summary.errored += 1;
                    error!(task_id = task.task_id(), error = %format!("{e:#}"), "task failed");
                    let row =
                        record_for_error(&config.run_id, &task, &e, &started_at, &finished_at);
                    sink.append_result(&row)?;
                }
            },
            WorkerEvent::ProvisioningFailed { worker, error } => {
                error!(worker, error = %error, "worker failed to provision, cancelling batch");
                cancel.store(true, Ordering::SeqCst);
                provisioning_error.get_or_insert(error);
            }
        }
        sink.flush()?;
    }
    for handle in handles {
        // A panicking worker already lost its session; surface it.
        if handle.join().is_err() {
            return Err(anyhow!("a worker thread panicked"));
        }
    }
    if let Some(error) = provisioning_error {
        return Err(anyhow!("worker provisioning failed: {error}"));
    }
    info!(
        completed = summary.completed,
        errored = summary.errored,
        mean_score = summary.mean_score(),
        "batch finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{ResultRecord, StepRecord};
    use crate::solver::ScriptedSolver;

    #[derive(Default)]
    struct MemorySink {
        results: Vec<ResultRecord>,
        steps: Vec<StepRecord>,
    }

    impl ResultSink for MemorySink {
        fn write_run_manifest(&mut self, _run: &RunManifestRecord) -> Result<()> {
            Ok(())
        }
        fn append_result(&mut self, row: &ResultRecord) -> Result<()> {
            self.results.push(row.clone());
            Ok(())
        }
        fn append_step_rows(&mut self, rows: &[StepRecord]) -> Result<()> {
            self.steps.extend_from_slice(rows);
            Ok(())
        }
        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn bash_task(task_id: u64) -> TaskConfig {
        serde_json::from_value(serde_json::json!({
            "env_type": "bash",
            "task_id": task_id,
            "intent": "say the word",
            "eval": {
                "eval_types": ["string_match"],
                "reference_answers": {"exact_match": "hello"}
            }
        }))
        .expect("config should deserialize")
    }

    #[test]
    fn tasks_are_dealt_round_robin() {
        let tasks: Vec<TaskConfig> = (0..5).map(bash_task).collect();
        let mut chunks: Vec<Vec<TaskConfig>> = (0..2).map(|_| Vec::new()).collect();
        for (idx, task) in tasks.into_iter().enumerate() {
            chunks[idx % 2].push(task);
        }
        assert_eq!(chunks[0].len(), 3);
        assert_eq!(chunks[1].len(), 2);
        assert_eq!(chunks[1][0].task_id(), 1);
    }

    #[test]
    fn union_of_services_dedups_across_tasks() {
        let tasks = vec![bash_task(1), bash_task(2)];
        let services = union_of_services(&tasks);
        assert_eq!(services.iter().filter(|s| **s == Service::Bash).count(), 1);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let config = BatchConfig {
            run_id: "r".to_string(),
            workers: 0,
            caps: EarlyStopConfig::default(),
            session: SessionConfig::default(),
        };
        let factory: SolverFactory =
            Arc::new(|| Ok(Box::new(ScriptedSolver::new(Vec::<String>::new())) as Box<dyn Solver>));
        let mut sink = MemorySink::default();
        let err = run_batch(
            Vec::new(),
            config,
            factory,
            Arc::new(crate::ContainmentJudge),
            &mut sink,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap_err();
        assert!(err.to_string().contains("at least one worker"));
    }

    #[test]
    fn mean_score_handles_empty_batches() {
        let summary = BatchSummary::default();
        assert_eq!(summary.mean_score(), 0.0);
        let summary = BatchSummary {
            completed: 2,
            score_sum: 1.0,
            ..BatchSummary::default()
        };
        assert!((summary.mean_score() - 0.5).abs() < 1e-9);
    }
}
