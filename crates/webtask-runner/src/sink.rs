use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::{StopReason, TaskOutcome};
use webtask_core::TaskConfig;

const RESULTS_FILE: &str = "results.jsonl";
const STEPS_FILE: &str = "steps.jsonl";
const RUN_MANIFEST_FILE: &str = "run_manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifestRecord {
    pub schema_version: String,
    pub run_id: String,
    pub created_at: String,
    pub task_ids: Vec<u64>,
    pub workers: usize,
}

/// One row per task attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub run_id: String,
    pub task_id: u64,
    pub env_type: String,
    pub goal: String,
    pub score: f64,
    pub success: bool,
    pub stop_reason: String,
    pub steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: String,
    pub finished_at: String,
}

/// One row per agent-issued step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub run_id: String,
    pub task_id: u64,
    pub step: usize,
    pub raw_prediction: String,
    pub action: String,
    pub observation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_error: Option<String>,
}

pub trait ResultSink: Send {
    fn write_run_manifest(&mut self, run: &RunManifestRecord) -> Result<()>;
    fn append_result(&mut self, row: &ResultRecord) -> Result<()>;
    fn append_step_rows(&mut self, rows: &[StepRecord]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

pub struct JsonlResultSink {
    run_manifest_path: PathBuf,
    results_writer: BufWriter<File>,
    steps_writer: BufWriter<File>,
}

impl JsonlResultSink {
    pub fn new(run_dir: &Path) -> Result<Self> {
        fs::create_dir_all(run_dir)?;
        Ok(Self {
            run_manifest_path: run_dir.join(RUN_MANIFEST_FILE),
            results_writer: open_append(run_dir.join(RESULTS_FILE))?,
            steps_writer: open_append(run_dir.join(STEPS_FILE))?,
        })
    }
}

impl ResultSink for JsonlResultSink {
    fn write_run_manifest(&mut self, run: &RunManifestRecord) -> Result<()> {
        fs::write(&self.run_manifest_path, serde_json::to_vec_pretty(run)?)?;
        Ok(())
    }

    fn append_result(&mut self, row: &ResultRecord) -> Result<()> {
        append_row(&mut self.results_writer, row)
    }

    fn append_step_rows(&mut self, rows: &[StepRecord]) -> Result<()> {
        for row in rows {
            append_row(&mut self.steps_writer, row)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.results_writer.flush()?;
        self.steps_writer.flush()?;
        Ok(())
    }
}

fn open_append(path: PathBuf) -> Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

fn append_row<T: Serialize>(writer: &mut BufWriter<File>, row: &T) -> Result<()> {
    serde_json::to_writer(&mut *writer, row)?;
    writer.write_all(b"\n")?;
    Ok(())
}

fn env_type_name(config: &TaskConfig) -> &'static str {
    match config {
        TaskConfig::Bash(_) => "bash",
        TaskConfig::Browser(_) => "browser",
        TaskConfig::BashBrowser(_) => "bash_browser",
    }
}

/// Flatten a finished task into its result row plus one row per step.
pub fn records_for_outcome(
    run_id: &str,
    config: &TaskConfig,
    outcome: &TaskOutcome,
    started_at: &str,
    finished_at: &str,
) -> (ResultRecord, Vec<StepRecord>) {
    let result = ResultRecord {
        run_id: run_id.to_string(),
        task_id: outcome.task_id,
        env_type: env_type_name(config).to_string(),
        goal: config.goal().to_string(),
        score: outcome.score,
        success: outcome.score >= 1.0,
        stop_reason: outcome.stop_reason.as_str().to_string(),
        steps: outcome.trajectory.action_count(),
        final_answer: outcome.trajectory.final_answer().map(str::to_string),
        error: None,
        started_at: started_at.to_string(),
        finished_at: finished_at.to_string(),
    };
    let steps = outcome
        .trajectory
        .steps()
        .iter()
        .enumerate()
        .filter_map(|(idx, step)| {
            let action = step.action.as_ref()?;
            Some(StepRecord {
                run_id: run_id.to_string(),
                task_id: outcome.task_id,
                step: idx,
                raw_prediction: action.raw_prediction.clone(),
                action: action.to_string(),
                observation: step.output.observation.text().to_string(),
                page_url: step.output.info.page_url.clone(),
                fail_error: step.output.info.fail_error.clone(),
            })
        })
        .collect();
    (result, steps)
}

/// Row for a task that errored before producing an outcome.
pub fn record_for_error(
    run_id: &str,
    config: &TaskConfig,
    error: &anyhow::Error,
    started_at: &str,
    finished_at: &str,
) -> ResultRecord {
    ResultRecord {
        run_id: run_id.to_string(),
        task_id: config.task_id(),
        env_type: env_type_name(config).to_string(),
        goal: config.goal().to_string(),
        score: 0.0,
        success: false,
        stop_reason: "error".to_string(),
        steps: 0,
        final_answer: None,
        error: Some(format!("{error:#}")),
        started_at: started_at.to_string(),
        finished_at: finished_at.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};
    use webtask_env::actions::parse_browser_action;
    use webtask_env::{EnvOutput, Observation, Trajectory};

    fn temp_root(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        std::env::temp_dir().join(format!("webtask_sink_{}_{}", label, nanos))
    }

    fn bash_config() -> TaskConfig {
        serde_json::from_value(serde_json::json!({
            "env_type": "bash",
            "task_id": 5,
            "intent": "count files",
            "eval": {
                "eval_types": ["string_match"],
                "reference_answers": {"exact_match": "3"}
            }
        }))
        .expect("config should deserialize")
    }

    #[test]
    fn jsonl_sink_appends_rows() {
        let run_dir = temp_root("append");
        let mut sink = JsonlResultSink::new(&run_dir).expect("sink should initialize");
        sink.write_run_manifest(&RunManifestRecord {
            schema_version: "run_manifest_v1".to_string(),
            run_id: "run_1".to_string(),
            created_at: "2026-03-01T00:00:00Z".to_string(),
            task_ids: vec![5],
            workers: 1,
        })
        .expect("manifest should write");

        let mut trajectory = Trajectory::new(EnvOutput::running(Observation::empty_bash()));
        trajectory.push(
            parse_browser_action("stop [3]", false).expect("stop should parse"),
            EnvOutput::finished(Observation::empty_bash()),
        );
        let outcome = TaskOutcome {
            task_id: 5,
            stop_reason: StopReason::AgentStop,
            score: 1.0,
            trajectory,
        };
        let (result, steps) = records_for_outcome(
            "run_1",
            &bash_config(),
            &outcome,
            "2026-03-01T00:00:00Z",
            "2026-03-01T00:00:09Z",
        );
        sink.append_result(&result).expect("result row should append");
        sink.append_step_rows(&steps).expect("step rows should append");
        sink.flush().expect("flush should succeed");

        assert!(run_dir.join("run_manifest.json").exists());
        let results = fs::read_to_string(run_dir.join(RESULTS_FILE))
            .expect("results file should exist");
        assert_eq!(results.lines().count(), 1);
        assert!(results.contains("\"stop_reason\":\"agent_stop\""));
        let step_rows = fs::read_to_string(run_dir.join(STEPS_FILE))
            .expect("steps file should exist");
        assert_eq!(step_rows.lines().count(), 1);
        assert!(step_rows.contains("stop [3]"));
        let _ = fs::remove_dir_all(run_dir);
    }

    #[test]
    fn result_rows_flatten_outcome_fields() {
        let mut trajectory = Trajectory::new(EnvOutput::running(Observation::empty_bash()));
        trajectory.push(
            parse_browser_action("stop [3]", false).expect("stop should parse"),
            EnvOutput::finished(Observation::empty_bash()),
        );
        let outcome = TaskOutcome {
            task_id: 5,
            stop_reason: StopReason::AgentStop,
            score: 1.0,
            trajectory,
        };
        let (result, steps) =
            records_for_outcome("r", &bash_config(), &outcome, "t0", "t1");
        assert!(result.success);
        assert_eq!(result.steps, 1);
        assert_eq!(result.final_answer.as_deref(), Some("3"));
        assert_eq!(result.env_type, "bash");
        // The reset step produces no row.
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].step, 1);
    }

    #[test]
    fn error_row_carries_the_chain() {
        use anyhow::Context;
        let err = Err::<(), _>(anyhow::anyhow!("no such image"))
            .context("starting services")
            .unwrap_err();
        let row = record_for_error("r", &bash_config(), &err, "t0", "t1");
        assert_eq!(row.stop_reason, "error");
        assert!(!row.success);
        let text = row.error.expect("error text should be set");
        assert!(text.contains("starting services"));
        assert!(text.contains("no such image"));
    }
}
