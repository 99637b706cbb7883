//! The control loop over one task attempt: prompt the solver, parse its
//! output, execute, and decide when the episode ends. Batch scheduling
//! across worker threads lives in [`batch`]; scoring in [`evaluators`].

use anyhow::Result;
use tracing::{debug, info};

use webtask_core::{EarlyStopConfig, TaskConfig};
use webtask_env::observation::StepInfo;
use webtask_env::{Action, EnvOutput, Environment, Trajectory};

pub mod batch;
pub mod evaluators;
pub mod sink;
pub mod solver;

pub use evaluators::{ContainmentJudge, EvaluatorSet, FuzzyJudge};
pub use solver::{CommandSolver, Exchange, ScriptedSolver, Solver, SolverPrompt};

/// Why a trajectory ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The agent issued a stop action.
    AgentStop,
    /// The environment reported done without an agent stop.
    EnvironmentDone,
    MaxSteps,
    /// The last N actions were all equivalent.
    RepeatingAction,
    /// The last N responses all failed to parse.
    ParsingFailures,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::AgentStop => "agent_stop",
            StopReason::EnvironmentDone => "environment_done",
            StopReason::MaxSteps => "max_steps",
            StopReason::RepeatingAction => "repeating_action",
            StopReason::ParsingFailures => "parsing_failures",
        }
    }
}

#[derive(Debug)]
pub struct TaskOutcome {
    pub task_id: u64,
    pub stop_reason: StopReason,
    pub score: f64,
    pub trajectory: Trajectory,
}

/// Earlier turns as (observation seen, action taken) pairs, oldest
/// first. The current observation is not included.
fn conversation_history(trajectory: &Trajectory) -> Vec<Exchange> {
    let steps = trajectory.steps();
    steps
        .windows(2)
        .filter_map(|pair| {
            let action = pair[1].action.as_ref()?;
            Some(Exchange {
                observation: pair[0].output.observation.text().to_string(),
                action: action.to_string(),
            })
        })
        .collect()
}

/// Run the trajectory loop to its stop condition. The environment stays
/// open afterwards so evaluation can still inspect it.
pub fn run_trajectory(
    env: &mut dyn Environment,
    solver: &mut dyn Solver,
    caps: &EarlyStopConfig,
) -> Result<(Trajectory, StopReason)> {
    let initial = env.reset()?;
    let mut trajectory = Trajectory::new(initial);
    let mut consecutive_parse_failures = 0usize;

    let stop_reason = loop {
        if trajectory.action_count() >= caps.max_steps {
            break StopReason::MaxSteps;
        }

        let raw = {
            let last = trajectory.last_output();
            let prompt = SolverPrompt {
                goal: env.goal(),
                observation: last.observation.text(),
                url: last.info.page_url.as_deref(),
                previous_action: trajectory.last_action().map(|a| a.to_string()),
                history: conversation_history(&trajectory),
                step: trajectory.action_count(),
            };
            solver.propose(&prompt)?
        };

        match env.parse_action(&raw) {
            Ok(action) => {
                consecutive_parse_failures = 0;
                let is_stop = action.is_stop();
                debug!(action = %action, "executing");
                let output = env.step(&action)?;
                let done = output.done;
                trajectory.push(action, output);
                if is_stop {
                    break StopReason::AgentStop;
                }
                if done {
                    break StopReason::EnvironmentDone;
                }
                if trajectory.last_actions_equivalent(caps.repeating_action) {
                    break StopReason::RepeatingAction;
                }
            }
            Err(parse_error) => {
                // The pseudo-action is recorded but never executed; the
                // hint rides back to the agent on the unchanged
                // observation.
                consecutive_parse_failures += 1;
                debug!(error = %parse_error, "unparseable response");
                let last = trajectory.last_output();
                let output = EnvOutput {
                    observation: last.observation.clone(),
                    reward: 0.0,
                    done: false,
                    truncated: false,
                    info: StepInfo {
                        page_url: last.info.page_url.clone(),
                        fail_error: Some(parse_error.to_string()),
                    },
                };
                trajectory.push(Action::parsing_failure(&raw, &parse_error), output);
                if consecutive_parse_failures >= caps.parsing_failure {
                    break StopReason::ParsingFailures;
                }
            }
        }
    };

    Ok((trajectory, stop_reason))
}

/// One complete task attempt: trajectory, then scoring, then close.
/// Only provisioning errors escape; a scoring failure closes the
/// environment before propagating.
pub fn run_task(
    env: &mut dyn Environment,
    solver: &mut dyn Solver,
    config: &TaskConfig,
    caps: &EarlyStopConfig,
    judge: &dyn FuzzyJudge,
) -> Result<TaskOutcome> {
    let evaluator_set = EvaluatorSet::for_task(config)?;
    let result = match run_trajectory(env, solver, caps) {
        Ok((trajectory, stop_reason)) => evaluator_set
            .score(&trajectory, env, config, judge)
            .map(|score| (trajectory, stop_reason, score)),
        Err(err) => Err(err),
    };
    let close_result = env.close();
    let (trajectory, stop_reason, score) = result?;
    close_result?;
    info!(
        task_id = config.task_id(),
        stop_reason = stop_reason.as_str(),
        score,
        steps = trajectory.action_count(),
        "task finished"
    );
    Ok(TaskOutcome {
        task_id: config.task_id(),
        stop_reason,
        score,
        trajectory,
    })
}
