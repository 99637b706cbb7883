//! What the agent sees after each step, and the append-only record of
//! a whole task attempt.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::actions::Action;

/// One actuator's view of the world. Exactly one data view is
/// authoritative per variant: command output for the shell, the
/// accessibility tree for the browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Observation {
    Bash { output: String },
    Browser {
        acc_tree: String,
        html: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        screenshot_b64: Option<String>,
    },
}

impl Observation {
    pub fn empty_bash() -> Self {
        Observation::Bash {
            output: String::new(),
        }
    }

    pub fn empty_browser() -> Self {
        Observation::Browser {
            acc_tree: String::new(),
            html: String::new(),
            screenshot_b64: None,
        }
    }

    /// The text shown to the agent in its prompt.
    pub fn text(&self) -> &str {
        match self {
            Observation::Bash { output } => output,
            Observation::Browser { acc_tree, .. } => acc_tree,
        }
    }

    /// Decoded image bytes of the page screenshot, when one was taken
    /// and the bridge sent valid base64.
    pub fn screenshot(&self) -> Option<Vec<u8>> {
        match self {
            Observation::Browser {
                screenshot_b64: Some(b64),
                ..
            } => STANDARD.decode(b64).ok(),
            _ => None,
        }
    }
}

/// Side-channel data attached to a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepInfo {
    /// Public URL of the current page, browser steps only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    /// Set when the action failed and the observation was carried over
    /// unchanged from the previous step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_error: Option<String>,
}

/// Product of every `reset` and `step` call.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvOutput {
    pub observation: Observation,
    pub reward: f64,
    pub done: bool,
    pub truncated: bool,
    pub info: StepInfo,
}

impl EnvOutput {
    pub fn running(observation: Observation) -> Self {
        EnvOutput {
            observation,
            reward: 0.0,
            done: false,
            truncated: false,
            info: StepInfo::default(),
        }
    }

    pub fn finished(observation: Observation) -> Self {
        EnvOutput {
            observation,
            reward: 0.0,
            done: true,
            truncated: false,
            info: StepInfo::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrajectoryStep {
    /// `None` only for the initial observation produced by reset.
    pub action: Option<Action>,
    pub output: EnvOutput,
}

/// Ordered, append-only record of one task attempt. The first step is
/// always the reset observation with no action.
#[derive(Debug, Clone)]
pub struct Trajectory {
    steps: Vec<TrajectoryStep>,
}

impl Trajectory {
    pub fn new(initial: EnvOutput) -> Self {
        Trajectory {
            steps: vec![TrajectoryStep {
                action: None,
                output: initial,
            }],
        }
    }

    pub fn push(&mut self, action: Action, output: EnvOutput) {
        self.steps.push(TrajectoryStep {
            action: Some(action),
            output,
        });
    }

    pub fn steps(&self) -> &[TrajectoryStep] {
        &self.steps
    }

    /// Number of agent-issued steps, the reset step excluded.
    pub fn action_count(&self) -> usize {
        self.steps.len().saturating_sub(1)
    }

    /// Agent-issued actions in order. The initial None never appears
    /// here, so loop detection cannot count it.
    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.steps.iter().filter_map(|s| s.action.as_ref())
    }

    pub fn last_action(&self) -> Option<&Action> {
        self.actions().last()
    }

    pub fn last_output(&self) -> &EnvOutput {
        // Construction guarantees at least the reset step.
        &self.steps[self.steps.len() - 1].output
    }

    /// Answer carried by the final stop action, if the attempt ended
    /// with one.
    pub fn final_answer(&self) -> Option<&str> {
        self.last_action().and_then(|a| a.stop_answer())
    }

    /// True when the most recent `n` actions are all mutually
    /// equivalent. Never true while fewer than `n` actions exist.
    pub fn last_actions_equivalent(&self, n: usize) -> bool {
        if n == 0 {
            return false;
        }
        let actions: Vec<&Action> = self.actions().collect();
        if actions.len() < n {
            return false;
        }
        let tail = &actions[actions.len() - n..];
        tail.windows(2).all(|pair| pair[0].is_equivalent(pair[1]))
    }
}
