//! The agent boundary. A solver sees one rendered prompt per step and
//! answers with a raw action line; everything about how it produces
//! that line (model calls, heuristics, a human at a keyboard) is its
//! own business.

use std::collections::VecDeque;
use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{anyhow, Context, Result};

/// One earlier turn: what the agent saw and what it did about it.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub observation: String,
    pub action: String,
}

/// Everything the agent gets to see for one step.
#[derive(Debug, Clone)]
pub struct SolverPrompt<'a> {
    pub goal: &'a str,
    pub observation: &'a str,
    /// Browser tasks only.
    pub url: Option<&'a str>,
    pub previous_action: Option<String>,
    /// Earlier turns, oldest first.
    pub history: Vec<Exchange>,
    pub step: usize,
}

impl SolverPrompt<'_> {
    /// Render the prompt in the fixed OBJECTIVE / OBSERVATION layout
    /// agents are instructed against.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("OBJECTIVE: ");
        out.push_str(self.goal);
        out.push('\n');
        for exchange in &self.history {
            out.push_str("OBSERVATION:\n");
            out.push_str(&exchange.observation);
            out.push('\n');
            out.push_str("ACTION: ");
            out.push_str(&exchange.action);
            out.push('\n');
        }
        if let Some(url) = self.url {
            out.push_str("URL: ");
            out.push_str(url);
            out.push('\n');
        }
        out.push_str("OBSERVATION:\n");
        out.push_str(self.observation);
        out.push('\n');
        match &self.previous_action {
            Some(action) => {
                out.push_str("PREVIOUS ACTION: ");
                out.push_str(action);
            }
            None => out.push_str("PREVIOUS ACTION: None"),
        }
        out.push('\n');
        out
    }
}

pub trait Solver: Send {
    /// Produce the raw action text for one step.
    fn propose(&mut self, prompt: &SolverPrompt<'_>) -> Result<String>;
}

/// Runs an external command per step: the rendered prompt goes to its
/// stdin, its stdout is the action. Lets any executable act as the
/// agent without this crate knowing about model APIs.
pub struct CommandSolver {
    command: Vec<String>,
}

impl CommandSolver {
    pub fn new(command: Vec<String>) -> Result<Self> {
        if command.is_empty() {
            return Err(anyhow!("solver command must not be empty"));
        }
        Ok(CommandSolver { command })
    }
}

impl Solver for CommandSolver {
    fn propose(&mut self, prompt: &SolverPrompt<'_>) -> Result<String> {
        let mut child = Command::new(&self.command[0])
            .args(&self.command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("spawning solver '{}'", self.command[0]))?;
        if let Some(stdin) = child.stdin.as_mut() {
            stdin
                .write_all(prompt.render().as_bytes())
                .context("writing prompt to solver stdin")?;
        }
        let output = child.wait_with_output().context("waiting for solver")?;
        if !output.status.success() {
            return Err(anyhow!(
                "solver '{}' exited with {}",
                self.command[0],
                output.status
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Replays a fixed list of responses. For tests and dry runs.
pub struct ScriptedSolver {
    responses: VecDeque<String>,
}

impl ScriptedSolver {
    pub fn new(responses: impl IntoIterator<Item = impl Into<String>>) -> Self {
        ScriptedSolver {
            responses: responses.into_iter().map(Into::into).collect(),
        }
    }
}

impl Solver for ScriptedSolver {
    fn propose(&mut self, _prompt: &SolverPrompt<'_>) -> Result<String> {
        self.responses
            .pop_front()
            .ok_or_else(|| anyhow!("scripted solver ran out of responses"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_renders_all_sections() {
        let prompt = SolverPrompt {
            goal: "Buy a red stapler",
            observation: "[1] RootWebArea 'Store'",
            url: Some("http://onestopmarket.com"),
            previous_action: Some("click [3]".to_string()),
            history: Vec::new(),
            step: 2,
        };
        let text = prompt.render();
        assert!(text.starts_with("OBJECTIVE: Buy a red stapler\n"));
        assert!(text.contains("URL: http://onestopmarket.com\n"));
        assert!(text.contains("OBSERVATION:\n[1] RootWebArea 'Store'\n"));
        assert!(text.contains("PREVIOUS ACTION: click [3]"));
    }

    #[test]
    fn history_renders_before_the_current_observation() {
        let prompt = SolverPrompt {
            goal: "g",
            observation: "now",
            url: None,
            previous_action: Some("scroll [down]".to_string()),
            history: vec![Exchange {
                observation: "then".to_string(),
                action: "scroll [down]".to_string(),
            }],
            step: 1,
        };
        let text = prompt.render();
        let then = text.find("OBSERVATION:\nthen").expect("history observation");
        let now = text.find("OBSERVATION:\nnow").expect("current observation");
        assert!(then < now);
        assert!(text.contains("ACTION: scroll [down]\n"));
    }

    #[test]
    fn first_step_shows_no_previous_action() {
        let prompt = SolverPrompt {
            goal: "g",
            observation: "",
            url: None,
            previous_action: None,
            history: Vec::new(),
            step: 0,
        };
        assert!(prompt.render().contains("PREVIOUS ACTION: None"));
        assert!(!prompt.render().contains("URL:"));
    }

    #[test]
    fn scripted_solver_replays_then_errors() {
        let mut solver = ScriptedSolver::new(["scroll [down]", "stop"]);
        let prompt = SolverPrompt {
            goal: "g",
            observation: "",
            url: None,
            previous_action: None,
            history: Vec::new(),
            step: 0,
        };
        assert_eq!(solver.propose(&prompt).unwrap(), "scroll [down]");
        assert_eq!(solver.propose(&prompt).unwrap(), "stop");
        assert!(solver.propose(&prompt).is_err());
    }
}
