//! Shell actuator. Commands run inside the session's bash container,
//! one `docker exec` per step, with working directory and exported
//! variables threaded through two marker files so that `cd` and
//! `export` appear to persist.
//!
//! This is an emulation with known holes: background jobs, subshells,
//! and signal state do not survive between steps. Each step is its own
//! process; only the two marker files carry state forward.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use webtask_core::{BashTaskConfig, Service};
use webtask_session::ContainerSession;

use crate::actions::{parse_bash_action, Action, ActionKind, ActionParseError};
use crate::observation::{EnvOutput, Observation, StepInfo};
use crate::Environment;

const WORKDIR_MARKER: &str = "~/.current_dir";
const ENV_MARKER: &str = "~/.current_env_variables";

/// Wrap a user command so shell state flows through the marker files.
/// The user command's stdout and stderr are merged; the bookkeeping
/// commands after it write nothing to stdout.
pub(crate) fn wrap_command(command: &str) -> String {
    format!(
        "cd \"$(cat {workdir})\" > /dev/null 2>&1; \
         source {env} 2> /dev/null && {command} 2>&1; \
         pwd > {workdir}; declare -p > {env}",
        workdir = WORKDIR_MARKER,
        env = ENV_MARKER,
    )
}

fn init_markers_command() -> String {
    format!("echo \"$HOME\" > {WORKDIR_MARKER}; : > {ENV_MARKER}")
}

pub struct BashEnv {
    session: Arc<ContainerSession>,
    config: BashTaskConfig,
    last_observation: Observation,
}

impl BashEnv {
    pub fn new(session: Arc<ContainerSession>, config: BashTaskConfig) -> Self {
        BashEnv {
            session,
            config,
            last_observation: Observation::empty_bash(),
        }
    }

    /// Run one command with state threading and return its merged
    /// output.
    pub fn run_command(&self, command: &str) -> Result<String> {
        let wrapped = wrap_command(command);
        let out = self
            .session
            .exec(Service::Bash, &["bash", "-c", &wrapped])
            .with_context(|| format!("executing shell command '{command}'"))?;
        Ok(out.stdout)
    }

    fn init_markers(&self) -> Result<()> {
        let cmd = init_markers_command();
        self.session
            .exec(Service::Bash, &["bash", "-c", &cmd])
            .context("initializing shell state markers")?;
        Ok(())
    }

    /// Setup commands may need the internet (package installs, data
    /// downloads); the container gets outbound access for their
    /// duration only.
    fn run_setup_commands(&self) -> Result<()> {
        if self.config.setup_commands.is_empty() {
            return Ok(());
        }
        self.session.enable_outbound(Service::Bash)?;
        let result = (|| -> Result<()> {
            for command in &self.config.setup_commands {
                debug!(command, "running setup command");
                self.run_command(command)?;
            }
            Ok(())
        })();
        if let Err(e) = self.session.disable_outbound(Service::Bash) {
            warn!(error = %e, "failed to revoke outbound access after setup");
        }
        result
    }
}

impl Environment for BashEnv {
    fn reset(&mut self) -> Result<EnvOutput> {
        if self.config.require_reset {
            self.session.reset_service(Service::Bash)?;
        }
        self.init_markers()?;
        self.run_setup_commands()?;
        self.last_observation = Observation::empty_bash();
        Ok(EnvOutput::running(self.last_observation.clone()))
    }

    fn step(&mut self, action: &Action) -> Result<EnvOutput> {
        match &action.kind {
            ActionKind::Stop { .. } => {
                // Terminal: nothing runs in the container.
                Ok(EnvOutput::finished(self.last_observation.clone()))
            }
            ActionKind::Command { command } => match self.run_command(command) {
                Ok(output) => {
                    self.last_observation = Observation::Bash { output };
                    Ok(EnvOutput::running(self.last_observation.clone()))
                }
                Err(e) => Ok(EnvOutput {
                    observation: self.last_observation.clone(),
                    reward: 0.0,
                    done: false,
                    truncated: false,
                    info: StepInfo {
                        page_url: None,
                        fail_error: Some(e.to_string()),
                    },
                }),
            },
            other => Ok(EnvOutput {
                observation: self.last_observation.clone(),
                reward: 0.0,
                done: false,
                truncated: false,
                info: StepInfo {
                    page_url: None,
                    fail_error: Some(format!(
                        "a shell task cannot execute this action: {other:?}"
                    )),
                },
            }),
        }
    }

    fn close(&mut self) -> Result<()> {
        // Containers belong to the session; nothing to release here.
        Ok(())
    }

    fn parse_action(&self, raw: &str) -> Result<Action, ActionParseError> {
        Ok(parse_bash_action(raw))
    }

    fn goal(&self) -> &str {
        &self.config.goal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_command_threads_state_through_markers() {
        let wrapped = wrap_command("export FOO=1 && echo done");
        assert!(wrapped.starts_with("cd \"$(cat ~/.current_dir)\""));
        assert!(wrapped.contains("source ~/.current_env_variables"));
        assert!(wrapped.contains("export FOO=1 && echo done 2>&1"));
        assert!(wrapped.ends_with("declare -p > ~/.current_env_variables"));
    }

    #[test]
    fn wrapped_command_merges_stderr_into_stdout() {
        let wrapped = wrap_command("ls /nonexistent");
        assert!(wrapped.contains("ls /nonexistent 2>&1"));
    }

    #[test]
    fn marker_init_empties_both_files() {
        let cmd = init_markers_command();
        assert!(cmd.contains("> ~/.current_dir"));
        assert!(cmd.contains(": > ~/.current_env_variables"));
    }
}
