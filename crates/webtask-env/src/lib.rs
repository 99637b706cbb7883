//! Actuators and the uniform environment interface over them: a shell
//! container, a remote-controlled browser, or both at once, all driven
//! through the plain-text action language in [`actions`].

use std::sync::Arc;

use anyhow::Result;

use webtask_core::TaskConfig;
use webtask_session::ContainerSession;

pub mod acctree;
pub mod actions;
pub mod bash;
pub mod bridge;
pub mod browser;
pub mod combined;
pub mod observation;

pub use actions::{Action, ActionKind, ActionParseError, ElementTarget, ScrollDirection};
pub use bash::BashEnv;
pub use browser::BrowserEnv;
pub use combined::BashBrowserEnv;
pub use observation::{EnvOutput, Observation, StepInfo, Trajectory, TrajectoryStep};

/// Uniform reset / step / close surface over exactly one actuator.
///
/// `reset` and `close` bracket a task attempt; `step` executes one
/// already-parsed action. Errors escaping `reset` are provisioning
/// errors and abort the attempt; `step` keeps execution failures inside
/// the returned [`EnvOutput`].
pub trait Environment: Send {
    fn reset(&mut self) -> Result<EnvOutput>;
    fn step(&mut self, action: &Action) -> Result<EnvOutput>;
    fn close(&mut self) -> Result<()>;

    /// Parse agent output under this environment's grammar.
    fn parse_action(&self, raw: &str) -> Result<Action, ActionParseError>;

    fn goal(&self) -> &str;

    /// The browser actuator, when this environment has one. Used by
    /// page-content evaluation after the trajectory ends.
    fn browser_mut(&mut self) -> Option<&mut BrowserEnv> {
        None
    }
}

/// Wire up the environment a task config asks for.
pub fn build_environment(
    session: Arc<ContainerSession>,
    config: &TaskConfig,
) -> Box<dyn Environment> {
    match config {
        TaskConfig::Bash(c) => Box::new(BashEnv::new(session, c.clone())),
        TaskConfig::Browser(c) => Box::new(BrowserEnv::new(session, c.clone())),
        TaskConfig::BashBrowser(c) => Box::new(BashBrowserEnv::new(session, c.clone())),
    }
}
