//! Combined actuator: one browser plus one shell against the same
//! session. Each action goes to whichever side understands it.

use std::sync::Arc;

use anyhow::Result;

use webtask_core::BashBrowserTaskConfig;
use webtask_session::ContainerSession;

use crate::actions::{parse_browser_action, Action, ActionKind, ActionParseError};
use crate::bash::BashEnv;
use crate::browser::BrowserEnv;
use crate::observation::EnvOutput;
use crate::Environment;

pub struct BashBrowserEnv {
    bash: BashEnv,
    browser: BrowserEnv,
    goal: String,
}

impl BashBrowserEnv {
    pub fn new(session: Arc<ContainerSession>, config: BashBrowserTaskConfig) -> Self {
        let goal = config.goal.clone();
        let (bash_config, browser_config) = config.split();
        BashBrowserEnv {
            bash: BashEnv::new(session.clone(), bash_config),
            browser: BrowserEnv::new(session, browser_config),
            goal,
        }
    }
}

impl Environment for BashBrowserEnv {
    fn reset(&mut self) -> Result<EnvOutput> {
        self.bash.reset()?;
        // The browser observation is the primary view after reset.
        self.browser.reset()
    }

    fn step(&mut self, action: &Action) -> Result<EnvOutput> {
        match &action.kind {
            ActionKind::Command { .. } => self.bash.step(action),
            _ => self.browser.step(action),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.bash.close()?;
        self.browser.close()
    }

    fn parse_action(&self, raw: &str) -> Result<Action, ActionParseError> {
        parse_browser_action(raw, true)
    }

    fn goal(&self) -> &str {
        &self.goal
    }

    fn browser_mut(&mut self) -> Option<&mut BrowserEnv> {
        Some(&mut self.browser)
    }
}
