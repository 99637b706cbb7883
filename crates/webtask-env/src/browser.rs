//! Browser actuator. Owns a [`BridgeClient`] for the lifetime of one
//! task attempt and drives the remote browser action by action. A
//! failed action degrades to a no-op step: the previous observation
//! comes back unchanged with `fail_error` set, and the episode goes on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::{debug, warn};

use webtask_core::{private_to_public, public_to_private, BrowserTaskConfig};
use webtask_session::ContainerSession;

use crate::acctree::{process_snapshot, NodeInfo, ProcessedTree, ScrollOffset, Viewport};
use crate::actions::{parse_browser_action, Action, ActionKind, ActionParseError, ElementTarget};
use crate::bridge::{quote_arg, BridgeClient};
use crate::observation::{EnvOutput, Observation, StepInfo};
use crate::Environment;

/// Pages need a moment to settle after most actions before a snapshot
/// is representative.
const SLEEP_AFTER_EXECUTION: Duration = Duration::from_millis(500);

const AX_TREE_COMMAND: &str = r#"client.send("Accessibility.getFullAXTree", {})"#;
const SCREENSHOT_COMMAND: &str = "page.screenshot()";
const DOM_SNAPSHOT_COMMAND: &str = r#"client.send("DOMSnapshot.captureSnapshot", {"computedStyles": [], "includeDOMRects": true, "includePaintOrder": true})"#;

enum Dispatch {
    /// Remote call issued; take a fresh observation.
    Executed,
    /// Nothing ran (unresolvable goto); keep the old observation.
    Noop,
    /// Terminal stop.
    Done,
}

pub struct BrowserEnv {
    bridge: BridgeClient,
    config: BrowserTaskConfig,
    viewport: Viewport,
    current_viewport_only: bool,
    sleep_after_execution: Duration,
    /// Element-id registry from the most recent observation.
    nodes: HashMap<String, NodeInfo>,
    last_observation: Observation,
    /// Public form of the current page URL.
    last_url: Option<String>,
}

impl BrowserEnv {
    pub fn new(session: Arc<ContainerSession>, config: BrowserTaskConfig) -> Self {
        BrowserEnv {
            bridge: BridgeClient::new(session),
            viewport: config.viewport,
            config,
            current_viewport_only: true,
            sleep_after_execution: SLEEP_AFTER_EXECUTION,
            nodes: HashMap::new(),
            last_observation: Observation::empty_browser(),
            last_url: None,
        }
    }

    pub fn page_url(&self) -> Option<&str> {
        self.last_url.as_deref()
    }

    /// Storage-state file seeding the browser context: the configured
    /// path, or the conventional per-site file when the task needs a
    /// logged-in session.
    fn storage_state_path(&self) -> Option<String> {
        if let Some(path) = &self.config.storage_state {
            return Some(path.clone());
        }
        if self.config.require_login {
            let site = self.config.sites.first()?;
            return Some(format!(".auth/{}_state.json", site.name()));
        }
        None
    }

    fn node(&self, element_id: &str) -> Result<&NodeInfo> {
        self.nodes.get(element_id).ok_or_else(|| {
            anyhow!("element id [{element_id}] does not exist in the current observation")
        })
    }

    /// Navigate to a public URL, translating it for the session
    /// network. Returns false when the URL maps to no known service.
    fn goto(&self, url: &str) -> Result<bool> {
        let Some(private) = public_to_private(url) else {
            debug!(url, "goto target resolves to no service, skipping");
            return Ok(false);
        };
        self.bridge
            .exec(&format!("page.goto({})", quote_arg(&private)))?
            .into_ok()?;
        Ok(true)
    }

    fn dispatch(&mut self, kind: &ActionKind) -> Result<Dispatch> {
        match kind {
            ActionKind::Stop { .. } => return Ok(Dispatch::Done),
            ActionKind::None | ActionKind::ParsingFailure { .. } => {
                return Ok(Dispatch::Noop);
            }
            ActionKind::Click { target } => match target {
                ElementTarget::Id(id) => {
                    let (x, y) = self.node(id)?.center();
                    self.bridge
                        .exec(&format!("page.mouse.click({x}, {y})"))?
                        .into_ok()?;
                }
                ElementTarget::Locator(code) => {
                    self.bridge.exec(code)?.into_ok()?;
                }
            },
            ActionKind::Hover { target } => match target {
                ElementTarget::Id(id) => {
                    let (x, y) = self.node(id)?.center();
                    self.bridge
                        .exec(&format!("page.mouse.move({x}, {y})"))?
                        .into_ok()?;
                }
                ElementTarget::Locator(code) => {
                    self.bridge.exec(code)?.into_ok()?;
                }
            },
            ActionKind::Type {
                target,
                text,
                submit,
            } => match target {
                ElementTarget::Id(id) => {
                    let (x, y) = self.node(id)?.center();
                    self.bridge
                        .exec(&format!("page.mouse.click({x}, {y})"))?
                        .into_ok()?;
                    let mut text = text.clone();
                    if *submit {
                        text.push('\n');
                    }
                    self.bridge
                        .exec(&format!("page.keyboard.type({})", quote_arg(&text)))?
                        .into_ok()?;
                }
                ElementTarget::Locator(code) => {
                    self.bridge.exec(code)?.into_ok()?;
                }
            },
            ActionKind::Press { key_comb } => {
                self.bridge
                    .exec(&format!("page.keyboard.press({})", quote_arg(key_comb)))?
                    .into_ok()?;
            }
            ActionKind::Scroll { direction } => {
                let amount = match direction {
                    crate::actions::ScrollDirection::Up => -self.viewport.height,
                    crate::actions::ScrollDirection::Down => self.viewport.height,
                };
                let code = format!("window.scrollBy(0, {amount})");
                self.bridge
                    .exec(&format!("page.evaluate({})", quote_arg(&code)))?
                    .into_ok()?;
            }
            ActionKind::Goto { url } => {
                if !self.goto(url)? {
                    return Ok(Dispatch::Noop);
                }
            }
            ActionKind::NewTab => {
                self.bridge.exec("context.new_page()")?.into_ok()?;
            }
            ActionKind::GoBack => {
                self.bridge.exec("page.go_back()")?.into_ok()?;
            }
            ActionKind::GoForward => {
                self.bridge.exec("page.go_forward()")?.into_ok()?;
            }
            ActionKind::TabFocus { index } => {
                self.bridge
                    .exec(&format!("context.pages[{index}].bring_to_front()"))?
                    .into_ok()?;
            }
            ActionKind::CloseTab => {
                self.bridge.exec("page.close()")?.into_ok()?;
            }
            ActionKind::Check { locator_code } | ActionKind::SelectOption { locator_code } => {
                self.bridge.exec(locator_code)?.into_ok()?;
            }
            ActionKind::Command { .. } => {
                return Err(anyhow!(
                    "shell commands need a combined bash+browser task"
                ));
            }
        }
        Ok(Dispatch::Executed)
    }

    fn scroll_offsets(&self) -> ScrollOffset {
        let fetch = |expr: &str| -> f64 {
            self.bridge
                .exec_idempotent(&format!("page.evaluate({})", quote_arg(expr)))
                .ok()
                .and_then(|resp| resp.content.as_f64())
                .unwrap_or(0.0)
        };
        ScrollOffset {
            x: fetch("window.pageXOffset"),
            y: fetch("window.pageYOffset"),
        }
    }

    /// Take a fresh observation from the remote browser.
    fn observe(&mut self) -> Result<EnvOutput> {
        let content = self.bridge.exec_idempotent("page.content()")?.into_ok()?;
        let html = content.content_str().unwrap_or_default().to_string();
        let page_url = content
            .url
            .as_deref()
            .map(|u| private_to_public(u).unwrap_or_else(|| u.to_string()));

        let ax_tree = self.bridge.exec_idempotent(AX_TREE_COMMAND)?.into_ok()?;
        // A snapshot taken mid-navigation can fail; wait for the load
        // to finish and try once more.
        let snapshot = match self
            .bridge
            .exec_idempotent(DOM_SNAPSHOT_COMMAND)
            .and_then(|r| r.into_ok())
        {
            Ok(resp) => resp,
            Err(e) => {
                debug!(error = %e, "snapshot failed, waiting for page load");
                self.bridge
                    .exec(r#"page.wait_for_load_state("load")"#)?
                    .into_ok()?;
                self.bridge.exec_idempotent(DOM_SNAPSHOT_COMMAND)?.into_ok()?
            }
        };
        let scroll = self.scroll_offsets();
        let ProcessedTree { tree_text, nodes } = process_snapshot(
            &ax_tree.content,
            &snapshot.content,
            self.viewport,
            scroll,
            self.current_viewport_only,
        );

        // One attempt only; a missing screenshot never fails the step.
        let screenshot_b64 = self
            .bridge
            .exec(SCREENSHOT_COMMAND)
            .ok()
            .and_then(|resp| resp.into_ok().ok())
            .and_then(|resp| resp.content_str().map(str::to_string))
            .filter(|s| !s.is_empty());

        self.nodes = nodes;
        self.last_observation = Observation::Browser {
            acc_tree: tree_text,
            html,
            screenshot_b64,
        };
        self.last_url = page_url.clone();
        Ok(EnvOutput {
            observation: self.last_observation.clone(),
            reward: 0.0,
            done: false,
            truncated: false,
            info: StepInfo {
                page_url,
                fail_error: None,
            },
        })
    }

    fn failed_step(&self, error: anyhow::Error) -> EnvOutput {
        EnvOutput {
            observation: self.last_observation.clone(),
            reward: 0.0,
            done: false,
            truncated: false,
            info: StepInfo {
                page_url: self.last_url.clone(),
                fail_error: Some(error.to_string()),
            },
        }
    }

    fn unchanged_step(&self) -> EnvOutput {
        EnvOutput {
            observation: self.last_observation.clone(),
            reward: 0.0,
            done: false,
            truncated: false,
            info: StepInfo {
                page_url: self.last_url.clone(),
                fail_error: None,
            },
        }
    }

    /// Content extraction for page-content evaluation. `url` is public
    /// (or the sentinel `"last"` for the current page); the locator is
    /// either empty (whole page), `document.`-prefixed script, or a
    /// `func:`-named helper.
    pub fn fetch_content(&mut self, url: &str, locator: &str) -> Result<String> {
        if url != "last" {
            if !self.goto(url)? {
                return Err(anyhow!("no service serves '{url}'"));
            }
            std::thread::sleep(self.sleep_after_execution);
        }
        let locator = locator.trim();
        if locator.is_empty() {
            let resp = self.bridge.exec_idempotent("page.content()")?.into_ok()?;
            return Ok(resp.content_str().unwrap_or_default().to_string());
        }
        if let Some(rest) = locator.strip_prefix("func:") {
            return self.run_extractor(rest);
        }
        if locator.starts_with("document.") {
            let code = format!("() => {locator}");
            // A broken locator means the page lacks the content; score
            // it as empty rather than failing the evaluation.
            let resp = self
                .bridge
                .exec_idempotent(&format!("page.evaluate({})", quote_arg(&code)))?;
            if !resp.ok() {
                warn!(locator, "locator evaluation failed, treating as empty");
                return Ok(String::new());
            }
            return Ok(resp.content_str().unwrap_or_default().to_string());
        }
        Err(anyhow!("unknown locator '{locator}'"))
    }

    fn run_extractor(&self, call: &str) -> Result<String> {
        // One helper is supported: text_content("<selector>").
        let Some(args) = call
            .strip_prefix("text_content(")
            .and_then(|rest| rest.strip_suffix(')'))
        else {
            return Err(anyhow!("unknown extractor '{call}'"));
        };
        let selector = args.trim_matches(|c| c == '"' || c == '\'');
        let code = format!(
            "() => document.querySelector({})?.textContent ?? ''",
            quote_arg(selector)
        );
        let resp = self
            .bridge
            .exec_idempotent(&format!("page.evaluate({})", quote_arg(&code)))?
            .into_ok()?;
        Ok(resp.content_str().unwrap_or_default().to_string())
    }
}

impl Environment for BrowserEnv {
    fn reset(&mut self) -> Result<EnvOutput> {
        self.bridge.setup(self.storage_state_path().as_deref())?;
        if let Some(lat_lng) = self.config.geolocation {
            self.bridge
                .exec(&format!(
                    "context.set_geolocation({{\"latitude\": {}, \"longitude\": {}}})",
                    lat_lng.0, lat_lng.1
                ))?
                .into_ok()?;
        }
        if let Some(url) = self.config.start_url.clone() {
            if !self.goto(&url)? {
                return Err(anyhow!("start URL '{url}' resolves to no known service"));
            }
            std::thread::sleep(self.sleep_after_execution);
        }
        self.observe()
    }

    fn step(&mut self, action: &Action) -> Result<EnvOutput> {
        match self.dispatch(&action.kind) {
            Ok(Dispatch::Done) => Ok(EnvOutput::finished(self.last_observation.clone())),
            Ok(Dispatch::Noop) => Ok(self.unchanged_step()),
            Ok(Dispatch::Executed) => {
                std::thread::sleep(self.sleep_after_execution);
                match self.observe() {
                    Ok(output) => Ok(output),
                    Err(e) => Ok(self.failed_step(e)),
                }
            }
            Err(e) => Ok(self.failed_step(e)),
        }
    }

    fn close(&mut self) -> Result<()> {
        if let Err(e) = self.bridge.shutdown() {
            warn!(error = %e, "bridge shutdown failed");
        }
        Ok(())
    }

    fn parse_action(&self, raw: &str) -> Result<Action, ActionParseError> {
        parse_browser_action(raw, false)
    }

    fn goal(&self) -> &str {
        &self.config.goal
    }

    fn browser_mut(&mut self) -> Option<&mut BrowserEnv> {
        Some(self)
    }
}
