//! Task configuration as read from JSON task files. The shape follows
//! the `env_type` tag: pure shell tasks, pure browsing tasks, and
//! combined tasks that run both actuators against one session.

use serde::{Deserialize, Serialize};

use crate::services::Service;

/// A single task definition. The tag decides which actuators the runner
/// wires up, and the variants carry only the fields that make sense for
/// that environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "env_type", rename_all = "snake_case")]
pub enum TaskConfig {
    Bash(BashTaskConfig),
    Browser(BrowserTaskConfig),
    BashBrowser(BashBrowserTaskConfig),
}

impl TaskConfig {
    pub fn task_id(&self) -> u64 {
        match self {
            TaskConfig::Bash(c) => c.task_id,
            TaskConfig::Browser(c) => c.task_id,
            TaskConfig::BashBrowser(c) => c.task_id,
        }
    }

    pub fn goal(&self) -> &str {
        match self {
            TaskConfig::Bash(c) => &c.goal,
            TaskConfig::Browser(c) => &c.goal,
            TaskConfig::BashBrowser(c) => &c.goal,
        }
    }

    pub fn eval(&self) -> &EvalSpec {
        match self {
            TaskConfig::Bash(c) => &c.eval,
            TaskConfig::Browser(c) => &c.eval,
            TaskConfig::BashBrowser(c) => &c.eval,
        }
    }

    /// Every service this task needs running, bridge and shell
    /// containers included.
    pub fn required_services(&self) -> Vec<Service> {
        match self {
            TaskConfig::Bash(_) => vec![Service::Bash],
            TaskConfig::Browser(c) => {
                let mut out = c.sites.clone();
                out.push(Service::BrowserBridge);
                out.sort();
                out.dedup();
                out
            }
            TaskConfig::BashBrowser(c) => {
                let mut out = c.sites.clone();
                out.push(Service::BrowserBridge);
                out.push(Service::Bash);
                out.sort();
                out.dedup();
                out
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BashTaskConfig {
    pub task_id: u64,
    #[serde(rename = "intent")]
    pub goal: String,
    pub eval: EvalSpec,
    /// Recreate the container from scratch instead of reusing one left
    /// over from an earlier task.
    #[serde(default)]
    pub require_reset: bool,
    /// Commands run inside the container before the first step.
    #[serde(default)]
    pub setup_commands: Vec<String>,
}

/// Browser window size in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Viewport {
            width: 1280.0,
            height: 720.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserTaskConfig {
    pub task_id: u64,
    #[serde(rename = "intent")]
    pub goal: String,
    pub eval: EvalSpec,
    pub sites: Vec<Service>,
    pub start_url: Option<String>,
    #[serde(default)]
    pub require_login: bool,
    /// Path to a storage-state file with pre-baked cookies.
    #[serde(default)]
    pub storage_state: Option<String>,
    #[serde(default)]
    pub geolocation: Option<(f64, f64)>,
    #[serde(default)]
    pub viewport: Viewport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BashBrowserTaskConfig {
    pub task_id: u64,
    #[serde(rename = "intent")]
    pub goal: String,
    pub eval: EvalSpec,
    pub sites: Vec<Service>,
    pub start_url: Option<String>,
    #[serde(default)]
    pub require_login: bool,
    #[serde(default)]
    pub storage_state: Option<String>,
    #[serde(default)]
    pub geolocation: Option<(f64, f64)>,
    #[serde(default)]
    pub viewport: Viewport,
    #[serde(default)]
    pub require_reset: bool,
    #[serde(default)]
    pub setup_commands: Vec<String>,
}

impl BashBrowserTaskConfig {
    /// Lossless split into the two single-actuator configs. The two
    /// halves share the goal, id, and eval spec; each keeps only the
    /// fields its environment reads.
    pub fn split(&self) -> (BashTaskConfig, BrowserTaskConfig) {
        let bash = BashTaskConfig {
            task_id: self.task_id,
            goal: self.goal.clone(),
            eval: self.eval.clone(),
            require_reset: self.require_reset,
            setup_commands: self.setup_commands.clone(),
        };
        let browser = BrowserTaskConfig {
            task_id: self.task_id,
            goal: self.goal.clone(),
            eval: self.eval.clone(),
            sites: self.sites.clone(),
            start_url: self.start_url.clone(),
            require_login: self.require_login,
            storage_state: self.storage_state.clone(),
            geolocation: self.geolocation,
            viewport: self.viewport,
        };
        (bash, browser)
    }
}

/// How the final trajectory gets scored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalSpec {
    pub eval_types: Vec<EvalType>,
    #[serde(default)]
    pub reference_answers: Option<ReferenceAnswers>,
    #[serde(default)]
    pub reference_url: Option<String>,
    #[serde(default)]
    pub url_note: Option<UrlMatchRule>,
    #[serde(default)]
    pub program_html: Vec<ProgramHtmlTarget>,
    #[serde(default)]
    pub string_note: Option<String>,
    #[serde(default)]
    pub reference_answer_raw_annotation: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalType {
    StringMatch,
    UrlMatch,
    ProgramHtml,
}

/// How a reference URL is compared with the final page URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UrlMatchRule {
    #[serde(rename = "EXACT")]
    Exact,
    #[serde(rename = "GOLD in PRED")]
    GoldInPred,
}

impl Default for UrlMatchRule {
    fn default() -> Self {
        UrlMatchRule::Exact
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceAnswers {
    #[serde(default)]
    pub exact_match: Option<String>,
    #[serde(default)]
    pub must_include: Option<Vec<String>>,
    #[serde(default)]
    pub fuzzy_match: Option<Vec<String>>,
}

/// One page-content check: open `url`, extract per `locator`, and
/// require the content to appear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramHtmlTarget {
    /// Page to inspect, or the sentinel `"last"` for the final page of
    /// the trajectory.
    pub url: String,
    /// Empty string means the whole page text. Otherwise either locator
    /// code evaluated on the page (`document.`-prefixed) or a
    /// `func:`-prefixed named extractor.
    #[serde(default)]
    pub locator: String,
    /// Substring that must appear, case-insensitively. Alternatives may
    /// be joined with ` |OR| `.
    pub required_contents: String,
}

/// Caps that end a run before the solver decides to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EarlyStopConfig {
    pub max_steps: usize,
    /// Stop once the same action has been issued this many times in a
    /// row.
    pub repeating_action: usize,
    /// Stop after this many consecutive unparseable responses.
    pub parsing_failure: usize,
}

impl Default for EarlyStopConfig {
    fn default() -> Self {
        EarlyStopConfig {
            max_steps: 30,
            repeating_action: 3,
            parsing_failure: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BROWSER_TASK: &str = r#"{
        "env_type": "browser",
        "task_id": 7,
        "intent": "What is the top product?",
        "sites": ["shopping"],
        "start_url": "http://onestopmarket.com",
        "eval": {
            "eval_types": ["string_match"],
            "reference_answers": {"must_include": ["widget"]}
        }
    }"#;

    #[test]
    fn browser_task_deserializes_from_tagged_json() {
        let cfg: TaskConfig = serde_json::from_str(BROWSER_TASK).unwrap();
        let TaskConfig::Browser(browser) = &cfg else {
            panic!("expected browser task");
        };
        assert_eq!(browser.task_id, 7);
        assert_eq!(browser.goal, "What is the top product?");
        assert_eq!(browser.sites, vec![Service::Shopping]);
        assert!(!browser.require_login);
        assert_eq!(browser.viewport, Viewport::default());
    }

    #[test]
    fn viewport_deserializes_and_round_trips() {
        let text = r#"{
            "env_type": "browser",
            "task_id": 2,
            "intent": "read the news",
            "sites": ["wikipedia"],
            "start_url": null,
            "viewport": {"width": 1024, "height": 768},
            "eval": {"eval_types": []}
        }"#;
        let cfg: TaskConfig = serde_json::from_str(text).unwrap();
        let TaskConfig::Browser(browser) = &cfg else {
            panic!("expected browser task");
        };
        assert_eq!(browser.viewport.width, 1024.0);
        assert_eq!(browser.viewport.height, 768.0);
        let back: TaskConfig =
            serde_json::from_str(&serde_json::to_string(&cfg).unwrap()).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn config_round_trips_through_json() {
        let cfg: TaskConfig = serde_json::from_str(BROWSER_TASK).unwrap();
        let text = serde_json::to_string(&cfg).unwrap();
        let back: TaskConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn required_services_adds_bridge_and_dedupes() {
        let cfg: TaskConfig = serde_json::from_str(BROWSER_TASK).unwrap();
        assert_eq!(
            cfg.required_services(),
            vec![Service::Shopping, Service::BrowserBridge]
        );
    }

    #[test]
    fn combined_split_is_lossless() {
        let combined = BashBrowserTaskConfig {
            task_id: 3,
            goal: "download the homepage".to_string(),
            eval: EvalSpec {
                eval_types: vec![EvalType::StringMatch],
                reference_answers: Some(ReferenceAnswers {
                    exact_match: Some("ok".to_string()),
                    ..Default::default()
                }),
                reference_url: None,
                url_note: None,
                program_html: Vec::new(),
                string_note: None,
                reference_answer_raw_annotation: None,
            },
            sites: vec![Service::SimpleWeb],
            start_url: Some("http://simple-web.com".to_string()),
            require_login: false,
            storage_state: None,
            geolocation: None,
            viewport: Viewport {
                width: 1920.0,
                height: 1080.0,
            },
            require_reset: true,
            setup_commands: vec!["touch /tmp/ready".to_string()],
        };
        let (bash, browser) = combined.split();
        assert_eq!(bash.task_id, combined.task_id);
        assert_eq!(bash.goal, combined.goal);
        assert!(bash.require_reset);
        assert_eq!(bash.setup_commands, combined.setup_commands);
        assert_eq!(browser.sites, combined.sites);
        assert_eq!(browser.start_url, combined.start_url);
        assert_eq!(browser.viewport, combined.viewport);
        assert_eq!(bash.eval, browser.eval);
    }

    #[test]
    fn url_note_parses_annotation_strings() {
        let note: UrlMatchRule = serde_json::from_str("\"GOLD in PRED\"").unwrap();
        assert_eq!(note, UrlMatchRule::GoldInPred);
    }

    #[test]
    fn early_stop_defaults() {
        let caps = EarlyStopConfig::default();
        assert_eq!(caps.max_steps, 30);
        assert_eq!(caps.repeating_action, 3);
        assert_eq!(caps.parsing_failure, 3);
    }

    #[test]
    fn combined_required_services_includes_both_actuators() {
        let cfg = TaskConfig::BashBrowser(BashBrowserTaskConfig {
            task_id: 1,
            goal: "g".to_string(),
            eval: EvalSpec {
                eval_types: vec![],
                reference_answers: None,
                reference_url: None,
                url_note: None,
                program_html: Vec::new(),
                string_note: None,
                reference_answer_raw_annotation: None,
            },
            sites: vec![Service::SimpleWeb, Service::SimpleWeb],
            start_url: None,
            require_login: false,
            storage_state: None,
            geolocation: None,
            viewport: Viewport::default(),
            require_reset: false,
            setup_commands: Vec::new(),
        });
        let services = cfg.required_services();
        assert!(services.contains(&Service::Bash));
        assert!(services.contains(&Service::BrowserBridge));
        assert_eq!(
            services.iter().filter(|s| **s == Service::SimpleWeb).count(),
            1
        );
    }
}
