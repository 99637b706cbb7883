//! The action language. Agents emit one plain-text line per step; this
//! module turns that line into a typed [`Action`], renders actions back
//! to text for logging, and decides when two actions count as the same
//! move for loop detection.
//!
//! Two grammars coexist. The identifier grammar refers to elements by
//! the small integer ids printed in the accessibility-tree observation
//! (`click [42]`). The locator grammar is a single allow-listed method
//! chain starting with `page.` (`page.get_by_role("button").click()`).

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

/// Hint text sent back to the agent when its output does not parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionParseError {
    #[error("could not parse action from '{0}'")]
    Unrecognized(String),
    #[error("malformed '{verb}' action: {hint}")]
    Malformed { verb: String, hint: String },
    #[error("'{0}' is not an allowed page method")]
    DisallowedMethod(String),
    #[error("a locator chain must end with an action, got '{0}'")]
    TrailingLocator(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollDirection {
    Up,
    Down,
}

impl ScrollDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrollDirection::Up => "up",
            ScrollDirection::Down => "down",
        }
    }
}

/// How a browser action names its element: by observation id or by a
/// raw locator expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementTarget {
    Id(String),
    Locator(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionKind {
    /// Placeholder for the initial reset step.
    None,
    /// Synthetic action standing in for unparseable agent output. Never
    /// executed against an environment.
    ParsingFailure { hint: String },
    Click { target: ElementTarget },
    Hover { target: ElementTarget },
    Type {
        target: ElementTarget,
        text: String,
        /// Press Enter after typing. The identifier grammar defaults to
        /// true.
        submit: bool,
    },
    Press { key_comb: String },
    Scroll { direction: ScrollDirection },
    Goto { url: String },
    NewTab,
    GoBack,
    GoForward,
    TabFocus { index: usize },
    CloseTab,
    Check { locator_code: String },
    SelectOption { locator_code: String },
    Stop { answer: String },
    /// Shell command, either the whole line in a bash task or the
    /// `bash [...]` form in a combined task.
    Command { command: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    /// The agent's output, verbatim, for audit.
    pub raw_prediction: String,
    pub kind: ActionKind,
}

impl Action {
    pub fn new(raw: impl Into<String>, kind: ActionKind) -> Self {
        Action {
            raw_prediction: raw.into(),
            kind,
        }
    }

    pub fn none() -> Self {
        Action::new("", ActionKind::None)
    }

    pub fn parsing_failure(raw: impl Into<String>, error: &ActionParseError) -> Self {
        Action::new(
            raw,
            ActionKind::ParsingFailure {
                hint: error.to_string(),
            },
        )
    }

    pub fn is_stop(&self) -> bool {
        matches!(self.kind, ActionKind::Stop { .. })
    }

    pub fn stop_answer(&self) -> Option<&str> {
        match &self.kind {
            ActionKind::Stop { answer } => Some(answer),
            _ => None,
        }
    }

    /// Loop-detection equality: same tag and same semantically relevant
    /// fields. Two parsing failures always match, whatever their hints.
    pub fn is_equivalent(&self, other: &Action) -> bool {
        match (&self.kind, &other.kind) {
            (ActionKind::ParsingFailure { .. }, ActionKind::ParsingFailure { .. }) => true,
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ActionKind::None => write!(f, "none"),
            ActionKind::ParsingFailure { .. } => write!(f, "parsing_failure"),
            ActionKind::Click { target } => write_targeted(f, "click", target),
            ActionKind::Hover { target } => write_targeted(f, "hover", target),
            ActionKind::Type {
                target,
                text,
                submit,
            } => match target {
                ElementTarget::Id(id) => {
                    write!(f, "type [{id}] [{text}] [{}]", if *submit { 1 } else { 0 })
                }
                ElementTarget::Locator(code) => f.write_str(code),
            },
            ActionKind::Press { key_comb } => write!(f, "press [{key_comb}]"),
            ActionKind::Scroll { direction } => write!(f, "scroll [{}]", direction.as_str()),
            ActionKind::Goto { url } => write!(f, "goto [{url}]"),
            ActionKind::NewTab => write!(f, "new_tab"),
            ActionKind::GoBack => write!(f, "go_back"),
            ActionKind::GoForward => write!(f, "go_forward"),
            ActionKind::TabFocus { index } => write!(f, "tab_focus [{index}]"),
            ActionKind::CloseTab => write!(f, "close_tab"),
            ActionKind::Check { locator_code } => f.write_str(locator_code),
            ActionKind::SelectOption { locator_code } => f.write_str(locator_code),
            ActionKind::Stop { answer } => write!(f, "stop [{answer}]"),
            ActionKind::Command { command } => write!(f, "bash [{command}]"),
        }
    }
}

fn write_targeted(f: &mut fmt::Formatter<'_>, verb: &str, target: &ElementTarget) -> fmt::Result {
    match target {
        ElementTarget::Id(id) => write!(f, "{verb} [{id}]"),
        ElementTarget::Locator(code) => f.write_str(code),
    }
}

/// Pull the action out of a fenced block if the agent wrapped it in
/// one, otherwise use the whole response.
pub fn extract_action_text(raw: &str) -> &str {
    static FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"```(?s)(.*?)```").unwrap());
    match FENCE.captures(raw) {
        Some(caps) => caps.get(1).map(|m| m.as_str().trim()).unwrap_or(""),
        None => raw.trim(),
    }
}

/// Bash tasks treat the whole response as a command unless it is a
/// `stop`. This never fails: any text is a runnable command.
pub fn parse_bash_action(raw: &str) -> Action {
    let text = extract_action_text(raw);
    if let Some(stop) = parse_stop(text) {
        return Action::new(raw, stop);
    }
    Action::new(
        raw,
        ActionKind::Command {
            command: text.to_string(),
        },
    )
}

/// Browser (and combined) tasks accept both grammars. `allow_bash`
/// admits the `bash [...]` form for combined tasks.
pub fn parse_browser_action(raw: &str, allow_bash: bool) -> Result<Action, ActionParseError> {
    let text = extract_action_text(raw);
    let kind = if text.starts_with("page.") {
        parse_locator_chain(text)?
    } else {
        parse_id_grammar(text, allow_bash)?
    };
    Ok(Action::new(raw, kind))
}

fn parse_stop(text: &str) -> Option<ActionKind> {
    static STOP: Lazy<Regex> = Lazy::new(|| Regex::new(r"^stop(?: ?\[(?s)(.*)\])?$").unwrap());
    let caps = STOP.captures(text)?;
    let answer = caps.get(1).map(|m| m.as_str()).unwrap_or("").to_string();
    Some(ActionKind::Stop { answer })
}

fn parse_id_grammar(text: &str, allow_bash: bool) -> Result<ActionKind, ActionParseError> {
    static CLICK: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(click|hover) ?\[(\d+)\]$").unwrap());
    static TYPE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^type ?\[(\d+)\] ?\[(?s)(.*)\](?-s) ?\[([01])\]$").unwrap());
    static TYPE_NO_FLAG: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^type ?\[(\d+)\] ?\[(?s)(.*)\]$").unwrap());
    static PRESS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^press ?\[(.+)\]$").unwrap());
    static SCROLL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^scroll ?\[?(up|down)\]?$").unwrap());
    static GOTO: Lazy<Regex> = Lazy::new(|| Regex::new(r"^goto ?\[(.+)\]$").unwrap());
    static TAB_FOCUS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^tab_focus ?\[(\d+)\]$").unwrap());
    static BASH: Lazy<Regex> = Lazy::new(|| Regex::new(r"^bash ?\[(?s)(.+)\]$").unwrap());

    if let Some(stop) = parse_stop(text) {
        return Ok(stop);
    }
    if let Some(caps) = CLICK.captures(text) {
        let target = ElementTarget::Id(caps[2].to_string());
        return Ok(match &caps[1] {
            "click" => ActionKind::Click { target },
            _ => ActionKind::Hover { target },
        });
    }
    if let Some(caps) = TYPE.captures(text) {
        return Ok(ActionKind::Type {
            target: ElementTarget::Id(caps[1].to_string()),
            text: caps[2].to_string(),
            submit: &caps[3] == "1",
        });
    }
    if let Some(caps) = TYPE_NO_FLAG.captures(text) {
        return Ok(ActionKind::Type {
            target: ElementTarget::Id(caps[1].to_string()),
            text: caps[2].to_string(),
            submit: true,
        });
    }
    if let Some(caps) = PRESS.captures(text) {
        return Ok(ActionKind::Press {
            key_comb: normalize_key_comb(&caps[1]),
        });
    }
    if let Some(caps) = SCROLL.captures(text) {
        let direction = if &caps[1] == "up" {
            ScrollDirection::Up
        } else {
            ScrollDirection::Down
        };
        return Ok(ActionKind::Scroll { direction });
    }
    if let Some(caps) = GOTO.captures(text) {
        return Ok(ActionKind::Goto {
            url: caps[1].to_string(),
        });
    }
    if let Some(caps) = TAB_FOCUS.captures(text) {
        let index = caps[1]
            .parse()
            .map_err(|_| ActionParseError::Malformed {
                verb: "tab_focus".to_string(),
                hint: "tab index must be a small integer".to_string(),
            })?;
        return Ok(ActionKind::TabFocus { index });
    }
    match text {
        "new_tab" => return Ok(ActionKind::NewTab),
        "go_back" => return Ok(ActionKind::GoBack),
        "go_forward" => return Ok(ActionKind::GoForward),
        "close_tab" => return Ok(ActionKind::CloseTab),
        _ => {}
    }
    if allow_bash {
        if let Some(caps) = BASH.captures(text) {
            return Ok(ActionKind::Command {
                command: caps[1].to_string(),
            });
        }
    }
    // A well-known verb with bad arguments earns a pointed hint.
    let verb = text.split_whitespace().next().unwrap_or("");
    match verb {
        "click" | "hover" | "type" | "press" | "scroll" | "goto" | "tab_focus" => {
            Err(ActionParseError::Malformed {
                verb: verb.to_string(),
                hint: "arguments must be wrapped in square brackets, e.g. click [42]".to_string(),
            })
        }
        _ => Err(ActionParseError::Unrecognized(text.to_string())),
    }
}

const ALLOWED_LOCATORS: &[&str] = &[
    "get_by_role",
    "get_by_text",
    "get_by_label",
    "get_by_placeholder",
    "get_by_alt_text",
    "get_by_title",
    "get_by_test_id",
    "locator",
    "frame_locator",
    "filter",
    "first",
    "last",
    "nth",
];

const ALLOWED_PAGE_ACTIONS: &[&str] = &[
    "click",
    "dblclick",
    "hover",
    "fill",
    "type",
    "press",
    "check",
    "uncheck",
    "select_option",
    "goto",
    "go_back",
    "go_forward",
];

/// Split a method chain on dots that sit outside parentheses and string
/// literals, so `page.get_by_text("a.b").click()` yields three segments.
fn split_method_chain(line: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0usize;
    for (i, c) in line.char_indices() {
        match c {
            '"' | '\'' => match quote {
                Some(q) if q == c => quote = None,
                None => quote = Some(c),
                _ => {}
            },
            '(' if quote.is_none() => depth += 1,
            ')' if quote.is_none() => depth = depth.saturating_sub(1),
            '.' if quote.is_none() && depth == 0 => {
                segments.push(&line[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    segments.push(&line[start..]);
    segments
}

fn segment_name(segment: &str) -> &str {
    match segment.find('(') {
        Some(pos) => &segment[..pos],
        None => segment,
    }
}

/// First quoted argument of a call segment, if any.
fn first_string_arg(segment: &str) -> Option<String> {
    static ARG: Lazy<Regex> = Lazy::new(|| Regex::new(r#""([^"]*)"|'([^']*)'"#).unwrap());
    let caps = ARG.captures(segment)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str().to_string())
}

fn parse_locator_chain(line: &str) -> Result<ActionKind, ActionParseError> {
    let segments = split_method_chain(line);
    if segments.len() < 2 || segments[0] != "page" {
        return Err(ActionParseError::Unrecognized(line.to_string()));
    }
    for middle in &segments[1..segments.len() - 1] {
        let name = segment_name(middle);
        if !ALLOWED_LOCATORS.contains(&name) {
            return Err(ActionParseError::DisallowedMethod(name.to_string()));
        }
    }
    let last = segments[segments.len() - 1];
    let name = segment_name(last);
    if ALLOWED_LOCATORS.contains(&name) {
        return Err(ActionParseError::TrailingLocator(name.to_string()));
    }
    if !ALLOWED_PAGE_ACTIONS.contains(&name) {
        return Err(ActionParseError::DisallowedMethod(name.to_string()));
    }
    let code = line.to_string();
    Ok(match name {
        "click" | "dblclick" => ActionKind::Click {
            target: ElementTarget::Locator(code),
        },
        "hover" => ActionKind::Hover {
            target: ElementTarget::Locator(code),
        },
        "fill" | "type" => ActionKind::Type {
            target: ElementTarget::Locator(code),
            text: first_string_arg(last).unwrap_or_default(),
            submit: false,
        },
        "press" => ActionKind::Press {
            key_comb: normalize_key_comb(&first_string_arg(last).unwrap_or_default()),
        },
        "check" | "uncheck" => ActionKind::Check { locator_code: code },
        "select_option" => ActionKind::SelectOption { locator_code: code },
        "goto" => ActionKind::Goto {
            url: first_string_arg(last).unwrap_or_default(),
        },
        "go_back" => ActionKind::GoBack,
        _ => ActionKind::GoForward,
    })
}

/// Map loosely spelled key names onto the names the browser expects.
pub fn normalize_key_comb(raw: &str) -> String {
    raw.split('+')
        .map(|part| {
            let part = part.trim();
            match part.to_ascii_lowercase().as_str() {
                "ctrl" | "control" => "Control".to_string(),
                "shift" => "Shift".to_string(),
                "alt" => "Alt".to_string(),
                "meta" | "cmd" | "command" => "Meta".to_string(),
                "enter" | "return" => "Enter".to_string(),
                "space" | "spacebar" => "Space".to_string(),
                "tab" => "Tab".to_string(),
                "esc" | "escape" => "Escape".to_string(),
                "backspace" => "Backspace".to_string(),
                "delete" | "del" => "Delete".to_string(),
                "pageup" | "page_up" => "PageUp".to_string(),
                "pagedown" | "page_down" => "PageDown".to_string(),
                "up" | "arrowup" => "ArrowUp".to_string(),
                "down" | "arrowdown" => "ArrowDown".to_string(),
                "left" | "arrowleft" => "ArrowLeft".to_string(),
                "right" | "arrowright" => "ArrowRight".to_string(),
                _ => part.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join("+")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn click_parses_element_id() {
        let action = parse_browser_action("click [42]", false).unwrap();
        assert_eq!(
            action.kind,
            ActionKind::Click {
                target: ElementTarget::Id("42".to_string())
            }
        );
    }

    #[test]
    fn click_round_trips_through_serializer() {
        let action = parse_browser_action("click [42]", false).unwrap();
        let reparsed = parse_browser_action(&action.to_string(), false).unwrap();
        assert!(action.is_equivalent(&reparsed));
    }

    #[test]
    fn stop_with_and_without_answer() {
        let with = parse_browser_action("stop [London]", false).unwrap();
        assert_eq!(with.stop_answer(), Some("London"));
        let bare = parse_browser_action("stop", false).unwrap();
        assert_eq!(bare.stop_answer(), Some(""));
    }

    #[test]
    fn type_defaults_to_submit() {
        let action = parse_browser_action("type [7] [hello world]", false).unwrap();
        assert_eq!(
            action.kind,
            ActionKind::Type {
                target: ElementTarget::Id("7".to_string()),
                text: "hello world".to_string(),
                submit: true,
            }
        );
        let no_submit = parse_browser_action("type [7] [hello] [0]", false).unwrap();
        let ActionKind::Type { submit, .. } = no_submit.kind else {
            panic!("expected type action");
        };
        assert!(!submit);
    }

    #[test]
    fn fenced_responses_are_unwrapped() {
        let raw = "I will now scroll.\n```scroll [down]```";
        let action = parse_browser_action(raw, false).unwrap();
        assert_eq!(
            action.kind,
            ActionKind::Scroll {
                direction: ScrollDirection::Down
            }
        );
        assert_eq!(action.raw_prediction, raw);
    }

    #[test]
    fn bash_form_requires_combined_grammar() {
        assert!(parse_browser_action("bash [ls -la]", false).is_err());
        let action = parse_browser_action("bash [ls -la]", true).unwrap();
        assert_eq!(
            action.kind,
            ActionKind::Command {
                command: "ls -la".to_string()
            }
        );
    }

    #[test]
    fn bash_grammar_treats_any_text_as_a_command() {
        let action = parse_bash_action("grep -r TODO /srv | wc -l");
        assert!(matches!(action.kind, ActionKind::Command { .. }));
        let stop = parse_bash_action("stop [42]");
        assert_eq!(stop.stop_answer(), Some("42"));
    }

    #[test]
    fn locator_chain_parses_and_validates() {
        let action =
            parse_browser_action("page.get_by_role(\"button\", name=\"Go\").click()", false)
                .unwrap();
        assert!(matches!(
            action.kind,
            ActionKind::Click {
                target: ElementTarget::Locator(_)
            }
        ));
    }

    #[test]
    fn locator_chain_splits_around_dots_in_strings() {
        let action =
            parse_browser_action("page.get_by_text(\"ex.ample\").click()", false).unwrap();
        let ActionKind::Click {
            target: ElementTarget::Locator(code),
        } = &action.kind
        else {
            panic!("expected locator click");
        };
        assert!(code.contains("ex.ample"));
    }

    #[test]
    fn locator_chain_rejects_unknown_methods() {
        let err = parse_browser_action("page.evaluate(\"alert(1)\")", false).unwrap_err();
        assert_eq!(err, ActionParseError::DisallowedMethod("evaluate".to_string()));
    }

    #[test]
    fn locator_chain_must_end_with_an_action() {
        let err = parse_browser_action("page.get_by_text(\"x\").first", false).unwrap_err();
        assert_eq!(err, ActionParseError::TrailingLocator("first".to_string()));
    }

    #[test]
    fn fill_extracts_typed_text() {
        let action =
            parse_browser_action("page.locator(\"#q\").fill(\"rust crates\")", false).unwrap();
        let ActionKind::Type { text, submit, .. } = &action.kind else {
            panic!("expected type action");
        };
        assert_eq!(text, "rust crates");
        assert!(!submit);
    }

    #[test]
    fn equivalence_follows_semantic_fields() {
        let a = parse_browser_action("scroll [down]", false).unwrap();
        let b = parse_browser_action("scroll down", false).unwrap();
        let c = parse_browser_action("scroll [up]", false).unwrap();
        assert!(a.is_equivalent(&b));
        assert!(!a.is_equivalent(&c));

        let click_a = parse_browser_action("click [3]", false).unwrap();
        let click_b = parse_browser_action("click [3]", false).unwrap();
        let click_c = parse_browser_action("click [4]", false).unwrap();
        assert!(click_a.is_equivalent(&click_b));
        assert!(!click_a.is_equivalent(&click_c));
    }

    #[test]
    fn parsing_failures_are_always_mutually_equivalent() {
        let e1 = parse_browser_action("launch the missiles", false).unwrap_err();
        let e2 = parse_browser_action("click without brackets 12", false).unwrap_err();
        let a = Action::parsing_failure("launch the missiles", &e1);
        let b = Action::parsing_failure("click without brackets 12", &e2);
        assert!(a.is_equivalent(&b));
    }

    #[test]
    fn key_combs_are_normalized() {
        let action = parse_browser_action("press [ctrl+a]", false).unwrap();
        assert_eq!(
            action.kind,
            ActionKind::Press {
                key_comb: "Control+a".to_string()
            }
        );
    }

    #[test]
    fn unresolved_verbs_carry_a_hint() {
        let err = parse_browser_action("click 42", false).unwrap_err();
        assert!(matches!(err, ActionParseError::Malformed { .. }));
        assert!(err.to_string().contains("square brackets"));
    }
}
