//! Trajectory scoring. Each evaluator maps a finished trajectory to a
//! score in [0, 1]; a task's evaluator set multiplies them, so every
//! criterion must pass for a non-zero result.

use anyhow::{anyhow, Result};
use tracing::warn;

use webtask_core::{EvalSpec, EvalType, TaskConfig, UrlMatchRule};
use webtask_env::{Environment, Trajectory};

/// Semantic answer comparison is delegated to an external judge.
pub trait FuzzyJudge: Send + Sync {
    /// Score the predicted answer against one reference, given the task
    /// goal for context. Returns a value in [0, 1].
    fn judge(&self, pred: &str, reference: &str, goal: &str) -> Result<f64>;
}

/// Fallback judge with no model behind it: pass iff the normalized
/// reference appears in the normalized answer.
pub struct ContainmentJudge;

impl FuzzyJudge for ContainmentJudge {
    fn judge(&self, pred: &str, reference: &str, _goal: &str) -> Result<f64> {
        if clean_answer(pred).contains(&clean_answer(reference)) {
            Ok(1.0)
        } else {
            Ok(0.0)
        }
    }
}

/// Strip one pair of matching surrounding quotes, then lowercase.
fn clean_answer(answer: &str) -> String {
    let trimmed = answer.trim();
    let unquoted = if (trimmed.starts_with('\'') && trimmed.ends_with('\'')
        || trimmed.starts_with('"') && trimmed.ends_with('"'))
        && trimmed.len() >= 2
    {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    };
    unquoted.to_lowercase()
}

fn as_score(passed: bool) -> f64 {
    if passed {
        1.0
    } else {
        0.0
    }
}

/// Scheme and trailing slash never decide a URL comparison.
fn clean_url(url: &str) -> &str {
    let url = url.strip_suffix('/').unwrap_or(url);
    let url = url.strip_prefix("http://").unwrap_or(url);
    url.strip_prefix("https://").unwrap_or(url)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluator {
    StringMatch,
    UrlMatch,
    HtmlContentMatch,
}

impl Evaluator {
    pub fn score(
        &self,
        trajectory: &Trajectory,
        env: &mut dyn Environment,
        config: &TaskConfig,
        judge: &dyn FuzzyJudge,
    ) -> Result<f64> {
        match self {
            Evaluator::StringMatch => string_match(trajectory, config.eval(), config.goal(), judge),
            Evaluator::UrlMatch => url_match(trajectory, config.eval()),
            Evaluator::HtmlContentMatch => html_content_match(env, config.eval()),
        }
    }
}

fn string_match(
    trajectory: &Trajectory,
    eval: &EvalSpec,
    goal: &str,
    judge: &dyn FuzzyJudge,
) -> Result<f64> {
    let pred = clean_answer(trajectory.final_answer().unwrap_or(""));
    let refs = eval
        .reference_answers
        .as_ref()
        .ok_or_else(|| anyhow!("string_match task has no reference answers"))?;
    let mut score = 1.0;
    if let Some(exact) = &refs.exact_match {
        score *= as_score(pred == clean_answer(exact));
    }
    if let Some(must_include) = &refs.must_include {
        for value in must_include {
            score *= as_score(pred.contains(&clean_answer(value)));
        }
    }
    if let Some(fuzzy) = &refs.fuzzy_match {
        for reference in fuzzy {
            score *= judge.judge(&pred, reference, goal)?;
        }
    }
    Ok(score)
}

fn url_match(trajectory: &Trajectory, eval: &EvalSpec) -> Result<f64> {
    let reference = eval
        .reference_url
        .as_deref()
        .ok_or_else(|| anyhow!("url_match task has no reference URL"))?;
    let Some(page_url) = trajectory.last_output().info.page_url.as_deref() else {
        return Ok(0.0);
    };
    let pred = clean_url(page_url);
    let refs: Vec<&str> = reference.split(" |OR| ").map(clean_url).collect();
    let matched = match eval.url_note.unwrap_or_default() {
        UrlMatchRule::Exact => refs.contains(&pred),
        UrlMatchRule::GoldInPred => refs.iter().any(|r| pred.contains(r)),
    };
    Ok(as_score(matched))
}

fn html_content_match(env: &mut dyn Environment, eval: &EvalSpec) -> Result<f64> {
    let browser = env
        .browser_mut()
        .ok_or_else(|| anyhow!("program_html evaluation needs a browser environment"))?;
    let mut score = 1.0;
    for target in &eval.program_html {
        // A page that cannot be read simply lacks the content.
        let content = match browser.fetch_content(&target.url, &target.locator) {
            Ok(content) => content,
            Err(e) => {
                warn!(url = %target.url, error = %e, "content fetch failed");
                String::new()
            }
        };
        let content = content.trim().to_lowercase();
        let satisfied = target
            .required_contents
            .split(" |OR| ")
            .map(|alt| alt.trim().to_lowercase())
            .any(|alt| content.contains(&alt));
        score *= as_score(satisfied);
    }
    Ok(score)
}

/// The evaluators a task selects, applied as a multiplicative AND.
pub struct EvaluatorSet {
    evaluators: Vec<Evaluator>,
}

impl EvaluatorSet {
    /// Route eval types to evaluators. Shell-only tasks support only
    /// string matching; there is no page to inspect.
    pub fn for_task(config: &TaskConfig) -> Result<Self> {
        let browser_capable = !matches!(config, TaskConfig::Bash(_));
        let mut evaluators = Vec::new();
        for eval_type in &config.eval().eval_types {
            let evaluator = match eval_type {
                EvalType::StringMatch => Evaluator::StringMatch,
                EvalType::UrlMatch if browser_capable => Evaluator::UrlMatch,
                EvalType::ProgramHtml if browser_capable => Evaluator::HtmlContentMatch,
                other => {
                    return Err(anyhow!(
                        "eval type {other:?} is not supported for task {}",
                        config.task_id()
                    ))
                }
            };
            evaluators.push(evaluator);
        }
        Ok(EvaluatorSet { evaluators })
    }

    /// Composite score: the product over all evaluators. Zero from any
    /// child zeroes the whole task.
    pub fn score(
        &self,
        trajectory: &Trajectory,
        env: &mut dyn Environment,
        config: &TaskConfig,
        judge: &dyn FuzzyJudge,
    ) -> Result<f64> {
        let mut score = 1.0;
        for evaluator in &self.evaluators {
            score *= evaluator.score(trajectory, env, config, judge)?;
        }
        Ok(score)
    }
}
