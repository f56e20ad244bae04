//! Prompt rendering for the planner and executor agents.
//!
//! Templates mark sections with `<!-- section:KEY required|droppable -->`.
//! When a rendered prompt exceeds its byte budget, droppable sections are
//! removed first and the last remaining section is truncated as a last resort.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::io::agent::{ExecRequest, PlanRequest};

const PLAN_TEMPLATE: &str = include_str!("../prompts/plan.md");
const EXECUTE_TEMPLATE: &str = include_str!("../prompts/execute.md");

/// Default prompt budget in bytes.
pub const DEFAULT_BUDGET_BYTES: usize = 64_000;

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker regex is valid")
});

/// Drop order when over budget: oldest context first.
const DROP_ORDER: [&str; 3] = ["previous", "skills", "failures"];

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

fn environment() -> Result<Environment<'static>> {
    let mut env = Environment::new();
    env.add_template("plan", PLAN_TEMPLATE)
        .context("load plan template")?;
    env.add_template("execute", EXECUTE_TEMPLATE)
        .context("load execute template")?;
    Ok(env)
}

pub fn render_plan_prompt(request: &PlanRequest, budget_bytes: usize) -> Result<String> {
    let env = environment()?;
    let rendered = env
        .get_template("plan")?
        .render(context! {
            iteration => request.iteration,
            goal => request.goal.trim(),
            workflow_dir => request.workflow_dir.display().to_string(),
            gates => &request.gates,
            failures => &request.last_failures,
            skills => &request.skills,
            previous_plan => request.previous_plan.as_deref().map(str::trim).filter(|s| !s.is_empty()),
        })
        .context("render plan prompt")?;
    Ok(fit_to_budget(&rendered, budget_bytes))
}

pub fn render_execute_prompt(request: &ExecRequest, budget_bytes: usize) -> Result<String> {
    let env = environment()?;
    let rendered = env
        .get_template("execute")?
        .render(context! {
            iteration => request.iteration,
            goal => request.goal.trim(),
            workflow_dir => request.workflow_dir.display().to_string(),
            plan => request.plan.trim(),
        })
        .context("render execute prompt")?;
    Ok(fit_to_budget(&rendered, budget_bytes))
}

fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn fit_to_budget(rendered: &str, budget: usize) -> String {
    let mut sections = parse_sections(rendered);
    let total = |secs: &[Section]| secs.iter().map(|s| s.content.len()).sum::<usize>();

    for key in DROP_ORDER {
        if total(&sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(section = key, bytes_dropped = sections[idx].content.len(), "dropped prompt section");
            sections.remove(idx);
        }
    }

    if total(&sections) > budget
        && let Some((last, rest)) = sections.split_last_mut()
    {
        let allowed = budget.saturating_sub(total(rest));
        if last.content.len() > allowed {
            let mut cut = allowed.saturating_sub(12);
            while !last.content.is_char_boundary(cut) {
                cut -= 1;
            }
            last.content.truncate(cut);
            last.content.push_str("\n[truncated]");
            debug!(section = %last.key, "truncated prompt section");
        }
    }

    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}
