//! Change request -> requirements document + parallel task breakdown.
//!
//! The model is asked for markdown followed by one fenced JSON block. A reply
//! whose block is missing, unparsable or inconsistent still yields the
//! requirements text; only the breakdown degrades to `None`.

use std::{collections::HashSet, sync::LazyLock};

use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    config::ModelConfig,
    error::{FanoutError, Result},
    llm::CompletionClient,
    types::{RunContext, Task},
};

static JSON_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json[ \t]*\r?\n?(.*?)```").expect("valid regex"));
static ANY_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z0-9_+-]*[ \t]*\r?\n?(.*?)```").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTask {
    pub task_id: usize,
    pub description: String,
    pub target_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskBreakdown {
    pub declared_count: usize,
    pub tasks: Vec<PlannedTask>,
}

#[derive(Debug, Clone)]
pub struct PlanOutput {
    pub requirements_doc: String,
    pub breakdown: Option<TaskBreakdown>,
    pub raw_response: String,
}

#[derive(Deserialize)]
struct RawBreakdown {
    suggested_num_agents: usize,
    agents: Vec<RawAgent>,
}

#[derive(Deserialize)]
struct RawAgent {
    agent_id: usize,
    task_description: String,
    target_files: Vec<String>,
}

/// Issues exactly one planning request. Only a failed model call is an error.
pub async fn generate_plan(
    client: &dyn CompletionClient,
    change_request: &str,
    context_text: &str,
    model: &ModelConfig,
    prompt_context_chars: usize,
) -> Result<PlanOutput> {
    let prompt = build_plan_prompt(change_request, context_text, prompt_context_chars);
    let raw_response = client
        .complete(model, &prompt)
        .await
        .map_err(|e| FanoutError::PlanGeneration(format!("{e:#}")))?;

    let (requirements_doc, breakdown) = parse_plan_response(&raw_response);
    match &breakdown {
        Some(b) => info!(tasks = b.tasks.len(), "plan parsed"),
        None => warn!("plan reply has no valid task breakdown; parallel launch unavailable"),
    }
    Ok(PlanOutput {
        requirements_doc,
        breakdown,
        raw_response,
    })
}

pub fn build_plan_prompt(change_request: &str, context_text: &str, context_chars: usize) -> String {
    let context: String = context_text.chars().take(context_chars).collect();
    let note = if context.len() < context_text.len() {
        "(Context truncated for brevity)"
    } else {
        ""
    };
    format!(
        "You are an expert software architect and project manager. Produce a requirements \
         document and a parallel implementation plan for the proposed change below.\n\n\
         **Proposed Change:**\n{change_request}\n\n\
         **Current Repository Context:**\n```\n{context}\n```\n{note}\n\n\
         **Instructions:**\n\
         1. Analyze the change against the repository structure and files.\n\
         2. Write the requirements as markdown: Goal, Scope (included and excluded), \
         High-Level Requirements, Implementation Plan.\n\
         3. Split the implementation into tasks that independent `aider` agents can run in \
         parallel. Agents should touch separate, non-conflicting files where possible.\n\
         4. After the markdown, output exactly one fenced block tagged json with this shape \
         and nothing after it:\n\n\
         ```json\n\
         {{\n  \"suggested_num_agents\": 2,\n  \"agents\": [\n    {{\"agent_id\": 0, \
         \"task_description\": \"Precise instructions for agent 0\", \"target_files\": \
         [\"path/to/file.py\", \"path/to/dir/\"]}},\n    {{\"agent_id\": 1, \
         \"task_description\": \"Precise instructions for agent 1\", \"target_files\": \
         [\"path/to/other.js\"]}}\n  ]\n}}\n\
         ```\n\n\
         Rules: suggested_num_agents must equal the number of agent objects; agent_id values \
         are 0, 1, 2, ... in order; the JSON must be valid with no comments."
    )
}

/// Splits a planning reply into the requirements text and, when the
/// structured block parses and validates, the task breakdown.
pub fn parse_plan_response(text: &str) -> (String, Option<TaskBreakdown>) {
    for (start, candidate) in breakdown_candidates(text) {
        let Some(raw) = parse_raw(&candidate) else {
            continue;
        };
        match validate(raw) {
            Ok(breakdown) => {
                let requirements = text[..start].trim().to_string();
                let requirements = if requirements.is_empty() {
                    text.trim().to_string()
                } else {
                    requirements
                };
                return (requirements, Some(breakdown));
            }
            Err(reason) => warn!(%reason, "task breakdown rejected"),
        }
    }
    (text.trim().to_string(), None)
}

/// Candidate JSON objects paired with the byte offset where their block
/// starts, in priority order: ```json fence, any fence, outermost braces.
fn breakdown_candidates(text: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    if let Some(caps) = JSON_FENCE.captures(text) {
        if let (Some(all), Some(body)) = (caps.get(0), caps.get(1)) {
            out.push((all.start(), body.as_str().trim().to_string()));
        }
    }
    for caps in ANY_FENCE.captures_iter(text) {
        let (Some(all), Some(body)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if let Some(obj) = outermost_object(body.as_str()) {
            out.push((all.start(), obj));
        }
    }
    if let (Some(start), Some(obj)) = (text.find('{'), outermost_object(text)) {
        out.push((start, obj));
    }
    out
}

fn outermost_object(raw: &str) -> Option<String> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(raw[start..=end].to_string())
}

fn parse_raw(candidate: &str) -> Option<RawBreakdown> {
    serde_json::from_str(candidate)
        .ok()
        .or_else(|| serde_json::from_str(&strip_line_comments(candidate)).ok())
}

/// Drops `// ...` comments outside string literals; models sometimes echo
/// commented examples back.
fn strip_line_comments(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;
    while let Some(ch) = chars.next() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            '/' if chars.peek() == Some(&'/') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            _ => out.push(ch),
        }
    }
    out
}

fn validate(raw: RawBreakdown) -> std::result::Result<TaskBreakdown, String> {
    if raw.agents.is_empty() {
        return Err("breakdown lists no agents".to_string());
    }
    if raw.suggested_num_agents != raw.agents.len() {
        return Err(format!(
            "declared {} agents but listed {}",
            raw.suggested_num_agents,
            raw.agents.len()
        ));
    }

    let mut tasks = Vec::with_capacity(raw.agents.len());
    for (idx, agent) in raw.agents.into_iter().enumerate() {
        if agent.agent_id != idx {
            return Err(format!(
                "agent at position {idx} has id {}; ids must run 0..N-1",
                agent.agent_id
            ));
        }
        let description = agent.task_description.trim();
        if description.is_empty() {
            return Err(format!("agent {idx} has an empty task description"));
        }
        tasks.push(PlannedTask {
            task_id: idx,
            description: description.to_string(),
            target_files: dedup_paths(agent.target_files),
        });
    }

    Ok(TaskBreakdown {
        declared_count: raw.suggested_num_agents,
        tasks,
    })
}

fn dedup_paths<I>(paths: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    paths
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .filter(|p| seen.insert(p.clone()))
        .collect()
}

impl TaskBreakdown {
    /// Binds planned tasks to a run: log paths come from the run context, the
    /// requirements document and default context files join every file list.
    pub fn into_tasks(
        self,
        ctx: &RunContext,
        requirements_path: &str,
        default_context_files: &[String],
    ) -> Vec<Task> {
        self.tasks
            .into_iter()
            .map(|planned| {
                let files = planned
                    .target_files
                    .into_iter()
                    .chain(std::iter::once(requirements_path.to_string()))
                    .chain(default_context_files.iter().cloned());
                Task {
                    task_id: planned.task_id,
                    description: planned.description,
                    target_files: dedup_paths(files),
                    log_path: ctx.log_path(planned.task_id),
                    summary: None,
                }
            })
            .collect()
    }
}
