//! Post-hoc grading of task logs.

use std::{
    collections::BTreeMap,
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::Path,
    sync::LazyLock,
};

use regex::Regex;
use tracing::{info, warn};

use crate::{
    config::ModelConfig,
    llm::CompletionClient,
    types::{Grade, Run, StatusLabel, Task, TaskSummary},
};

static ANSI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("valid regex"));
static STATUS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[\s*_#>-]*status[\s*_]*:[\s*_]*(.+?)[\s*_]*$").expect("valid regex")
});
static GRADE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[\s*_#>-]*grade[\s*_]*:[\s*_\[]*([A-F])\b").expect("valid regex")
});
static DETAILS_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ims)^[\s*_#>-]*details[\s*_]*:[\s*_]*(.*)").expect("valid regex")
});

/// A log read, possibly cut to its most recent bytes.
struct LogTail {
    text: String,
    truncated: bool,
}

/// Summarizes every task of `run` in task order. Never fails as a whole:
/// problems with one task become an `error` summary for that task.
pub async fn summarize(
    client: &dyn CompletionClient,
    run: &Run,
    model: &ModelConfig,
    max_log_bytes: u64,
) -> BTreeMap<usize, TaskSummary> {
    let mut tasks: Vec<&Task> = run.tasks.iter().collect();
    tasks.sort_by_key(|t| t.task_id);

    let mut out = BTreeMap::new();
    for task in tasks {
        let summary = summarize_task(client, task, model, max_log_bytes).await;
        info!(
            run_id = %run.run_id,
            task_id = task.task_id,
            status = summary.status_label.as_str(),
            grade = summary.grade.as_str(),
            "task summarized"
        );
        out.insert(task.task_id, summary);
    }
    out
}

/// Copies summaries into their tasks. Other task fields stay untouched.
pub fn apply_summaries(run: &mut Run, summaries: BTreeMap<usize, TaskSummary>) {
    for (task_id, summary) in summaries {
        if let Some(task) = run.tasks.iter_mut().find(|t| t.task_id == task_id) {
            task.summary = Some(summary);
        }
    }
}

async fn summarize_task(
    client: &dyn CompletionClient,
    task: &Task,
    model: &ModelConfig,
    max_log_bytes: u64,
) -> TaskSummary {
    let log = match read_log_tail(&task.log_path, max_log_bytes) {
        Ok(log) => log,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(task_id = task.task_id, path = %task.log_path.display(), "log file missing");
            return TaskSummary::error(format!(
                "log file not found at {}",
                task.log_path.display()
            ));
        }
        Err(e) => {
            warn!(task_id = task.task_id, error = %e, "log file unreadable");
            return TaskSummary::error(format!("failed to read log file: {e}"));
        }
    };

    if log.text.trim().is_empty() {
        warn!(task_id = task.task_id, "log file is empty");
        return TaskSummary::empty_log();
    }

    let prompt = build_summary_prompt(task, &log);
    match client.complete(model, &prompt).await {
        Ok(reply) => parse_summary(&reply),
        Err(e) => {
            warn!(task_id = task.task_id, error = %e, "summary request failed");
            TaskSummary::error(format!("summary request failed: {e:#}"))
        }
    }
}

fn read_log_tail(path: &Path, max_bytes: u64) -> std::io::Result<LogTail> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let truncated = len > max_bytes;
    if truncated {
        file.seek(SeekFrom::Start(len - max_bytes))?;
    }
    let mut raw = Vec::with_capacity(len.min(max_bytes) as usize);
    file.take(max_bytes).read_to_end(&mut raw)?;

    let mut text = String::from_utf8_lossy(&raw).into_owned();
    if truncated {
        // drop the partial first line
        if let Some(nl) = text.find('\n') {
            text.drain(..=nl);
        }
    }
    let text = ANSI.replace_all(&text, "").into_owned();
    Ok(LogTail { text, truncated })
}

fn build_summary_prompt(task: &Task, log: &LogTail) -> String {
    let id = task.task_id;
    let note = if log.truncated {
        "(Only the most recent part of the log is shown)"
    } else {
        ""
    };
    format!(
        "You are reviewing the work of an AI coding agent (`aider`).\n\
         Analyze the log of Agent {id}, who was tasked with:\n\n\
         **Task Description:**\n{}\n\n\
         **Agent {id} Log:**\n```log\n{}\n```\n{note}\n\n\
         **Instructions:**\n\
         1. Summarize what the agent attempted and what the outcome was according to the log.\n\
         2. Decide from this log alone whether the task was completed. State exactly one of: \
         Completed, Partially Completed, Failed, Unclear.\n\
         3. Note significant actions, errors, and files created or modified.\n\
         4. Assign a letter grade:\n\
         A: completed with no major issues.\n\
         B: mostly completed, minor issues or workarounds.\n\
         C: partially completed, significant issues.\n\
         D: attempted but failed due to errors or inability to apply changes.\n\
         F: no progress, stuck in loops, or unusable results.\n\n\
         **Output Format:**\n\
         Status: <Completed|Partially Completed|Failed|Unclear>\n\
         Grade: <A|B|C|D|F>\n\
         Details:\n<summary of key events, changes, errors and outcome>",
        task.description, log.text
    )
}

/// Missing fields fall back to `unclear` / `F`; the narrative falls back to
/// the whole reply.
pub fn parse_summary(reply: &str) -> TaskSummary {
    let status_label = STATUS_LINE
        .captures(reply)
        .and_then(|c| c.get(1))
        .map(|m| parse_status(m.as_str()))
        .unwrap_or(StatusLabel::Unclear);
    let grade = GRADE_LINE
        .captures(reply)
        .and_then(|c| c.get(1))
        .and_then(|m| Grade::from_letter(m.as_str()))
        .unwrap_or(Grade::F);
    let narrative = DETAILS_BLOCK
        .captures(reply)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| reply.trim().to_string());

    TaskSummary {
        status_label,
        grade,
        narrative,
    }
}

fn parse_status(raw: &str) -> StatusLabel {
    let value = raw.trim_matches(|c: char| !c.is_alphanumeric()).to_ascii_lowercase();
    if value.starts_with("partial") {
        StatusLabel::PartiallyCompleted
    } else if value.starts_with("complete") {
        StatusLabel::Completed
    } else if value.starts_with("fail") {
        StatusLabel::Failed
    } else if value.starts_with("error") {
        StatusLabel::Error
    } else {
        StatusLabel::Unclear
    }
}
