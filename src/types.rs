use std::{
    fmt,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FanoutError, Result};

// ── Run lifecycle ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    PlanGenerated,
    LaunchFailed,
    Launched,
    Summarized,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::PlanGenerated => "plan_generated",
            Self::LaunchFailed => "launch_failed",
            Self::Launched => "launched",
            Self::Summarized => "summarized",
            Self::Failed => "failed",
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::LaunchFailed)
    }

    /// Forward-only transitions. Failure states are terminal; `summarized` may
    /// be re-entered when summaries are regenerated.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Started, Self::PlanGenerated | Self::Failed)
                | (
                    Self::PlanGenerated,
                    Self::Launched | Self::LaunchFailed | Self::Failed
                )
                | (Self::Launched, Self::Summarized)
                | (Self::Summarized, Self::Summarized)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Summaries ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLabel {
    Completed,
    PartiallyCompleted,
    Failed,
    Unclear,
    Error,
}

impl StatusLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::PartiallyCompleted => "partially_completed",
            Self::Failed => "failed",
            Self::Unclear => "unclear",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
            Self::F => "F",
        }
    }

    pub fn from_letter(letter: &str) -> Option<Self> {
        match letter.trim().to_ascii_uppercase().as_str() {
            "A" => Some(Self::A),
            "B" => Some(Self::B),
            "C" => Some(Self::C),
            "D" => Some(Self::D),
            "F" => Some(Self::F),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub status_label: StatusLabel,
    pub grade: Grade,
    pub narrative: String,
}

impl TaskSummary {
    pub fn empty_log() -> Self {
        Self {
            status_label: StatusLabel::Unclear,
            grade: Grade::F,
            narrative: "empty log".to_string(),
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status_label: StatusLabel::Error,
            grade: Grade::F,
            narrative: reason.into(),
        }
    }
}

// ── Run and task records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: usize,
    pub description: String,
    pub target_files: Vec<String>,
    pub log_path: PathBuf,
    #[serde(default)]
    pub summary: Option<TaskSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub request_text: String,
    pub status: RunStatus,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub session_handle: Option<String>,
    #[serde(default)]
    pub raw_plan_response: Option<String>,
    #[serde(default)]
    pub requirements_doc: Option<String>,
    #[serde(default)]
    pub requirements_path: Option<String>,
    pub repo_root: PathBuf,
    #[serde(default)]
    pub config_path: Option<PathBuf>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(run_id: impl Into<String>, request_text: impl Into<String>, repo_root: &Path) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            request_text: request_text.into(),
            status: RunStatus::Started,
            tasks: Vec::new(),
            session_handle: None,
            raw_plan_response: None,
            requirements_doc: None,
            requirements_path: None,
            repo_root: repo_root.to_path_buf(),
            config_path: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn advance(&mut self, next: RunStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(FanoutError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Moves the run into a terminal failure state and records why.
    pub fn fail(&mut self, status: RunStatus, reason: impl Into<String>) -> Result<()> {
        debug_assert!(status.is_failure());
        self.advance(status)?;
        self.error = Some(reason.into());
        Ok(())
    }

    pub fn task(&self, task_id: usize) -> Option<&Task> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    pub fn all_summarized(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(|t| t.summary.is_some())
    }
}

/// Time-derived run identifier; lexicographic order is chronological order.
pub fn new_run_id() -> String {
    Local::now().format("%Y%m%d_%H%M%S_%3f").to_string()
}

// ── Run context ───────────────────────────────────────────────────────────────

/// Everything derived from a `run_id`, computed once and passed to every
/// component instead of being rebuilt from conventions at each call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub run_id: String,
    pub session_name: String,
    pub log_dir: PathBuf,
}

impl RunContext {
    pub fn new(run_id: &str, logs_root: &Path, session_prefix: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            session_name: format!("{session_prefix}{run_id}"),
            log_dir: logs_root.join(run_id),
        }
    }

    pub fn log_path(&self, task_id: usize) -> PathBuf {
        self.log_dir.join(format!("task_{task_id}.log"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_moves_forward_only() {
        assert!(RunStatus::Started.can_transition_to(RunStatus::PlanGenerated));
        assert!(RunStatus::PlanGenerated.can_transition_to(RunStatus::Launched));
        assert!(RunStatus::Launched.can_transition_to(RunStatus::Summarized));
        assert!(RunStatus::Summarized.can_transition_to(RunStatus::Summarized));
        assert!(!RunStatus::Launched.can_transition_to(RunStatus::PlanGenerated));
        assert!(!RunStatus::Summarized.can_transition_to(RunStatus::Launched));
        assert!(!RunStatus::Started.can_transition_to(RunStatus::Launched));
    }

    #[test]
    fn failure_states_are_terminal() {
        for next in [
            RunStatus::Started,
            RunStatus::PlanGenerated,
            RunStatus::Launched,
            RunStatus::Summarized,
            RunStatus::Failed,
        ] {
            assert!(!RunStatus::Failed.can_transition_to(next));
            assert!(!RunStatus::LaunchFailed.can_transition_to(next));
        }
        assert!(!RunStatus::Launched.can_transition_to(RunStatus::LaunchFailed));
    }

    #[test]
    fn fail_records_reason() {
        let mut run = Run::new("r1", "Add logging", Path::new("/repo"));
        run.advance(RunStatus::PlanGenerated).expect("forward");
        run.fail(RunStatus::LaunchFailed, "tmux not running")
            .expect("failure transition");
        assert_eq!(run.status, RunStatus::LaunchFailed);
        assert_eq!(run.error.as_deref(), Some("tmux not running"));
        assert!(run.advance(RunStatus::Launched).is_err());
    }

    #[test]
    fn run_context_derives_paths_from_run_id() {
        let ctx = RunContext::new("20240101_120000_000", Path::new("/tmp/logs"), "fanout_");
        assert_eq!(ctx.session_name, "fanout_20240101_120000_000");
        assert_eq!(
            ctx.log_path(3),
            PathBuf::from("/tmp/logs/20240101_120000_000/task_3.log")
        );
    }

    #[test]
    fn status_serializes_as_snake_case() {
        let json = serde_json::to_string(&RunStatus::PlanGenerated).unwrap();
        assert_eq!(json, "\"plan_generated\"");
        let label = serde_json::to_string(&StatusLabel::PartiallyCompleted).unwrap();
        assert_eq!(label, "\"partially_completed\"");
        assert_eq!(serde_json::to_string(&Grade::B).unwrap(), "\"B\"");
    }
}
