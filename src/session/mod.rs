//! Multiplexer-backed launch of one coding agent per task.
//!
//! Task `i` always runs in pane `i`, so logs, summaries and what the user sees
//! after attaching line up by position.

mod tmux;

use std::{fs, path::Path};

use tracing::{info, warn};

use crate::{
    error::{FanoutError, Result},
    types::{RunContext, Task},
};

pub use tmux::TmuxLauncher;

/// Written to a task log by the shell once the agent process exits.
pub const EXIT_MARKER: &str = "[fanout] agent exited with status";

/// The multiplexer operations a launch needs. Pane indices are returned by
/// the implementation so callers can check them against task ids.
pub trait ProcessLauncher: Send + Sync {
    fn session_exists(&self, session: &str) -> Result<bool>;
    /// Creates a detached session and returns the index of its first pane.
    fn create_session(&self, session: &str, cwd: &Path) -> Result<usize>;
    /// Creates pane `index` in an existing session and returns the index the
    /// multiplexer actually assigned.
    fn create_pane(&self, session: &str, index: usize, cwd: &Path) -> Result<usize>;
    fn run_in_pane(&self, session: &str, index: usize, command: &str) -> Result<()>;
    fn kill_session(&self, session: &str) -> Result<()>;
    /// argv that attaches the current terminal to `session`.
    fn attach_command(&self, session: &str) -> Vec<String>;
}

/// How each pane invokes the coding agent.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    pub model: String,
    pub completion_marker: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOutcome {
    pub session_handle: String,
    /// True when a session for this run already existed and nothing new was
    /// started.
    pub reused: bool,
}

/// Starts every task in its own pane of a session named after the run.
///
/// Re-launching a run whose session is alive is a no-op. Any failure after
/// the session is created tears the whole session down again.
pub fn launch(
    launcher: &dyn ProcessLauncher,
    ctx: &RunContext,
    repo_root: &Path,
    tasks: &[Task],
    agent: &AgentCommand,
) -> Result<LaunchOutcome> {
    if tasks.is_empty() {
        return Err(FanoutError::Launch("no tasks to launch".to_string()));
    }
    if let Some((pos, task)) = tasks.iter().enumerate().find(|(i, t)| t.task_id != *i) {
        return Err(FanoutError::Launch(format!(
            "task at position {pos} has id {}; tasks must be ordered by id",
            task.task_id
        )));
    }

    let session = ctx.session_name.as_str();
    if launcher.session_exists(session)? {
        info!(session, "session already running; reusing it");
        return Ok(LaunchOutcome {
            session_handle: session.to_string(),
            reused: true,
        });
    }

    fs::create_dir_all(&ctx.log_dir).map_err(|e| {
        FanoutError::Launch(format!(
            "cannot create log directory {}: {e}",
            ctx.log_dir.display()
        ))
    })?;

    let first = match launcher.create_session(session, repo_root) {
        Ok(first) => first,
        Err(err) => {
            // the session may exist even though its setup failed
            if launcher.session_exists(session).unwrap_or(true) {
                discard_session(launcher, session);
            }
            return Err(err);
        }
    };
    if let Err(err) = start_panes(launcher, session, first, repo_root, tasks, agent) {
        discard_session(launcher, session);
        return Err(err);
    }

    info!(session, panes = tasks.len(), "agents launched");
    Ok(LaunchOutcome {
        session_handle: session.to_string(),
        reused: false,
    })
}

fn discard_session(launcher: &dyn ProcessLauncher, session: &str) {
    if let Err(err) = launcher.kill_session(session) {
        warn!(session, error = %err, "failed to remove partial session");
    }
}

fn start_panes(
    launcher: &dyn ProcessLauncher,
    session: &str,
    first_pane: usize,
    repo_root: &Path,
    tasks: &[Task],
    agent: &AgentCommand,
) -> Result<()> {
    for task in tasks {
        let pane = if task.task_id == 0 {
            first_pane
        } else {
            launcher.create_pane(session, task.task_id, repo_root)?
        };
        if pane != task.task_id {
            return Err(FanoutError::Launch(format!(
                "pane index {pane} does not match task {}",
                task.task_id
            )));
        }
        let command = compose_agent_command(repo_root, task, agent);
        launcher.run_in_pane(session, pane, &command)?;
        info!(session, pane, log = %task.log_path.display(), "agent started");
    }
    Ok(())
}

/// Shell line run inside a pane. All output of the agent goes to the task log.
pub fn compose_agent_command(repo_root: &Path, task: &Task, agent: &AgentCommand) -> String {
    let log = shell_quote(&task.log_path.to_string_lossy());
    let mut words = vec![shell_quote(&agent.program)];
    words.extend(agent.args.iter().map(|a| shell_quote(a)));
    words.push("--model".to_string());
    words.push(shell_quote(&agent.model));
    words.push("--message".to_string());
    words.push(shell_quote(&task.description));
    words.extend(task.target_files.iter().map(|f| shell_quote(f)));

    let mut line = format!(
        "cd {} && {} > {log} 2>&1",
        shell_quote(&repo_root.to_string_lossy()),
        words.join(" ")
    );
    if agent.completion_marker {
        line.push_str(&format!("; echo \"{EXIT_MARKER} $?\" >> {log}"));
    }
    line
}

/// POSIX single-quote quoting.
pub fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// Fails early with a readable message when a required executable is not on
/// PATH.
pub fn preflight(programs: &[&str]) -> Result<()> {
    for program in programs {
        which::which(program).map_err(|_| {
            FanoutError::Configuration(format!("`{program}` was not found on PATH"))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::testing::{LauncherCall, RecordingLauncher};

    fn agent() -> AgentCommand {
        AgentCommand {
            program: "aider".to_string(),
            args: vec!["--yes".to_string()],
            model: "gpt-4o".to_string(),
            completion_marker: true,
        }
    }

    fn tasks(ctx: &RunContext, n: usize) -> Vec<Task> {
        (0..n)
            .map(|i| Task {
                task_id: i,
                description: format!("task {i}"),
                target_files: vec![format!("src/f{i}.rs")],
                log_path: ctx.log_path(i),
                summary: None,
            })
            .collect()
    }

    fn ctx(dir: &Path) -> RunContext {
        RunContext::new("r1", dir, "fanout_")
    }

    #[test]
    fn launches_each_task_in_matching_pane() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx(tmp.path());
        let launcher = RecordingLauncher::default();
        let tasks = tasks(&ctx, 3);

        let out = launch(&launcher, &ctx, Path::new("/repo"), &tasks, &agent()).unwrap();
        assert_eq!(out.session_handle, "fanout_r1");
        assert!(!out.reused);
        assert!(ctx.log_dir.is_dir());

        let runs: Vec<(usize, String)> = launcher
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                LauncherCall::Run(_, pane, cmd) => Some((pane, cmd)),
                _ => None,
            })
            .collect();
        assert_eq!(runs.len(), 3);
        for (i, (pane, cmd)) in runs.iter().enumerate() {
            assert_eq!(*pane, i);
            assert!(cmd.contains(&format!("'task {i}'")));
            assert!(cmd.contains(&format!("task_{i}.log")));
        }
    }

    #[test]
    fn existing_session_is_reused_without_pane_calls() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx(tmp.path());
        let launcher = RecordingLauncher::default();
        let tasks = tasks(&ctx, 2);

        launch(&launcher, &ctx, Path::new("/repo"), &tasks, &agent()).unwrap();
        let first_calls = launcher.calls().len();

        let again = launch(&launcher, &ctx, Path::new("/repo"), &tasks, &agent()).unwrap();
        assert!(again.reused);
        assert_eq!(again.session_handle, "fanout_r1");
        let calls = launcher.calls();
        assert_eq!(calls.len(), first_calls + 1);
        assert!(matches!(calls.last(), Some(LauncherCall::Exists(_))));
    }

    #[test]
    fn pane_failure_kills_session() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx(tmp.path());
        let launcher = RecordingLauncher::default().failing_pane(2);

        let err = launch(&launcher, &ctx, Path::new("/repo"), &tasks(&ctx, 3), &agent())
            .unwrap_err();
        assert!(matches!(err, FanoutError::Launch(_)));
        assert_eq!(
            launcher.calls().last(),
            Some(&LauncherCall::Kill("fanout_r1".to_string()))
        );
        assert!(!launcher.has_session("fanout_r1"));
    }

    #[test]
    fn session_setup_failure_kills_session_and_allows_relaunch() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx(tmp.path());
        let launcher = RecordingLauncher::default().failing_session_setup();
        let tasks = tasks(&ctx, 2);

        let err = launch(&launcher, &ctx, Path::new("/repo"), &tasks, &agent()).unwrap_err();
        assert!(matches!(err, FanoutError::Launch(_)));
        assert!(!launcher.has_session("fanout_r1"));
        assert!(launcher.calls().contains(&LauncherCall::Kill("fanout_r1".to_string())));

        // a later attempt must not mistake leftovers for a running session
        let again = launch(&launcher, &ctx, Path::new("/repo"), &tasks, &agent()).unwrap_err();
        assert!(matches!(again, FanoutError::Launch(_)));
        assert!(
            !launcher
                .calls()
                .iter()
                .any(|c| matches!(c, LauncherCall::Run(..)))
        );
    }

    #[test]
    fn misnumbered_pane_kills_session() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx(tmp.path());
        let launcher = RecordingLauncher::default().misnumbered_pane(1);

        let err = launch(&launcher, &ctx, Path::new("/repo"), &tasks(&ctx, 2), &agent())
            .unwrap_err();
        assert!(err.to_string().contains("does not match task 1"));
        assert!(launcher.calls().contains(&LauncherCall::Kill("fanout_r1".to_string())));
        // task 1 must never have been started in the wrong pane
        let runs = launcher
            .calls()
            .into_iter()
            .filter(|c| matches!(c, LauncherCall::Run(..)))
            .count();
        assert_eq!(runs, 1);
    }

    #[test]
    fn out_of_order_tasks_are_rejected_before_any_call() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx(tmp.path());
        let launcher = RecordingLauncher::default();
        let mut tasks = tasks(&ctx, 2);
        tasks.swap(0, 1);

        assert!(launch(&launcher, &ctx, Path::new("/repo"), &tasks, &agent()).is_err());
        assert!(launcher.calls().is_empty());
        assert!(launch(&launcher, &ctx, Path::new("/repo"), &[], &agent()).is_err());
    }

    #[test]
    fn command_quotes_every_word_and_appends_marker() {
        let task = Task {
            task_id: 0,
            description: "Don't break $HOME".to_string(),
            target_files: vec!["src/a b.rs".to_string()],
            log_path: PathBuf::from("/logs/r1/task_0.log"),
            summary: None,
        };
        let cmd = compose_agent_command(Path::new("/work/repo"), &task, &agent());
        assert_eq!(
            cmd,
            "cd '/work/repo' && 'aider' '--yes' --model 'gpt-4o' --message 'Don'\\''t break $HOME' \
             'src/a b.rs' > '/logs/r1/task_0.log' 2>&1; \
             echo \"[fanout] agent exited with status $?\" >> '/logs/r1/task_0.log'"
        );

        let quiet = AgentCommand {
            completion_marker: false,
            ..agent()
        };
        assert!(!compose_agent_command(Path::new("/r"), &task, &quiet).contains(EXIT_MARKER));
    }

    #[test]
    fn preflight_reports_missing_program() {
        let err = preflight(&["definitely-not-a-real-binary-xyz"]).unwrap_err();
        assert!(err.to_string().contains("definitely-not-a-real-binary-xyz"));
    }
}
