use std::{
    path::Path,
    process::{Command, Output},
};

use tracing::debug;

use super::ProcessLauncher;
use crate::error::{FanoutError, Result};

/// tmux-backed launcher. Each task gets its own window; window `i` is
/// addressed as `<session>:i`.
#[derive(Debug, Clone)]
pub struct TmuxLauncher {
    program: String,
}

impl Default for TmuxLauncher {
    fn default() -> Self {
        Self {
            program: "tmux".to_string(),
        }
    }
}

impl TmuxLauncher {
    pub fn program(&self) -> &str {
        &self.program
    }

    fn output(&self, args: &[&str]) -> Result<Output> {
        debug!(program = %self.program, ?args, "tmux");
        Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|e| FanoutError::Launch(format!("failed to run `{}`: {e}", self.program)))
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.output(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FanoutError::Launch(format!(
                "`{} {}` exited with {}: {}",
                self.program,
                args.first().copied().unwrap_or_default(),
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn parse_index(raw: &str) -> Result<usize> {
    raw.lines()
        .next()
        .unwrap_or_default()
        .trim()
        .parse()
        .map_err(|_| FanoutError::Launch(format!("unexpected window index `{raw}` from tmux")))
}

fn target(session: &str, index: usize) -> String {
    format!("{}:{index}", exact(session))
}

/// `=` disables tmux's prefix and pattern matching of session names.
fn exact(session: &str) -> String {
    format!("={session}")
}

/// Inside an existing tmux client, switching is the only way to reach
/// another session without nesting.
fn attach_args(program: &str, session: &str, inside_tmux: bool) -> Vec<String> {
    let verb = if inside_tmux {
        "switch-client"
    } else {
        "attach-session"
    };
    [program, verb, "-t", &exact(session)]
        .into_iter()
        .map(str::to_string)
        .collect()
}

impl ProcessLauncher for TmuxLauncher {
    fn session_exists(&self, session: &str) -> Result<bool> {
        // non-zero covers both "no such session" and "no server running"
        Ok(self
            .output(&["has-session", "-t", &exact(session)])?
            .status
            .success())
    }

    fn create_session(&self, session: &str, cwd: &Path) -> Result<usize> {
        let cwd = cwd.to_string_lossy();
        let raw = self.run(&[
            "new-session",
            "-d",
            "-s",
            session,
            "-c",
            &cwd,
            "-P",
            "-F",
            "#{window_index}",
        ])?;
        let index = parse_index(&raw)?;
        if index != 0 {
            // base-index in the user's tmux.conf; renumber so pane 0 is task 0
            self.run(&["move-window", "-s", &target(session, index), "-t", &target(session, 0)])?;
        }
        Ok(0)
    }

    fn create_pane(&self, session: &str, index: usize, cwd: &Path) -> Result<usize> {
        let cwd = cwd.to_string_lossy();
        let raw = self.run(&[
            "new-window",
            "-d",
            "-t",
            &target(session, index),
            "-c",
            &cwd,
            "-P",
            "-F",
            "#{window_index}",
        ])?;
        parse_index(&raw)
    }

    fn run_in_pane(&self, session: &str, index: usize, command: &str) -> Result<()> {
        self.run(&["send-keys", "-t", &target(session, index), command, "C-m"])?;
        Ok(())
    }

    fn kill_session(&self, session: &str) -> Result<()> {
        self.run(&["kill-session", "-t", &exact(session)])?;
        Ok(())
    }

    fn attach_command(&self, session: &str) -> Vec<String> {
        attach_args(&self.program, session, std::env::var_os("TMUX").is_some())
    }
}
