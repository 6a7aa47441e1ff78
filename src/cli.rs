//! Command-line surface: `fanout orchestrate` and the `fanout runs ...`
//! inspection commands.

use std::{
    io::{self, BufRead, IsTerminal, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;

use crate::{
    config::{Config, DEFAULT_CONFIG_FILE, Defaults},
    inspect,
    llm::{HttpCompletionClient, build_http_client},
    orchestrator::{OrchestrateOutcome, Orchestrator},
    session::{self, TmuxLauncher},
    store::RunStore,
};

/// Fan a change request out to parallel aider agents in tmux.
#[derive(Parser)]
#[command(name = "fanout", version)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, env = "FANOUT_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Plan a change with a model and launch one agent per task.
    Orchestrate {
        /// Natural-language description of the change.
        change_request: String,

        /// Repository to work in (overrides `defaults.repo_path`).
        #[arg(long)]
        repo_path: Option<PathBuf>,

        /// Launch without asking for confirmation.
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Inspect recorded runs.
    Runs {
        #[command(subcommand)]
        command: RunsCommand,
    },
}

#[derive(Subcommand)]
pub enum RunsCommand {
    /// List all runs, newest first.
    List,

    /// Show one run with its tasks and summaries.
    Show { run_id: String },

    /// Print or page the log of one task.
    Log {
        run_id: String,
        task_id: usize,

        /// Pager command (defaults to `defaults.pager`, then `$PAGER`).
        #[arg(long, conflicts_with = "no_pager")]
        pager: Option<String>,

        /// Print the log directly.
        #[arg(long)]
        no_pager: bool,

        /// Print only the last N lines.
        #[arg(long, short = 'n')]
        lines: Option<usize>,
    },

    /// Print the command that attaches to a run's tmux session.
    Attach { run_id: String },

    /// Grade every task log of a launched run.
    Summarize {
        run_id: String,

        /// Regenerate summaries that already exist.
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Orchestrate {
                change_request,
                repo_path,
                yes,
            } => {
                let mut config = load_config(&self.config)?;
                if let Some(repo) = repo_path {
                    config.defaults.repo_path = repo.display().to_string();
                }
                let store = RunStore::new(config.state_dir());
                let launcher = TmuxLauncher::default();
                session::preflight(&[launcher.program(), config.defaults.agent_command.as_str()])?;
                let client = HttpCompletionClient::new(build_http_client()?);
                let orchestrator = Orchestrator {
                    config: &config,
                    client: &client,
                    launcher: &launcher,
                    store: &store,
                };
                let mut confirm = |n: usize| yes || ask_to_proceed(n);
                let outcome = orchestrator
                    .orchestrate(&change_request, &mut confirm, &mut io::stdout())
                    .await?;
                if let OrchestrateOutcome::Launched { reused: true, run_id, .. } = outcome {
                    println!("Session for run {run_id} was already running; nothing new started.");
                }
                Ok(())
            }
            Commands::Runs { command } => run_inspect(command, &self.config).await,
        }
    }
}

fn load_config(path: &Path) -> Result<Config> {
    let config = Config::load(path)?;
    debug!(config = %path.display(), "configuration loaded");
    Ok(config)
}

/// Only `summarize` needs the model tables; the read-only commands get by
/// with the state directory and the pager.
async fn run_inspect(command: RunsCommand, config_path: &Path) -> Result<()> {
    let defaults = Defaults::load(config_path)?;
    let store = RunStore::new(defaults.state_dir());
    match command {
        RunsCommand::List => {
            let runs = store.list_all()?;
            print!("{}", inspect::render_run_table(&runs, io::stdout().is_terminal()));
        }
        RunsCommand::Show { run_id } => {
            let run = store.load(&run_id)?;
            print!("{}", inspect::render_run_detail(&run));
        }
        RunsCommand::Log {
            run_id,
            task_id,
            pager,
            no_pager,
            lines,
        } => {
            let run = store.load(&run_id)?;
            let task = inspect::resolve_task(&run, task_id)?;
            if let Some(n) = lines {
                let text = inspect::tail_lines(&task.log_path, n)
                    .with_context(|| format!("cannot read {}", task.log_path.display()))?;
                print!("{text}");
                return Ok(());
            }
            let pager = if no_pager || !io::stdout().is_terminal() {
                None
            } else {
                pager
                    .or_else(|| defaults.pager.clone())
                    .or_else(|| std::env::var("PAGER").ok())
                    .filter(|p| !p.trim().is_empty())
            };
            inspect::show_log(&task.log_path, pager.as_deref())?;
        }
        RunsCommand::Attach { run_id } => {
            let run = store.load(&run_id)?;
            println!("{}", inspect::attach_hint(&run, &TmuxLauncher::default())?);
        }
        RunsCommand::Summarize { run_id, force } => {
            let config = load_config(config_path)?;
            let store = RunStore::new(config.state_dir());
            let client = HttpCompletionClient::new(build_http_client()?);
            let launcher = TmuxLauncher::default();
            let orchestrator = Orchestrator {
                config: &config,
                client: &client,
                launcher: &launcher,
                store: &store,
            };
            let run = orchestrator.summarize_run(&run_id, force).await?;
            print!("{}", inspect::render_summaries(&run));
        }
    }
    Ok(())
}

/// `[Y/n]` prompt on the terminal; end of input counts as "no".
fn ask_to_proceed(agents: usize) -> bool {
    print!("Proceed with {agents} agents? [Y/n] ");
    if io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    match io::stdin().lock().read_line(&mut answer) {
        Ok(0) | Err(_) => false,
        Ok(_) => is_yes(&answer),
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "" | "y" | "yes")
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_orchestrate_with_global_config() {
        let cli = Cli::try_parse_from([
            "fanout",
            "orchestrate",
            "Add logging",
            "--config",
            "custom.toml",
            "--repo-path",
            "/work",
            "--yes",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("custom.toml"));
        let Commands::Orchestrate {
            change_request,
            repo_path,
            yes,
        } = cli.command
        else {
            panic!("expected orchestrate");
        };
        assert_eq!(change_request, "Add logging");
        assert_eq!(repo_path, Some(PathBuf::from("/work")));
        assert!(yes);
    }

    #[test]
    fn log_pager_flags_conflict() {
        let both = Cli::try_parse_from([
            "fanout", "runs", "log", "r1", "0", "--pager", "less", "--no-pager",
        ]);
        assert!(both.is_err());

        let cli = Cli::try_parse_from(["fanout", "runs", "log", "r1", "2", "--lines", "50"]).unwrap();
        let Commands::Runs {
            command: RunsCommand::Log { task_id, lines, .. },
        } = cli.command
        else {
            panic!("expected runs log");
        };
        assert_eq!(task_id, 2);
        assert_eq!(lines, Some(50));
    }

    #[test]
    fn empty_answer_means_yes() {
        assert!(is_yes("\n"));
        assert!(is_yes("Y\n"));
        assert!(is_yes("yes"));
        assert!(!is_yes("n\n"));
        assert!(!is_yes("nope"));
    }
}
