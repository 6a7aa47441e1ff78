//! The plan -> launch pipeline and the summarize step, with the run record
//! persisted after every state change.

use std::{fs, io::Write, path::Path};

use tracing::{error, info, warn};

use crate::{
    config::Config,
    context,
    error::{FanoutError, Result},
    inspect,
    llm::CompletionClient,
    plan,
    session::{self, AgentCommand, ProcessLauncher},
    store::RunStore,
    summarize,
    types::{Run, RunContext, RunStatus, new_run_id},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrateOutcome {
    Launched {
        run_id: String,
        session_handle: String,
        reused: bool,
    },
    /// The plan reply had no usable task breakdown; only the requirements
    /// document was produced.
    PlanOnly { run_id: String },
    /// The user declined the confirmation prompt.
    Declined { run_id: String },
}

pub struct Orchestrator<'a> {
    pub config: &'a Config,
    pub client: &'a dyn CompletionClient,
    pub launcher: &'a dyn ProcessLauncher,
    pub store: &'a RunStore,
}

impl Orchestrator<'_> {
    /// Runs context extraction, planning and launch for one change request.
    ///
    /// Configuration and repository problems fail before a run record
    /// exists. Later failures are recorded on the run (`failed` or
    /// `launch_failed`) and then returned.
    pub async fn orchestrate(
        &self,
        change_request: &str,
        confirm: &mut dyn FnMut(usize) -> bool,
        out: &mut dyn Write,
    ) -> Result<OrchestrateOutcome> {
        let defaults = &self.config.defaults;
        let repo_root = self.config.repo_root();
        if !repo_root.is_dir() {
            return Err(FanoutError::RepositoryAccess(format!(
                "{} is not a directory",
                repo_root.display()
            )));
        }
        let model = self.config.planner_model()?;
        let context_text = context::extract_context(
            &repo_root,
            defaults.max_file_bytes,
            defaults.max_context_bytes,
        )?;

        let mut run = Run::new(new_run_id(), change_request, &repo_root);
        run.config_path = self.config.source.clone();
        self.store.save(&run)?;
        info!(run_id = %run.run_id, repo = %repo_root.display(), "run started");

        let planned = match plan::generate_plan(
            self.client,
            change_request,
            &context_text,
            &model,
            defaults.prompt_context_chars,
        )
        .await
        {
            Ok(planned) => planned,
            Err(e) => return Err(self.record_failure(&mut run, RunStatus::Failed, e)),
        };

        run.raw_plan_response = Some(planned.raw_response);
        run.requirements_doc = Some(planned.requirements_doc.clone());
        run.advance(RunStatus::PlanGenerated)?;
        self.store.save(&run)?;

        let requirements_path = match write_requirements(
            &repo_root,
            &defaults.requirements_dir,
            &run.run_id,
            &planned.requirements_doc,
        ) {
            Ok(path) => path,
            Err(e) => return Err(self.record_failure(&mut run, RunStatus::Failed, e)),
        };
        run.requirements_path = Some(requirements_path.clone());
        self.store.save(&run)?;
        writeln!(out, "Requirements written to {requirements_path}")?;

        let Some(breakdown) = planned.breakdown else {
            warn!(run_id = %run.run_id, "no valid task breakdown; stopping before launch");
            writeln!(out, "\n{}\n", planned.requirements_doc)?;
            writeln!(
                out,
                "The plan has no valid task breakdown, so no agents were launched (run {}).",
                run.run_id
            )?;
            return Ok(OrchestrateOutcome::PlanOnly { run_id: run.run_id });
        };

        let ctx = RunContext::new(
            &run.run_id,
            &self.config.logs_dir(),
            &defaults.tmux_session_prefix,
        );
        run.tasks = breakdown.into_tasks(&ctx, &requirements_path, &defaults.default_context_files);
        self.store.save(&run)?;

        write!(
            out,
            "{}",
            inspect::render_plan_overview(&repo_root, &planned.requirements_doc, &run.tasks)
        )?;
        if !confirm(run.tasks.len()) {
            writeln!(out, "Launch cancelled; run {} kept as plan_generated.", run.run_id)?;
            return Ok(OrchestrateOutcome::Declined { run_id: run.run_id });
        }

        let agent = AgentCommand {
            program: defaults.agent_command.clone(),
            args: defaults.agent_args.clone(),
            model: defaults.aider_model.clone(),
            completion_marker: defaults.completion_marker,
        };
        let launched = match session::launch(self.launcher, &ctx, &repo_root, &run.tasks, &agent) {
            Ok(launched) => launched,
            Err(e) => return Err(self.record_failure(&mut run, RunStatus::LaunchFailed, e)),
        };

        run.session_handle = Some(launched.session_handle.clone());
        run.advance(RunStatus::Launched)?;
        self.store.save(&run)?;
        info!(run_id = %run.run_id, session = %launched.session_handle, "run launched");

        writeln!(out, "\nRun {} launched with {} agents.", run.run_id, run.tasks.len())?;
        writeln!(
            out,
            "Attach with: {}",
            self.launcher.attach_command(&launched.session_handle).join(" ")
        )?;
        writeln!(out, "Logs: {}", ctx.log_dir.display())?;
        Ok(OrchestrateOutcome::Launched {
            run_id: run.run_id,
            session_handle: launched.session_handle,
            reused: launched.reused,
        })
    }

    /// Summarizes a launched run. Existing summaries are returned as they are
    /// unless `force` is set.
    pub async fn summarize_run(&self, run_id: &str, force: bool) -> Result<Run> {
        let mut run = self.store.load(run_id)?;
        if !matches!(run.status, RunStatus::Launched | RunStatus::Summarized) {
            return Err(FanoutError::InvalidTransition {
                from: run.status,
                to: RunStatus::Summarized,
            });
        }
        if run.all_summarized() && !force {
            info!(run_id, "summaries already present");
            return Ok(run);
        }

        let model = self.config.summarizer_model()?;
        let summaries = summarize::summarize(
            self.client,
            &run,
            &model,
            self.config.defaults.max_log_bytes,
        )
        .await;
        summarize::apply_summaries(&mut run, summaries);
        run.advance(RunStatus::Summarized)?;
        self.store.save(&run)?;
        Ok(run)
    }

    /// Marks the run as failed, persists it, and hands the original error
    /// back to the caller.
    fn record_failure(&self, run: &mut Run, status: RunStatus, err: FanoutError) -> FanoutError {
        error!(run_id = %run.run_id, status = %status, error = %err, "run failed");
        if let Err(e) = run.fail(status, err.to_string()) {
            warn!(run_id = %run.run_id, error = %e, "could not record failure status");
        }
        if let Err(e) = self.store.save(run) {
            warn!(run_id = %run.run_id, error = %e, "could not persist failed run");
        }
        err
    }
}

/// Writes the requirements document into the repository and returns its
/// repo-relative path.
fn write_requirements(
    repo_root: &Path,
    requirements_dir: &str,
    run_id: &str,
    doc: &str,
) -> Result<String> {
    let dir = requirements_dir.trim_matches('/');
    let rel = if dir.is_empty() {
        format!("{run_id}.md")
    } else {
        format!("{dir}/{run_id}.md")
    };
    let full = repo_root.join(&rel);
    if let Some(parent) = full.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&full, format!("{}\n", doc.trim_end()))?;
    Ok(rel)
}
