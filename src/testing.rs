//! Test doubles for the model client and the multiplexer.

use std::{
    collections::{HashSet, VecDeque},
    path::Path,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use anyhow::anyhow;
use async_trait::async_trait;

use crate::{
    config::{ModelConfig, ProviderKind},
    error::{FanoutError, Result},
    llm::CompletionClient,
    session::ProcessLauncher,
};

pub fn test_model() -> ModelConfig {
    ModelConfig {
        name: "test".to_string(),
        kind: ProviderKind::OpenAi,
        model_name: "gpt-test".to_string(),
        api_key: "sk-test".to_string(),
        temperature: 0.0,
        max_tokens: 256,
        base_url: None,
    }
}

/// Replays canned replies in order and counts calls.
#[derive(Default)]
pub struct ScriptedClient {
    replies: Mutex<VecDeque<std::result::Result<String, String>>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedClient {
    pub fn new(replies: Vec<std::result::Result<String, String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn complete(&self, _model: &ModelConfig, prompt: &str) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        match self.replies.lock().unwrap().pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(msg)) => Err(anyhow!(msg)),
            None => Err(anyhow!("no scripted reply left")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LauncherCall {
    Exists(String),
    CreateSession(String),
    CreatePane(String, usize),
    Run(String, usize, String),
    Kill(String),
}

/// In-memory multiplexer that records every call.
#[derive(Default)]
pub struct RecordingLauncher {
    calls: Mutex<Vec<LauncherCall>>,
    sessions: Mutex<HashSet<String>>,
    failing_pane: Option<usize>,
    misnumbered_pane: Option<usize>,
    failing_session_setup: bool,
}

impl RecordingLauncher {
    pub fn failing_pane(mut self, index: usize) -> Self {
        self.failing_pane = Some(index);
        self
    }

    pub fn misnumbered_pane(mut self, index: usize) -> Self {
        self.misnumbered_pane = Some(index);
        self
    }

    /// The session comes into existence but its setup then fails.
    pub fn failing_session_setup(mut self) -> Self {
        self.failing_session_setup = true;
        self
    }

    pub fn calls(&self) -> Vec<LauncherCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn has_session(&self, session: &str) -> bool {
        self.sessions.lock().unwrap().contains(session)
    }

    fn record(&self, call: LauncherCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl ProcessLauncher for RecordingLauncher {
    fn session_exists(&self, session: &str) -> Result<bool> {
        self.record(LauncherCall::Exists(session.to_string()));
        Ok(self.has_session(session))
    }

    fn create_session(&self, session: &str, _cwd: &Path) -> Result<usize> {
        self.record(LauncherCall::CreateSession(session.to_string()));
        self.sessions.lock().unwrap().insert(session.to_string());
        if self.failing_session_setup {
            return Err(FanoutError::Launch("move-window failed".to_string()));
        }
        Ok(0)
    }

    fn create_pane(&self, session: &str, index: usize, _cwd: &Path) -> Result<usize> {
        self.record(LauncherCall::CreatePane(session.to_string(), index));
        if self.failing_pane == Some(index) {
            return Err(FanoutError::Launch(format!("cannot create pane {index}")));
        }
        if self.misnumbered_pane == Some(index) {
            return Ok(index + 1);
        }
        Ok(index)
    }

    fn run_in_pane(&self, session: &str, index: usize, command: &str) -> Result<()> {
        self.record(LauncherCall::Run(
            session.to_string(),
            index,
            command.to_string(),
        ));
        Ok(())
    }

    fn kill_session(&self, session: &str) -> Result<()> {
        self.record(LauncherCall::Kill(session.to_string()));
        self.sessions.lock().unwrap().remove(session);
        Ok(())
    }

    fn attach_command(&self, session: &str) -> Vec<String> {
        vec!["true".to_string(), session.to_string()]
    }
}
