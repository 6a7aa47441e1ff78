//! Orchestration settings loaded from a TOML file plus environment variables.
//!
//! Secrets never live in the file: each model entry names the environment
//! variable that holds its API key (`.env` is loaded by `main` beforehand).

use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::error::{FanoutError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "fanout.toml";

const ENV_REPO_PATH: &str = "FANOUT_REPO_PATH";
const ENV_STATE_DIR: &str = "FANOUT_STATE_DIR";
const ENV_LOGS_DIR: &str = "FANOUT_LOGS_DIR";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub defaults: Defaults,
    pub workflow_llms: WorkflowLlms,
    #[serde(default)]
    pub llms: BTreeMap<String, LlmEntry>,
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub repo_path: String,
    pub tmux_session_prefix: String,
    pub agent_command: String,
    pub agent_args: Vec<String>,
    pub aider_model: String,
    pub default_context_files: Vec<String>,
    pub state_dir: String,
    pub logs_dir: String,
    pub requirements_dir: String,
    pub max_file_bytes: u64,
    pub max_context_bytes: usize,
    pub prompt_context_chars: usize,
    pub max_log_bytes: u64,
    pub completion_marker: bool,
    pub pager: Option<String>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            repo_path: ".".to_string(),
            tmux_session_prefix: "fanout_".to_string(),
            agent_command: "aider".to_string(),
            agent_args: vec!["--yes".to_string()],
            aider_model: "gpt-4o".to_string(),
            default_context_files: Vec::new(),
            state_dir: "state".to_string(),
            logs_dir: "logs".to_string(),
            requirements_dir: "docs/requirements".to_string(),
            max_file_bytes: 100 * 1024,
            max_context_bytes: 500 * 1024,
            prompt_context_chars: 40_000,
            max_log_bytes: 30_000,
            completion_marker: true,
            pager: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowLlms {
    pub plan_generator: String,
    pub log_summarizer: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gemini,
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmEntry {
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    pub model_name: String,
    pub api_key_env: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub base_url: Option<String>,
}

/// A model entry with its API key resolved, ready for a completion call.
#[derive(Clone)]
pub struct ModelConfig {
    pub name: String,
    pub kind: ProviderKind,
    pub model_name: String,
    pub api_key: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub base_url: Option<String>,
}

impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("model_name", &self.model_name)
            .field("api_key", &"<redacted>")
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            FanoutError::Configuration(format!("cannot read `{}`: {e}", path.display()))
        })?;
        let mut config = Self::from_toml_str(&text)?;
        config.source = Some(path.to_path_buf());
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)
            .map_err(|e| FanoutError::Configuration(format!("not valid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (role, name) in [
            ("plan_generator", &self.workflow_llms.plan_generator),
            ("log_summarizer", &self.workflow_llms.log_summarizer),
        ] {
            if !self.llms.contains_key(name) {
                return Err(FanoutError::Configuration(format!(
                    "workflow_llms.{role} refers to undefined model `{name}`"
                )));
            }
        }
        if self.defaults.agent_command.trim().is_empty() {
            return Err(FanoutError::Configuration(
                "defaults.agent_command must not be empty".to_string(),
            ));
        }
        if self.defaults.max_file_bytes == 0 || self.defaults.max_context_bytes == 0 {
            return Err(FanoutError::Configuration(
                "context size limits must be positive".to_string(),
            ));
        }
        if self.defaults.max_log_bytes == 0 {
            return Err(FanoutError::Configuration(
                "defaults.max_log_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        self.defaults.apply_overrides(lookup);
    }

    pub fn planner_model(&self) -> Result<ModelConfig> {
        self.resolve_model(&self.workflow_llms.plan_generator, |k| std::env::var(k).ok())
    }

    pub fn summarizer_model(&self) -> Result<ModelConfig> {
        self.resolve_model(&self.workflow_llms.log_summarizer, |k| std::env::var(k).ok())
    }

    pub fn resolve_model<F>(&self, name: &str, lookup: F) -> Result<ModelConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let entry = self.llms.get(name).ok_or_else(|| {
            FanoutError::Configuration(format!("model `{name}` is not defined under [llms]"))
        })?;
        let env_name = entry.api_key_env.as_deref().ok_or_else(|| {
            FanoutError::Configuration(format!("model `{name}` has no api_key_env"))
        })?;
        let api_key = lookup(env_name)
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                FanoutError::Configuration(format!(
                    "environment variable {env_name} for model `{name}` is not set"
                ))
            })?;
        Ok(ModelConfig {
            name: name.to_string(),
            kind: entry.kind,
            model_name: entry.model_name.clone(),
            api_key,
            temperature: entry.temperature.unwrap_or(0.7),
            max_tokens: entry.max_tokens.unwrap_or(4096),
            base_url: entry.base_url.clone(),
        })
    }

    pub fn repo_root(&self) -> PathBuf {
        absolutize(Path::new(&self.defaults.repo_path))
    }

    pub fn state_dir(&self) -> PathBuf {
        self.defaults.state_dir()
    }

    pub fn logs_dir(&self) -> PathBuf {
        absolutize(Path::new(&self.defaults.logs_dir))
    }
}

/// The `[defaults]` table on its own; model tables are ignored.
#[derive(Deserialize)]
struct DefaultsOnly {
    #[serde(default)]
    defaults: Defaults,
}

impl Defaults {
    /// Settings for the read-only `runs` commands, which only need paths and
    /// the pager. A missing file yields the built-in defaults; model sections
    /// are neither required nor checked.
    pub fn load(path: &Path) -> Result<Self> {
        let mut defaults = match fs::read_to_string(path) {
            Ok(text) => Self::from_toml_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                return Err(FanoutError::Configuration(format!(
                    "cannot read `{}`: {e}",
                    path.display()
                )));
            }
        };
        defaults.apply_overrides(|key| std::env::var(key).ok());
        Ok(defaults)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let parsed: DefaultsOnly = toml::from_str(text)
            .map_err(|e| FanoutError::Configuration(format!("not valid TOML: {e}")))?;
        Ok(parsed.defaults)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = non_empty(ENV_REPO_PATH) {
            self.repo_path = v;
        }
        if let Some(v) = non_empty(ENV_STATE_DIR) {
            self.state_dir = v;
        }
        if let Some(v) = non_empty(ENV_LOGS_DIR) {
            self.logs_dir = v;
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        absolutize(Path::new(&self.state_dir))
    }
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
