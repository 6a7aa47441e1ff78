use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::{ModelConfig, ProviderKind};

use super::{provider_anthropic, provider_gemini, provider_openai};

/// Single-prompt text completion. Providers differ only in wire shape; every
/// implementation reduces the reply to plain text.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, model: &ModelConfig, prompt: &str) -> Result<String>;
}

// ── HTTP client builder ───────────────────────────────────────────────────────

pub fn build_http_client() -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));

    if let Ok(proxy_url) = std::env::var("HTTP_PROXY") {
        builder = builder.proxy(reqwest::Proxy::all(&proxy_url)?);
    }

    if let Ok(ms) = std::env::var("API_TIMEOUT_MS") {
        if let Ok(ms) = ms.parse::<u64>() {
            builder = builder.timeout(Duration::from_millis(ms));
        }
    }

    builder.build().map_err(Into::into)
}

// ── Dispatching client ────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct HttpCompletionClient {
    http: reqwest::Client,
}

impl HttpCompletionClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, model: &ModelConfig, prompt: &str) -> Result<String> {
        info!(
            llm = %model.name,
            provider = model.kind.as_str(),
            model = %model.model_name,
            "calling model"
        );
        debug!(prompt_chars = prompt.chars().count(), "prompt prepared");
        match model.kind {
            ProviderKind::Anthropic => provider_anthropic::complete(&self.http, model, prompt).await,
            ProviderKind::OpenAi => provider_openai::complete(&self.http, model, prompt).await,
            ProviderKind::Gemini => provider_gemini::complete(&self.http, model, prompt).await,
        }
    }
}

/// Shared failure path for non-2xx replies.
pub(super) async fn error_for_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    Err(anyhow::anyhow!("API error {status}: {}", truncate(&text, 600)))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push_str("…(truncated)");
    out
}
