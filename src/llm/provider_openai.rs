use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;

use super::provider::error_for_status;

const BASE_URL: &str = "https://api.openai.com/v1";

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    choices: Vec<ApiChoice>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiChoiceMessage,
}

#[derive(Deserialize)]
struct ApiChoiceMessage {
    content: Option<String>,
}

// ── Implementation ────────────────────────────────────────────────────────────

/// Any OpenAI-compatible `chat/completions` endpoint (set `base_url` for
/// self-hosted or third-party gateways).
pub(super) async fn complete(
    client: &reqwest::Client,
    model: &ModelConfig,
    prompt: &str,
) -> Result<String> {
    let base_url = model.base_url.as_deref().unwrap_or(BASE_URL);
    let body = ApiRequest {
        model: &model.model_name,
        messages: vec![ApiMessage {
            role: "user",
            content: prompt,
        }],
        max_tokens: model.max_tokens,
        temperature: model.temperature,
    };

    let resp = client
        .post(format!("{}/chat/completions", base_url.trim_end_matches('/')))
        .header("Authorization", format!("Bearer {}", model.api_key))
        .json(&body)
        .send()
        .await
        .context("HTTP request failed")?;

    let parsed: ApiResponse = error_for_status(resp)
        .await?
        .json()
        .await
        .context("failed to parse API response")?;
    extract_text(parsed).ok_or_else(|| anyhow!("API returned empty content"))
}

fn extract_text(resp: ApiResponse) -> Option<String> {
    resp.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|t| !t.trim().is_empty())
}
