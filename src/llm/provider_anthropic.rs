use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;

use super::provider::error_for_status;

const BASE_URL: &str = "https://api.anthropic.com";

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<ApiMessage<'a>>,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

// ── Implementation ────────────────────────────────────────────────────────────

pub(super) async fn complete(
    client: &reqwest::Client,
    model: &ModelConfig,
    prompt: &str,
) -> Result<String> {
    let base_url = model.base_url.as_deref().unwrap_or(BASE_URL);
    let body = build_request(model, prompt);

    let resp = client
        .post(format!("{}/v1/messages", base_url.trim_end_matches('/')))
        .header("x-api-key", &model.api_key)
        .header("anthropic-version", "2023-06-01")
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

fn build_request<'a>(model: &'a ModelConfig, prompt: &'a str) -> ApiRequest<'a> {
    ApiRequest {
        model: &model.model_name,
        max_tokens: model.max_tokens,
        temperature: model.temperature,
        messages: vec![ApiMessage {
            role: "user",
            content: prompt,
        }],
    }
}

fn extract_text(resp: ApiResponse) -> Option<String> {
    let text = resp
        .content
        .into_iter()
        .filter(|b| b.kind == "text")
        .filter_map(|b| b.text)
        .collect::<Vec<_>>()
        .join("\n");
    (!text.trim().is_empty()).then_some(text)
}
