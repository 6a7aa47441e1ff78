use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;

use super::provider::error_for_status;

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiRequest<'a> {
    contents: Vec<ApiContent<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct ApiContent<'a> {
    role: &'static str,
    parts: Vec<ApiPart<'a>>,
}

#[derive(Serialize)]
struct ApiPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

// ── Implementation ────────────────────────────────────────────────────────────

pub(super) async fn complete(
    client: &reqwest::Client,
    model: &ModelConfig,
    prompt: &str,
) -> Result<String> {
    let base_url = model.base_url.as_deref().unwrap_or(BASE_URL);
    let model_name = model.model_name.trim_start_matches("models/");
    let body = ApiRequest {
        contents: vec![ApiContent {
            role: "user",
            parts: vec![ApiPart { text: prompt }],
        }],
        generation_config: GenerationConfig {
            temperature: model.temperature,
            max_output_tokens: model.max_tokens,
        },
    };

    let resp = client
        .post(format!(
            "{}/models/{model_name}:generateContent",
            base_url.trim_end_matches('/')
        ))
        .header("x-goog-api-key", &model.api_key)
        .json(&body)
        .send()
        .await
        .context("HTTP request failed")?;

    let parsed: ApiResponse = error_for_status(resp)
        .await?
        .json()
        .await
        .context("failed to parse API response")?;
    extract_text(parsed)
}

/// Blocked prompts and safety stops are errors; anything else without text
/// is reported as empty content.
fn extract_text(resp: ApiResponse) -> Result<String> {
    let Some(candidate) = resp.candidates.into_iter().next() else {
        if let Some(reason) = resp.prompt_feedback.and_then(|f| f.block_reason) {
            bail!("request blocked: {reason}");
        }
        bail!("API returned no candidates");
    };

    let text = candidate
        .content
        .map(|c| {
            c.parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        return match candidate.finish_reason.as_deref() {
            Some("SAFETY") => Err(anyhow!("generation stopped for safety reasons")),
            Some(reason) => Err(anyhow!("API returned empty content (finish reason {reason})")),
            None => Err(anyhow!("API returned empty content")),
        };
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> ApiResponse {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn generation_config_uses_camel_case() {
        let body = ApiRequest {
            contents: vec![ApiContent {
                role: "user",
                parts: vec![ApiPart { text: "x" }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.5,
                max_output_tokens: 8192,
            },
        };
        let json = serde_json::to_value(body).unwrap();
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 8192);
        assert_eq!(json["contents"][0]["parts"][0]["text"], "x");
    }

    #[test]
    fn parts_of_first_candidate_are_concatenated() {
        let resp = parse(
            r#"{"candidates":[{"content":{"parts":[{"text":"a"},{"text":"b"}]},"finishReason":"STOP"}]}"#,
        );
        assert_eq!(extract_text(resp).unwrap(), "ab");
    }

    #[test]
    fn blocked_prompt_is_an_error() {
        let resp = parse(r#"{"candidates":[],"promptFeedback":{"blockReason":"SAFETY"}}"#);
        let err = extract_text(resp).unwrap_err();
        assert!(err.to_string().contains("blocked"));
    }

    #[test]
    fn safety_stop_without_text_is_an_error() {
        let resp = parse(r#"{"candidates":[{"finishReason":"SAFETY"}]}"#);
        let err = extract_text(resp).unwrap_err();
        assert!(err.to_string().contains("safety"));
    }
}
