pub mod provider;
mod provider_anthropic;
mod provider_gemini;
mod provider_openai;

pub use provider::{CompletionClient, HttpCompletionClient, build_http_client};
