//! Provider trait and upstream protocol adapters.
//!
//! The [`Provider`] trait abstracts over upstream LLM APIs, translating
//! between the relay's OpenAI-shaped inbound bodies and each provider's
//! wire protocol. Built-in implementations: [`OpenAiProvider`],
//! [`AnthropicProvider`], [`PalmProvider`], [`AwsClaudeProvider`].
//!
//! ## Architecture
//!
//! ```text
//! Ticket ──► prepare_body() ──► complete() / complete_streaming() ──► UpstreamResponse
//!                                         │
//!                      ┌───────────┬──────┴──────┬─────────────┐
//!                 OpenAiProvider  Anthropic    Palm          AwsClaude
//!                 /v1/chat/...    /v1/complete /v1beta2/...  bedrock invoke
//! ```

pub mod anthropic;
pub mod aws;
pub mod mock;
pub mod openai;
pub mod palm;
pub mod sse;

pub use anthropic::AnthropicProvider;
pub use aws::AwsClaudeProvider;
pub use mock::{MockOutcome, MockProvider};
pub use openai::OpenAiProvider;
pub use palm::PalmProvider;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::error::{RelayError, Result};
use crate::key_pool::LeasedKey;

/// Upstream providers the relay can route to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// OpenAI chat completions.
    OpenAi,
    /// Anthropic's native completion API.
    Anthropic,
    /// Google PaLM text generation.
    GooglePalm,
    /// Claude hosted on AWS Bedrock.
    Aws,
}

impl ProviderKind {
    /// Stable lowercase name, matching the client-facing route segment.
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::GooglePalm => "google-palm",
            ProviderKind::Aws => "aws",
        }
    }

    /// Resolve a route segment (`/{provider}/v1/...`) to a provider.
    pub fn from_route(segment: &str) -> Option<ProviderKind> {
        match segment {
            "openai" => Some(ProviderKind::OpenAi),
            "anthropic" => Some(ProviderKind::Anthropic),
            "google-palm" => Some(ProviderKind::GooglePalm),
            "aws" => Some(ProviderKind::Aws),
            _ => None,
        }
    }

    /// The wire dialect this provider speaks.
    pub fn dialect(self) -> ApiFormat {
        match self {
            ProviderKind::OpenAi => ApiFormat::OpenAi,
            ProviderKind::Anthropic | ProviderKind::Aws => ApiFormat::Anthropic,
            ProviderKind::GooglePalm => ApiFormat::Palm,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request/response dialects the relay translates between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFormat {
    /// OpenAI chat completion shapes (`choices`, `message`, `delta`).
    OpenAi,
    /// Anthropic completion shapes (`completion`).
    Anthropic,
    /// PaLM generateText shapes (`candidates`).
    Palm,
}

/// A buffered upstream reply: provider-native JSON plus the HTTP status.
#[derive(Debug)]
pub struct UpstreamResponse {
    /// Provider-native response body.
    pub body: Value,
    /// HTTP status code (for diagnostics/logging).
    pub status: u16,
}

/// Abstraction over upstream LLM providers.
///
/// Implementors translate the relay's OpenAI-shaped inbound body into the
/// provider's wire protocol, attach credentials from the leased key, and
/// hand back provider-native responses. Two modes: buffered completion and
/// streaming completion with a per-event callback.
///
/// # Object Safety
///
/// This trait is object-safe and designed to be used as `Arc<dyn Provider>`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Which provider this adapter speaks to.
    fn kind(&self) -> ProviderKind;

    /// Translate an OpenAI-shaped inbound body into the provider wire form,
    /// clamping the requested output tokens to `max_output_tokens`.
    ///
    /// Runs once per ticket; credentials are attached per attempt in
    /// `complete`/`complete_streaming` so a retried ticket can carry a
    /// different key.
    fn prepare_body(&self, inbound: &Value, max_output_tokens: u32) -> Result<Value>;

    /// The full upstream URL for a model.
    fn endpoint(&self, key: &LeasedKey, model: &str) -> String;

    /// Execute a buffered upstream call.
    async fn complete(
        &self,
        client: &Client,
        key: &LeasedKey,
        model: &str,
        body: &Value,
    ) -> Result<UpstreamResponse>;

    /// Execute a streaming upstream call.
    ///
    /// `on_event` is called with each provider-native event as it arrives.
    /// The final buffered body (assembled from the stream) is returned.
    async fn complete_streaming(
        &self,
        client: &Client,
        key: &LeasedKey,
        model: &str,
        body: &Value,
        on_event: &mut (dyn FnMut(Value) + Send),
    ) -> Result<UpstreamResponse>;

    /// Extract the text delta from one provider-native stream event.
    fn delta_text(&self, event: &Value) -> Option<String>;

    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// The default provider registry: one adapter per [`ProviderKind`].
pub fn default_providers() -> HashMap<ProviderKind, Arc<dyn Provider>> {
    let mut providers: HashMap<ProviderKind, Arc<dyn Provider>> = HashMap::new();
    providers.insert(ProviderKind::OpenAi, Arc::new(OpenAiProvider::new()));
    providers.insert(ProviderKind::Anthropic, Arc::new(AnthropicProvider::new()));
    providers.insert(ProviderKind::GooglePalm, Arc::new(PalmProvider::new()));
    providers.insert(ProviderKind::Aws, Arc::new(AwsClaudeProvider::new()));
    providers
}

/// Insert the `/v1/` prefix into a client path that is missing it.
///
/// Clients routinely POST `/openai/chat/completions`; the canonical route
/// is `/openai/v1/chat/completions`.
pub fn ensure_v1_prefix(path: &str) -> String {
    if path.starts_with("/v1/") || path == "/v1" {
        path.to_string()
    } else {
        format!("/v1{}{}", if path.starts_with('/') { "" } else { "/" }, path)
    }
}

/// Parse a `Retry-After` header value as whole seconds.
pub(crate) fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Convert a non-success upstream response into [`RelayError::UpstreamHttp`],
/// capturing the `Retry-After` hint before the body is consumed.
pub(crate) async fn upstream_error(resp: reqwest::Response) -> RelayError {
    let status = resp.status().as_u16();
    let retry_after = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body = resp.text().await.unwrap_or_default();
    RelayError::UpstreamHttp {
        status,
        body,
        retry_after,
    }
}

/// Flatten an OpenAI `messages` array into a single prompt transcript.
///
/// Used by providers whose wire form takes one prompt string (Anthropic's
/// `\n\nHuman:`/`\n\nAssistant:` turns, PaLM's `prompt.text`).
pub(crate) fn flatten_messages(
    inbound: &Value,
    user_label: &str,
    assistant_label: &str,
    terminal_label: &str,
) -> Result<String> {
    let messages = inbound
        .get("messages")
        .and_then(|m| m.as_array())
        .ok_or_else(|| RelayError::Rewriting {
            status: 400,
            message: "request body is missing a messages array".into(),
        })?;

    let mut prompt = String::new();
    for message in messages {
        let role = message.get("role").and_then(|r| r.as_str()).unwrap_or("user");
        let content = message
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or_default();
        let label = match role {
            "assistant" => assistant_label,
            // System prompts ride along as user turns.
            _ => user_label,
        };
        prompt.push_str(label);
        prompt.push_str(content);
    }
    prompt.push_str(terminal_label);
    Ok(prompt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_route_segments_round_trip() {
        for kind in [
            ProviderKind::OpenAi,
            ProviderKind::Anthropic,
            ProviderKind::GooglePalm,
            ProviderKind::Aws,
        ] {
            assert_eq!(ProviderKind::from_route(kind.as_str()), Some(kind));
        }
        assert_eq!(ProviderKind::from_route("cohere"), None);
    }

    #[test]
    fn test_dialects() {
        assert_eq!(ProviderKind::OpenAi.dialect(), ApiFormat::OpenAi);
        assert_eq!(ProviderKind::Anthropic.dialect(), ApiFormat::Anthropic);
        assert_eq!(ProviderKind::Aws.dialect(), ApiFormat::Anthropic);
        assert_eq!(ProviderKind::GooglePalm.dialect(), ApiFormat::Palm);
    }

    #[test]
    fn test_ensure_v1_prefix() {
        assert_eq!(
            ensure_v1_prefix("/chat/completions"),
            "/v1/chat/completions"
        );
        assert_eq!(
            ensure_v1_prefix("/v1/chat/completions"),
            "/v1/chat/completions"
        );
        assert_eq!(ensure_v1_prefix("models"), "/v1/models");
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("5"), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after(" 30 "), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn test_flatten_messages_anthropic_turns() {
        let inbound = json!({
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"},
                {"role": "user", "content": "bye"}
            ]
        });
        let prompt =
            flatten_messages(&inbound, "\n\nHuman: ", "\n\nAssistant: ", "\n\nAssistant:")
                .unwrap();
        assert_eq!(
            prompt,
            "\n\nHuman: hi\n\nAssistant: hello\n\nHuman: bye\n\nAssistant:"
        );
    }

    #[test]
    fn test_flatten_messages_requires_array() {
        let inbound = json!({"model": "claude-v2"});
        let err = flatten_messages(&inbound, "", "", "").unwrap_err();
        assert!(matches!(err, RelayError::Rewriting { status: 400, .. }));
    }
}
