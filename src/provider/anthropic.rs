//! Provider adapter for Anthropic's native completion API.
//!
//! Endpoint: `/v1/complete`. The OpenAI-shaped inbound `messages` array is
//! flattened into the `\n\nHuman:` / `\n\nAssistant:` turn format, and the
//! response carries a single `completion` string. Streaming events each
//! carry a `completion` delta under `event: completion` framing.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};

use super::sse::SseDecoder;
use super::{flatten_messages, upstream_error, Provider, ProviderKind, UpstreamResponse};
use crate::error::{RelayError, Result};
use crate::key_pool::LeasedKey;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Adapter for Anthropic's completion API.
#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    base_url: String,
}

impl AnthropicProvider {
    pub fn new() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_string(),
        }
    }

    /// Point the adapter at a different host (compat servers, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn request(&self, client: &Client, key: &LeasedKey, url: &str, body: &Value) -> reqwest::RequestBuilder {
        client
            .post(url)
            .json(body)
            .header("x-api-key", key.secret.as_str())
            .header("anthropic-version", ANTHROPIC_VERSION)
    }

    fn with_stream_flag(body: &Value, stream: bool) -> Value {
        let mut body = body.clone();
        body["stream"] = json!(stream);
        body
    }
}

impl Default for AnthropicProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn prepare_body(&self, inbound: &Value, max_output_tokens: u32) -> Result<Value> {
        let prompt =
            flatten_messages(inbound, "\n\nHuman: ", "\n\nAssistant: ", "\n\nAssistant:")?;
        let requested = inbound
            .get("max_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(max_output_tokens as u64);
        let mut body = json!({
            "model": inbound.get("model").cloned().unwrap_or(json!("claude-v2")),
            "prompt": prompt,
            "max_tokens_to_sample": requested.min(max_output_tokens as u64),
        });
        if let Some(temperature) = inbound.get("temperature") {
            body["temperature"] = temperature.clone();
        }
        Ok(body)
    }

    fn endpoint(&self, _key: &LeasedKey, _model: &str) -> String {
        format!("{}/v1/complete", self.base_url.trim_end_matches('/'))
    }

    async fn complete(
        &self,
        client: &Client,
        key: &LeasedKey,
        model: &str,
        body: &Value,
    ) -> Result<UpstreamResponse> {
        let url = self.endpoint(key, model);
        let body = Self::with_stream_flag(body, false);
        let resp = self.request(client, key, &url, &body).send().await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            return Err(upstream_error(resp).await);
        }
        Ok(UpstreamResponse {
            body: resp.json().await?,
            status,
        })
    }

    async fn complete_streaming(
        &self,
        client: &Client,
        key: &LeasedKey,
        model: &str,
        body: &Value,
        on_event: &mut (dyn FnMut(Value) + Send),
    ) -> Result<UpstreamResponse> {
        let url = self.endpoint(key, model);
        let body = Self::with_stream_flag(body, true);
        let resp = self.request(client, key, &url, &body).send().await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            return Err(upstream_error(resp).await);
        }

        let mut stream = resp.bytes_stream();
        let mut decoder = SseDecoder::new();
        let mut accumulated = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(RelayError::Request)?;
            for event in decoder.decode(&chunk) {
                if let Some(delta) = self.delta_text(&event) {
                    accumulated.push_str(&delta);
                }
                on_event(event);
            }
        }
        for event in decoder.flush() {
            if let Some(delta) = self.delta_text(&event) {
                accumulated.push_str(&delta);
            }
            on_event(event);
        }

        Ok(UpstreamResponse {
            body: json!({
                "completion": accumulated,
                "stop_reason": "stop_sequence",
                "model": model,
            }),
            status,
        })
    }

    fn delta_text(&self, event: &Value) -> Option<String> {
        event
            .get("completion")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}
