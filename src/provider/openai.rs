//! Provider adapter for the OpenAI chat completions API.
//!
//! Endpoint: `/v1/chat/completions`. Streaming: SSE with
//! `data: {"choices": [{"delta": {"content": "token"}}]}` and a
//! `data: [DONE]` terminator. Inbound bodies are already in this dialect,
//! so preparation is a passthrough plus the output-token clamp.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};

use super::sse::SseDecoder;
use super::{upstream_error, Provider, ProviderKind, UpstreamResponse};
use crate::error::{RelayError, Result};
use crate::key_pool::LeasedKey;

/// Adapter for OpenAI's chat completion API.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    base_url: String,
}

impl OpenAiProvider {
    pub fn new() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
        }
    }

    /// Point the adapter at a different host (compat servers, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn request(&self, client: &Client, key: &LeasedKey, url: &str, body: &Value) -> reqwest::RequestBuilder {
        let mut req = client
            .post(url)
            .json(body)
            .header("Authorization", format!("Bearer {}", key.secret));
        if let Some(ref org) = key.org_id {
            req = req.header("OpenAI-Organization", org.as_str());
        }
        req
    }

    fn with_stream_flag(body: &Value, stream: bool) -> Value {
        let mut body = body.clone();
        body["stream"] = json!(stream);
        body
    }
}

impl Default for OpenAiProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn prepare_body(&self, inbound: &Value, max_output_tokens: u32) -> Result<Value> {
        if inbound.get("messages").and_then(|m| m.as_array()).is_none() {
            return Err(RelayError::Rewriting {
                status: 400,
                message: "request body is missing a messages array".into(),
            });
        }
        let mut body = inbound.clone();
        let requested = body
            .get("max_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(max_output_tokens as u64);
        body["max_tokens"] = json!(requested.min(max_output_tokens as u64));
        // The executor decides streaming per attempt.
        if let Some(map) = body.as_object_mut() {
            map.remove("stream");
        }
        Ok(body)
    }

    fn endpoint(&self, _key: &LeasedKey, _model: &str) -> String {
        format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        )
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
                "object": "chat.completion",
                "model": model,
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": accumulated},
                    "finish_reason": "stop"
                }]
            }),
            status,
        })
    }

    fn delta_text(&self, event: &Value) -> Option<String> {
        event
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}
