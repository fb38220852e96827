//! Provider adapter for Google PaLM text generation.
//!
//! Endpoint: `/v1beta2/models/{model}:generateText`, authenticated with the
//! API key as a query parameter. PaLM has no streaming endpoint; streaming
//! clients get the buffered result replayed as a single event.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::{upstream_error, Provider, ProviderKind, UpstreamResponse};
use crate::error::{RelayError, Result};
use crate::key_pool::LeasedKey;

/// Adapter for Google PaLM's generateText API.
#[derive(Debug, Clone)]
pub struct PalmProvider {
    base_url: String,
}

impl PalmProvider {
    pub fn new() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com".to_string(),
        }
    }

    /// Point the adapter at a different host (tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// PaLM takes one prompt string; message contents are joined by
    /// newlines without role labels.
    fn flatten_prompt(inbound: &Value) -> Result<String> {
        let messages = inbound
            .get("messages")
            .and_then(|m| m.as_array())
            .ok_or_else(|| RelayError::Rewriting {
                status: 400,
                message: "request body is missing a messages array".into(),
            })?;
        Ok(messages
            .iter()
            .filter_map(|m| m.get("content").and_then(|c| c.as_str()))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

impl Default for PalmProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for PalmProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GooglePalm
    }

    fn prepare_body(&self, inbound: &Value, max_output_tokens: u32) -> Result<Value> {
        let prompt = Self::flatten_prompt(inbound)?;
        let requested = inbound
            .get("max_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(max_output_tokens as u64);
        let mut body = json!({
            "prompt": {"text": prompt},
            "maxOutputTokens": requested.min(max_output_tokens as u64),
            "candidateCount": 1,
        });
        if let Some(temperature) = inbound.get("temperature") {
            body["temperature"] = temperature.clone();
        }
        Ok(body)
    }

    fn endpoint(&self, key: &LeasedKey, model: &str) -> String {
        format!(
            "{}/v1beta2/models/{}:generateText?key={}",
            self.base_url.trim_end_matches('/'),
            model,
            key.secret
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
        let resp = client.post(&url).json(body).send().await?;
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
        // No streaming endpoint: deliver the buffered result as one event.
        let response = self.complete(client, key, model, body).await?;
        on_event(response.body.clone());
        Ok(response)
    }

    fn delta_text(&self, event: &Value) -> Option<String> {
        event
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("output"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    fn name(&self) -> &'static str {
        "google-palm"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leased_key() -> LeasedKey {
        LeasedKey {
            id: crate::key_pool::test_key_id(0),
            provider: ProviderKind::GooglePalm,
            secret: "palm-key".into(),
            org_id: None,
            aws: None,
        }
    }

    #[test]
    fn test_prepare_body_shape() {
        let provider = PalmProvider::new();
        let inbound = json!({
            "model": "text-bison-001",
            "messages": [
                {"role": "user", "content": "ping"},
                {"role": "assistant", "content": "pong"}
            ],
            "max_tokens": 64
        });
        let body = provider.prepare_body(&inbound, 300).unwrap();
        assert_eq!(body["prompt"]["text"], "ping\npong");
        assert_eq!(body["maxOutputTokens"], 64);
        assert_eq!(body["candidateCount"], 1);
    }

    #[test]
    fn test_endpoint_rewrites_to_generate_text() {
        let provider = PalmProvider::new();
        let url = provider.endpoint(&leased_key(), "text-bison-001");
        assert_eq!(
            url,
            "https://generativelanguage.googleapis.com/v1beta2/models/text-bison-001:generateText?key=palm-key"
        );
    }

    #[test]
    fn test_delta_text_reads_candidates() {
        let provider = PalmProvider::new();
        let event = json!({"candidates": [{"output": "pong"}]});
        assert_eq!(provider.delta_text(&event), Some("pong".to_string()));
        assert_eq!(provider.delta_text(&json!({"candidates": []})), None);
    }
}
