//! Provider adapter for Claude hosted on AWS Bedrock.
//!
//! Endpoint: the region-prefixed invoke path
//! `https://bedrock-runtime.{region}.amazonaws.com/model/{model}/invoke`,
//! signed with SigV4 from the key's `access:secret:region` triple. The body
//! is Anthropic's completion wire form. Bedrock streams use a binary event
//! framing rather than SSE, so streaming clients get the buffered result
//! replayed as a single event.

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sigv4::http_request::{sign, SignableBody, SignableRequest, SigningSettings};
use aws_sigv4::sign::v4;
use reqwest::Client;
use serde_json::{json, Value};

use super::{flatten_messages, upstream_error, Provider, ProviderKind, UpstreamResponse};
use crate::config::AwsCredential;
use crate::error::{RelayError, Result};
use crate::key_pool::LeasedKey;

/// Adapter for Anthropic models on AWS Bedrock.
#[derive(Debug, Clone, Default)]
pub struct AwsClaudeProvider;

impl AwsClaudeProvider {
    pub fn new() -> Self {
        Self
    }

    fn credentials<'k>(key: &'k LeasedKey) -> Result<&'k AwsCredential> {
        key.aws.as_ref().ok_or_else(|| {
            RelayError::Other("AWS key record is missing its credential triple".into())
        })
    }

    /// SigV4-sign a Bedrock invoke request, returning the signed header set.
    fn sign_invoke(
        cred: &AwsCredential,
        url: &str,
        body: &[u8],
    ) -> Result<Vec<(String, String)>> {
        let identity = Credentials::new(
            cred.access_key.clone(),
            cred.secret_key.clone(),
            None,
            None,
            "llm-relay",
        )
        .into();
        let params = v4::SigningParams::builder()
            .identity(&identity)
            .region(&cred.region)
            .name("bedrock")
            .time(std::time::SystemTime::now())
            .settings(SigningSettings::default())
            .build()
            .map_err(|e| RelayError::Other(format!("sigv4 params: {}", e)))?
            .into();

        let mut request = http::Request::builder()
            .method("POST")
            .uri(url)
            .header("content-type", "application/json")
            .header("accept", "application/json")
            .body(body.to_vec())
            .map_err(|e| RelayError::Other(format!("sigv4 request: {}", e)))?;

        let signable = SignableRequest::new(
            "POST",
            url,
            request
                .headers()
                .iter()
                .map(|(name, value)| (name.as_str(), value.to_str().unwrap_or(""))),
            SignableBody::Bytes(body),
        )
        .map_err(|e| RelayError::Other(format!("sigv4 signable: {}", e)))?;

        let (instructions, _signature) = sign(signable, &params)
            .map_err(|e| RelayError::Other(format!("sigv4 sign: {}", e)))?
            .into_parts();
        instructions.apply_to_request_http1x(&mut request);

        Ok(request
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or("").to_string(),
                )
            })
            .collect())
    }
}

#[async_trait]
impl Provider for AwsClaudeProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Aws
    }

    fn prepare_body(&self, inbound: &Value, max_output_tokens: u32) -> Result<Value> {
        let prompt =
            flatten_messages(inbound, "\n\nHuman: ", "\n\nAssistant: ", "\n\nAssistant:")?;
        let requested = inbound
            .get("max_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(max_output_tokens as u64);
        let mut body = json!({
            "prompt": prompt,
            "max_tokens_to_sample": requested.min(max_output_tokens as u64),
        });
        if let Some(temperature) = inbound.get("temperature") {
            body["temperature"] = temperature.clone();
        }
        Ok(body)
    }

    fn endpoint(&self, key: &LeasedKey, model: &str) -> String {
        let region = key
            .aws
            .as_ref()
            .map(|c| c.region.as_str())
            .unwrap_or("us-east-1");
        format!(
            "https://bedrock-runtime.{}.amazonaws.com/model/{}/invoke",
            region, model
        )
    }

    async fn complete(
        &self,
        client: &Client,
        key: &LeasedKey,
        model: &str,
        body: &Value,
    ) -> Result<UpstreamResponse> {
        let cred = Self::credentials(key)?;
        let url = self.endpoint(key, model);
        let payload = serde_json::to_vec(body)?;
        let headers = Self::sign_invoke(cred, &url, &payload)?;

        let mut req = client.post(&url).body(payload);
        for (name, value) in headers {
            req = req.header(name, value);
        }
        let resp = req.send().await?;
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
        // Bedrock's event-stream framing is not SSE; deliver the buffered
        // result as one event.
        let response = self.complete(client, key, model, body).await?;
        on_event(response.body.clone());
        Ok(response)
    }

    fn delta_text(&self, event: &Value) -> Option<String> {
        event
            .get("completion")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    fn name(&self) -> &'static str {
        "aws-claude"
    }
}
