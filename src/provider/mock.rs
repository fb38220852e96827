//! Mock provider for testing the lifecycle without a live upstream.
//!
//! [`MockProvider`] returns pre-configured outcomes in order, cycling when
//! exhausted, so the queue/dispatch/retry machinery can be exercised
//! deterministically: a 429 followed by a 200 reproduces the rate-limit
//! retry path end to end.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::{Provider, ProviderKind, UpstreamResponse};
use crate::error::{RelayError, Result};
use crate::key_pool::LeasedKey;

/// One canned upstream outcome.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// A successful reply with this provider-native body.
    Reply(Value),
    /// An upstream HTTP error.
    Http {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },
}

/// A test provider that replays canned outcomes in order.
///
/// Cycles back to the beginning when all outcomes have been consumed. For
/// streaming, a `Reply` is emitted as a single event.
#[derive(Debug)]
pub struct MockProvider {
    kind: ProviderKind,
    outcomes: Vec<MockOutcome>,
    index: AtomicUsize,
    calls: AtomicUsize,
}

impl MockProvider {
    /// Create a mock with the given canned outcomes.
    pub fn new(kind: ProviderKind, outcomes: Vec<MockOutcome>) -> Self {
        assert!(
            !outcomes.is_empty(),
            "MockProvider requires at least one outcome"
        );
        Self {
            kind,
            outcomes,
            index: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// A mock that always succeeds with the same body.
    pub fn replying(kind: ProviderKind, body: Value) -> Self {
        Self::new(kind, vec![MockOutcome::Reply(body)])
    }

    /// How many upstream attempts have been made.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    fn next_outcome(&self) -> MockOutcome {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % self.outcomes.len();
        self.outcomes[idx].clone()
    }

    fn resolve(&self, outcome: MockOutcome) -> Result<UpstreamResponse> {
        match outcome {
            MockOutcome::Reply(body) => Ok(UpstreamResponse { body, status: 200 }),
            MockOutcome::Http {
                status,
                body,
                retry_after,
            } => Err(RelayError::UpstreamHttp {
                status,
                body,
                retry_after,
            }),
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn prepare_body(&self, inbound: &Value, _max_output_tokens: u32) -> Result<Value> {
        Ok(inbound.clone())
    }

    fn endpoint(&self, _key: &LeasedKey, model: &str) -> String {
        format!("mock://{}/{}", self.kind, model)
    }

    async fn complete(
        &self,
        _client: &Client,
        _key: &LeasedKey,
        _model: &str,
        _body: &Value,
    ) -> Result<UpstreamResponse> {
        self.resolve(self.next_outcome())
    }

    async fn complete_streaming(
        &self,
        _client: &Client,
        _key: &LeasedKey,
        _model: &str,
        _body: &Value,
        on_event: &mut (dyn FnMut(Value) + Send),
    ) -> Result<UpstreamResponse> {
        let response = self.resolve(self.next_outcome())?;
        on_event(response.body.clone());
        Ok(response)
    }

    fn delta_text(&self, event: &Value) -> Option<String> {
        // Accept any of the three dialect shapes so one mock serves all
        // provider roles in tests.
        event
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .or_else(|| event.get("completion"))
            .or_else(|| {
                event
                    .get("candidates")
                    .and_then(|c| c.get(0))
                    .and_then(|c| c.get("output"))
            })
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
