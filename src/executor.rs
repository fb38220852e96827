//! The proxy executor: one upstream attempt per dequeued ticket.
//!
//! Leases a key, runs the buffered or streaming upstream call, and
//! classifies failures into the retry taxonomy: transient errors bench the
//! key and send the ticket back through the queue; permanent credential
//! failures retire the key and retry on another; everything else is
//! terminal. Once real output has streamed to the client, retries are
//! forbidden — the error surfaces as an SSE frame instead.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::key_pool::KeyPool;
use crate::normalize::{augment_response, completion_text, normalize_chunk, normalize_response};
use crate::provider::Provider;
use crate::sse::SseSink;
use crate::ticket::{Ticket, TokenCounter};

/// The result of one upstream attempt.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// Buffered success: the normalized client-facing body.
    Complete(Value),
    /// Streaming success: every frame (including `[DONE]`) was written.
    Streamed,
    /// Transient failure: reenqueue the ticket and try another key.
    Retry,
    /// Terminal failure to surface to the client.
    Failed(RelayError),
}

/// How a classified upstream failure is handled.
enum Classification {
    /// Permanent credential failure: disable the key, retry elsewhere.
    AuthRevoked,
    /// Transient: bench the key for the hinted duration, retry.
    RateLimited(Option<Duration>),
    /// The key's quota or billing is exhausted: retire it, terminal.
    QuotaExhausted,
    /// Non-retryable: forward to the client.
    Terminal,
}

fn is_permanent_auth_error(body: &str) -> bool {
    let body = body.to_lowercase();
    ["invalid", "revoked", "disabled", "deactivated", "incorrect api key"]
        .iter()
        .any(|marker| body.contains(marker))
}

fn is_quota_error(body: &str) -> bool {
    let body = body.to_lowercase();
    ["quota", "billing", "exceeded your current"]
        .iter()
        .any(|marker| body.contains(marker))
}

fn classify(error: &RelayError) -> Classification {
    match error {
        // Connection refused, reset, timeout: assume transient.
        RelayError::Request(_) => Classification::RateLimited(None),
        RelayError::UpstreamHttp {
            status,
            body,
            retry_after,
        } => match *status {
            401 | 403 if is_permanent_auth_error(body) => Classification::AuthRevoked,
            429 if is_quota_error(body) => Classification::QuotaExhausted,
            429 => Classification::RateLimited(*retry_after),
            500..=599 => Classification::RateLimited(*retry_after),
            _ => Classification::Terminal,
        },
        _ => Classification::Terminal,
    }
}

/// Executes upstream attempts against leased keys.
pub struct ProxyExecutor {
    client: Client,
    pool: Arc<KeyPool>,
    counter: Arc<dyn TokenCounter>,
    config: Config,
}

impl ProxyExecutor {
    pub fn new(
        client: Client,
        pool: Arc<KeyPool>,
        counter: Arc<dyn TokenCounter>,
        config: Config,
    ) -> Self {
        Self {
            client,
            pool,
            counter,
            config,
        }
    }

    /// Run one upstream attempt for a dequeued ticket.
    ///
    /// The ticket's retry counter is incremented on every transient
    /// failure; the caller reenqueues it. A missed lease (another attempt
    /// grabbed the key between the dispatcher's check and now) is the same
    /// back-pressure signal and also reenqueues.
    pub async fn attempt(
        &self,
        ticket: &mut Ticket,
        provider: &dyn Provider,
        sink: Option<&SseSink>,
    ) -> AttemptOutcome {
        let Some(key) = self.pool.lease(ticket.family) else {
            debug!(ticket = ticket.id, family = %ticket.family, "lease raced away, requeueing");
            ticket.retries += 1;
            return AttemptOutcome::Retry;
        };

        let result = if ticket.stream {
            match sink {
                Some(sink) => self.run_streaming(ticket, provider, &key, sink).await,
                None => Err(RelayError::Other(
                    "streaming ticket has no client sink".into(),
                )),
            }
        } else {
            self.run_buffered(ticket, provider, &key).await
        };

        match result {
            Ok(outcome) => outcome,
            Err(error) => {
                let streaming_started = sink.map(SseSink::is_started).unwrap_or(false);
                match classify(&error) {
                    Classification::AuthRevoked => {
                        self.pool.disable(key.id, &error.to_string());
                        if streaming_started {
                            return AttemptOutcome::Failed(error);
                        }
                        ticket.retries += 1;
                        AttemptOutcome::Retry
                    }
                    Classification::RateLimited(retry_after) => {
                        self.pool.mark_rate_limited(key.id, ticket.family, retry_after);
                        if streaming_started {
                            warn!(ticket = ticket.id, "upstream failed mid-stream, no retry possible");
                            return AttemptOutcome::Failed(error);
                        }
                        ticket.retries += 1;
                        AttemptOutcome::Retry
                    }
                    Classification::QuotaExhausted => {
                        self.pool.disable(key.id, "quota exhausted");
                        AttemptOutcome::Failed(RelayError::KeysExhausted)
                    }
                    Classification::Terminal => AttemptOutcome::Failed(error),
                }
            }
        }
    }

    async fn run_buffered(
        &self,
        ticket: &mut Ticket,
        provider: &dyn Provider,
        key: &crate::key_pool::LeasedKey,
    ) -> Result<AttemptOutcome> {
        let body = outbound_body(ticket)?;
        let upstream = provider
            .complete(&self.client, key, &ticket.model, &body)
            .await?;

        let text = completion_text(ticket.outbound, &upstream.body);
        ticket.output_tokens = self.counter.count_output(&text);
        self.pool.record_usage(
            key.id,
            ticket.family,
            (ticket.prompt_tokens + ticket.output_tokens) as u64,
        );

        let mut response = normalize_response(ticket, &upstream.body)?;
        augment_response(&mut response, ticket, &self.config);
        Ok(AttemptOutcome::Complete(response))
    }

    async fn run_streaming(
        &self,
        ticket: &mut Ticket,
        provider: &dyn Provider,
        key: &crate::key_pool::LeasedKey,
        sink: &SseSink,
    ) -> Result<AttemptOutcome> {
        let body = outbound_body(ticket)?;
        let shared: &Ticket = ticket;

        let mut on_event = |event: Value| {
            let delta = provider.delta_text(&event);
            if let Some(chunk) = normalize_chunk(shared, &event, delta) {
                sink.data(&chunk);
            }
        };

        let upstream = tokio::select! {
            result = provider.complete_streaming(
                &self.client,
                key,
                &shared.model,
                &body,
                &mut on_event,
            ) => result?,
            // Client went away mid-stream: abort the upstream call. The
            // prompt was still consumed, so usage is recorded.
            () = sink.closed() => {
                self.pool.record_usage(key.id, shared.family, shared.prompt_tokens as u64);
                return Err(RelayError::Aborted);
            }
        };

        let text = completion_text(ticket.outbound, &upstream.body);
        ticket.output_tokens = self.counter.count_output(&text);
        self.pool.record_usage(
            key.id,
            ticket.family,
            (ticket.prompt_tokens + ticket.output_tokens) as u64,
        );

        sink.done();
        Ok(AttemptOutcome::Streamed)
    }
}

fn outbound_body(ticket: &Ticket) -> Result<Value> {
    ticket.outbound_body.clone().ok_or_else(|| {
        // Internal invariant: the preprocessor runs before any attempt.
        RelayError::Other(format!(
            "ticket {} reached the executor without a finalized body",
            ticket.id
        ))
    })
}
