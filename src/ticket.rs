//! The request ticket: one per in-flight client request.
//!
//! A [`Ticket`] is created at admission, waits in the queue, and cycles back
//! through it on retry with an incremented counter. It carries everything
//! the executor needs to run an upstream attempt, plus the token estimates
//! the normalizer reads. Only the dispatcher (queue-out stamp) and the
//! executor (retry counter) mutate a ticket after admission.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::time::Instant;

use crate::family::ModelFamily;
use crate::provider::{ApiFormat, ProviderKind};

/// The stable identity a request is admitted under.
///
/// `SharedIp` marks sources known to front many users (e.g. a hosted client
/// product): they get a higher concurrency cap but are deprioritized in
/// scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// Authenticated user token.
    Token(String),
    /// A shared-identity source address.
    SharedIp(String),
    /// Plain source address.
    Ip(String),
}

impl Identity {
    /// Whether this identity is scheduled behind normal traffic.
    pub fn is_deprioritized(&self) -> bool {
        matches!(self, Identity::SharedIp(_))
    }

    /// How many tickets this identity may have queued at once.
    pub fn concurrency_cap(&self) -> usize {
        match self {
            Identity::SharedIp(_) => 5,
            _ => 1,
        }
    }
}

static NEXT_TICKET_ID: AtomicU64 = AtomicU64::new(1);

/// The internal handle for one in-flight client request.
#[derive(Debug)]
pub struct Ticket {
    /// Process-unique id; the queue's at-most-once invariant keys on it.
    pub id: u64,
    pub identity: Identity,
    /// Provider this request is routed to.
    pub provider: ProviderKind,
    /// Dialect the client speaks (currently always OpenAI-compatible).
    pub inbound: ApiFormat,
    /// Dialect the upstream speaks.
    pub outbound: ApiFormat,
    /// Cost/rate partition the ticket queues under.
    pub family: ModelFamily,
    /// Declared model id.
    pub model: String,
    /// Parsed inbound body, mutated in place by the preprocessor.
    pub body: Value,
    /// Provider wire-form body, produced once by the preprocessor finalize.
    pub outbound_body: Option<Value>,
    /// Forwarded client headers (origin checks, identity stripping).
    pub headers: HashMap<String, String>,
    /// Whether the client asked for an SSE stream.
    pub stream: bool,
    /// Client declared a non-compliant SSE parser (`badSseParser=true`).
    pub bad_sse_parser: bool,
    /// Attach tokenizer debug info to the response.
    pub debug: bool,
    /// When the ticket was admitted.
    pub started_at: Instant,
    /// When the dispatcher pulled it from the queue; `None` while waiting.
    pub queued_out_at: Option<Instant>,
    /// How many times this ticket has been reenqueued after a failure.
    pub retries: u32,
    /// Prompt token estimate, written by the token counter at admission.
    pub prompt_tokens: u32,
    /// Output token estimate, written after the upstream call.
    pub output_tokens: u32,
    /// The preprocessor chain has already run (never reruns on retry).
    pub preprocessed: bool,
}

impl Ticket {
    /// Create a fresh ticket at admission time.
    pub fn new(
        identity: Identity,
        provider: ProviderKind,
        model: impl Into<String>,
        body: Value,
        headers: HashMap<String, String>,
        stream: bool,
    ) -> Self {
        let model = model.into();
        Self {
            id: NEXT_TICKET_ID.fetch_add(1, Ordering::Relaxed),
            identity,
            provider,
            inbound: ApiFormat::OpenAi,
            outbound: provider.dialect(),
            family: ModelFamily::partition(provider, &model),
            model,
            body,
            outbound_body: None,
            headers,
            stream,
            bad_sse_parser: false,
            debug: false,
            started_at: Instant::now(),
            queued_out_at: None,
            retries: 0,
            prompt_tokens: 0,
            output_tokens: 0,
            preprocessed: false,
        }
    }

    /// Age of the ticket, measured from admission.
    pub fn age(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    /// Whether the client and upstream dialects differ, requiring the
    /// response normalizer.
    pub fn needs_normalization(&self) -> bool {
        self.inbound != self.outbound
    }
}

/// Seam for the external token estimator.
///
/// The estimator is not part of this core; the contract is that it writes
/// `prompt_tokens` and `output_tokens` onto the ticket before the
/// normalizer runs. [`HeuristicTokenCounter`] is the built-in stand-in.
pub trait TokenCounter: Send + Sync {
    /// Estimate prompt tokens for an OpenAI-shaped request body.
    fn count_prompt(&self, body: &Value) -> u32;

    /// Estimate tokens in a completion text.
    fn count_output(&self, text: &str) -> u32;
}

/// Crude chars/4 estimate, good enough for quota clamps and telemetry.
#[derive(Debug, Default)]
pub struct HeuristicTokenCounter;

impl TokenCounter for HeuristicTokenCounter {
    fn count_prompt(&self, body: &Value) -> u32 {
        let chars: usize = body
            .get("messages")
            .and_then(|m| m.as_array())
            .map(|messages| {
                messages
                    .iter()
                    .filter_map(|m| m.get("content").and_then(|c| c.as_str()))
                    .map(str::len)
                    .sum()
            })
            .unwrap_or(0);
        (chars / 4).max(1) as u32
    }

    fn count_output(&self, text: &str) -> u32 {
        (text.len() / 4).max(1) as u32
    }
}
