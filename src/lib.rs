//! # LLM Relay
//!
//! The core of a multi-provider LLM reverse proxy: a request queue and
//! dispatcher that multiplex many client connections onto a rotating pool
//! of upstream API keys across several providers (OpenAI, Anthropic,
//! Google PaLM, AWS Bedrock-hosted Claude), each with its own rate-limit
//! regime.
//!
//! This crate owns the request lifecycle from admission to upstream
//! dispatch. The embedding HTTP server parses requests off the wire and
//! drains SSE frames back onto it; everything in between lives here:
//!
//! - **[`Relay`]** — the façade: admission, preprocessing, enqueue, the
//!   resume-wait, retry-by-reenqueue, and terminal delivery.
//! - **[`KeyPool`]** — credential rotation with per-family rate-limit
//!   lockout. Rate limits are opaque lockout windows, not token buckets.
//! - **[`RequestQueue`]** — one shared list sharded by model family, with
//!   per-identity admission caps, shared-identity deprioritization,
//!   streaming keep-alive heartbeats, and a stall sweep.
//! - **[`Dispatcher`]** — a 50 ms polling loop that resumes one waiting
//!   ticket per family whenever that family's pool reports no lockout.
//! - **[`Provider`]** — the upstream protocol seam, with adapters for each
//!   provider and a [`MockProvider`] for tests.
//! - **Response normalization** — provider-native responses are rewritten
//!   into the OpenAI-compatible client schema when dialects differ.
//!
//! ## Quick Start
//!
//! ```no_run
//! use llm_relay::{ClientRequest, Config, Relay};
//! use serde_json::json;
//! use std::collections::HashMap;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let relay = Relay::builder(config).build();
//!     let _tasks = relay.start();
//!
//!     let request = ClientRequest {
//!         provider: llm_relay::ProviderKind::OpenAi,
//!         identity: relay.identify(None, "203.0.113.7"),
//!         body: json!({
//!             "model": "gpt-3.5-turbo",
//!             "messages": [{"role": "user", "content": "hi"}],
//!         }),
//!         headers: HashMap::new(),
//!         bad_sse_parser: false,
//!         debug: false,
//!     };
//!     let response = relay.handle_chat(request, None).await?;
//!     println!("{:?}", response);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod estimator;
pub mod executor;
pub mod family;
pub mod gateway;
pub mod key_pool;
pub mod normalize;
pub mod preprocess;
pub mod provider;
pub mod queue;
pub mod sse;
pub mod ticket;

pub use config::{AwsCredential, Config, GatekeeperMode, GatekeeperStore, QuotaRefreshPeriod};
pub use dispatcher::Dispatcher;
pub use error::{RelayError, Result};
pub use estimator::WaitTimeEstimator;
pub use executor::{AttemptOutcome, ProxyExecutor};
pub use family::ModelFamily;
pub use gateway::{ClientRequest, ClientResponse, Relay, RelayBuilder, RelayTasks};
pub use key_pool::{KeyPool, LeasedKey};
pub use preprocess::{Rewriter, RewriterChain};
pub use provider::{
    ensure_v1_prefix, ApiFormat, MockProvider, Provider, ProviderKind, UpstreamResponse,
};
pub use queue::{QueueVerdict, RequestQueue};
pub use sse::SseSink;
pub use ticket::{HeuristicTokenCounter, Identity, Ticket, TokenCounter};
