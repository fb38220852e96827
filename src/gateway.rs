//! The relay façade: admission through response delivery.
//!
//! [`Relay`] owns the shared aggregates (queue, key pool, wait estimator)
//! and wires the lifecycle together: admission checks and preprocessing,
//! enqueue, the resume-wait, upstream attempts with retry-by-reenqueue,
//! and terminal delivery. The embedding HTTP layer parses requests off the
//! wire, derives the caller's identity, and drains the SSE sink; everything
//! in between lives here.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::{RelayError, Result};
use crate::estimator::WaitTimeEstimator;
use crate::executor::{AttemptOutcome, ProxyExecutor};
use crate::key_pool::KeyPool;
use crate::normalize::PROMPT_LOG_NOTE;
use crate::preprocess::RewriterChain;
use crate::provider::{default_providers, Provider, ProviderKind};
use crate::queue::{QueueVerdict, RequestQueue};
use crate::sse::SseSink;
use crate::ticket::{HeuristicTokenCounter, Identity, Ticket, TokenCounter};

/// A parsed inbound chat completion request.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    /// Which provider route the request arrived on.
    pub provider: ProviderKind,
    /// The caller's admission identity.
    pub identity: Identity,
    /// The OpenAI-shaped request body.
    pub body: Value,
    /// Forwarded client headers.
    pub headers: HashMap<String, String>,
    /// `badSseParser=true` was passed: suppress comments and fake events.
    pub bad_sse_parser: bool,
    /// Attach tokenizer debug info to the response.
    pub debug: bool,
}

/// A successful relay outcome.
#[derive(Debug)]
pub enum ClientResponse {
    /// Buffered completion: send this JSON with HTTP 200.
    Json(Value),
    /// Streaming completion: every frame was written to the sink.
    Streamed,
}

/// Long-running relay tasks (dispatcher, stall sweep). Aborted on drop.
pub struct RelayTasks {
    handles: Vec<JoinHandle<()>>,
}

impl Drop for RelayTasks {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// The relay core.
pub struct Relay {
    config: Config,
    queue: Arc<RequestQueue>,
    pool: Arc<KeyPool>,
    estimator: Arc<WaitTimeEstimator>,
    executor: ProxyExecutor,
    providers: HashMap<ProviderKind, Arc<dyn Provider>>,
    chain: RewriterChain,
    counter: Arc<dyn TokenCounter>,
    shared_ips: HashSet<String>,
    models_cache: Mutex<HashMap<ProviderKind, (Instant, Value)>>,
}

impl Relay {
    /// Start building a relay from a configuration.
    pub fn builder(config: Config) -> RelayBuilder {
        RelayBuilder {
            config,
            providers: default_providers(),
            counter: Arc::new(HeuristicTokenCounter),
            shared_ips: HashSet::new(),
        }
    }

    /// Spawn the dispatcher and stall-sweep tasks.
    pub fn start(self: &Arc<Self>) -> RelayTasks {
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.pool),
            self.config.dispatch_tick,
        );
        let sweeper = Arc::clone(&self.queue);
        info!("relay started");
        RelayTasks {
            handles: vec![
                tokio::spawn(dispatcher.run()),
                tokio::spawn(sweeper.sweep_loop()),
            ],
        }
    }

    /// Derive the admission identity for a request.
    ///
    /// An authenticated token wins; otherwise the source address, tagged as
    /// shared when it belongs to a known multi-user front.
    pub fn identify(&self, auth_token: Option<&str>, ip: &str) -> Identity {
        match auth_token {
            Some(token) => Identity::Token(token.to_string()),
            None if self.shared_ips.contains(ip) => Identity::SharedIp(ip.to_string()),
            None => Identity::Ip(ip.to_string()),
        }
    }

    /// Handle one chat completion request, end to end.
    ///
    /// Streaming requests must pass the sink their connection is draining;
    /// buffered requests pass `None`. The returned error is ready to render
    /// with [`Relay::error_envelope`] when nothing has streamed yet.
    pub async fn handle_chat(
        &self,
        request: ClientRequest,
        sink: Option<SseSink>,
    ) -> Result<ClientResponse> {
        let model = request
            .body
            .get("model")
            .and_then(|m| m.as_str())
            .ok_or_else(|| RelayError::Rewriting {
                status: 400,
                message: "request body is missing a model".into(),
            })?
            .to_string();
        let stream = request
            .body
            .get("stream")
            .and_then(|s| s.as_bool())
            .unwrap_or(false);
        if stream && sink.is_none() {
            return Err(RelayError::Other(
                "streaming request arrived without a client sink".into(),
            ));
        }

        let provider = self
            .providers
            .get(&request.provider)
            .cloned()
            .ok_or_else(|| RelayError::Other(format!(
                "no adapter registered for provider '{}'",
                request.provider
            )))?;

        let mut ticket = Ticket::new(
            request.identity,
            request.provider,
            model,
            request.body,
            request.headers,
            stream,
        );
        ticket.bad_sse_parser = request.bad_sse_parser;
        ticket.debug = request.debug;
        ticket.prompt_tokens = self.counter.count_prompt(&ticket.body);

        // The rewriter chain runs exactly once, before the first enqueue.
        self.chain
            .run(&mut ticket, &self.config, provider.as_ref())?;

        loop {
            let rx = self.queue.enqueue(ticket, sink.clone())?;
            let verdict = rx.await.map_err(|_| RelayError::Aborted)?;
            ticket = match verdict {
                QueueVerdict::Ready(ticket) => ticket,
                QueueVerdict::TimedOut(ticket) => {
                    debug!(ticket = ticket.id, "stalled in queue, terminating");
                    return Err(self.deliver_failure(RelayError::QueueTimeout, stream, &sink));
                }
            };

            match self
                .executor
                .attempt(&mut ticket, provider.as_ref(), sink.as_ref())
                .await
            {
                AttemptOutcome::Complete(body) => {
                    self.record_wait(&ticket);
                    return Ok(ClientResponse::Json(body));
                }
                AttemptOutcome::Streamed => {
                    self.record_wait(&ticket);
                    return Ok(ClientResponse::Streamed);
                }
                AttemptOutcome::Retry => continue,
                AttemptOutcome::Failed(error) => {
                    return Err(self.deliver_failure(error, stream, &sink));
                }
            }
        }
    }

    /// OpenAI-shaped model listing for a provider route. Cached.
    pub fn models(&self, provider: ProviderKind) -> Value {
        let mut cache = self.models_cache.lock().unwrap();
        if let Some((at, listing)) = cache.get(&provider) {
            if at.elapsed() < self.config.models_cache_ttl {
                return listing.clone();
            }
        }
        let data: Vec<Value> = self
            .served_models(provider)
            .into_iter()
            .map(|id| {
                json!({
                    "id": id,
                    "object": "model",
                    "owned_by": provider.as_str(),
                })
            })
            .collect();
        let listing = json!({"object": "list", "data": data});
        cache.insert(provider, (Instant::now(), listing.clone()));
        listing
    }

    /// Render a terminal error as the client-facing JSON envelope.
    pub fn error_envelope(&self, error: &RelayError) -> Value {
        let note = self.config.prompt_logging.then_some(PROMPT_LOG_NOTE);
        error.to_envelope(note)
    }

    fn served_models(&self, provider: ProviderKind) -> Vec<&'static str> {
        self.config
            .allowed_model_families
            .iter()
            .filter(|family| family.provider() == provider)
            .map(|family| family.representative_model())
            .collect()
    }

    /// On success, leave a wait sample behind for the heartbeat estimates.
    fn record_wait(&self, ticket: &Ticket) {
        if let Some(end) = ticket.queued_out_at {
            self.estimator.record(
                ticket.family,
                ticket.started_at,
                end,
                ticket.identity.is_deprioritized(),
            );
        }
    }

    /// Route a terminal failure to the right channel: an SSE error frame
    /// when the client opened a stream, the JSON envelope otherwise.
    fn deliver_failure(
        &self,
        error: RelayError,
        stream: bool,
        sink: &Option<SseSink>,
    ) -> RelayError {
        if stream {
            if let Some(sink) = sink {
                sink.error(&error.to_string());
            }
        }
        error
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("queue", &self.queue)
            .field("pool", &self.pool)
            .finish()
    }
}

/// Builder for [`Relay`].
pub struct RelayBuilder {
    config: Config,
    providers: HashMap<ProviderKind, Arc<dyn Provider>>,
    counter: Arc<dyn TokenCounter>,
    shared_ips: HashSet<String>,
}

impl RelayBuilder {
    /// Replace the adapter for one provider (used to inject mocks).
    pub fn provider(mut self, kind: ProviderKind, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(kind, provider);
        self
    }

    /// Replace the token counter.
    pub fn token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    /// Register a source address as a shared-identity front.
    pub fn shared_ip(mut self, ip: impl Into<String>) -> Self {
        self.shared_ips.insert(ip.into());
        self
    }

    /// Build the relay.
    pub fn build(self) -> Arc<Relay> {
        let estimator = Arc::new(WaitTimeEstimator::new(self.config.sample_retention));
        let queue = Arc::new(RequestQueue::new(
            self.config.clone(),
            Arc::clone(&estimator),
        ));
        let pool = Arc::new(KeyPool::from_config(&self.config));
        let executor = ProxyExecutor::new(
            reqwest::Client::new(),
            Arc::clone(&pool),
            Arc::clone(&self.counter),
            self.config.clone(),
        );
        Arc::new(Relay {
            config: self.config,
            queue,
            pool,
            estimator,
            executor,
            providers: self.providers,
            chain: RewriterChain::standard(),
            counter: self.counter,
            shared_ips: self.shared_ips,
            models_cache: Mutex::new(HashMap::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::ModelFamily;
    use crate::provider::{MockOutcome, MockProvider};
    use std::time::Duration;

    fn relay_with_mock(
        keys: &[&str],
        provider_kind: ProviderKind,
        mock: Arc<MockProvider>,
    ) -> Arc<Relay> {
        let mut config = Config::default();
        match provider_kind {
            ProviderKind::OpenAi => {
                config.openai_keys = keys.iter().map(|s| s.to_string()).collect()
            }
            ProviderKind::Anthropic => {
                config.anthropic_keys = keys.iter().map(|s| s.to_string()).collect()
            }
            ProviderKind::GooglePalm => {
                config.google_palm_keys = keys.iter().map(|s| s.to_string()).collect()
            }
            ProviderKind::Aws => {}
        }
        Relay::builder(config)
            .provider(provider_kind, mock)
            .shared_ip("9.9.9.9")
            .build()
    }

    fn openai_reply(content: &str) -> Value {
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": "stop"
            }]
        })
    }

    fn chat_request(relay: &Relay, provider: ProviderKind, ip: &str, model: &str) -> ClientRequest {
        ClientRequest {
            provider,
            identity: relay.identify(None, ip),
            body: json!({
                "model": model,
                "messages": [{"role": "user", "content": "hi"}]
            }),
            headers: HashMap::new(),
            bad_sse_parser: false,
            debug: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_basic_openai_passthrough() {
        let mock = Arc::new(MockProvider::replying(
            ProviderKind::OpenAi,
            openai_reply("hello"),
        ));
        let relay = relay_with_mock(&["sk-one"], ProviderKind::OpenAi, Arc::clone(&mock));
        let _tasks = relay.start();

        let request = chat_request(&relay, ProviderKind::OpenAi, "1.2.3.4", "gpt-3.5-turbo");
        let response = relay.handle_chat(request, None).await.unwrap();

        let ClientResponse::Json(body) = response else {
            panic!("expected buffered JSON");
        };
        assert_eq!(body["choices"][0]["message"]["content"], "hello");
        assert_eq!(mock.call_count(), 1);
        // One wait sample landed in the turbo partition.
        assert_eq!(relay.estimator.len(), 1);
        // Key usage was incremented.
        let usage = relay
            .pool
            .usage(crate::key_pool::test_key_id(0), ModelFamily::Turbo);
        assert_eq!(usage.requests, 1);
        assert!(usage.tokens > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_retry_invisible_to_client() {
        let mock = Arc::new(MockProvider::new(
            ProviderKind::OpenAi,
            vec![
                MockOutcome::Http {
                    status: 429,
                    body: "rate limited, slow down".into(),
                    retry_after: Some(Duration::from_secs(1)),
                },
                MockOutcome::Reply(openai_reply("second time lucky")),
            ],
        ));
        let relay = relay_with_mock(&["sk-one"], ProviderKind::OpenAi, Arc::clone(&mock));
        let _tasks = relay.start();

        let request = chat_request(&relay, ProviderKind::OpenAi, "1.2.3.4", "gpt-3.5-turbo");
        let response = relay.handle_chat(request, None).await.unwrap();

        // The client only ever sees the success.
        let ClientResponse::Json(body) = response else {
            panic!("expected buffered JSON");
        };
        assert_eq!(
            body["choices"][0]["message"]["content"],
            "second time lucky"
        );
        assert_eq!(mock.call_count(), 2);
        // The lockout was set for the retry, then expired before the
        // second attempt.
        assert_eq!(relay.pool.lockout_period(ModelFamily::Turbo), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_cap_rejects_second_request() {
        let mock = Arc::new(MockProvider::replying(
            ProviderKind::OpenAi,
            openai_reply("unreachable"),
        ));
        let relay = relay_with_mock(&["sk-one"], ProviderKind::OpenAi, mock);
        // No dispatcher: the first request stays queued.

        let first = chat_request(&relay, ProviderKind::OpenAi, "1.2.3.4", "gpt-3.5-turbo");
        let relay_clone = Arc::clone(&relay);
        let waiting = tokio::spawn(async move { relay_clone.handle_chat(first, None).await });
        tokio::task::yield_now().await;
        assert_eq!(relay.queue.len(), 1);

        let second = chat_request(&relay, ProviderKind::OpenAi, "1.2.3.4", "gpt-3.5-turbo");
        let err = relay.handle_chat(second, None).await.unwrap_err();
        assert!(matches!(err, RelayError::TooManyQueued));

        let envelope = relay.error_envelope(&err);
        assert_eq!(envelope["type"], "proxy_error");
        assert!(envelope["message"]
            .as_str()
            .unwrap()
            .contains("already has a request in the queue"));

        waiting.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_identity_deprioritized_behind_regular() {
        let mock = Arc::new(MockProvider::replying(
            ProviderKind::OpenAi,
            openai_reply("served"),
        ));
        let relay = relay_with_mock(&["sk-one"], ProviderKind::OpenAi, mock);

        // Five shared-identity requests arrive first.
        let mut shared_tasks = Vec::new();
        for _ in 0..5 {
            let request = chat_request(&relay, ProviderKind::OpenAi, "9.9.9.9", "gpt-3.5-turbo");
            assert!(matches!(request.identity, Identity::SharedIp(_)));
            let relay_clone = Arc::clone(&relay);
            shared_tasks.push(tokio::spawn(async move {
                relay_clone.handle_chat(request, None).await
            }));
        }
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(5)).await;

        // A regular user arrives later.
        let regular = chat_request(&relay, ProviderKind::OpenAi, "1.2.3.4", "gpt-3.5-turbo");
        let relay_clone = Arc::clone(&relay);
        let regular_task = tokio::spawn(async move { relay_clone.handle_chat(regular, None).await });
        tokio::task::yield_now().await;
        assert_eq!(relay.queue.len(), 6);

        // One dispatch pass serves the regular user before any shared one.
        let dispatcher = Dispatcher::new(
            Arc::clone(&relay.queue),
            Arc::clone(&relay.pool),
            relay.config.dispatch_tick,
        );
        dispatcher.tick_once();

        let response = regular_task.await.unwrap().unwrap();
        assert!(matches!(response, ClientResponse::Json(_)));
        assert_eq!(relay.queue.len(), 5);

        for task in shared_tasks {
            task.abort();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_palm_normalization() {
        let mock = Arc::new(MockProvider::replying(
            ProviderKind::GooglePalm,
            json!({"candidates": [{"output": "pong"}]}),
        ));
        let relay = relay_with_mock(&["palm-key"], ProviderKind::GooglePalm, mock);
        let _tasks = relay.start();

        let mut request = chat_request(&relay, ProviderKind::GooglePalm, "1.2.3.4", "text-bison-001");
        request.body["messages"] = json!([{"role": "user", "content": "ping"}]);
        request.body["stream"] = json!(false);

        let ClientResponse::Json(body) = relay.handle_chat(request, None).await.unwrap() else {
            panic!("expected buffered JSON");
        };
        assert_eq!(body["choices"][0]["message"]["content"], "pong");
        assert!(body["id"].as_str().unwrap().starts_with("plm-"));
        assert_eq!(body["object"], "chat.completion");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_timeout_during_streaming_wait() {
        // No keys configured: the turbo partition never dispatches.
        let mock = Arc::new(MockProvider::replying(
            ProviderKind::OpenAi,
            openai_reply("unreachable"),
        ));
        let relay = relay_with_mock(&[], ProviderKind::OpenAi, mock);
        let _tasks = relay.start();

        let mut request = chat_request(&relay, ProviderKind::OpenAi, "1.2.3.4", "gpt-3.5-turbo");
        request.body["stream"] = json!(true);
        let (sink, mut frames) = SseSink::channel(false);

        let relay_clone = Arc::clone(&relay);
        let handler =
            tokio::spawn(async move { relay_clone.handle_chat(request, Some(sink)).await });

        // Heartbeats flow while the ticket waits.
        tokio::time::advance(Duration::from_secs(11)).await;
        let heartbeat = frames.recv().await.unwrap();
        assert!(heartbeat.starts_with(": "));

        // Past the stall timeout the sweep expires the ticket.
        tokio::time::advance(Duration::from_secs(300)).await;
        let err = handler.await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::QueueTimeout));
        assert!(relay.queue.is_empty());

        // The error frame reached the client in its dialect.
        let mut saw_error = false;
        while let Ok(frame) = frames.try_recv() {
            if frame.contains("terminated by the proxy") {
                assert!(frame.contains("chat.completion.chunk"));
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_models_listing_cached_openai_shape() {
        let mock = Arc::new(MockProvider::replying(
            ProviderKind::OpenAi,
            openai_reply("unused"),
        ));
        let relay = relay_with_mock(&["sk-one"], ProviderKind::OpenAi, mock);

        let listing = relay.models(ProviderKind::OpenAi);
        assert_eq!(listing["object"], "list");
        let ids: Vec<&str> = listing["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        assert!(ids.contains(&"gpt-3.5-turbo"));
        assert!(ids.contains(&"gpt-4"));
        assert!(ids.contains(&"gpt-4-32k"));
        assert!(!ids.contains(&"claude-v2"));

        // Second read comes from the cache (same value).
        assert_eq!(relay.models(ProviderKind::OpenAi), listing);
        // Anthropic's route lists its own families.
        let anthropic = relay.models(ProviderKind::Anthropic);
        let ids: Vec<&str> = anthropic["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["claude-v2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_preprocess_never_queues() {
        let mock = Arc::new(MockProvider::replying(
            ProviderKind::OpenAi,
            openai_reply("unused"),
        ));
        let relay = relay_with_mock(&["sk-one"], ProviderKind::OpenAi, mock);

        let mut request = chat_request(&relay, ProviderKind::OpenAi, "1.2.3.4", "gpt-3.5-turbo");
        request.body.as_object_mut().unwrap().remove("model");
        let err = relay.handle_chat(request, None).await.unwrap_err();
        assert!(matches!(err, RelayError::Rewriting { status: 400, .. }));
        assert!(relay.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_identify_modes() {
        let mock = Arc::new(MockProvider::replying(
            ProviderKind::OpenAi,
            openai_reply("unused"),
        ));
        let relay = relay_with_mock(&["sk-one"], ProviderKind::OpenAi, mock);

        assert_eq!(
            relay.identify(Some("tok-1"), "9.9.9.9"),
            Identity::Token("tok-1".into())
        );
        assert_eq!(
            relay.identify(None, "9.9.9.9"),
            Identity::SharedIp("9.9.9.9".into())
        );
        assert_eq!(
            relay.identify(None, "1.2.3.4"),
            Identity::Ip("1.2.3.4".into())
        );
    }
}
