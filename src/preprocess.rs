//! The preprocessor pipeline: inbound rewriting before a ticket queues.
//!
//! An ordered chain of [`Rewriter`] stages runs once per ticket lifetime,
//! at first admission — never on retry. Stages validate and mutate the
//! inbound body in place; the final step translates it into the provider's
//! wire form. Credentials are deliberately not attached here: the executor
//! builds a fresh upstream request per attempt so a retried ticket can
//! carry a different key.
//!
//! Any stage failure destroys the request with a terminal 400/403.

use tracing::debug;

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::provider::Provider;
use crate::ticket::Ticket;

/// One preprocessing stage. Stages are pure rewrites of the ticket.
pub trait Rewriter: Send + Sync {
    /// Stage name for logs and rejection messages.
    fn name(&self) -> &'static str;

    /// Validate and/or mutate the ticket.
    fn apply(&self, ticket: &mut Ticket, config: &Config) -> Result<()>;
}

/// Reject families the operator has not enabled.
pub struct FamilyGuard;

impl Rewriter for FamilyGuard {
    fn name(&self) -> &'static str {
        "family-guard"
    }

    fn apply(&self, ticket: &mut Ticket, config: &Config) -> Result<()> {
        if config.allowed_model_families.contains(&ticket.family) {
            Ok(())
        } else {
            Err(RelayError::Rewriting {
                status: 403,
                message: format!("model family '{}' is not served here", ticket.family),
            })
        }
    }
}

/// Cap the requested output tokens to the per-family limit.
pub struct QuotaLimits;

impl Rewriter for QuotaLimits {
    fn name(&self) -> &'static str {
        "quota-limits"
    }

    fn apply(&self, ticket: &mut Ticket, config: &Config) -> Result<()> {
        let cap = config.max_output_tokens(ticket.family) as u64;
        let requested = ticket
            .body
            .get("max_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(cap);
        ticket.body["max_tokens"] = serde_json::json!(requested.min(cap));
        Ok(())
    }
}

/// Terms that trip the content filter when `REJECT_DISALLOWED` is on.
const DISALLOWED_TERMS: &[&str] = &["loli", "shota", "underage", "child porn"];

/// Reject content the operator has declared off-limits.
pub struct ContentFilter;

impl Rewriter for ContentFilter {
    fn name(&self) -> &'static str {
        "content-filter"
    }

    fn apply(&self, ticket: &mut Ticket, config: &Config) -> Result<()> {
        if !config.reject_disallowed {
            return Ok(());
        }
        let messages = ticket.body.get("messages").and_then(|m| m.as_array());
        let Some(messages) = messages else {
            return Ok(());
        };
        for message in messages {
            let content = message
                .get("content")
                .and_then(|c| c.as_str())
                .unwrap_or_default()
                .to_lowercase();
            if DISALLOWED_TERMS.iter().any(|term| content.contains(term)) {
                return Err(RelayError::Rewriting {
                    status: 403,
                    message: config.reject_message.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Refuse requests arriving from configured origins.
pub struct BlockOrigins;

impl Rewriter for BlockOrigins {
    fn name(&self) -> &'static str {
        "block-origins"
    }

    fn apply(&self, ticket: &mut Ticket, config: &Config) -> Result<()> {
        if config.blocked_origins.is_empty() {
            return Ok(());
        }
        let origin = ticket
            .headers
            .get("origin")
            .or_else(|| ticket.headers.get("referer"))
            .cloned()
            .unwrap_or_default();
        if config
            .blocked_origins
            .iter()
            .any(|blocked| origin.contains(blocked.as_str()))
        {
            return Err(RelayError::Rewriting {
                status: 403,
                message: config.block_message.clone(),
            });
        }
        Ok(())
    }
}

/// Headers that would leak the client's identity to the upstream.
const IDENTITY_HEADERS: &[&str] = &[
    "authorization",
    "x-forwarded-for",
    "x-real-ip",
    "cf-connecting-ip",
    "true-client-ip",
    "forwarded",
];

/// Strip originating headers so the upstream only sees the proxy.
pub struct StripIdentityHeaders;

impl Rewriter for StripIdentityHeaders {
    fn name(&self) -> &'static str {
        "strip-identity-headers"
    }

    fn apply(&self, ticket: &mut Ticket, _config: &Config) -> Result<()> {
        ticket
            .headers
            .retain(|name, _| !IDENTITY_HEADERS.contains(&name.to_lowercase().as_str()));
        Ok(())
    }
}

/// The ordered stage chain for one provider route.
pub struct RewriterChain {
    stages: Vec<Box<dyn Rewriter>>,
}

impl RewriterChain {
    /// The standard chain every provider route uses.
    pub fn standard() -> Self {
        Self {
            stages: vec![
                Box::new(FamilyGuard),
                Box::new(QuotaLimits),
                Box::new(ContentFilter),
                Box::new(BlockOrigins),
                Box::new(StripIdentityHeaders),
            ],
        }
    }

    /// Run every stage, then finalize the body into the provider wire form.
    ///
    /// No-op if the ticket was already preprocessed (retries skip the
    /// whole chain).
    pub fn run(&self, ticket: &mut Ticket, config: &Config, provider: &dyn Provider) -> Result<()> {
        if ticket.preprocessed {
            return Ok(());
        }
        for stage in &self.stages {
            stage.apply(ticket, config).inspect_err(|_| {
                debug!(ticket = ticket.id, stage = stage.name(), "rewriter rejected request");
            })?;
        }
        let cap = config.max_output_tokens(ticket.family);
        ticket.outbound_body = Some(provider.prepare_body(&ticket.body, cap)?);
        ticket.preprocessed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::ModelFamily;
    use crate::provider::{MockProvider, ProviderKind};
    use crate::ticket::Identity;
    use serde_json::json;
    use std::collections::HashMap;

    fn ticket_with(body: serde_json::Value, headers: HashMap<String, String>) -> Ticket {
        Ticket::new(
            Identity::Ip("1.2.3.4".into()),
            ProviderKind::OpenAi,
            "gpt-3.5-turbo",
            body,
            headers,
            false,
        )
    }

    fn ticket() -> Ticket {
        ticket_with(
            json!({"model": "gpt-3.5-turbo", "messages": [{"role": "user", "content": "hi"}]}),
            HashMap::new(),
        )
    }

    #[test]
    fn test_family_guard_rejects_disabled_family() {
        let config = Config {
            allowed_model_families: vec![ModelFamily::Claude],
            ..Config::default()
        };
        let mut t = ticket();
        let err = FamilyGuard.apply(&mut t, &config).unwrap_err();
        assert!(matches!(err, RelayError::Rewriting { status: 403, .. }));
    }

    #[test]
    fn test_quota_limits_clamps_body() {
        let config = Config::default();
        let mut t = ticket();
        t.body["max_tokens"] = json!(100_000);
        QuotaLimits.apply(&mut t, &config).unwrap();
        assert_eq!(
            t.body["max_tokens"],
            config.max_output_tokens_openai
        );
    }

    #[test]
    fn test_content_filter_only_when_enabled() {
        let mut t = ticket_with(
            json!({"messages": [{"role": "user", "content": "an UNDERAGE character"}]}),
            HashMap::new(),
        );
        ContentFilter.apply(&mut t, &Config::default()).unwrap();

        let strict = Config {
            reject_disallowed: true,
            ..Config::default()
        };
        let err = ContentFilter.apply(&mut t, &strict).unwrap_err();
        assert!(matches!(err, RelayError::Rewriting { status: 403, .. }));
    }

    #[test]
    fn test_block_origins_matches_substring() {
        let config = Config {
            blocked_origins: vec!["evil.example".into()],
            block_message: "go away".into(),
            ..Config::default()
        };
        let mut headers = HashMap::new();
        headers.insert("origin".to_string(), "https://evil.example/app".to_string());
        let mut t = ticket_with(json!({"messages": []}), headers);
        let err = BlockOrigins.apply(&mut t, &config).unwrap_err();
        assert!(err.to_string().contains("go away"));

        let mut clean = ticket();
        BlockOrigins.apply(&mut clean, &config).unwrap();
    }

    #[test]
    fn test_strip_identity_headers() {
        let mut headers = HashMap::new();
        headers.insert("X-Forwarded-For".to_string(), "1.2.3.4".to_string());
        headers.insert("authorization".to_string(), "Bearer secret".to_string());
        headers.insert("user-agent".to_string(), "client/1.0".to_string());
        let mut t = ticket_with(json!({"messages": []}), headers);

        StripIdentityHeaders.apply(&mut t, &Config::default()).unwrap();
        assert_eq!(t.headers.len(), 1);
        assert!(t.headers.contains_key("user-agent"));
    }

    #[test]
    fn test_chain_runs_once_and_finalizes() {
        let config = Config::default();
        let provider = MockProvider::replying(ProviderKind::OpenAi, json!({}));
        let chain = RewriterChain::standard();
        let mut t = ticket();

        chain.run(&mut t, &config, &provider).unwrap();
        assert!(t.preprocessed);
        assert!(t.outbound_body.is_some());

        // A second run (retry path) is a no-op.
        t.body = json!("poisoned");
        chain.run(&mut t, &config, &provider).unwrap();
        assert!(t.outbound_body.is_some());
    }

    #[test]
    fn test_chain_stops_on_first_rejection() {
        let config = Config {
            allowed_model_families: vec![ModelFamily::Claude],
            ..Config::default()
        };
        let provider = MockProvider::replying(ProviderKind::OpenAi, json!({}));
        let chain = RewriterChain::standard();
        let mut t = ticket();

        assert!(chain.run(&mut t, &config, &provider).is_err());
        assert!(!t.preprocessed);
        assert!(t.outbound_body.is_none());
    }
}
