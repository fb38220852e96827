//! Response normalization between upstream and client dialects.
//!
//! When the client's dialect and the upstream's differ, the relay rewrites
//! provider-native responses into the single client-facing schema (OpenAI
//! chat completions). Same-dialect responses pass through unchanged.

use serde_json::{json, Value};

use crate::config::Config;
use crate::error::Result;
use crate::provider::ApiFormat;
use crate::ticket::Ticket;

/// The disclosure appended to responses when prompt logging is enabled.
pub(crate) const PROMPT_LOG_NOTE: &str =
    "This proxy logs prompts. Do not submit anything you would not share.";

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Extract the completion text from a provider-native buffered body.
pub fn completion_text(format: ApiFormat, body: &Value) -> String {
    match format {
        ApiFormat::OpenAi => body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        ApiFormat::Anthropic => body
            .get("completion")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        ApiFormat::Palm => body
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("output"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
    }
}

/// Wrap an Anthropic completion into an OpenAI chat completion.
pub fn anthropic_to_openai(native: &Value, model: &str) -> Value {
    let content = completion_text(ApiFormat::Anthropic, native);
    json!({
        "id": format!("ant-{}", uuid::Uuid::new_v4()),
        "object": "chat.completion",
        "created": unix_now(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }]
    })
}

/// Wrap a PaLM generateText result into an OpenAI chat completion.
///
/// The id is synthesized (`plm-` prefix plus a random UUID) and the usage
/// block comes from the token estimates the counter wrote onto the ticket.
pub fn palm_to_openai(native: &Value, ticket: &Ticket) -> Value {
    let content = completion_text(ApiFormat::Palm, native);
    json!({
        "id": format!("plm-{}", uuid::Uuid::new_v4()),
        "object": "chat.completion",
        "created": unix_now(),
        "model": ticket.model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": null
        }],
        "usage": {
            "prompt_tokens": ticket.prompt_tokens,
            "completion_tokens": ticket.output_tokens,
            "total_tokens": ticket.prompt_tokens + ticket.output_tokens,
        }
    })
}

/// Transform a buffered upstream body into the client's dialect.
pub fn normalize_response(ticket: &Ticket, upstream: &Value) -> Result<Value> {
    let normalized = match (ticket.inbound, ticket.outbound) {
        (inbound, outbound) if inbound == outbound => upstream.clone(),
        (ApiFormat::OpenAi, ApiFormat::Anthropic) => anthropic_to_openai(upstream, &ticket.model),
        (ApiFormat::OpenAi, ApiFormat::Palm) => palm_to_openai(upstream, ticket),
        // The client surface is OpenAI-compatible; other inbound dialects
        // do not occur.
        _ => upstream.clone(),
    };
    Ok(normalized)
}

/// Translate one provider-native stream event into a client-dialect chunk.
///
/// Same-dialect events pass through untouched; cross-dialect deltas are
/// wrapped into an OpenAI `chat.completion.chunk`.
pub fn normalize_chunk(ticket: &Ticket, event: &Value, delta: Option<String>) -> Option<Value> {
    if !ticket.needs_normalization() {
        return Some(event.clone());
    }
    let delta = delta?;
    Some(json!({
        "id": format!("relay-{}", ticket.id),
        "object": "chat.completion.chunk",
        "model": ticket.model,
        "choices": [{
            "index": 0,
            "delta": {"content": delta},
            "finish_reason": null
        }]
    }))
}

/// Apply the optional response augmentations: the prompt-logging
/// disclosure and the tokenizer debug block.
pub fn augment_response(response: &mut Value, ticket: &Ticket, config: &Config) {
    if config.prompt_logging {
        response["proxy_note"] = json!(PROMPT_LOG_NOTE);
    }
    if ticket.debug {
        response["tokenizer_debug"] = json!({
            "prompt_tokens": ticket.prompt_tokens,
            "output_tokens": ticket.output_tokens,
            "model_family": ticket.family.as_str(),
            "retries": ticket.retries,
        });
    }
}
