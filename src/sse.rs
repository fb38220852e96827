//! Client-facing SSE framing.
//!
//! The relay never owns the socket; it writes rendered SSE frames into an
//! [`SseSink`] and the embedding HTTP layer drains the paired receiver onto
//! the wire. Framing rules: every event ends with `\n\n`, comment lines
//! begin with `: `, and the terminal sentinel is `data: [DONE]`.
//!
//! Clients that declare `badSseParser=true` get neither comments nor
//! diagnostic fake events; for them the stream carries only real payloads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

/// The terminal sentinel frame.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Render a JSON payload as one SSE data event.
pub fn render_data(value: &Value) -> String {
    format!("data: {}\n\n", value)
}

/// Render an SSE comment line (ignored by compliant parsers).
pub fn render_comment(text: &str) -> String {
    format!(": {}\n\n", text)
}

/// The heartbeat comment carrying queue telemetry.
pub fn heartbeat_comment(queue_depth: usize, estimated_wait: Duration) -> String {
    render_comment(&format!(
        "queue heartbeat: depth={} est_wait_ms={}",
        queue_depth,
        estimated_wait.as_millis()
    ))
}

/// A well-formed fake chunk in the OpenAI dialect, used for heartbeats in
/// diagnostic mode. Carries no content a client would render as output.
pub fn fake_heartbeat_chunk(queue_depth: usize, estimated_wait: Duration) -> Value {
    json!({
        "id": "relay-heartbeat",
        "object": "chat.completion.chunk",
        "choices": [{
            "index": 0,
            "delta": {},
            "finish_reason": null
        }],
        "relay": {
            "queue_depth": queue_depth,
            "est_wait_ms": estimated_wait.as_millis() as u64,
        }
    })
}

/// An OpenAI-dialect error chunk for failures after streaming has begun.
pub fn error_chunk(message: &str) -> Value {
    json!({
        "id": "relay-error",
        "object": "chat.completion.chunk",
        "choices": [{
            "index": 0,
            "delta": {"content": format!("\n\n[Proxy error: {}]", message)},
            "finish_reason": "error"
        }]
    })
}

/// Writer half of a client SSE connection.
///
/// Cheap to clone; the heartbeat task and the executor share one sink. The
/// `started` flag tracks whether real completion output has been written —
/// the executor's no-retry-after-streaming rule keys on it. Heartbeats and
/// comments deliberately do not set it: a ticket that has only received
/// keep-alives may still be reenqueued.
#[derive(Clone)]
pub struct SseSink {
    tx: mpsc::UnboundedSender<String>,
    suppress_noise: bool,
    started: Arc<AtomicBool>,
}

impl SseSink {
    /// Create a sink and the receiver the HTTP layer drains.
    pub fn channel(suppress_noise: bool) -> (SseSink, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            SseSink {
                tx,
                suppress_noise,
                started: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// Write one completion chunk. Marks the stream as started.
    pub fn data(&self, value: &Value) {
        self.started.store(true, Ordering::Relaxed);
        let _ = self.tx.send(render_data(value));
    }

    /// Write a keep-alive heartbeat.
    ///
    /// Production mode emits an SSE comment; diagnostic mode emits a fake
    /// chunk. Both are suppressed for `badSseParser` clients.
    pub fn heartbeat(&self, queue_depth: usize, estimated_wait: Duration, diagnostic: bool) {
        if self.suppress_noise {
            return;
        }
        let frame = if diagnostic {
            render_data(&fake_heartbeat_chunk(queue_depth, estimated_wait))
        } else {
            heartbeat_comment(queue_depth, estimated_wait)
        };
        let _ = self.tx.send(frame);
    }

    /// Write the terminal `[DONE]` sentinel.
    pub fn done(&self) {
        let _ = self.tx.send(DONE_FRAME.to_string());
    }

    /// Write an error event in the client's dialect.
    pub fn error(&self, message: &str) {
        let _ = self.tx.send(render_data(&error_chunk(message)));
    }

    /// Whether real completion output has been written to this sink.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Relaxed)
    }

    /// Whether the client side of the channel has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves when the client side of the channel goes away.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}
