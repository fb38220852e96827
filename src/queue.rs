//! The shared request queue.
//!
//! One ordered list of waiting tickets, sharded by model family through a
//! filter predicate. Admission enforces the per-identity concurrency cap;
//! dequeue serves non-deprioritized tickets first, oldest first. Streaming
//! waiters get a keep-alive heartbeat while queued, and a periodic stall
//! sweep expires tickets that have waited too long.
//!
//! The resume continuation is a per-ticket oneshot channel: the dispatcher
//! delivers the ticket back through it when a key frees up. A client abort
//! is simply the receiver being dropped — such waiters are discarded at
//! dequeue and sweep time.

use std::sync::{Arc, Mutex, Weak};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::estimator::WaitTimeEstimator;
use crate::family::ModelFamily;
use crate::sse::SseSink;
use crate::ticket::Ticket;

/// What the resume channel delivers to the waiting handler.
#[derive(Debug)]
pub enum QueueVerdict {
    /// A key slot opened; run the upstream attempt.
    Ready(Ticket),
    /// The ticket stalled past the timeout and was expired by the sweep.
    TimedOut(Ticket),
}

/// Aborts the heartbeat task when the queue entry goes away.
struct HeartbeatGuard(JoinHandle<()>);

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct Waiting {
    ticket: Ticket,
    resume: oneshot::Sender<QueueVerdict>,
    heartbeat: Option<HeartbeatGuard>,
}

/// A dequeued ticket, ready to be handed back to its handler.
pub struct Resumed {
    ticket: Ticket,
    resume: oneshot::Sender<QueueVerdict>,
}

impl Resumed {
    /// Fire the resume continuation. Returns false if the client is gone.
    pub fn deliver(self) -> bool {
        self.resume.send(QueueVerdict::Ready(self.ticket)).is_ok()
    }
}

/// The shared queue. All mutation is serialized behind one mutex.
pub struct RequestQueue {
    inner: Mutex<Vec<Waiting>>,
    estimator: Arc<WaitTimeEstimator>,
    config: Config,
}

impl RequestQueue {
    pub fn new(config: Config, estimator: Arc<WaitTimeEstimator>) -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
            estimator,
            config,
        }
    }

    /// Admit a ticket to the queue.
    ///
    /// Enforces the per-identity concurrency cap (retried tickets are
    /// exempt) and the at-most-once invariant, then parks the ticket and
    /// returns the resume channel its handler awaits. Streaming tickets
    /// get a heartbeat task that keeps the client connection warm with
    /// queue telemetry.
    pub fn enqueue(
        self: &Arc<Self>,
        mut ticket: Ticket,
        sink: Option<SseSink>,
    ) -> Result<oneshot::Receiver<QueueVerdict>> {
        let mut inner = self.inner.lock().unwrap();

        // Entries whose client vanished do not count against anyone.
        inner.retain(|w| !w.resume.is_closed());

        if inner.iter().any(|w| w.ticket.id == ticket.id) {
            return Err(RelayError::DuplicateTicket(ticket.id));
        }
        if ticket.retries == 0 {
            let queued = inner
                .iter()
                .filter(|w| w.ticket.identity == ticket.identity)
                .count();
            if queued >= ticket.identity.concurrency_cap() {
                debug!(identity = ?ticket.identity, queued, "admission rejected");
                return Err(RelayError::TooManyQueued);
            }
        }

        ticket.queued_out_at = None;
        let (tx, rx) = oneshot::channel();
        let heartbeat = match (&sink, ticket.stream) {
            (Some(sink), true) => Some(HeartbeatGuard(self.spawn_heartbeat(
                sink.clone(),
                ticket.family,
            ))),
            _ => None,
        };
        debug!(
            ticket = ticket.id,
            family = %ticket.family,
            retries = ticket.retries,
            "enqueued"
        );
        inner.push(Waiting {
            ticket,
            resume: tx,
            heartbeat,
        });
        Ok(rx)
    }

    /// Pull the next eligible ticket for a family.
    ///
    /// Deprioritized (shared-identity) tickets are served only after all
    /// normal tickets; within each tier, earliest start time wins. Waiters
    /// whose client vanished are discarded along the way.
    pub fn dequeue(&self, family: ModelFamily) -> Option<Resumed> {
        let mut inner = self.inner.lock().unwrap();
        inner.retain(|w| !w.resume.is_closed());

        let index = inner
            .iter()
            .enumerate()
            .filter(|(_, w)| w.ticket.family == family)
            .min_by_key(|(_, w)| {
                (
                    w.ticket.identity.is_deprioritized(),
                    w.ticket.started_at,
                )
            })
            .map(|(i, _)| i)?;

        let Waiting {
            mut ticket,
            resume,
            heartbeat,
        } = inner.remove(index);
        drop(heartbeat);
        ticket.queued_out_at = Some(Instant::now());
        debug!(ticket = ticket.id, family = %family, "dequeued");
        Some(Resumed { ticket, resume })
    }

    /// Remove a ticket by id. Idempotent; returns whether it was present.
    pub fn remove(&self, id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.len();
        inner.retain(|w| w.ticket.id != id);
        before != inner.len()
    }

    /// Whether a ticket id is currently queued.
    pub fn contains(&self, id: u64) -> bool {
        self.inner.lock().unwrap().iter().any(|w| w.ticket.id == id)
    }

    /// Number of queued tickets for a family.
    pub fn depth(&self, family: ModelFamily) -> usize {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.ticket.family == family)
            .count()
    }

    /// Total queued tickets.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Expire tickets older than the stall timeout and drop waiters whose
    /// client has vanished. Expired tickets are handed back to their
    /// handlers as [`QueueVerdict::TimedOut`] for terminal delivery. Also
    /// prunes the wait-sample window.
    pub fn sweep_once(&self) {
        let stall_timeout = self.config.stall_timeout;
        let mut expired = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.retain(|w| !w.resume.is_closed());
            let mut index = 0;
            while index < inner.len() {
                if inner[index].ticket.age() > stall_timeout {
                    expired.push(inner.remove(index));
                } else {
                    index += 1;
                }
            }
        }
        for waiting in expired {
            let Waiting {
                ticket,
                resume,
                heartbeat,
            } = waiting;
            drop(heartbeat);
            warn!(ticket = ticket.id, family = %ticket.family, "queue stall, expiring ticket");
            let _ = resume.send(QueueVerdict::TimedOut(ticket));
        }
        self.estimator.prune();
    }

    /// Run the stall sweep on its interval until the queue is dropped.
    pub async fn sweep_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval_secs = self.config.sweep_interval.as_secs(),
            "stall sweep running"
        );
        loop {
            interval.tick().await;
            self.sweep_once();
        }
    }

    fn spawn_heartbeat(self: &Arc<Self>, sink: SseSink, family: ModelFamily) -> JoinHandle<()> {
        let queue: Weak<RequestQueue> = Arc::downgrade(self);
        let estimator = Arc::clone(&self.estimator);
        let period = self.config.heartbeat_interval;
        let diagnostic = self.config.diagnostic_heartbeat;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick fires immediately; skip it so the heartbeat
            // starts one period after admission.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(queue) = queue.upgrade() else { break };
                if sink.is_closed() {
                    break;
                }
                let depth = queue.depth(family);
                let wait = estimator.estimate(family);
                sink.heartbeat(depth, wait, diagnostic);
            }
        })
    }
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("len", &self.len())
            .finish()
    }
}
