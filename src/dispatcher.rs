//! The dispatch loop: marries waiting tickets to available keys.
//!
//! A single cooperative task polls every 50 ms. Polling rather than
//! condition-variable wake-up is deliberate: rate-limit lockouts expire on
//! wall time, not on an event, so the loop must re-evaluate regardless.
//! Per tick, each family whose key pool reports no lockout gets exactly one
//! ticket resumed; the upstream call runs in the handler's own task, so the
//! loop never blocks on I/O.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::family::ALL_FAMILIES;
use crate::key_pool::KeyPool;
use crate::queue::RequestQueue;

pub struct Dispatcher {
    queue: Arc<RequestQueue>,
    pool: Arc<KeyPool>,
    tick: Duration,
}

impl Dispatcher {
    pub fn new(queue: Arc<RequestQueue>, pool: Arc<KeyPool>, tick: Duration) -> Self {
        Self { queue, pool, tick }
    }

    /// One dispatch pass over all families.
    ///
    /// Skips families whose pool is fully locked out; otherwise resumes the
    /// oldest eligible ticket. Waiters whose client vanished are consumed
    /// until one live resume is delivered.
    pub fn tick_once(&self) {
        for family in ALL_FAMILIES {
            if self.pool.lockout_period(family) > Duration::ZERO {
                continue;
            }
            while let Some(resumed) = self.queue.dequeue(family) {
                if resumed.deliver() {
                    break;
                }
            }
        }
    }

    /// Run the dispatch loop until the task is dropped.
    pub async fn run(self) {
        info!(tick_ms = self.tick.as_millis() as u64, "dispatcher running");
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.tick_once();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::estimator::WaitTimeEstimator;
    use crate::family::ModelFamily;
    use crate::provider::ProviderKind;
    use crate::queue::QueueVerdict;
    use crate::ticket::{Identity, Ticket};
    use serde_json::json;
    use std::collections::HashMap;

    fn setup(keys: &[&str]) -> (Arc<RequestQueue>, Arc<KeyPool>, Dispatcher) {
        let config = Config {
            openai_keys: keys.iter().map(|s| s.to_string()).collect(),
            ..Config::default()
        };
        let estimator = Arc::new(WaitTimeEstimator::new(config.sample_retention));
        let queue = Arc::new(RequestQueue::new(config.clone(), estimator));
        let pool = Arc::new(KeyPool::from_config(&config));
        let dispatcher = Dispatcher::new(
            Arc::clone(&queue),
            Arc::clone(&pool),
            config.dispatch_tick,
        );
        (queue, pool, dispatcher)
    }

    fn ticket(ip: &str, model: &str) -> Ticket {
        Ticket::new(
            Identity::Ip(ip.into()),
            ProviderKind::OpenAi,
            model,
            json!({"model": model, "messages": []}),
            HashMap::new(),
            false,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_resumes_one_ticket_per_family() {
        let (queue, _pool, dispatcher) = setup(&["sk-one"]);
        let mut rx1 = queue.enqueue(ticket("1.1.1.1", "gpt-3.5-turbo"), None).unwrap();
        let mut rx2 = queue.enqueue(ticket("2.2.2.2", "gpt-3.5-turbo"), None).unwrap();

        dispatcher.tick_once();

        assert!(matches!(rx1.try_recv(), Ok(QueueVerdict::Ready(_))));
        // Only one turbo ticket per tick.
        assert!(rx2.try_recv().is_err());
        assert_eq!(queue.len(), 1);

        dispatcher.tick_once();
        assert!(matches!(rx2.try_recv(), Ok(QueueVerdict::Ready(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_serves_families_independently() {
        let (queue, _pool, dispatcher) = setup(&["sk-one"]);
        let mut turbo_rx = queue.enqueue(ticket("1.1.1.1", "gpt-3.5-turbo"), None).unwrap();
        let mut gpt4_rx = queue.enqueue(ticket("2.2.2.2", "gpt-4"), None).unwrap();

        dispatcher.tick_once();

        // One ticket from each partition in the same tick.
        assert!(turbo_rx.try_recv().is_ok());
        assert!(gpt4_rx.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_locked_out_family_left_queued() {
        let (queue, pool, dispatcher) = setup(&["sk-one"]);
        let lease = pool.lease(ModelFamily::Turbo).unwrap();
        pool.mark_rate_limited(lease.id, ModelFamily::Turbo, Some(Duration::from_secs(10)));

        let mut rx = queue.enqueue(ticket("1.1.1.1", "gpt-3.5-turbo"), None).unwrap();
        dispatcher.tick_once();
        assert!(rx.try_recv().is_err());
        assert_eq!(queue.len(), 1);

        // After the lockout passes, the next tick serves it.
        tokio::time::advance(Duration::from_secs(11)).await;
        dispatcher.tick_once();
        assert!(matches!(rx.try_recv(), Ok(QueueVerdict::Ready(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_client_consumed_live_client_served() {
        let (queue, _pool, dispatcher) = setup(&["sk-one"]);
        let rx_dead = queue.enqueue(ticket("1.1.1.1", "gpt-3.5-turbo"), None).unwrap();
        tokio::time::advance(Duration::from_millis(1)).await;
        let mut rx_live = queue.enqueue(ticket("2.2.2.2", "gpt-3.5-turbo"), None).unwrap();
        drop(rx_dead);

        dispatcher.tick_once();
        assert!(matches!(rx_live.try_recv(), Ok(QueueVerdict::Ready(_))));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_dispatches_on_its_own() {
        let (queue, _pool, dispatcher) = setup(&["sk-one"]);
        let rx = queue.enqueue(ticket("1.1.1.1", "gpt-3.5-turbo"), None).unwrap();

        let handle = tokio::spawn(dispatcher.run());
        let verdict = rx.await.unwrap();
        assert!(matches!(verdict, QueueVerdict::Ready(_)));
        handle.abort();
    }
}
