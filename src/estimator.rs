//! Rolling wait-time estimation per model family.
//!
//! Successful requests leave behind a wait sample; the heartbeat reads the
//! windowed average back to waiting clients. Deprioritized traffic is
//! excluded from the average so shared-identity waits do not inflate the
//! estimate shown to normal users.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::family::ModelFamily;

/// One recorded queue wait.
#[derive(Debug, Clone, Copy)]
struct WaitSample {
    family: ModelFamily,
    start: Instant,
    end: Instant,
    deprioritized: bool,
}

/// Rolling list of recent wait samples.
pub struct WaitTimeEstimator {
    samples: Mutex<Vec<WaitSample>>,
    retention: Duration,
}

impl WaitTimeEstimator {
    pub fn new(retention: Duration) -> Self {
        Self {
            samples: Mutex::new(Vec::new()),
            retention,
        }
    }

    /// Record a completed wait. `end` is the ticket's queue-out time.
    pub fn record(&self, family: ModelFamily, start: Instant, end: Instant, deprioritized: bool) {
        debug_assert!(end >= start);
        let mut samples = self.samples.lock().unwrap();
        samples.push(WaitSample {
            family,
            start,
            end,
            deprioritized,
        });
    }

    /// Average wait over non-deprioritized samples for the family recorded
    /// within the retention window. Zero when there are none.
    pub fn estimate(&self, family: ModelFamily) -> Duration {
        let cutoff = Instant::now() - self.retention;
        let samples = self.samples.lock().unwrap();
        let waits: Vec<Duration> = samples
            .iter()
            .filter(|s| s.family == family && !s.deprioritized && s.end >= cutoff)
            .map(|s| s.end - s.start)
            .collect();
        if waits.is_empty() {
            return Duration::ZERO;
        }
        waits.iter().sum::<Duration>() / waits.len() as u32
    }

    /// Drop samples older than the retention window. Runs with the stall
    /// sweep.
    pub fn prune(&self) {
        let cutoff = Instant::now() - self.retention;
        let mut samples = self.samples.lock().unwrap();
        samples.retain(|s| s.end >= cutoff);
    }

    /// Number of retained samples.
    pub fn len(&self) -> usize {
        self.samples.lock().unwrap().len()
    }

    /// True when no samples are retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> WaitTimeEstimator {
        WaitTimeEstimator::new(Duration::from_secs(300))
    }

    #[tokio::test(start_paused = true)]
    async fn test_estimate_empty_is_zero() {
        assert_eq!(estimator().estimate(ModelFamily::Turbo), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_estimate_averages_waits() {
        let est = estimator();
        let start = Instant::now();
        tokio::time::advance(Duration::from_secs(2)).await;
        est.record(ModelFamily::Turbo, start, Instant::now(), false);

        let start = Instant::now();
        tokio::time::advance(Duration::from_secs(4)).await;
        est.record(ModelFamily::Turbo, start, Instant::now(), false);

        assert_eq!(est.estimate(ModelFamily::Turbo), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_estimate_excludes_deprioritized_and_other_families() {
        let est = estimator();
        let start = Instant::now();
        tokio::time::advance(Duration::from_secs(10)).await;
        est.record(ModelFamily::Turbo, start, Instant::now(), true);
        est.record(ModelFamily::Gpt4, start, Instant::now(), false);

        assert_eq!(est.estimate(ModelFamily::Turbo), Duration::ZERO);
        assert_eq!(est.estimate(ModelFamily::Gpt4), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_drops_old_samples() {
        let est = estimator();
        let start = Instant::now();
        tokio::time::advance(Duration::from_secs(1)).await;
        est.record(ModelFamily::Turbo, start, Instant::now(), false);
        assert_eq!(est.len(), 1);

        tokio::time::advance(Duration::from_secs(301)).await;
        est.prune();
        assert!(est.is_empty());
        assert_eq!(est.estimate(ModelFamily::Turbo), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_samples_excluded_before_prune() {
        let est = estimator();
        let start = Instant::now();
        tokio::time::advance(Duration::from_secs(1)).await;
        est.record(ModelFamily::Turbo, start, Instant::now(), false);

        // Past the retention window the sample no longer counts, pruned
        // or not.
        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(est.estimate(ModelFamily::Turbo), Duration::ZERO);
    }
}
