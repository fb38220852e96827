//! Upstream credential pool: leasing, usage tracking, and lockout.
//!
//! The pool owns every configured API key and answers one question for the
//! dispatcher: "can this model family be served right now?" Rate limits are
//! treated as opaque lockout windows — on a 429 the key is benched for the
//! `Retry-After` duration (default 10 s) rather than modeled with token
//! buckets. An empty lease is back-pressure, not an error.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::{redact, AwsCredential, Config};
use crate::family::ModelFamily;
use crate::provider::ProviderKind;

/// Opaque handle to a key in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyId(usize);

/// Per-family usage counters for one key.
#[derive(Debug, Clone, Copy, Default)]
pub struct FamilyUsage {
    pub requests: u64,
    pub tokens: u64,
}

/// One upstream credential and its bookkeeping.
struct KeyRecord {
    provider: ProviderKind,
    secret: String,
    org_id: Option<String>,
    aws: Option<AwsCredential>,
    enabled: bool,
    disabled_reason: Option<String>,
    last_used: HashMap<ModelFamily, Instant>,
    lockout_until: HashMap<ModelFamily, Instant>,
    last_rate_limited_at: Option<Instant>,
    usage: HashMap<ModelFamily, FamilyUsage>,
}

impl KeyRecord {
    fn new(provider: ProviderKind, secret: String) -> Self {
        Self {
            provider,
            secret,
            org_id: None,
            aws: None,
            enabled: true,
            disabled_reason: None,
            last_used: HashMap::new(),
            lockout_until: HashMap::new(),
            last_rate_limited_at: None,
            usage: HashMap::new(),
        }
    }

    fn usable_for(&self, family: ModelFamily, now: Instant) -> bool {
        self.enabled
            && self.provider == family.provider()
            && self
                .lockout_until
                .get(&family)
                .is_none_or(|until| *until <= now)
    }
}

/// A leased key: the data an upstream attempt needs, detached from the pool
/// so the pool lock is never held across I/O.
#[derive(Clone)]
pub struct LeasedKey {
    pub id: KeyId,
    pub provider: ProviderKind,
    pub secret: String,
    pub org_id: Option<String>,
    pub aws: Option<AwsCredential>,
}

impl std::fmt::Debug for LeasedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasedKey")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("secret", &redact(&self.secret))
            .field("org_id", &self.org_id)
            .finish()
    }
}

/// The shared key pool. All mutation is serialized behind one mutex.
pub struct KeyPool {
    keys: Mutex<Vec<KeyRecord>>,
    default_lockout: Duration,
    no_key_holdoff: Duration,
}

impl KeyPool {
    /// Build the pool from the configured per-provider key lists.
    pub fn from_config(config: &Config) -> Self {
        let mut keys = Vec::new();
        for secret in &config.openai_keys {
            keys.push(KeyRecord::new(ProviderKind::OpenAi, secret.clone()));
        }
        for secret in &config.anthropic_keys {
            keys.push(KeyRecord::new(ProviderKind::Anthropic, secret.clone()));
        }
        for secret in &config.google_palm_keys {
            keys.push(KeyRecord::new(ProviderKind::GooglePalm, secret.clone()));
        }
        for cred in &config.aws_credentials {
            let mut record = KeyRecord::new(ProviderKind::Aws, cred.access_key.clone());
            record.aws = Some(cred.clone());
            keys.push(record);
        }
        info!(key_count = keys.len(), "key pool initialized");
        Self {
            keys: Mutex::new(keys),
            default_lockout: config.default_lockout,
            no_key_holdoff: config.no_key_holdoff,
        }
    }

    /// Lease an enabled, non-locked-out key for the family.
    ///
    /// Selection is least-recently-used for that family (approximate
    /// round-robin), with random tie-break among equally idle keys. The
    /// lease stamps `last_used`, so concurrent leases rotate through the
    /// pool rather than piling onto one key.
    pub fn lease(&self, family: ModelFamily) -> Option<LeasedKey> {
        let now = Instant::now();
        let mut keys = self.keys.lock().unwrap();

        let oldest = keys
            .iter()
            .enumerate()
            .filter(|(_, k)| k.usable_for(family, now))
            .map(|(i, k)| (i, k.last_used.get(&family).copied()))
            .min_by_key(|(_, used)| *used)?
            .1;
        let candidates: Vec<usize> = keys
            .iter()
            .enumerate()
            .filter(|(_, k)| {
                k.usable_for(family, now) && k.last_used.get(&family).copied() == oldest
            })
            .map(|(i, _)| i)
            .collect();
        let index = candidates[fastrand::usize(..candidates.len())];

        let record = &mut keys[index];
        record.last_used.insert(family, now);
        Some(LeasedKey {
            id: KeyId(index),
            provider: record.provider,
            secret: record.secret.clone(),
            org_id: record.org_id.clone(),
            aws: record.aws.clone(),
        })
    }

    /// Back-off hint for the dispatcher: zero when at least one key is
    /// usable for the family, otherwise the minimum remaining lockout. A
    /// family with no configured keys at all reports a fixed hold-off so
    /// its partition never spins.
    pub fn lockout_period(&self, family: ModelFamily) -> Duration {
        let now = Instant::now();
        let keys = self.keys.lock().unwrap();

        let mut min_remaining: Option<Duration> = None;
        let mut have_keys = false;
        for key in keys.iter() {
            if !key.enabled || key.provider != family.provider() {
                continue;
            }
            have_keys = true;
            match key.lockout_until.get(&family) {
                Some(until) if *until > now => {
                    let remaining = *until - now;
                    min_remaining = Some(match min_remaining {
                        Some(current) => current.min(remaining),
                        None => remaining,
                    });
                }
                _ => return Duration::ZERO,
            }
        }
        if !have_keys {
            return self.no_key_holdoff;
        }
        min_remaining.unwrap_or(self.no_key_holdoff)
    }

    /// Bench a key for the family. `retry_after` comes from the upstream
    /// `Retry-After` header; absent, the default lockout applies.
    pub fn mark_rate_limited(
        &self,
        id: KeyId,
        family: ModelFamily,
        retry_after: Option<Duration>,
    ) {
        let lockout = retry_after.unwrap_or(self.default_lockout);
        let now = Instant::now();
        let mut keys = self.keys.lock().unwrap();
        if let Some(record) = keys.get_mut(id.0) {
            record.lockout_until.insert(family, now + lockout);
            record.last_rate_limited_at = Some(now);
            warn!(
                key = %redact(&record.secret),
                %family,
                lockout_secs = lockout.as_secs_f64(),
                "key rate limited, locked out"
            );
        }
    }

    /// Permanently retire a key (revoked, invalid, or over quota).
    pub fn disable(&self, id: KeyId, reason: &str) {
        let mut keys = self.keys.lock().unwrap();
        if let Some(record) = keys.get_mut(id.0) {
            if record.enabled {
                record.enabled = false;
                record.disabled_reason = Some(reason.to_string());
                warn!(key = %redact(&record.secret), reason, "key disabled");
            }
        }
    }

    /// Record a successful call against a key's usage counters.
    pub fn record_usage(&self, id: KeyId, family: ModelFamily, tokens: u64) {
        let mut keys = self.keys.lock().unwrap();
        if let Some(record) = keys.get_mut(id.0) {
            let usage = record.usage.entry(family).or_default();
            usage.requests += 1;
            usage.tokens += tokens;
        }
    }

    /// Usage counters for one key and family.
    pub fn usage(&self, id: KeyId, family: ModelFamily) -> FamilyUsage {
        let keys = self.keys.lock().unwrap();
        keys.get(id.0)
            .and_then(|k| k.usage.get(&family).copied())
            .unwrap_or_default()
    }

    /// Whether the key is still enabled.
    pub fn is_enabled(&self, id: KeyId) -> bool {
        let keys = self.keys.lock().unwrap();
        keys.get(id.0).map(|k| k.enabled).unwrap_or(false)
    }

    /// Number of configured keys (enabled or not).
    pub fn len(&self) -> usize {
        self.keys.lock().unwrap().len()
    }

    /// True when no keys are configured at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Construct a `KeyId` directly in unit tests.
#[cfg(test)]
pub(crate) fn test_key_id(index: usize) -> KeyId {
    KeyId(index)
}

impl std::fmt::Debug for KeyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys = self.keys.lock().unwrap();
        f.debug_struct("KeyPool")
            .field("keys", &keys.len())
            .field("enabled", &keys.iter().filter(|k| k.enabled).count())
            .finish()
    }
}
