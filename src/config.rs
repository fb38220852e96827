//! Environment-driven configuration.
//!
//! [`Config`] enumerates every option the relay recognizes. All values have
//! working defaults so `Config::default()` is a usable test fixture; the
//! embedding binary calls [`Config::from_env`] once at startup. Parsing is
//! split into pure helpers so the option grammar is unit-testable without
//! touching the process environment.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::{RelayError, Result};
use crate::family::{ModelFamily, ALL_FAMILIES};

/// Client authentication mode. The backing store for user tokens is an
/// external collaborator; the relay only needs to know which mode is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatekeeperMode {
    /// No client authentication; identity is the source address.
    None,
    /// A single shared proxy password.
    ProxyKey,
    /// Per-user tokens issued by the external user store.
    UserToken,
}

/// Where the gatekeeper's user records live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatekeeperStore {
    /// Process-local, lost on restart.
    Memory,
    /// External key-value store.
    Kv,
}

/// How often per-user token quotas reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaRefreshPeriod {
    Never,
    Hourly,
    Daily,
}

/// One AWS Bedrock credential, parsed from an `access:secret:region` triple.
#[derive(Clone, PartialEq, Eq)]
pub struct AwsCredential {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

impl std::fmt::Debug for AwsCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredential")
            .field("access_key", &redact(&self.access_key))
            .field("secret_key", &"***")
            .field("region", &self.region)
            .finish()
    }
}

/// Shorten a secret to a recognizable prefix for logs and Debug output.
pub(crate) fn redact(secret: &str) -> String {
    if secret.len() > 6 {
        format!("{}***", &secret[..6])
    } else {
        "***".to_string()
    }
}

/// Relay configuration. See the crate docs for the recognized environment
/// variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// `PORT` — listen port for the embedding HTTP server.
    pub port: u16,
    /// `LOG_LEVEL` — tracing filter directive.
    pub log_level: String,
    /// `SERVER_TITLE` — display name used on the info page.
    pub server_title: String,
    /// `MODEL_RATE_LIMIT` — per-identity requests per minute (0 = off).
    pub model_rate_limit: u32,
    /// `MAX_OUTPUT_TOKENS_OPENAI` — output token cap for OpenAI families.
    pub max_output_tokens_openai: u32,
    /// `MAX_OUTPUT_TOKENS_ANTHROPIC` — output token cap for Claude families.
    pub max_output_tokens_anthropic: u32,
    /// `ALLOWED_MODEL_FAMILIES` — families the relay will serve.
    pub allowed_model_families: Vec<ModelFamily>,
    /// `BLOCKED_ORIGINS` — Origin header substrings that are refused.
    pub blocked_origins: Vec<String>,
    /// `BLOCK_MESSAGE` — message returned to blocked origins.
    pub block_message: String,
    /// `BLOCK_REDIRECT` — where blocked browser traffic is sent.
    pub block_redirect: String,
    /// `REJECT_DISALLOWED` — enable the content filter.
    pub reject_disallowed: bool,
    /// `REJECT_MESSAGE` — message returned on a content-filter rejection.
    pub reject_message: String,
    /// `PROMPT_LOGGING` — whether prompts are forwarded to the logging sink.
    pub prompt_logging: bool,
    /// `CHECK_KEYS` — verify keys against the provider at startup.
    pub check_keys: bool,
    /// `GATEKEEPER` — client authentication mode.
    pub gatekeeper: GatekeeperMode,
    /// `GATEKEEPER_STORE` — user store backing the gatekeeper.
    pub gatekeeper_store: GatekeeperStore,
    /// `MAX_IPS_PER_USER` — per-token IP limit enforced by the gatekeeper.
    pub max_ips_per_user: u32,
    /// `TOKEN_QUOTA_*` — per-family token quotas (0 = unlimited).
    pub token_quota: HashMap<ModelFamily, u64>,
    /// `QUOTA_REFRESH_PERIOD` — how often quotas reset.
    pub quota_refresh_period: QuotaRefreshPeriod,

    /// `OPENAI_KEY` — comma-separated OpenAI API keys.
    pub openai_keys: Vec<String>,
    /// `ANTHROPIC_KEY` — comma-separated Anthropic API keys.
    pub anthropic_keys: Vec<String>,
    /// `GOOGLE_PALM_KEY` — comma-separated PaLM API keys.
    pub google_palm_keys: Vec<String>,
    /// `AWS_CREDENTIALS` — comma-separated `access:secret:region` triples.
    pub aws_credentials: Vec<AwsCredential>,

    /// Dispatcher poll interval.
    pub dispatch_tick: Duration,
    /// Keep-alive interval for streaming queue waiters.
    pub heartbeat_interval: Duration,
    /// How often the stall sweep runs.
    pub sweep_interval: Duration,
    /// Maximum time a ticket may wait in the queue.
    pub stall_timeout: Duration,
    /// How long wait samples are retained for the estimator.
    pub sample_retention: Duration,
    /// Lockout applied on a rate limit with no `Retry-After` hint.
    pub default_lockout: Duration,
    /// Hold-off reported for families with no configured keys.
    pub no_key_holdoff: Duration,
    /// How long the models listing is cached.
    pub models_cache_ttl: Duration,
    /// Emit synthetic fake-chunk heartbeats instead of SSE comments.
    pub diagnostic_heartbeat: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 7860,
            log_level: "info".to_string(),
            server_title: "LLM relay".to_string(),
            model_rate_limit: 0,
            max_output_tokens_openai: 300,
            max_output_tokens_anthropic: 400,
            allowed_model_families: ALL_FAMILIES.to_vec(),
            blocked_origins: Vec::new(),
            block_message: "Access denied.".to_string(),
            block_redirect: String::new(),
            reject_disallowed: false,
            reject_message: "This content violates the acceptable use policy.".to_string(),
            prompt_logging: false,
            check_keys: false,
            gatekeeper: GatekeeperMode::None,
            gatekeeper_store: GatekeeperStore::Memory,
            max_ips_per_user: 0,
            token_quota: HashMap::new(),
            quota_refresh_period: QuotaRefreshPeriod::Never,
            openai_keys: Vec::new(),
            anthropic_keys: Vec::new(),
            google_palm_keys: Vec::new(),
            aws_credentials: Vec::new(),
            dispatch_tick: Duration::from_millis(50),
            heartbeat_interval: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(20),
            stall_timeout: Duration::from_secs(5 * 60),
            sample_retention: Duration::from_secs(5 * 60),
            default_lockout: Duration::from_secs(10),
            no_key_holdoff: Duration::from_secs(60),
            models_cache_ttl: Duration::from_secs(60),
            diagnostic_heartbeat: false,
        }
    }
}

impl Config {
    /// Load configuration from the process environment, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        let get = |name: &str| std::env::var(name).ok();

        if let Some(v) = get("PORT") {
            config.port = v
                .parse()
                .map_err(|_| RelayError::InvalidConfig(format!("PORT: '{}'", v)))?;
        }
        if let Some(v) = get("LOG_LEVEL") {
            config.log_level = v;
        }
        if let Some(v) = get("SERVER_TITLE") {
            config.server_title = v;
        }
        if let Some(v) = get("MODEL_RATE_LIMIT") {
            config.model_rate_limit = v
                .parse()
                .map_err(|_| RelayError::InvalidConfig(format!("MODEL_RATE_LIMIT: '{}'", v)))?;
        }
        if let Some(v) = get("MAX_OUTPUT_TOKENS_OPENAI") {
            config.max_output_tokens_openai = v.parse().map_err(|_| {
                RelayError::InvalidConfig(format!("MAX_OUTPUT_TOKENS_OPENAI: '{}'", v))
            })?;
        }
        if let Some(v) = get("MAX_OUTPUT_TOKENS_ANTHROPIC") {
            config.max_output_tokens_anthropic = v.parse().map_err(|_| {
                RelayError::InvalidConfig(format!("MAX_OUTPUT_TOKENS_ANTHROPIC: '{}'", v))
            })?;
        }
        if let Some(v) = get("ALLOWED_MODEL_FAMILIES") {
            config.allowed_model_families = parse_family_list(&v)?;
        }
        if let Some(v) = get("BLOCKED_ORIGINS") {
            config.blocked_origins = parse_list(&v);
        }
        if let Some(v) = get("BLOCK_MESSAGE") {
            config.block_message = v;
        }
        if let Some(v) = get("BLOCK_REDIRECT") {
            config.block_redirect = v;
        }
        if let Some(v) = get("REJECT_DISALLOWED") {
            config.reject_disallowed = parse_bool(&v);
        }
        if let Some(v) = get("REJECT_MESSAGE") {
            config.reject_message = v;
        }
        if let Some(v) = get("PROMPT_LOGGING") {
            config.prompt_logging = parse_bool(&v);
        }
        if let Some(v) = get("CHECK_KEYS") {
            config.check_keys = parse_bool(&v);
        }
        if let Some(v) = get("GATEKEEPER") {
            config.gatekeeper = parse_gatekeeper(&v)?;
        }
        if let Some(v) = get("GATEKEEPER_STORE") {
            config.gatekeeper_store = parse_gatekeeper_store(&v)?;
        }
        if let Some(v) = get("MAX_IPS_PER_USER") {
            config.max_ips_per_user = v
                .parse()
                .map_err(|_| RelayError::InvalidConfig(format!("MAX_IPS_PER_USER: '{}'", v)))?;
        }
        if let Some(v) = get("QUOTA_REFRESH_PERIOD") {
            config.quota_refresh_period = parse_quota_refresh(&v)?;
        }
        for family in ALL_FAMILIES {
            let name = format!(
                "TOKEN_QUOTA_{}",
                family.as_str().to_uppercase().replace('-', "_")
            );
            if let Some(v) = get(&name) {
                let quota = v
                    .parse()
                    .map_err(|_| RelayError::InvalidConfig(format!("{}: '{}'", name, v)))?;
                config.token_quota.insert(family, quota);
            }
        }

        if let Some(v) = get("OPENAI_KEY") {
            config.openai_keys = parse_list(&v);
        }
        if let Some(v) = get("ANTHROPIC_KEY") {
            config.anthropic_keys = parse_list(&v);
        }
        if let Some(v) = get("GOOGLE_PALM_KEY") {
            config.google_palm_keys = parse_list(&v);
        }
        if let Some(v) = get("AWS_CREDENTIALS") {
            config.aws_credentials = parse_aws_credentials(&v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// The output token cap for a family, from `MAX_OUTPUT_TOKENS_*`.
    pub fn max_output_tokens(&self, family: ModelFamily) -> u32 {
        match family {
            ModelFamily::Claude | ModelFamily::AwsClaude => self.max_output_tokens_anthropic,
            _ => self.max_output_tokens_openai,
        }
    }

    /// The per-family token quota, zero meaning unlimited.
    pub fn token_quota_for(&self, family: ModelFamily) -> u64 {
        self.token_quota.get(&family).copied().unwrap_or(0)
    }

    fn validate(&self) -> Result<()> {
        if self.allowed_model_families.is_empty() {
            return Err(RelayError::InvalidConfig(
                "ALLOWED_MODEL_FAMILIES must name at least one family".into(),
            ));
        }
        if self.max_output_tokens_openai == 0 || self.max_output_tokens_anthropic == 0 {
            return Err(RelayError::InvalidConfig(
                "MAX_OUTPUT_TOKENS_* must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Split a comma-separated list, dropping empty entries.
pub(crate) fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "yes")
}

fn parse_family_list(value: &str) -> Result<Vec<ModelFamily>> {
    parse_list(value)
        .iter()
        .map(|s| {
            s.parse::<ModelFamily>()
                .map_err(RelayError::InvalidConfig)
        })
        .collect()
}

fn parse_gatekeeper(value: &str) -> Result<GatekeeperMode> {
    match value.trim().to_lowercase().as_str() {
        "none" => Ok(GatekeeperMode::None),
        "proxy_key" => Ok(GatekeeperMode::ProxyKey),
        "user_token" => Ok(GatekeeperMode::UserToken),
        other => Err(RelayError::InvalidConfig(format!(
            "GATEKEEPER: '{}'",
            other
        ))),
    }
}

fn parse_gatekeeper_store(value: &str) -> Result<GatekeeperStore> {
    match value.trim().to_lowercase().as_str() {
        "memory" => Ok(GatekeeperStore::Memory),
        "kv" => Ok(GatekeeperStore::Kv),
        other => Err(RelayError::InvalidConfig(format!(
            "GATEKEEPER_STORE: '{}'",
            other
        ))),
    }
}

fn parse_quota_refresh(value: &str) -> Result<QuotaRefreshPeriod> {
    match value.trim().to_lowercase().as_str() {
        "" | "never" => Ok(QuotaRefreshPeriod::Never),
        "hourly" => Ok(QuotaRefreshPeriod::Hourly),
        "daily" => Ok(QuotaRefreshPeriod::Daily),
        other => Err(RelayError::InvalidConfig(format!(
            "QUOTA_REFRESH_PERIOD: '{}'",
            other
        ))),
    }
}

/// Parse `AWS_CREDENTIALS`: comma-separated `access:secret:region` triples.
fn parse_aws_credentials(value: &str) -> Result<Vec<AwsCredential>> {
    parse_list(value)
        .iter()
        .map(|entry| {
            let parts: Vec<&str> = entry.splitn(3, ':').collect();
            match parts.as_slice() {
                [access, secret, region]
                    if !access.is_empty() && !secret.is_empty() && !region.is_empty() =>
                {
                    Ok(AwsCredential {
                        access_key: access.to_string(),
                        secret_key: secret.to_string(),
                        region: region.to_string(),
                    })
                }
                _ => Err(RelayError::InvalidConfig(format!(
                    "AWS_CREDENTIALS entry '{}' is not an access:secret:region triple",
                    redact(entry)
                ))),
            }
        })
        .collect()
}
