//! Environment-driven configuration resolver.
//!
//! Every knob in the gateway is parsed from a named environment variable with
//! explicit bounds. Parsing never panics: an invalid or out-of-range value
//! silently falls back to the documented default, the same way the upstream
//! `RateLimiter::default()` env-parsing helper in this codebase's lineage
//! works, generalized into reusable bounded parsers.

use std::collections::HashSet;
use std::time::Duration;

fn env_raw(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Parse a bounded `u64` from `name`, clamping to `[min, max]`. Falls back to
/// `default` on missing/unparseable input.
pub fn env_bounded_u64(name: &str, min: u64, max: u64, default: u64) -> u64 {
    match env_raw(name).and_then(|v| v.parse::<u64>().ok()) {
        Some(v) => v.clamp(min, max),
        None => default,
    }
}

/// Parse a bounded `usize` from `name`, clamping to `[min, max]`.
pub fn env_bounded_usize(name: &str, min: usize, max: usize, default: usize) -> usize {
    match env_raw(name).and_then(|v| v.parse::<usize>().ok()) {
        Some(v) => v.clamp(min, max),
        None => default,
    }
}

/// Parse a boolean environment variable against the documented whitelist
/// `{1,true,yes}` / `{0,false,no}` (case-insensitive). Anything else falls
/// back to `default`.
pub fn env_bool(name: &str, default: bool) -> bool {
    match env_raw(name).map(|v| v.to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no") => false,
        _ => default,
    }
}

/// Parse an enum-like string env var against an explicit whitelist.
pub fn env_enum<'a>(name: &str, whitelist: &[&'a str], default: &'a str) -> &'a str {
    match env_raw(name) {
        Some(v) => whitelist
            .iter()
            .find(|w| w.eq_ignore_ascii_case(&v))
            .copied()
            .unwrap_or(default),
        None => default,
    }
}

/// Parse an identifier-shaped string (namespace versions, region ids, model
/// ids, key prefixes): ASCII alphanumeric plus `-_.:` only, non-empty,
/// capped at 128 bytes. Falls back to `default` otherwise.
pub fn env_identifier(name: &str, default: &str) -> String {
    match env_raw(name) {
        Some(v) if is_valid_identifier(&v) => v,
        _ => default.to_string(),
    }
}

fn is_valid_identifier(v: &str) -> bool {
    !v.is_empty()
        && v.len() <= 128
        && v.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}

/// Admission-control sub-configuration (§4.F, §6 env vars `ADMISSION_*`).
#[derive(Clone, Debug)]
pub struct AdmissionConfig {
    pub enabled: bool,
    pub shadow_mode: bool,
    pub redis_url: String,
    pub redis_token: String,
    pub key_prefix: String,
    pub enforce_user_inflight: bool,
    pub enforce_global_inflight: bool,
    pub enforce_global_msg_rate: bool,
    pub enforce_global_tool_rate: bool,
    pub user_max_inflight: u64,
    pub global_max_inflight: u64,
    pub global_max_msg_per_sec: u64,
    pub global_max_tool_per_sec: u64,
    pub estimated_tool_calls_per_msg: u64,
    pub ticket_ttl_ms: u64,
    pub retry_after_ms: u64,
    pub retry_after_jitter_pct: u64,
    pub allowed_event_sample_pct: u64,
}

impl AdmissionConfig {
    fn from_env() -> Self {
        Self {
            enabled: env_bool("FF_ADMISSION_ENFORCE", true) || env_bool("ADMISSION_REDIS_ENABLED", true),
            shadow_mode: env_bool("ADMISSION_REDIS_SHADOW_MODE", false),
            redis_url: env_raw("ADMISSION_REDIS_URL").unwrap_or_default(),
            redis_token: env_raw("ADMISSION_REDIS_TOKEN").unwrap_or_default(),
            key_prefix: env_identifier("ADMISSION_REDIS_KEY_PREFIX", "sendcat:admission"),
            enforce_user_inflight: env_bool("ADMISSION_ENFORCE_USER_INFLIGHT", true),
            enforce_global_inflight: env_bool("ADMISSION_ENFORCE_GLOBAL_INFLIGHT", true),
            enforce_global_msg_rate: env_bool("ADMISSION_ENFORCE_GLOBAL_MSG_RATE", true),
            enforce_global_tool_rate: env_bool("ADMISSION_ENFORCE_GLOBAL_TOOL_RATE", false),
            user_max_inflight: env_bounded_u64("ADMISSION_USER_MAX_INFLIGHT", 1, 1_000, 2),
            global_max_inflight: env_bounded_u64("ADMISSION_GLOBAL_MAX_INFLIGHT", 1, 1_000_000, 2_000),
            global_max_msg_per_sec: env_bounded_u64("ADMISSION_GLOBAL_MAX_MSG_PER_SEC", 1, 1_000_000, 500),
            global_max_tool_per_sec: env_bounded_u64("ADMISSION_GLOBAL_MAX_TOOL_PER_SEC", 1, 1_000_000, 1_000),
            estimated_tool_calls_per_msg: env_bounded_u64("ADMISSION_EST_TOOL_CALLS_PER_MSG", 0, 20, 1),
            ticket_ttl_ms: env_bounded_u64("ADMISSION_TICKET_TTL_MS", 1_000, 600_000, 120_000),
            retry_after_ms: env_bounded_u64("ADMISSION_RETRY_AFTER_MS", 100, 60_000, 1_000),
            retry_after_jitter_pct: env_bounded_u64("ADMISSION_RETRY_AFTER_JITTER_PCT", 0, 90, 20),
            allowed_event_sample_pct: env_bounded_u64("ADMISSION_ALLOWED_EVENT_SAMPLE_PCT", 0, 100, 5),
        }
    }
}

/// Rate-limit bucket bound (§4.B, env vars `RATE_LIMIT_<BUCKET>_{MAX,WINDOW_MS}`).
#[derive(Clone, Copy, Debug)]
pub struct RateLimitBucketConfig {
    pub max: u64,
    pub window_ms: u64,
}

/// Named circuit-breaker threshold/cooldown pair (§4.D).
#[derive(Clone, Copy, Debug)]
pub struct CircuitBreakerConfigEntry {
    pub threshold: usize,
    pub cooldown_ms: u64,
}

/// Named bulkhead cap (§4.E).
#[derive(Clone, Copy, Debug)]
pub struct BulkheadConfigEntry {
    pub max_concurrent: usize,
    pub lease_ttl_ms: u64,
}

/// Provider routing sub-configuration (§4.H).
#[derive(Clone, Debug)]
pub struct ChatRouteConfig {
    pub timeout_ms: u64,
    pub retries: usize,
    pub fast_model: String,
    pub agent_model: String,
}

/// Tool-job queue sub-configuration (§4.G).
#[derive(Clone, Debug)]
pub struct ToolQueueConfig {
    pub max_per_run: usize,
    pub lease_ms: u64,
    pub wait_ms: u64,
    pub poll_ms: u64,
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub retention_ms: u64,
    pub dead_letter_retention_ms: u64,
    pub claim_scan_size: usize,
    pub max_queued_by_tool: u64,
    pub running_cap_by_tool: u64,
    pub running_cap_by_qos: u64,
}

/// Region/topology metadata (§4.J, read-only posture, no active steering).
#[derive(Clone, Debug, serde::Serialize)]
pub struct RegionConfig {
    pub region_id: String,
    pub topology_mode: String,
    pub readiness_only: bool,
}

/// Feature flags (§6 `FF_*`).
#[derive(Clone, Copy, Debug)]
pub struct FeatureFlags {
    pub chat_gateway_enabled: bool,
    pub chat_gateway_shadow: bool,
    pub admission_enforce: bool,
    pub tool_queue_enforce: bool,
    pub provider_failover_enabled: bool,
    pub fail_closed_on_redis_error: bool,
    pub chat_gateway_health_enabled: bool,
}

/// A fully-resolved, typed configuration snapshot (§4.A).
///
/// `Config::snapshot()` is pure and cheap enough to call per request; callers
/// that want a longer-lived value may cache the `Arc` it's usually wrapped
/// in at the call site.
#[derive(Clone, Debug)]
pub struct Config {
    pub admission: AdmissionConfig,
    pub rate_limits: RateLimitBuckets,
    pub circuit_breakers: CircuitBreakers,
    pub bulkheads: Bulkheads,
    pub chat_primary: ChatRouteConfig,
    pub chat_secondary: ChatRouteConfig,
    pub default_model_class: String,
    pub tool_queue: ToolQueueConfig,
    pub region: RegionConfig,
    pub flags: FeatureFlags,
    pub allowed_origins: HashSet<String>,
    pub bulkhead_sentry_cooldown_ms: u64,
}

/// Named rate-limit buckets known to the gateway.
#[derive(Clone, Debug)]
pub struct RateLimitBuckets {
    pub chat_stream_session: RateLimitBucketConfig,
    pub webhook_ingest: RateLimitBucketConfig,
}

/// Named circuit breakers known to the gateway (one per upstream route).
#[derive(Clone, Debug)]
pub struct CircuitBreakers {
    pub chat_primary: CircuitBreakerConfigEntry,
    pub chat_secondary: CircuitBreakerConfigEntry,
    pub search_web: CircuitBreakerConfigEntry,
    pub search_products: CircuitBreakerConfigEntry,
    pub search_global: CircuitBreakerConfigEntry,
}

/// Named bulkheads known to the gateway.
#[derive(Clone, Debug)]
pub struct Bulkheads {
    pub chat_primary: BulkheadConfigEntry,
    pub chat_secondary: BulkheadConfigEntry,
    pub search_web: BulkheadConfigEntry,
    pub search_products: BulkheadConfigEntry,
    pub search_global: BulkheadConfigEntry,
    pub tool_job_worker: BulkheadConfigEntry,
}

impl Config {
    /// Resolve a fresh configuration snapshot from the process environment.
    ///
    /// Never panics: every knob falls back to a documented default when its
    /// environment variable is absent or fails validation.
    pub fn snapshot() -> Self {
        let origins = env_raw("CHAT_GATEWAY_ALLOWED_ORIGINS")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        Config {
            admission: AdmissionConfig::from_env(),
            rate_limits: RateLimitBuckets {
                chat_stream_session: RateLimitBucketConfig {
                    max: env_bounded_u64("RATE_LIMIT_CHAT_STREAM_MAX", 1, 10_000, 20),
                    window_ms: env_bounded_u64("RATE_LIMIT_CHAT_STREAM_WINDOW_MS", 1_000, 3_600_000, 60_000),
                },
                webhook_ingest: RateLimitBucketConfig {
                    max: env_bounded_u64("RATE_LIMIT_WEBHOOK_MAX", 1, 10_000, 120),
                    window_ms: env_bounded_u64("RATE_LIMIT_WEBHOOK_WINDOW_MS", 1_000, 3_600_000, 60_000),
                },
            },
            circuit_breakers: CircuitBreakers {
                chat_primary: CircuitBreakerConfigEntry {
                    threshold: env_bounded_usize("CIRCUIT_CHAT_PRIMARY_THRESHOLD", 1, 1_000, 5),
                    cooldown_ms: env_bounded_u64("CIRCUIT_CHAT_PRIMARY_COOLDOWN_MS", 100, 600_000, 30_000),
                },
                chat_secondary: CircuitBreakerConfigEntry {
                    threshold: env_bounded_usize("CIRCUIT_CHAT_SECONDARY_THRESHOLD", 1, 1_000, 5),
                    cooldown_ms: env_bounded_u64("CIRCUIT_CHAT_SECONDARY_COOLDOWN_MS", 100, 600_000, 30_000),
                },
                search_web: CircuitBreakerConfigEntry {
                    threshold: env_bounded_usize("CIRCUIT_SEARCH_WEB_THRESHOLD", 1, 1_000, 5),
                    cooldown_ms: env_bounded_u64("CIRCUIT_SEARCH_WEB_COOLDOWN_MS", 100, 600_000, 20_000),
                },
                search_products: CircuitBreakerConfigEntry {
                    threshold: env_bounded_usize("CIRCUIT_SEARCH_PRODUCTS_THRESHOLD", 1, 1_000, 5),
                    cooldown_ms: env_bounded_u64("CIRCUIT_SEARCH_PRODUCTS_COOLDOWN_MS", 100, 600_000, 20_000),
                },
                search_global: CircuitBreakerConfigEntry {
                    threshold: env_bounded_usize("CIRCUIT_SEARCH_GLOBAL_THRESHOLD", 1, 1_000, 5),
                    cooldown_ms: env_bounded_u64("CIRCUIT_SEARCH_GLOBAL_COOLDOWN_MS", 100, 600_000, 20_000),
                },
            },
            bulkheads: Bulkheads {
                chat_primary: BulkheadConfigEntry {
                    max_concurrent: env_bounded_usize("BULKHEAD_CHAT_PRIMARY_MAX_CONCURRENT", 1, 100_000, 200),
                    lease_ttl_ms: env_bounded_u64("BULKHEAD_CHAT_PRIMARY_LEASE_TTL_MS", 1_000, 600_000, 60_000),
                },
                chat_secondary: BulkheadConfigEntry {
                    max_concurrent: env_bounded_usize("BULKHEAD_CHAT_SECONDARY_MAX_CONCURRENT", 1, 100_000, 100),
                    lease_ttl_ms: env_bounded_u64("BULKHEAD_CHAT_SECONDARY_LEASE_TTL_MS", 1_000, 600_000, 60_000),
                },
                search_web: BulkheadConfigEntry {
                    max_concurrent: env_bounded_usize("BULKHEAD_SEARCH_WEB_MAX_CONCURRENT", 1, 100_000, 50),
                    lease_ttl_ms: env_bounded_u64("BULKHEAD_SEARCH_WEB_LEASE_TTL_MS", 1_000, 600_000, 15_000),
                },
                search_products: BulkheadConfigEntry {
                    max_concurrent: env_bounded_usize("BULKHEAD_SEARCH_PRODUCTS_MAX_CONCURRENT", 1, 100_000, 50),
                    lease_ttl_ms: env_bounded_u64("BULKHEAD_SEARCH_PRODUCTS_LEASE_TTL_MS", 1_000, 600_000, 15_000),
                },
                search_global: BulkheadConfigEntry {
                    max_concurrent: env_bounded_usize("BULKHEAD_SEARCH_GLOBAL_MAX_CONCURRENT", 1, 100_000, 20),
                    lease_ttl_ms: env_bounded_u64("BULKHEAD_SEARCH_GLOBAL_LEASE_TTL_MS", 1_000, 600_000, 15_000),
                },
                tool_job_worker: BulkheadConfigEntry {
                    max_concurrent: env_bounded_usize("BULKHEAD_TOOL_JOB_WORKER_MAX_CONCURRENT", 1, 1_000, 8),
                    lease_ttl_ms: env_bounded_u64("BULKHEAD_TOOL_JOB_WORKER_LEASE_TTL_MS", 1_000, 600_000, 60_000),
                },
            },
            chat_primary: ChatRouteConfig {
                timeout_ms: env_bounded_u64("CHAT_PROVIDER_PRIMARY_TIMEOUT_MS", 1_000, 600_000, 45_000),
                retries: env_bounded_usize("CHAT_PROVIDER_PRIMARY_RETRIES", 0, 10, 2),
                fast_model: env_identifier("CHAT_MODEL_FAST_PRIMARY", "gpt-4.1-mini"),
                agent_model: env_identifier("CHAT_MODEL_AGENT_PRIMARY", "gpt-4.1"),
            },
            chat_secondary: ChatRouteConfig {
                timeout_ms: env_bounded_u64("CHAT_PROVIDER_SECONDARY_TIMEOUT_MS", 1_000, 600_000, 35_000),
                retries: env_bounded_usize("CHAT_PROVIDER_SECONDARY_RETRIES", 0, 10, 1),
                fast_model: env_identifier("CHAT_MODEL_FAST_SECONDARY", "claude-haiku"),
                agent_model: env_identifier("CHAT_MODEL_AGENT_SECONDARY", "claude-sonnet"),
            },
            default_model_class: env_enum("CHAT_DEFAULT_MODEL_CLASS", &["fast", "agent"], "agent").to_string(),
            tool_queue: ToolQueueConfig {
                max_per_run: env_bounded_usize("TOOL_JOB_MAX_PER_RUN", 1, 1_000, 10),
                lease_ms: env_bounded_u64("TOOL_JOB_LEASE_MS", 1_000, 600_000, 30_000),
                wait_ms: env_bounded_u64("TOOL_JOB_WAIT_MS", 250, 120_000, 8_000),
                poll_ms: env_bounded_u64("TOOL_JOB_POLL_MS", 50, 10_000, 250),
                max_attempts: env_bounded_u64("TOOL_JOB_MAX_ATTEMPTS", 1, 20, 3) as u32,
                retry_base_ms: env_bounded_u64("TOOL_JOB_RETRY_BASE_MS", 100, 60_000, 1_500),
                retention_ms: env_bounded_u64("TOOL_JOB_TTL_MS", 60_000, 2_592_000_000, 86_400_000),
                dead_letter_retention_ms: env_bounded_u64(
                    "TOOL_JOB_DLQ_TTL_MS", 60_000, 7_776_000_000, 604_800_000,
                ),
                claim_scan_size: env_bounded_usize("TOOL_JOB_CLAIM_SCAN", 1, 1_000, 50),
                max_queued_by_tool: env_bounded_u64("TOOL_JOB_QMAX_DEFAULT", 1, 1_000_000, 500),
                running_cap_by_tool: env_bounded_u64("TOOL_JOB_RUNMAX_DEFAULT", 1, 100_000, 20),
                running_cap_by_qos: env_bounded_u64("TOOL_JOB_RUNMAX_QOS_DEFAULT", 1, 100_000, 50),
            },
            region: RegionConfig {
                region_id: env_identifier("RELIABILITY_REGION_ID", "local"),
                topology_mode: env_enum(
                    "RELIABILITY_TOPOLOGY_MODE",
                    &["single", "active-passive", "active-active-readonly"],
                    "single",
                )
                .to_string(),
                readiness_only: env_bool("RELIABILITY_REGION_READINESS_ONLY", true),
            },
            flags: FeatureFlags {
                chat_gateway_enabled: env_bool("FF_CHAT_GATEWAY_ENABLED", true),
                chat_gateway_shadow: env_bool("FF_CHAT_GATEWAY_SHADOW", false),
                admission_enforce: env_bool("FF_ADMISSION_ENFORCE", true),
                tool_queue_enforce: env_bool("FF_TOOL_QUEUE_ENFORCE", true),
                provider_failover_enabled: env_bool("FF_PROVIDER_FAILOVER_ENABLED", true),
                fail_closed_on_redis_error: env_bool("FF_FAIL_CLOSED_ON_REDIS_ERROR", true),
                chat_gateway_health_enabled: env_bool("FF_CHAT_GATEWAY_HEALTH_ENABLED", true),
            },
            allowed_origins: origins,
            bulkhead_sentry_cooldown_ms: env_bounded_u64("BULKHEAD_SENTRY_COOLDOWN_MS", 1_000, 3_600_000, 300_000),
        }
    }

    /// Admission mode derived from feature flags: `enforce` unless the
    /// rollout is explicitly in shadow mode.
    pub fn admission_mode(&self) -> crate::admission::AdmissionMode {
        if self.flags.chat_gateway_shadow || self.admission.shadow_mode {
            crate::admission::AdmissionMode::Shadow
        } else {
            crate::admission::AdmissionMode::Enforce
        }
    }

    /// Redacted projection safe to return from `/api/chat/health` and the
    /// ops snapshot: no Redis tokens, no provider keys.
    pub fn redacted(&self) -> RedactedConfig {
        RedactedConfig {
            region: self.region.clone(),
            admission_enforce: self.flags.admission_enforce,
            admission_shadow: self.admission.shadow_mode,
            admission_retry_after_ms: self.admission.retry_after_ms,
            admission_retry_after_jitter_pct: self.admission.retry_after_jitter_pct,
            chat_primary_timeout_ms: self.chat_primary.timeout_ms,
            chat_primary_retries: self.chat_primary.retries,
            chat_secondary_timeout_ms: self.chat_secondary.timeout_ms,
            chat_secondary_retries: self.chat_secondary.retries,
            default_model_class: self.default_model_class.clone(),
            provider_failover_enabled: self.flags.provider_failover_enabled,
            tool_queue_alert_thresholds: ToolQueueAlertThresholds::default(),
            health_enabled: self.flags.chat_gateway_health_enabled,
        }
    }
}

/// Default alert thresholds surfaced on the redacted config / health
/// endpoint (§4.G monitorQueueHealth).
#[derive(Clone, Copy, Debug, serde::Serialize)]
pub struct ToolQueueAlertThresholds {
    pub queued_depth: u64,
    pub oldest_queued_age_minutes: u64,
    pub oldest_running_age_minutes: u64,
    pub dead_letter_depth: u64,
    pub window_minutes: u64,
}

impl Default for ToolQueueAlertThresholds {
    fn default() -> Self {
        Self {
            queued_depth: env_bounded_u64("TOOL_QUEUE_ALERT_QUEUED_DEPTH", 1, 1_000_000, 200),
            oldest_queued_age_minutes: env_bounded_u64("TOOL_QUEUE_ALERT_OLDEST_QUEUED_MIN", 1, 1_440, 10),
            oldest_running_age_minutes: env_bounded_u64("TOOL_QUEUE_ALERT_OLDEST_RUNNING_MIN", 1, 1_440, 15),
            dead_letter_depth: env_bounded_u64("TOOL_QUEUE_ALERT_DLQ_DEPTH", 1, 1_000_000, 50),
            window_minutes: env_bounded_u64("TOOL_QUEUE_ALERT_WINDOW_MIN", 1, 1_440, 15),
        }
    }
}

/// Safe-to-serialize configuration projection (§4.I `/api/chat/health`).
#[derive(Clone, Debug, serde::Serialize)]
pub struct RedactedConfig {
    pub region: RegionConfig,
    pub admission_enforce: bool,
    pub admission_shadow: bool,
    pub admission_retry_after_ms: u64,
    pub admission_retry_after_jitter_pct: u64,
    pub chat_primary_timeout_ms: u64,
    pub chat_primary_retries: usize,
    pub chat_secondary_timeout_ms: u64,
    pub chat_secondary_retries: usize,
    pub default_model_class: String,
    pub provider_failover_enabled: bool,
    pub tool_queue_alert_thresholds: ToolQueueAlertThresholds,
    pub health_enabled: bool,
}

impl serde::Serialize for RegionConfig {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("RegionConfig", 3)?;
        s.serialize_field("region_id", &self.region_id)?;
        s.serialize_field("topology_mode", &self.topology_mode)?;
        s.serialize_field("readiness_only", &self.readiness_only)?;
        s.end()
    }
}
