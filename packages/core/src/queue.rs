//! Queue configuration and statistics.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// What happens to a job body once the job completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    /// Keep the body with state `completed`.
    #[default]
    Keep,
    /// Delete the body.
    Discard,
}

impl std::str::FromStr for Retention {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep" => Ok(Retention::Keep),
            "discard" => Ok(Retention::Discard),
            other => Err(ConfigError::Env {
                key: "QUEUE_RETENTION".into(),
                value: other.into(),
            }),
        }
    }
}

/// Backoff for retrying transient store failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreRetry {
    /// Attempts per operation before giving up for this round.
    pub max_attempts: u32,
    /// Delay before the second attempt (milliseconds).
    pub base_delay_ms: u64,
    /// Upper bound on the delay between attempts (milliseconds).
    pub max_delay_ms: u64,
}

impl Default for StoreRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 50,
            max_delay_ms: 2_000,
        }
    }
}

impl StoreRetry {
    /// Delay to wait after the given failed try (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

/// Upper bound for every configured duration: one year.
pub const MAX_DURATION_MS: u64 = 365 * 24 * 60 * 60 * 1_000;

/// Configuration for queue behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of concurrent worker slots.
    pub concurrency: u32,
    /// Maximum handler runtime before the lease expires (milliseconds).
    pub lease_duration_ms: u64,
    /// First retry delay (milliseconds).
    pub base_delay_ms: u64,
    /// Retry delay cap (milliseconds).
    pub max_delay_ms: u64,
    /// Relative jitter applied to retry delays, 0.0 to 1.0.
    pub jitter: f64,
    /// How often due scheduled jobs are promoted (milliseconds).
    pub sweep_interval_ms: u64,
    /// How often expired leases are reclaimed (milliseconds). Defaults to half the lease.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reap_interval_ms: Option<u64>,
    /// Attempts granted to jobs that don't ask for a specific number.
    pub default_max_attempts: u32,
    /// How long an idle worker blocks waiting for work (milliseconds).
    pub claim_timeout_ms: u64,
    /// How often queue depth is sampled for observers (milliseconds).
    pub stats_interval_ms: u64,
    /// What to do with completed job bodies.
    pub retention: Retention,
    /// Retry settings for transient store failures.
    pub store_retry: StoreRetry,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            lease_duration_ms: 300_000,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            jitter: 0.2,
            sweep_interval_ms: 1_000,
            reap_interval_ms: None,
            default_max_attempts: 3,
            claim_timeout_ms: 1_000,
            stats_interval_ms: 30_000,
            retention: Retention::Keep,
            store_retry: StoreRetry::default(),
        }
    }
}

impl QueueConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(
            self.reap_interval_ms
                .unwrap_or(self.lease_duration_ms / 2)
                .max(1),
        )
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    /// Check the configuration for values the queue cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if self.lease_duration_ms == 0 {
            return Err(ConfigError::Invalid("lease_duration_ms must be positive".into()));
        }
        if self.claim_timeout_ms == 0 {
            return Err(ConfigError::Invalid("claim_timeout_ms must be positive".into()));
        }
        let durations = [
            ("lease_duration_ms", self.lease_duration_ms),
            ("max_delay_ms", self.max_delay_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
            ("reap_interval_ms", self.reap_interval_ms.unwrap_or(0)),
            ("claim_timeout_ms", self.claim_timeout_ms),
            ("stats_interval_ms", self.stats_interval_ms),
        ];
        if let Some((name, value)) = durations.iter().find(|(_, ms)| *ms > MAX_DURATION_MS) {
            return Err(ConfigError::Invalid(format!(
                "{name} ({value}) exceeds the {MAX_DURATION_MS}ms limit"
            )));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid("jitter must be within 0.0..=1.0".into()));
        }
        if self.sweep_interval_ms == 0 || self.stats_interval_ms == 0 {
            return Err(ConfigError::Invalid("intervals must be positive".into()));
        }
        if self.reap_interval_ms == Some(0) {
            return Err(ConfigError::Invalid("reap_interval_ms must be positive".into()));
        }
        if self.default_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "default_max_attempts must be at least 1".into(),
            ));
        }
        if self.store_retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "store_retry.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Build a config from environment variables.
    ///
    /// Every variable is optional and falls back to the default:
    /// - `QUEUE_CONCURRENCY`
    /// - `QUEUE_LEASE_MS`
    /// - `QUEUE_BASE_DELAY_MS`, `QUEUE_MAX_DELAY_MS`, `QUEUE_JITTER`
    /// - `QUEUE_SWEEP_INTERVAL_MS`, `QUEUE_REAP_INTERVAL_MS`
    /// - `QUEUE_DEFAULT_MAX_ATTEMPTS`
    /// - `QUEUE_CLAIM_TIMEOUT_MS`, `QUEUE_STATS_INTERVAL_MS`
    /// - `QUEUE_RETENTION` (`keep` or `discard`)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`QueueConfig::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, "QUEUE_CONCURRENCY")? {
            config.concurrency = v;
        }
        if let Some(v) = parse_var(&lookup, "QUEUE_LEASE_MS")? {
            config.lease_duration_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "QUEUE_BASE_DELAY_MS")? {
            config.base_delay_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "QUEUE_MAX_DELAY_MS")? {
            config.max_delay_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "QUEUE_JITTER")? {
            config.jitter = v;
        }
        if let Some(v) = parse_var(&lookup, "QUEUE_SWEEP_INTERVAL_MS")? {
            config.sweep_interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "QUEUE_REAP_INTERVAL_MS")? {
            config.reap_interval_ms = Some(v);
        }
        if let Some(v) = parse_var(&lookup, "QUEUE_DEFAULT_MAX_ATTEMPTS")? {
            config.default_max_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "QUEUE_CLAIM_TIMEOUT_MS")? {
            config.claim_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "QUEUE_STATS_INTERVAL_MS")? {
            config.stats_interval_ms = v;
        }
        if let Some(v) = lookup("QUEUE_RETENTION") {
            config.retention = v.trim().to_ascii_lowercase().parse()?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| ConfigError::Env {
            key: key.to_string(),
            value: raw,
        }),
    }
}

/// Number of ids currently held in each store collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub waiting: u64,
    pub scheduled: u64,
    pub in_flight: u64,
    pub dead_lettered: u64,
}

impl QueueDepth {
    /// Jobs that still have work ahead of them.
    pub fn active(&self) -> u64 {
        self.waiting + self.scheduled + self.in_flight
    }
}

/// Counters and the latest depth sample for a queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueStats {
    /// Latest sampled depth.
    pub depth: QueueDepth,
    /// Jobs accepted by enqueue.
    pub enqueued: u64,
    /// Attempts started by workers.
    pub started: u64,
    /// Jobs completed successfully.
    pub completed: u64,
    /// Attempts that failed (handler error, deadline or lease expiry).
    pub failed: u64,
    /// Failed attempts that were scheduled for another try.
    pub retried: u64,
    /// Jobs moved to the dead-letter collection.
    pub dead_lettered: u64,
    /// Leases reclaimed by the reaper.
    pub lease_expired: u64,
}

impl QueueStats {
    /// Total attempts that finished one way or another.
    pub fn processed(&self) -> u64 {
        self.completed + self.failed
    }

    /// Success rate as a percentage.
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.processed();
        if total == 0 {
            None
        } else {
            Some((self.completed as f64 / total as f64) * 100.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn reap_interval_defaults_to_half_the_lease() {
        let config = QueueConfig {
            lease_duration_ms: 10_000,
            ..Default::default()
        };
        assert_eq!(config.reap_interval(), Duration::from_secs(5));
    }

    #[test]
    fn env_overrides_defaults() {
        let config = QueueConfig::from_lookup(lookup(&[
            ("QUEUE_CONCURRENCY", "8"),
            ("QUEUE_LEASE_MS", "2000"),
            ("QUEUE_RETENTION", "Discard"),
        ]))
        .unwrap();

        assert_eq!(config.concurrency, 8);
        assert_eq!(config.lease_duration_ms, 2_000);
        assert_eq!(config.retention, Retention::Discard);
        assert_eq!(config.default_max_attempts, 3);
    }

    #[test]
    fn env_rejects_garbage() {
        let err = QueueConfig::from_lookup(lookup(&[("QUEUE_CONCURRENCY", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Env { ref key, .. } if key == "QUEUE_CONCURRENCY"));

        let err = QueueConfig::from_lookup(lookup(&[("QUEUE_CONCURRENCY", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn json_fills_missing_fields() {
        let config = QueueConfig::from_json(r#"{"concurrency": 2, "base_delay_ms": 10}"#).unwrap();
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.base_delay_ms, 10);
        assert_eq!(config.max_delay_ms, QueueConfig::default().max_delay_ms);

        assert!(QueueConfig::from_json(r#"{"base_delay_ms": 10, "max_delay_ms": 5}"#).is_err());
    }

    #[test]
    fn zero_claim_timeout_is_rejected() {
        let config = QueueConfig {
            claim_timeout_ms: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn durations_are_capped() {
        let config = QueueConfig {
            max_delay_ms: MAX_DURATION_MS + 1,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_delay_ms"));

        let config = QueueConfig {
            max_delay_ms: MAX_DURATION_MS,
            lease_duration_ms: u64::MAX,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn store_retry_delay_is_capped() {
        let retry = StoreRetry {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 500,
        };
        assert_eq!(retry.delay_after(1), Duration::from_millis(100));
        assert_eq!(retry.delay_after(2), Duration::from_millis(200));
        assert_eq!(retry.delay_after(10), Duration::from_millis(500));
    }

    #[test]
    fn stats_success_rate() {
        let stats = QueueStats {
            completed: 3,
            failed: 1,
            ..Default::default()
        };
        assert_eq!(stats.processed(), 4);
        assert_eq!(stats.success_rate(), Some(75.0));
        assert_eq!(QueueStats::default().success_rate(), None);
    }
}
