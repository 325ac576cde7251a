use envconfig::Envconfig;
use std::net::SocketAddr;
use std::time::Duration;

use crate::config_validator::ConfigValidator;
use crate::engine::EngineSettings;
use crate::error::Result;
use crate::job::RetryPolicy;
use crate::queue::QueueSettings;
use crate::rate_limiter::RateLimiterSettings;
use crate::worker::WorkerConfig;

#[derive(Debug, Envconfig, Clone)]
pub struct Config {
    /// Server bind address
    #[envconfig(from = "BIND_ADDR", default = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Redis connection URL. Empty selects in-process state.
    #[envconfig(from = "REDIS_URL", default = "")]
    pub redis_url: String,

    /// Namespace for every Redis key
    #[envconfig(from = "KEY_PREFIX", default = "synthesis")]
    pub key_prefix: String,

    #[envconfig(from = "DISCORD_API_BASE", default = "https://discord.com/api/v10")]
    pub discord_api_base: String,

    #[envconfig(from = "DISCORD_TOKEN", default = "")]
    pub discord_token: String,

    /// Maximum simultaneously active jobs
    #[envconfig(from = "QUEUE_CONCURRENCY", default = "5")]
    pub queue_concurrency: usize,

    /// Local job starts per second
    #[envconfig(from = "QUEUE_ADMISSION_RATE", default = "10")]
    pub queue_admission_rate: f64,

    #[envconfig(from = "RETRY_MAX_ATTEMPTS", default = "3")]
    pub retry_max_attempts: u32,

    #[envconfig(from = "RETRY_BACKOFF_BASE_MS", default = "1000")]
    pub retry_backoff_base_ms: u64,

    /// Global token bucket capacity
    #[envconfig(from = "TOKEN_BUCKET_CAPACITY", default = "50")]
    pub token_bucket_capacity: u32,

    /// Tokens added per second
    #[envconfig(from = "TOKEN_BUCKET_REFILL_RATE", default = "50")]
    pub token_bucket_refill_rate: f64,

    #[envconfig(from = "TOKEN_ACQUIRE_TIMEOUT_MS", default = "5000")]
    pub token_acquire_timeout_ms: u64,

    #[envconfig(from = "TOKEN_POLL_INTERVAL_MS", default = "100")]
    pub token_poll_interval_ms: u64,

    #[envconfig(from = "IDEMPOTENCY_TTL_SECS", default = "86400")]
    pub idempotency_ttl_secs: u64,

    #[envconfig(from = "COMPLETED_RETENTION_SECS", default = "3600")]
    pub completed_retention_secs: u64,

    #[envconfig(from = "DEAD_LETTER_RETENTION_SECS", default = "86400")]
    pub dead_letter_retention_secs: u64,

    /// Spacing between successive jobs of one batch
    #[envconfig(from = "BATCH_STAGGER_MS", default = "100")]
    pub batch_stagger_ms: u64,

    #[envconfig(from = "WORKER_POLL_INTERVAL_MS", default = "100")]
    pub worker_poll_interval_ms: u64,

    /// Active jobs older than this are presumed orphaned
    #[envconfig(from = "ACTIVE_LEASE_SECS", default = "300")]
    pub active_lease_secs: u64,

    #[envconfig(from = "SWEEP_INTERVAL_SECS", default = "60")]
    pub sweep_interval_secs: u64,

    #[envconfig(from = "SHUTDOWN_GRACE_MS", default = "30000")]
    pub shutdown_grace_ms: u64,

    #[envconfig(from = "AUTO_PAUSE_ON_GLOBAL_429", default = "false")]
    pub auto_pause_on_global_429: bool,

    /// Default level for the synthesis log target
    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> std::result::Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn validate(&self) -> Result<()> {
        ConfigValidator::validate_bind_address(&self.bind_addr.to_string())?;
        if self.uses_redis() {
            ConfigValidator::validate_redis_url(&self.redis_url)?;
        }
        ConfigValidator::validate_rate_limit(self.token_bucket_capacity, self.token_bucket_refill_rate)?;
        ConfigValidator::validate_admission_rate(self.queue_admission_rate)?;
        ConfigValidator::validate_retry(self.retry_max_attempts)?;
        ConfigValidator::validate_concurrency(self.queue_concurrency)?;
        ConfigValidator::validate_api_base(&self.discord_api_base)?;
        ConfigValidator::validate_nonzero("SWEEP_INTERVAL_SECS", self.sweep_interval_secs)?;
        ConfigValidator::validate_nonzero("TOKEN_POLL_INTERVAL_MS", self.token_poll_interval_ms)?;
        ConfigValidator::validate_nonzero("WORKER_POLL_INTERVAL_MS", self.worker_poll_interval_ms)?;
        ConfigValidator::validate_log_level(&self.log_level)?;
        Ok(())
    }

    pub fn uses_redis(&self) -> bool {
        !self.redis_url.trim().is_empty()
    }

    pub fn rate_limiter_settings(&self) -> RateLimiterSettings {
        RateLimiterSettings {
            capacity: self.token_bucket_capacity,
            refill_rate: self.token_bucket_refill_rate,
            poll_interval: Duration::from_millis(self.token_poll_interval_ms),
            default_wait: Duration::from_millis(self.token_acquire_timeout_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            backoff_base: Duration::from_millis(self.retry_backoff_base_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            admission_rate: self.queue_admission_rate,
            batch_stagger: Duration::from_millis(self.batch_stagger_ms),
            retry: self.retry_policy(),
            completed_retention: Duration::from_secs(self.completed_retention_secs),
            dead_letter_retention: Duration::from_secs(self.dead_letter_retention_secs),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.queue_concurrency,
            poll_interval: Duration::from_millis(self.worker_poll_interval_ms),
            acquire_timeout: Duration::from_millis(self.token_acquire_timeout_ms),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            key_prefix: self.key_prefix.clone(),
            limiter: self.rate_limiter_settings(),
            queue: self.queue_settings(),
            worker: self.worker_config(),
            idempotency_ttl: Duration::from_secs(self.idempotency_ttl_secs),
            active_lease: Duration::from_secs(self.active_lease_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            auto_pause_on_global_429: self.auto_pause_on_global_429,
        }
    }

    /// `RUST_LOG`-style directive used when `RUST_LOG` is unset.
    pub fn default_log_filter(&self) -> String {
        format!("synthesis={},tower_http=debug", self.log_level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::init_from_hashmap(&map).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]);

        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:3000");
        assert!(!config.uses_redis());
        assert!(config.validate().is_ok());

        let settings = config.engine_settings();
        assert_eq!(settings.limiter.capacity, 50);
        assert_eq!(settings.limiter.refill_rate, 50.0);
        assert_eq!(settings.worker.concurrency, 5);
        assert_eq!(settings.queue.retry.max_attempts, 3);
        assert_eq!(settings.queue.batch_stagger, Duration::from_millis(100));
        assert_eq!(settings.queue.completed_retention, Duration::from_secs(3600));
        assert_eq!(settings.idempotency_ttl, Duration::from_secs(86_400));
        assert_eq!(settings.shutdown_grace, Duration::from_secs(30));
        assert!(!settings.auto_pause_on_global_429);
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("REDIS_URL", "redis://cache:6379"),
            ("TOKEN_BUCKET_CAPACITY", "10"),
            ("TOKEN_BUCKET_REFILL_RATE", "2.5"),
            ("AUTO_PAUSE_ON_GLOBAL_429", "true"),
            ("LOG_LEVEL", "debug"),
        ]);

        assert!(config.uses_redis());
        assert!(config.validate().is_ok());
        assert_eq!(config.rate_limiter_settings().refill_rate, 2.5);
        assert!(config.engine_settings().auto_pause_on_global_429);
        assert_eq!(config.default_log_filter(), "synthesis=debug,tower_http=debug");
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        assert!(config(&[("REDIS_URL", "http://cache:6379")]).validate().is_err());
        assert!(config(&[("TOKEN_BUCKET_CAPACITY", "0")]).validate().is_err());
        assert!(config(&[("QUEUE_CONCURRENCY", "0")]).validate().is_err());
        assert!(config(&[("RETRY_MAX_ATTEMPTS", "0")]).validate().is_err());
        assert!(config(&[("LOG_LEVEL", "loud")]).validate().is_err());
    }

    #[test]
    fn test_unparseable_value_is_rejected() {
        let map: HashMap<String, String> =
            [("QUEUE_CONCURRENCY".to_string(), "five".to_string())].into();
        assert!(Config::init_from_hashmap(&map).is_err());
    }
}
