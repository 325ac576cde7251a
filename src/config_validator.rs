use crate::error::SynthesisError;

fn invalid(message: impl Into<String>) -> SynthesisError {
    SynthesisError::Configuration(message.into())
}

/// Validates configuration values for consistency and correctness
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates a Redis URL
    pub fn validate_redis_url(url: &str) -> Result<(), SynthesisError> {
        if url.is_empty() {
            return Err(invalid("Redis URL cannot be empty"));
        }

        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(invalid("Redis URL must start with 'redis://' or 'rediss://'"));
        }

        Ok(())
    }

    /// Validates a bind address
    pub fn validate_bind_address(address: &str) -> Result<(), SynthesisError> {
        if address.is_empty() {
            return Err(invalid("Bind address cannot be empty"));
        }

        if !address.contains(':') {
            return Err(invalid("Bind address must be in host:port format"));
        }

        Ok(())
    }

    /// Validates the global token bucket shape
    pub fn validate_rate_limit(capacity: u32, refill_rate: f64) -> Result<(), SynthesisError> {
        if capacity == 0 {
            return Err(invalid("Token bucket capacity must be greater than 0"));
        }

        if !refill_rate.is_finite() || refill_rate <= 0.0 {
            return Err(invalid("Refill rate must be a positive number"));
        }

        Ok(())
    }

    pub fn validate_admission_rate(rate: f64) -> Result<(), SynthesisError> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(invalid("Queue admission rate must be a positive number"));
        }
        Ok(())
    }

    pub fn validate_retry(max_attempts: u32) -> Result<(), SynthesisError> {
        if max_attempts == 0 {
            return Err(invalid("Retry max attempts must be at least 1"));
        }
        Ok(())
    }

    pub fn validate_concurrency(concurrency: usize) -> Result<(), SynthesisError> {
        if concurrency == 0 {
            return Err(invalid("Queue concurrency must be greater than 0"));
        }
        if concurrency > u32::MAX as usize {
            return Err(invalid("Queue concurrency is too large"));
        }
        Ok(())
    }

    /// Validates the external API base URL
    pub fn validate_api_base(url: &str) -> Result<(), SynthesisError> {
        if !url.starts_with("https://") && !url.starts_with("http://") {
            return Err(invalid(format!(
                "API base '{}' must start with 'https://' or 'http://'",
                url
            )));
        }
        Ok(())
    }

    pub fn validate_nonzero(name: &str, value: u64) -> Result<(), SynthesisError> {
        if value == 0 {
            return Err(invalid(format!("{} must be greater than 0", name)));
        }
        Ok(())
    }

    /// Validates a log level name
    pub fn validate_log_level(level: &str) -> Result<(), SynthesisError> {
        let valid = ["trace", "debug", "info", "warn", "error"];
        if !valid.contains(&level.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "Invalid log level '{}'. Must be one of: {:?}",
                level, valid
            )));
        }

        Ok(())
    }
}
