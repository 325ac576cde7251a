//! Key naming for the shared store.

use uuid::Uuid;

/// Builds namespaced keys so several deployments can share one Redis.
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    prefix: String,
}

impl KeyGenerator {
    pub fn new(prefix: &str) -> Self {
        let prefix = Self::sanitize_key(prefix.trim_end_matches(':'));
        Self {
            prefix: if prefix.is_empty() {
                "synthesis".to_string()
            } else {
                prefix
            },
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The one global bucket every worker process draws from
    pub fn bucket_key(&self, bucket: &str) -> String {
        format!("{}:bucket:{}", self.prefix, Self::sanitize_key(bucket))
    }

    pub fn idempotency_key(&self, key: &str) -> String {
        format!("{}:idem:{}", self.prefix, key)
    }

    pub fn job_key_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    pub fn job_key(&self, id: Uuid) -> String {
        format!("{}{}", self.job_key_prefix(), id)
    }

    /// Sorted set of claimable job ids scored by `run_at` millis
    pub fn ready_set(&self) -> String {
        format!("{}:queue:ready", self.prefix)
    }

    /// Sorted set of claimed job ids scored by claim time
    pub fn active_set(&self) -> String {
        format!("{}:queue:active", self.prefix)
    }

    pub fn completed_set(&self) -> String {
        format!("{}:queue:completed", self.prefix)
    }

    pub fn dead_set(&self) -> String {
        format!("{}:queue:dead", self.prefix)
    }

    /// Sanitize key components to ensure valid Redis keys
    pub fn sanitize_key(key: &str) -> String {
        key.chars()
            .map(|c| {
                if c.is_alphanumeric() || c == ':' || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new("synthesis")
    }
}
