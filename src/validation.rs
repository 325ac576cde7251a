use regex::Regex;
use std::sync::LazyLock;
use validator::{ValidationError, ValidationErrors};

use crate::error::SynthesisError;

/// Discord snowflakes are unsigned 64-bit integers rendered in decimal.
static SNOWFLAKE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9]{15,20}$").unwrap());

/// Permission bitfields travel as decimal strings.
static BITFIELD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9]{1,20}$").unwrap());

const MAX_IDEMPOTENCY_KEY_LEN: usize = 256;

pub fn validate_snowflake(value: &str) -> Result<(), ValidationError> {
    if SNOWFLAKE.is_match(value) && value.parse::<u64>().is_ok() {
        Ok(())
    } else {
        Err(ValidationError::new("snowflake"))
    }
}

pub fn validate_bitfield(value: &str) -> Result<(), ValidationError> {
    if BITFIELD.is_match(value) && value.parse::<u64>().is_ok() {
        Ok(())
    } else {
        Err(ValidationError::new("permission_bitfield"))
    }
}

/// Request validation utilities
pub struct RequestValidator;

impl RequestValidator {
    /// Validates a caller-supplied idempotency key
    pub fn validate_idempotency_key(key: &str) -> Result<String, SynthesisError> {
        let key = key.trim();

        if key.is_empty() {
            return Err(SynthesisError::InvalidPayload(
                "Idempotency key cannot be empty".to_string(),
            ));
        }

        if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(SynthesisError::InvalidPayload(format!(
                "Idempotency key exceeds {} bytes",
                MAX_IDEMPOTENCY_KEY_LEN
            )));
        }

        if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(SynthesisError::InvalidPayload(
                "Idempotency key cannot contain whitespace or control characters".to_string(),
            ));
        }

        Ok(key.to_string())
    }

    /// Flattens derive-validator output into a single caller-facing message
    pub fn describe(errors: &ValidationErrors) -> String {
        let mut parts: Vec<String> = errors
            .field_errors()
            .iter()
            .map(|(field, errs)| {
                let codes: Vec<&str> = errs.iter().map(|e| e.code.as_ref()).collect();
                format!("{}: {}", field, codes.join(", "))
            })
            .collect();
        parts.sort();
        parts.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snowflake() {
        assert!(validate_snowflake("175928847299117063").is_ok());
        assert!(validate_snowflake("abc").is_err());
        assert!(validate_snowflake("12").is_err());
        assert!(validate_snowflake("99999999999999999999").is_err());
    }

    #[test]
    fn test_bitfield() {
        assert!(validate_bitfield("0").is_ok());
        assert!(validate_bitfield("2048").is_ok());
        assert!(validate_bitfield("-1").is_err());
        assert!(validate_bitfield("").is_err());
    }

    #[test]
    fn test_validate_idempotency_key() {
        let key = RequestValidator::validate_idempotency_key("  g1:u1:r1 ").unwrap();
        assert_eq!(key, "g1:u1:r1");
    }

    #[test]
    fn test_invalid_idempotency_keys() {
        assert!(RequestValidator::validate_idempotency_key("").is_err());
        assert!(RequestValidator::validate_idempotency_key("a b").is_err());
        assert!(RequestValidator::validate_idempotency_key(&"k".repeat(300)).is_err());
    }
}
