//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`GatewayConfig`] that cannot
//! be expressed through the type system alone (range checks, cross-field
//! invariants).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use super::GatewayConfig;

/// Errors arising from configuration parsing, validation, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "performance.concurrent_requests").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Validate all semantic constraints on a [`GatewayConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Errors
///
/// Returns `Err(Vec<ConfigError>)` with every violation found.
pub fn validate(config: &GatewayConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // concurrent_requests: -1 is the unlimited sentinel; 0 would deadlock
    // the scheduler (no request could ever be admitted).
    let cap = config.performance.concurrent_requests;
    if cap == 0 || cap < -1 {
        errors.push(ConfigError::InvalidField {
            field: "performance.concurrent_requests".into(),
            value: cap.to_string(),
            reason: "must be -1 (unlimited) or a positive integer".into(),
        });
    }

    // A per-minute quota larger than the per-hour quota is contradictory:
    // the hourly window would always trip first.
    let per_minute = config.rate_limit.requests_per_minute;
    let per_hour = config.rate_limit.requests_per_hour;
    if per_minute > 0 && per_hour > 0 && per_minute > per_hour {
        errors.push(ConfigError::InvalidField {
            field: "rate_limit.requests_per_minute".into(),
            value: per_minute.to_string(),
            reason: format!("exceeds rate_limit.requests_per_hour ({per_hour})"),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PerformanceConfig, RateLimitConfig, UsageMode};

    fn base_config() -> GatewayConfig {
        GatewayConfig {
            usage_mode: UsageMode::Personal,
            performance: PerformanceConfig {
                concurrent_requests: 3,
            },
            rate_limit: RateLimitConfig {
                enabled: true,
                requests_per_minute: 60,
                requests_per_hour: 1000,
            },
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(validate(&base_config()).is_ok());
    }

    #[test]
    fn test_unlimited_cap_passes() {
        let mut config = base_config();
        config.performance.concurrent_requests = -1;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_zero_cap_rejected() {
        let mut config = base_config();
        config.performance.concurrent_requests = 0;
        let errors = validate(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("concurrent_requests"));
    }

    #[test]
    fn test_below_sentinel_cap_rejected() {
        let mut config = base_config();
        config.performance.concurrent_requests = -2;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_minute_quota_exceeding_hour_quota_rejected() {
        let mut config = base_config();
        config.rate_limit.requests_per_minute = 2000;
        config.rate_limit.requests_per_hour = 1000;
        let errors = validate(&config).unwrap_err();
        assert!(errors[0].to_string().contains("requests_per_minute"));
    }

    #[test]
    fn test_disabled_dimensions_skip_cross_check() {
        // Zero disables a dimension; the cross-field check must not fire.
        let mut config = base_config();
        config.rate_limit.requests_per_minute = 100;
        config.rate_limit.requests_per_hour = 0;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_all_errors_collected() {
        let mut config = base_config();
        config.performance.concurrent_requests = 0;
        config.rate_limit.requests_per_minute = 2000;
        config.rate_limit.requests_per_hour = 1000;
        let errors = validate(&config).unwrap_err();
        assert_eq!(errors.len(), 2, "validation must not short-circuit");
    }
}
