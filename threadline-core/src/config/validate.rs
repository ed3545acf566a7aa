//! Configuration validation rules.

use super::schema::Config;

/// Validate configuration and return aggregated validation errors.
pub fn validate_config(config: &Config) -> crate::Result<()> {
    let mut errors = Vec::new();

    if config.telegram.enabled && config.telegram.token.trim().is_empty() {
        errors.push("telegram.token is required when telegram is enabled".to_string());
    }

    let stateless = &config.backends.stateless;
    let stateful = &config.backends.stateful;
    if !stateless.enabled && !stateful.enabled {
        errors.push("at least one of backends.stateless / backends.stateful must be enabled".to_string());
    }
    if stateless.enabled {
        if stateless.api_base.trim().is_empty() {
            errors.push("backends.stateless.api_base must not be empty".to_string());
        }
        if stateless.model.trim().is_empty() {
            errors.push("backends.stateless.model must not be empty".to_string());
        }
        if !(0.0..=2.0).contains(&stateless.temperature) {
            errors.push("backends.stateless.temperature must be in [0.0, 2.0]".to_string());
        }
    }
    if stateful.enabled && stateful.api_base.trim().is_empty() {
        errors.push("backends.stateful.api_base must not be empty".to_string());
    }

    if config.threads.tick_interval_ms == 0 {
        errors.push("threads.tick_interval_ms must be > 0".to_string());
    }
    if config.retry.max_attempts == 0 {
        errors.push("retry.max_attempts must be > 0".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(crate::Error::Validation(errors.join("; ")))
    }
}
