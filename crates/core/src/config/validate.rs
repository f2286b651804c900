use super::{types::Config, ConfigError};

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

/// Validate configuration
/// Currently validates:
/// - Server port is not 0
/// - Concurrency limits, thresholds and timeouts are positive
/// - The publish retry policy has attempts and a backoff schedule
/// - Every `[platforms.*]` section names a known adapter
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(invalid("server.port cannot be 0"));
    }

    let dispatcher = &config.dispatcher;
    if dispatcher.max_parallel == 0 {
        return Err(invalid("dispatcher.max_parallel must be at least 1"));
    }
    if dispatcher.max_parallel_per_destination == 0 {
        return Err(invalid(
            "dispatcher.max_parallel_per_destination must be at least 1",
        ));
    }
    if dispatcher.scan_limit <= 0 {
        return Err(invalid("dispatcher.scan_limit must be positive"));
    }
    if dispatcher.lease_ttl_minutes <= 0 {
        return Err(invalid("dispatcher.lease_ttl_minutes must be positive"));
    }

    if config.watchdog.stuck_processing_minutes <= 0
        || config.watchdog.stuck_publishing_minutes <= 0
    {
        return Err(invalid("watchdog thresholds must be positive"));
    }

    if config.publisher.max_attempts == 0 {
        return Err(invalid("publisher.max_attempts must be at least 1"));
    }
    if config.publisher.backoff_secs.is_empty() {
        return Err(invalid("publisher.backoff_secs cannot be empty"));
    }

    if config.pipeline.step_timeout_secs == 0 {
        return Err(invalid("pipeline.step_timeout_secs cannot be 0"));
    }

    if let Some(name) = config.platforms.unknown.keys().next() {
        return Err(invalid(format!(
            "unknown platform: {} (expected youtube, apify or vk)",
            name
        )));
    }

    Ok(())
}
