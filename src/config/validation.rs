use super::models::Config;
use thiserror::Error;

/// Longest accepted retention window, about a century
pub const MAX_RETENTION_DAYS: u32 = 36_500;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Worker pool capacity must be at least 1")]
    NoWorkers,

    #[error("Interval must be positive: {field} = 0")]
    ZeroInterval { field: String },

    #[error("persist_every must be at least 1 byte")]
    ZeroPersistBytes,

    #[error("retry.max_delay_ms ({max}) is shorter than retry.base_delay_ms ({base})")]
    InvertedRetryDelays { base: u64, max: u64 },

    #[error("Retention TTL must be between 1 and 36500 days: {field} = {value}")]
    InvalidRetentionTTL { field: String, value: u32 },

    #[error("max_inflight_requests must be at least 1")]
    NoRequestCapacity,
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_server(config)?;
    validate_scheduler(config)?;
    validate_worker(config)?;
    validate_retry(config)?;
    validate_retention(config)?;
    Ok(())
}

fn validate_server(config: &Config) -> Result<(), ValidationError> {
    if config.server.max_inflight_requests == 0 {
        return Err(ValidationError::NoRequestCapacity);
    }
    Ok(())
}

fn validate_scheduler(config: &Config) -> Result<(), ValidationError> {
    if config.scheduler.workers == 0 {
        return Err(ValidationError::NoWorkers);
    }
    if config.scheduler.tick_interval_ms == 0 {
        return Err(ValidationError::ZeroInterval {
            field: "scheduler.tick_interval_ms".to_string(),
        });
    }
    Ok(())
}

/// A zero cadence would checkpoint on every chunk or spin the ticker
fn validate_worker(config: &Config) -> Result<(), ValidationError> {
    if config.worker.persist_every.as_u64() == 0 {
        return Err(ValidationError::ZeroPersistBytes);
    }
    if config.worker.persist_interval_ms == 0 {
        return Err(ValidationError::ZeroInterval {
            field: "worker.persist_interval_ms".to_string(),
        });
    }
    Ok(())
}

fn validate_retry(config: &Config) -> Result<(), ValidationError> {
    if config.retry.max_delay_ms < config.retry.base_delay_ms {
        return Err(ValidationError::InvertedRetryDelays {
            base: config.retry.base_delay_ms,
            max: config.retry.max_delay_ms,
        });
    }
    Ok(())
}

fn validate_retention(config: &Config) -> Result<(), ValidationError> {
    let ttl = config.retention.completed_ttl_days;
    if ttl == 0 || ttl > MAX_RETENTION_DAYS {
        return Err(ValidationError::InvalidRetentionTTL {
            field: "completed_ttl_days".to_string(),
            value: ttl,
        });
    }
    if config.retention.purge_interval_secs == 0 {
        return Err(ValidationError::ZeroInterval {
            field: "retention.purge_interval_secs".to_string(),
        });
    }
    Ok(())
}
