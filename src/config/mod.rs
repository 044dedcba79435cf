//! Configuration management for tidefetch
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use tidefetch::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Worker pool capacity: {}", config.scheduler.workers);
//! ```
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `TIDEFETCH__<section>__<key>`
//!
//! Examples:
//! - `TIDEFETCH__SERVER__BIND_ADDR=0.0.0.0:9000`
//! - `TIDEFETCH__SCHEDULER__WORKERS=4`
//! - `TIDEFETCH__WORKER__PERSIST_EVERY=512KB`
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/tidefetch.toml`.
//! This can be overridden using the `TIDEFETCH_CONFIG` environment variable.

mod models;
mod sources;
mod validation;

pub use crate::humanize::ByteSize;
pub use models::{
    Config, HttpConfig, RetentionConfig, RetryConfig, SchedulerConfig, ServerConfig, WorkerConfig,
};
pub use validation::ValidationError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// Configuration is loaded with the following priority (highest to lowest):
    /// 1. Environment variables (`TIDEFETCH__*`)
    /// 2. TOML file (default: `config/tidefetch.toml`)
    /// 3. Default values
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validation::validate(self)?;
        Ok(())
    }
}
