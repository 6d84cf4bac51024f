use std::net::SocketAddr;
use std::time::Duration;

use envconfig::Envconfig;
use thiserror::Error;

use crate::coordinator::{BufferCapacity, CoordinatorConfig};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::virtual_source::VirtualSourceConfig;

/// Configuration errors are fatal at startup, before any virtual source runs.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("retry delay multiplier must be >= 1.0, got {0}")]
    InvalidRetryMultiplier(f64),

    #[error("per-source buffer capacity must be greater than zero")]
    ZeroBufferCapacity,

    #[error("max filtered records per pass must be greater than zero")]
    ZeroFilteredBudget,

    #[error("unknown retry policy '{0}', expected 'default' or 'never'")]
    UnknownRetryPolicy(String),

    #[error("invalid bind address {0}:{1}")]
    InvalidBindAddress(String, u16),
}

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "kafka-sideliner")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "events")]
    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    // Retry configuration. A negative limit retries forever, zero never
    // retries, positive bounds the failure count.
    #[envconfig(default = "-1")]
    pub retry_limit: i32,

    #[envconfig(default = "2000")]
    pub initial_retry_delay_ms: u64,

    #[envconfig(default = "2.0")]
    pub retry_delay_multiplier: f64,

    #[envconfig(default = "900000")]
    pub retry_delay_max_ms: u64,

    #[envconfig(default = "default")]
    pub retry_policy: String,

    // Virtual source processing configuration
    #[envconfig(default = "1024")]
    pub source_buffer_capacity: usize,

    #[envconfig(default = "10")]
    pub source_poll_interval_ms: u64,

    #[envconfig(default = "1000")]
    pub source_flush_interval_ms: u64,

    #[envconfig(default = "100")]
    pub max_filtered_per_pass: usize,

    #[envconfig(default = "1000")]
    pub reap_interval_ms: u64,

    // HTTP server configuration for the metrics endpoint
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn bind_address(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddress(self.host.clone(), self.port))
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    /// Validate and convert into the coordinator's typed configuration.
    pub fn to_coordinator_config(&self) -> Result<CoordinatorConfig, ConfigError> {
        if self.retry_delay_multiplier < 1.0 {
            return Err(ConfigError::InvalidRetryMultiplier(
                self.retry_delay_multiplier,
            ));
        }
        if self.max_filtered_per_pass == 0 {
            return Err(ConfigError::ZeroFilteredBudget);
        }

        let buffer_capacity = BufferCapacity::new(self.source_buffer_capacity)
            .map_err(|_| ConfigError::ZeroBufferCapacity)?;

        let retry_policy: RetryPolicy = self
            .retry_policy
            .parse()
            .map_err(|_| ConfigError::UnknownRetryPolicy(self.retry_policy.clone()))?;

        Ok(CoordinatorConfig {
            buffer_capacity,
            retry_policy,
            retry: RetryConfig {
                retry_limit: self.retry_limit,
                initial_retry_delay: Duration::from_millis(self.initial_retry_delay_ms),
                retry_delay_multiplier: self.retry_delay_multiplier,
                retry_delay_max: Duration::from_millis(self.retry_delay_max_ms),
            },
            source: VirtualSourceConfig {
                poll_interval: Duration::from_millis(self.source_poll_interval_ms),
                flush_interval: Duration::from_millis(self.source_flush_interval_ms),
                max_filtered_per_pass: self.max_filtered_per_pass,
            },
        })
    }
}
