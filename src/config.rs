//! Dispatch configuration.
//!
//! `DispatchConfig` collects everything the scheduler, worker pool, and
//! monitor need: the local delivery window, jitter shaping, broker settings,
//! SLA targets, and monitoring thresholds. Values come from `Default`,
//! builder setters, or environment variables via `from_env`.

use std::time::Duration;

use chrono_tz::Tz;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the delivery dispatch system.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    // Delivery window settings
    /// Time zone the delivery instant is expressed in.
    pub delivery_timezone: Tz,
    /// Local wall-clock hour of the delivery instant.
    pub delivery_hour: u32,
    /// Local wall-clock minute of the delivery instant.
    pub delivery_minute: u32,
    /// Width of the jitter window spread over the delivery instant.
    pub jitter_window: Duration,

    // Broker settings
    /// Redis connection URL.
    pub redis_url: String,
    /// Name of the delivery queue batch jobs are admitted to.
    pub queue_name: String,
    /// Queues the monitor observes.
    pub monitor_queues: Vec<String>,
    /// Channel template used for daily content sends.
    pub template_name: String,
    /// Send attempts per job before terminal failure.
    pub max_attempts: u32,
    /// How long a claim may go without progress before it is swept back.
    pub stall_timeout: Duration,

    // Worker settings
    /// Number of worker tasks in the pool.
    pub num_workers: usize,
    /// How long a worker waits per claim attempt.
    pub claim_timeout: Duration,
    /// How long `send_immediate` waits for a terminal result.
    pub immediate_timeout: Duration,
    /// Timeout for graceful worker pool shutdown.
    pub shutdown_timeout: Duration,

    // SLA settings
    /// Minimum delivery rate considered met.
    pub sla_target: f64,
    /// Margin below the target before the SLA is classified breached.
    pub sla_at_risk_margin: f64,

    // Monitor settings
    /// Interval of the metrics collection tick.
    pub metrics_interval: Duration,
    /// Interval of the independent health check.
    pub health_interval: Duration,
    /// Waiting-job count above which a queue-depth alert is raised.
    pub queue_depth_threshold: usize,
    /// Failure rate above which a failure-rate alert is raised.
    pub failure_rate_threshold: f64,
    /// Average processing time above which a slow-processing alert is raised.
    pub processing_time_threshold: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            delivery_timezone: chrono_tz::Asia::Kolkata,
            delivery_hour: 6,
            delivery_minute: 0,
            jitter_window: Duration::from_secs(300), // 5 minutes

            redis_url: "redis://localhost:6379".to_string(),
            queue_name: "distribution".to_string(),
            monitor_queues: vec![
                "distribution".to_string(),
                "batch".to_string(),
                "retry".to_string(),
                "analytics".to_string(),
            ],
            template_name: "daily_market_update".to_string(),
            max_attempts: 3,
            stall_timeout: Duration::from_secs(30),

            num_workers: 4,
            claim_timeout: Duration::from_secs(1),
            immediate_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(60),

            sla_target: 0.99,
            sla_at_risk_margin: 0.02,

            metrics_interval: Duration::from_secs(5),
            health_interval: Duration::from_secs(30),
            queue_depth_threshold: 1000,
            failure_rate_threshold: 0.05,
            processing_time_threshold: Duration::from_secs(10),
        }
    }
}

impl DispatchConfig {
    /// Builds a configuration from environment variables, falling back to
    /// defaults for anything unset.
    ///
    /// Recognized variables: `REDIS_URL`, `DELIVERY_TIMEZONE`,
    /// `DELIVERY_HOUR`, `DELIVERY_MINUTE`, `JITTER_WINDOW_SECS`,
    /// `DELIVERY_QUEUE`, `NUM_WORKERS`, `MAX_ATTEMPTS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis_url = url;
        }
        if let Ok(tz) = std::env::var("DELIVERY_TIMEZONE") {
            config.delivery_timezone = tz.parse().map_err(|_| ConfigError::InvalidValue {
                key: "DELIVERY_TIMEZONE".to_string(),
                message: format!("unknown time zone '{tz}'"),
            })?;
        }
        if let Ok(hour) = std::env::var("DELIVERY_HOUR") {
            config.delivery_hour = parse_env("DELIVERY_HOUR", &hour)?;
        }
        if let Ok(minute) = std::env::var("DELIVERY_MINUTE") {
            config.delivery_minute = parse_env("DELIVERY_MINUTE", &minute)?;
        }
        if let Ok(secs) = std::env::var("JITTER_WINDOW_SECS") {
            config.jitter_window = Duration::from_secs(parse_env("JITTER_WINDOW_SECS", &secs)?);
        }
        if let Ok(name) = std::env::var("DELIVERY_QUEUE") {
            config.queue_name = name;
        }
        if let Ok(workers) = std::env::var("NUM_WORKERS") {
            config.num_workers = parse_env("NUM_WORKERS", &workers)?;
        }
        if let Ok(attempts) = std::env::var("MAX_ATTEMPTS") {
            config.max_attempts = parse_env("MAX_ATTEMPTS", &attempts)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Sets the delivery time zone.
    pub fn with_timezone(mut self, tz: Tz) -> Self {
        self.delivery_timezone = tz;
        self
    }

    /// Sets the local delivery instant.
    pub fn with_delivery_time(mut self, hour: u32, minute: u32) -> Self {
        self.delivery_hour = hour;
        self.delivery_minute = minute;
        self
    }

    /// Sets the jitter window width.
    pub fn with_jitter_window(mut self, window: Duration) -> Self {
        self.jitter_window = window;
        self
    }

    /// Sets the delivery queue name.
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    /// Sets the worker pool size.
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Checks invariants that would otherwise surface as scheduling bugs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.delivery_hour > 23 {
            return Err(ConfigError::ValidationFailed(format!(
                "delivery_hour must be 0-23, got {}",
                self.delivery_hour
            )));
        }
        if self.delivery_minute > 59 {
            return Err(ConfigError::ValidationFailed(format!(
                "delivery_minute must be 0-59, got {}",
                self.delivery_minute
            )));
        }
        if self.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be at least 1".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.sla_target) {
            return Err(ConfigError::ValidationFailed(format!(
                "sla_target must be within 0.0-1.0, got {}",
                self.sla_target
            )));
        }
        if !self.monitor_queues.contains(&self.queue_name) {
            return Err(ConfigError::ValidationFailed(format!(
                "delivery queue '{}' must be one of the monitored queues",
                self.queue_name
            )));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{value}'"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DispatchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.delivery_hour, 6);
        assert_eq!(config.delivery_timezone, chrono_tz::Asia::Kolkata);
        assert_eq!(config.monitor_queues.len(), 4);
    }

    #[test]
    fn test_builder_setters() {
        let config = DispatchConfig::default()
            .with_timezone(chrono_tz::Europe::Berlin)
            .with_delivery_time(7, 30)
            .with_jitter_window(Duration::from_secs(120))
            .with_num_workers(8);

        assert_eq!(config.delivery_timezone, chrono_tz::Europe::Berlin);
        assert_eq!(config.delivery_hour, 7);
        assert_eq!(config.delivery_minute, 30);
        assert_eq!(config.jitter_window, Duration::from_secs(120));
        assert_eq!(config.num_workers, 8);
    }

    #[test]
    fn test_validate_rejects_bad_hour() {
        let config = DispatchConfig::default().with_delivery_time(24, 0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("delivery_hour"));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = DispatchConfig::default().with_num_workers(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unmonitored_delivery_queue() {
        let config = DispatchConfig::default().with_queue_name("shadow");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("monitored"));
    }
}
