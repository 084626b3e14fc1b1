//! Pipeline configuration, read once from the environment at startup.

use crate::attributes::DEFAULT_MAX_ATTRIBUTES;
use crate::batch_processor::BatchConfig;
use crate::error::ConfigError;
use crate::queue::{OverflowPolicy, QueueConfig};
use crate::resilient_exporter::RetryPolicy;
use std::str::FromStr;
use std::time::Duration;

pub const ENDPOINT_VAR: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
pub const SERVICE_NAME_VAR: &str = "OTEL_SERVICE_NAME";
pub const EXPORT_INTERVAL_VAR: &str = "OTEL_METRIC_EXPORT_INTERVAL";
pub const MAX_BATCH_SIZE_VAR: &str = "OTEL_BSP_MAX_EXPORT_BATCH_SIZE";
pub const MAX_BATCH_AGE_VAR: &str = "OTEL_BSP_SCHEDULE_DELAY";
pub const QUEUE_CAPACITY_VAR: &str = "OTEL_BSP_MAX_QUEUE_SIZE";
pub const OVERFLOW_POLICY_VAR: &str = "OTEL_PIPELINE_OVERFLOW_POLICY";
pub const BLOCK_TIMEOUT_VAR: &str = "OTEL_PIPELINE_BLOCK_TIMEOUT";
pub const MAX_RETRIES_VAR: &str = "OTEL_EXPORTER_OTLP_MAX_RETRIES";
pub const EXPORT_TIMEOUT_VAR: &str = "OTEL_EXPORTER_OTLP_TIMEOUT";
pub const DRAIN_TIMEOUT_VAR: &str = "OTEL_PIPELINE_DRAIN_TIMEOUT";
pub const MAX_ATTRIBUTES_VAR: &str = "OTEL_ATTRIBUTE_COUNT_LIMIT";

/// Configuration for the whole pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Collector base URL; kinds are posted to `{endpoint}/v1/{kind}`
    pub endpoint: String,
    /// Value of the `service.name` resource label
    pub service_name: String,
    /// Periodic batcher wake-up, independent of batch deadlines
    pub export_interval: Duration,
    /// Item queue settings
    pub queue: QueueConfig,
    /// Batch formation settings
    pub batch: BatchConfig,
    /// Retry settings for failed exports
    pub retry: RetryPolicy,
    /// Upper bound for a single export call
    pub export_timeout: Duration,
    /// Upper bound for shutdown and force-flush
    pub drain_timeout: Duration,
    /// Sealed batches that may wait for each kind's exporter
    pub max_pending_batches: usize,
    /// Attribute bound per item
    pub max_attributes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:4318".to_owned(),
            service_name: "example-service".to_owned(),
            export_interval: Duration::from_millis(5000),
            queue: QueueConfig::default(),
            batch: BatchConfig::default(),
            retry: RetryPolicy::default(),
            export_timeout: Duration::from_millis(10_000),
            drain_timeout: Duration::from_millis(30_000),
            max_pending_batches: 2,
            max_attributes: DEFAULT_MAX_ATTRIBUTES,
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<T>()
        .map(Some)
        .map_err(|e| ConfigError::Invalid {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        })
}

fn parse_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    Ok(parse_var::<u64>(lookup, var)?.map(Duration::from_millis))
}

impl PipelineConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds a configuration from an arbitrary variable source.
    ///
    /// Unset or blank variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(endpoint) = lookup(ENDPOINT_VAR).filter(|v| !v.trim().is_empty()) {
            config.endpoint = endpoint.trim().to_owned();
        }
        if let Some(name) = lookup(SERVICE_NAME_VAR).filter(|v| !v.trim().is_empty()) {
            config.service_name = name.trim().to_owned();
        }
        if let Some(interval) = parse_millis(&lookup, EXPORT_INTERVAL_VAR)? {
            config.export_interval = interval;
        }
        if let Some(size) = parse_var(&lookup, MAX_BATCH_SIZE_VAR)? {
            config.batch.max_batch_size = size;
        }
        if let Some(age) = parse_millis(&lookup, MAX_BATCH_AGE_VAR)? {
            config.batch.max_batch_age = age;
        }
        if let Some(capacity) = parse_var(&lookup, QUEUE_CAPACITY_VAR)? {
            config.queue.capacity = capacity;
        }
        if let Some(policy) = lookup(OVERFLOW_POLICY_VAR).filter(|v| !v.trim().is_empty()) {
            config.queue.overflow_policy = policy.parse()?;
        }
        if let Some(timeout) = parse_millis(&lookup, BLOCK_TIMEOUT_VAR)? {
            config.queue.block_timeout = timeout;
        }
        if let Some(retries) = parse_var(&lookup, MAX_RETRIES_VAR)? {
            config.retry.max_retries = retries;
        }
        if let Some(timeout) = parse_millis(&lookup, EXPORT_TIMEOUT_VAR)? {
            config.export_timeout = timeout;
        }
        if let Some(timeout) = parse_millis(&lookup, DRAIN_TIMEOUT_VAR)? {
            config.drain_timeout = timeout;
        }
        if let Some(limit) = parse_var(&lookup, MAX_ATTRIBUTES_VAR)? {
            config.max_attributes = limit;
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(bool, &'static str, &'static str); 10] = [
            (self.endpoint.is_empty(), "endpoint", "must not be empty"),
            (self.batch.max_batch_size == 0, "max_batch_size", "must be at least 1"),
            (self.batch.max_batch_age.is_zero(), "max_batch_age", "must be greater than zero"),
            (self.queue.capacity == 0, "queue capacity", "must be at least 1"),
            (self.export_interval.is_zero(), "export_interval", "must be greater than zero"),
            (self.export_timeout.is_zero(), "export_timeout", "must be greater than zero"),
            (self.drain_timeout.is_zero(), "drain_timeout", "must be greater than zero"),
            (
                self.queue.overflow_policy == OverflowPolicy::Block && self.queue.block_timeout.is_zero(),
                "block_timeout",
                "must be greater than zero under the block policy",
            ),
            (self.max_pending_batches == 0, "max_pending_batches", "must be at least 1"),
            (
                !(0.0..=1.0).contains(&self.retry.jitter) || self.retry.backoff_multiplier < 1.0,
                "retry policy",
                "needs jitter within 0..=1 and a multiplier of at least 1",
            ),
        ];

        match checks.into_iter().find(|(failed, _, _)| *failed) {
            Some((_, field, reason)) => Err(ConfigError::OutOfRange { field, reason }),
            None => Ok(()),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn with_export_interval(mut self, interval: Duration) -> Self {
        self.export_interval = interval;
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_export_timeout(mut self, timeout: Duration) -> Self {
        self.export_timeout = timeout;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_max_pending_batches(mut self, pending: usize) -> Self {
        self.max_pending_batches = pending;
        self
    }

    pub fn with_max_attributes(mut self, limit: usize) -> Self {
        self.max_attributes = limit;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = PipelineConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.endpoint, "http://localhost:4318");
        assert_eq!(config.service_name, "example-service");
        assert_eq!(config.export_interval, Duration::from_millis(5000));
        assert_eq!(config.batch.max_batch_size, 512);
        assert_eq!(config.batch.max_batch_age, Duration::from_millis(5000));
        assert_eq!(config.queue.capacity, 2048);
        assert_eq!(config.queue.overflow_policy, OverflowPolicy::Reject);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.export_timeout, Duration::from_secs(10));
        assert_eq!(config.drain_timeout, Duration::from_secs(30));
        assert_eq!(config.max_attributes, 128);
    }

    #[test]
    fn test_overrides_from_lookup() {
        let config = PipelineConfig::from_lookup(lookup_from(&[
            (ENDPOINT_VAR, "http://collector:4318"),
            (SERVICE_NAME_VAR, "checkout"),
            (MAX_BATCH_SIZE_VAR, "64"),
            (MAX_BATCH_AGE_VAR, "250"),
            (OVERFLOW_POLICY_VAR, "evict-oldest"),
            (MAX_RETRIES_VAR, "2"),
            (QUEUE_CAPACITY_VAR, " 100 "),
        ]))
        .unwrap();

        assert_eq!(config.endpoint, "http://collector:4318");
        assert_eq!(config.service_name, "checkout");
        assert_eq!(config.batch.max_batch_size, 64);
        assert_eq!(config.batch.max_batch_age, Duration::from_millis(250));
        assert_eq!(config.queue.overflow_policy, OverflowPolicy::EvictOldest);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.queue.capacity, 100);
    }

    #[test]
    fn test_malformed_value_names_variable() {
        let err = PipelineConfig::from_lookup(lookup_from(&[(MAX_BATCH_SIZE_VAR, "lots")])).unwrap_err();
        match err {
            ConfigError::Invalid { var, value, .. } => {
                assert_eq!(var, MAX_BATCH_SIZE_VAR);
                assert_eq!(value, "lots");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = PipelineConfig::from_lookup(lookup_from(&[(OVERFLOW_POLICY_VAR, "drop")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: OVERFLOW_POLICY_VAR, .. }));
    }

    #[test]
    fn test_zero_values_rejected() {
        let err = PipelineConfig::from_lookup(lookup_from(&[(MAX_BATCH_SIZE_VAR, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { field: "max_batch_size", .. }));

        let err = PipelineConfig::from_lookup(lookup_from(&[(QUEUE_CAPACITY_VAR, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { field: "queue capacity", .. }));

        let err = PipelineConfig::default()
            .with_export_timeout(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { field: "export_timeout", .. }));
    }

    #[test]
    fn test_blank_values_keep_defaults() {
        let config = PipelineConfig::from_lookup(lookup_from(&[(SERVICE_NAME_VAR, "  "), (MAX_RETRIES_VAR, "")]))
            .unwrap();
        assert_eq!(config.service_name, "example-service");
        assert_eq!(config.retry.max_retries, 5);
    }
}
