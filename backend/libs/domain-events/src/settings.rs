//! Layered configuration for the pipeline.
//!
//! # Loading Order
//! 1. Built-in defaults
//! 2. `config/{service}.toml` (optional)
//! 3. Environment variables (highest priority)
//!
//! # Environment Variables
//! Prefix `APP`, separator `__`:
//! `APP__KAFKA__BROKERS=kafka-1:9092`,
//! `APP__KAFKA__PAYMENT__STATUS_CHANGED__TOPIC=payments.status`.

use std::time::Duration;

use config::{Config, ConfigError, Environment, File};

use crate::error::TopicError;
use crate::producer::{OverflowPolicy, ProducerConfig};
use crate::topics::{optional, TopicCatalog, DEFAULT_BROKERS};

/// Build the layered configuration for `service`.
pub fn load_layered(service: &str) -> Result<Config, ConfigError> {
    // Load .env file if it exists (for local development)
    dotenvy::dotenv().ok();

    Config::builder()
        .set_default("kafka.brokers", DEFAULT_BROKERS)?
        .add_source(File::with_name(&format!("config/{}", service)).required(false))
        .add_source(
            Environment::with_prefix("APP")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
}

/// Everything the pipeline reads from configuration.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub service: String,
    pub catalog: TopicCatalog,
    pub producer: ProducerConfig,
}

impl PipelineSettings {
    /// Defaults only; no configuration sources consulted.
    pub fn defaults(service: &str) -> Self {
        Self {
            service: service.to_string(),
            catalog: TopicCatalog::with_defaults(service),
            producer: ProducerConfig::default(),
        }
    }

    pub fn from_config(config: &Config, service: &str) -> Result<Self, TopicError> {
        let catalog = TopicCatalog::from_config(config, service)?;
        let mut producer = ProducerConfig::default();

        if let Some(capacity) = optional(config.get_int("kafka.producer.buffer_capacity"))? {
            producer.buffer_capacity = positive("kafka.producer.buffer_capacity", capacity)? as usize;
        }
        if let Some(policy) = optional(config.get_string("kafka.producer.overflow"))? {
            producer.overflow = policy
                .parse::<OverflowPolicy>()
                .map_err(|reason| TopicError::InvalidSetting {
                    key: "kafka.producer.overflow".to_string(),
                    reason,
                })?;
        }
        if let Some(ms) = optional(config.get_int("kafka.producer.shutdown_timeout_ms"))? {
            producer.shutdown_timeout =
                Duration::from_millis(positive("kafka.producer.shutdown_timeout_ms", ms)? as u64);
        }

        Ok(Self {
            service: service.to_string(),
            catalog,
            producer,
        })
    }

    /// Load the layered configuration and read the pipeline settings.
    pub fn load(service: &str) -> Result<Self, TopicError> {
        let config = load_layered(service)?;
        Self::from_config(&config, service)
    }
}

fn positive(key: &str, value: i64) -> Result<i64, TopicError> {
    if value > 0 {
        Ok(value)
    } else {
        Err(TopicError::InvalidSetting {
            key: key.to_string(),
            reason: format!("must be positive, got {}", value),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    #[test]
    fn test_producer_settings_from_config() {
        let config = Config::builder()
            .add_source(File::from_str(
                r#"
                [kafka.producer]
                buffer_capacity = 64
                overflow = "drop"
                shutdown_timeout_ms = 250
                "#,
                FileFormat::Toml,
            ))
            .build()
            .unwrap();

        let settings = PipelineSettings::from_config(&config, "shipping-service").unwrap();
        assert_eq!(settings.producer.buffer_capacity, 64);
        assert_eq!(settings.producer.overflow, OverflowPolicy::Drop);
        assert_eq!(settings.producer.shutdown_timeout, Duration::from_millis(250));
        assert_eq!(settings.catalog.group_id(), "shipping-service-group");
    }

    #[test]
    fn test_defaults_when_nothing_configured() {
        let config = Config::builder().build().unwrap();
        let settings = PipelineSettings::from_config(&config, "payment-service").unwrap();

        assert_eq!(settings.producer.buffer_capacity, 10_000);
        assert_eq!(settings.producer.overflow, OverflowPolicy::Block);
        assert_eq!(settings.producer.batch_size, 10);
        assert_eq!(settings.producer.linger, Duration::from_millis(500));
        assert_eq!(settings.catalog, TopicCatalog::with_defaults("payment-service"));
    }

    #[test]
    fn test_rejects_bad_overflow_and_capacity() {
        for toml in [
            "[kafka.producer]\noverflow = \"spill\"",
            "[kafka.producer]\nbuffer_capacity = 0",
        ] {
            let config = Config::builder()
                .add_source(File::from_str(toml, FileFormat::Toml))
                .build()
                .unwrap();
            assert!(matches!(
                PipelineSettings::from_config(&config, "svc"),
                Err(TopicError::InvalidSetting { .. })
            ));
        }
    }
}
