/// Configuration management for shipping-service
///
/// Read from `config/shipping-service.toml` and `APP__*` variables on top of
/// the defaults below. `DATABASE_URL` is used when no `database` table is set.
use anyhow::{Context, Result};
use config::{Config, ConfigError};
use domain_events::settings::load_layered;
use domain_events::PipelineSettings;
use serde::Deserialize;

pub const SERVICE_NAME: &str = "shipping-service";

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub database: DatabaseConfig,
    pub fulfillment: FulfillmentConfig,
    pub pipeline: PipelineSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

/// Shipment auto-creation
#[derive(Debug, Clone, Deserialize)]
pub struct FulfillmentConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Location recorded on the first tracking entry of a new shipment.
    #[serde(default = "default_origin")]
    pub origin: String,
}

impl Default for FulfillmentConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            origin: default_origin(),
        }
    }
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout_secs() -> u64 {
    10
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_origin() -> String {
    "warehouse".to_string()
}

impl DatabaseConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        })
    }
}

impl ServiceConfig {
    pub fn load() -> Result<Self> {
        let raw = load_layered(SERVICE_NAME).context("Failed to read configuration sources")?;
        Self::from_config(&raw)
    }

    pub fn from_config(raw: &Config) -> Result<Self> {
        let database = match raw.get::<DatabaseConfig>("database") {
            Ok(database) => database,
            Err(ConfigError::NotFound(_)) => DatabaseConfig::from_env()?,
            Err(e) => return Err(e).context("Invalid database configuration"),
        };
        let fulfillment = match raw.get::<FulfillmentConfig>("fulfillment") {
            Ok(fulfillment) => fulfillment,
            Err(ConfigError::NotFound(_)) => FulfillmentConfig::default(),
            Err(e) => return Err(e).context("Invalid fulfillment configuration"),
        };
        let pipeline = PipelineSettings::from_config(raw, SERVICE_NAME)
            .context("Invalid kafka configuration")?;

        Ok(Self {
            database,
            fulfillment,
            pipeline,
        })
    }
}
