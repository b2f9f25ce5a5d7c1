//! Configuration for payment-service.
//!
//! Layered the same way as the event pipeline: defaults, then
//! `config/payment-service.toml`, then `APP__*` variables. The database URL
//! falls back to `DATABASE_URL` when no `database` table is configured.

use anyhow::{Context, Result};
use config::{Config, ConfigError};
use domain_events::settings::load_layered;
use domain_events::PipelineSettings;
use serde::Deserialize;

pub const SERVICE_NAME: &str = "payment-service";

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub database: DatabaseConfig,
    pub invoices: InvoiceConfig,
    pub settlement: SettlementConfig,
    pub pipeline: PipelineSettings,
}

/// Database configuration
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

/// Invoice auto-generation
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Days between issue and due date.
    #[serde(default = "default_payment_terms_days")]
    pub payment_terms_days: i64,
}

impl Default for InvoiceConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            payment_terms_days: default_payment_terms_days(),
        }
    }
}

/// Gateway-outcome settlement
#[derive(Debug, Clone, Deserialize)]
pub struct SettlementConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
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

fn default_payment_terms_days() -> i64 {
    30
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
        let invoices = match raw.get::<InvoiceConfig>("invoices") {
            Ok(invoices) => invoices,
            Err(ConfigError::NotFound(_)) => InvoiceConfig::default(),
            Err(e) => return Err(e).context("Invalid invoices configuration"),
        };
        let settlement = match raw.get::<SettlementConfig>("settlement") {
            Ok(settlement) => settlement,
            Err(ConfigError::NotFound(_)) => SettlementConfig::default(),
            Err(e) => return Err(e).context("Invalid settlement configuration"),
        };
        let pipeline = PipelineSettings::from_config(raw, SERVICE_NAME)
            .context("Invalid kafka configuration")?;

        Ok(Self {
            database,
            invoices,
            settlement,
            pipeline,
        })
    }
}
