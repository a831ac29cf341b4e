//! Configuration management for the oracle node
//!
//! Loads from TOML/YAML files + environment variables via .env

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use ethers::types::Address;
use serde::Deserialize;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub l1: L1Config,
    pub oracle: OracleConfig,
    pub reporter: ReporterConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct L1Config {
    /// Streaming (websocket) endpoint of the L1 node
    pub ws_url: String,
    /// Path of the validator keystore file
    pub keystore_path: String,
    /// Password of the validator keystore file
    pub keystore_password: String,
    /// Validator identity compared against the on-chain committee
    pub validator_address: String,
}

impl L1Config {
    pub fn validator(&self) -> Result<Address> {
        self.validator_address
            .parse()
            .with_context(|| format!("invalid validator address {:?}", self.validator_address))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
    /// Directory holding the provider plugin executables
    pub plugin_dir: String,
    /// Initial symbol set (superseded by chain symbols once connected)
    pub symbols: Vec<String>,
    /// Price collection interval in seconds
    pub update_interval_secs: u64,
    /// Plugin discovery interval in seconds
    pub plugin_discovery_interval_secs: u64,
    /// Maximum age at which a collected price is still usable, milliseconds
    pub valid_data_age_ms: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReporterConfig {
    /// Chain connectivity checker interval in seconds
    pub health_checker_interval_secs: u64,
    /// Number of voting rounds kept buffered for reveals
    pub max_buffered_rounds: u64,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            // L1 defaults
            .set_default("l1.ws_url", "ws://127.0.0.1:8546")?
            .set_default("l1.keystore_path", "")?
            .set_default("l1.keystore_password", "")?
            .set_default("l1.validator_address", "")?
            // Oracle defaults
            .set_default("oracle.plugin_dir", "./plugins")?
            .set_default("oracle.symbols", vec!["BTCUSD", "ETHUSD"])?
            .set_default("oracle.update_interval_secs", 10)?
            .set_default("oracle.plugin_discovery_interval_secs", 2)?
            .set_default("oracle.valid_data_age_ms", 60_000)?
            // Reporter defaults
            .set_default("reporter.health_checker_interval_secs", 120)?
            .set_default("reporter.max_buffered_rounds", 10)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (ORACLE__*)
            .add_source(Environment::with_prefix("ORACLE").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(app_config)
    }

    /// Generate a digest of the config (without secrets) for logging
    pub fn digest(&self) -> String {
        format!(
            "ws={} plugin_dir={} symbols={:?} update={}s discovery={}s",
            self.l1.ws_url,
            self.oracle.plugin_dir,
            self.oracle.symbols,
            self.oracle.update_interval_secs,
            self.oracle.plugin_discovery_interval_secs,
        )
    }

    /// Validate required settings before startup
    pub fn validate(&self) -> Result<()> {
        if self.l1.keystore_path.is_empty() {
            bail!("l1.keystore_path is not set");
        }
        if self.l1.keystore_password.is_empty() {
            bail!("l1.keystore_password is not set");
        }
        self.l1.validator()?;
        if self.oracle.valid_data_age_ms <= 0 {
            bail!("oracle.valid_data_age_ms must be positive");
        }
        if self.reporter.max_buffered_rounds == 0 {
            bail!("reporter.max_buffered_rounds must be positive");
        }
        Ok(())
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
