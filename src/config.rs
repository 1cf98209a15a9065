//! Configuration management for the Treasury Relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use ethers::types::Address;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub poll_interval_ms: u64,
    pub blocks_before_retry: u64,
    pub blocks_before_cancel: u64,
    /// Pause between consecutive submissions from one account
    #[serde(default)]
    pub queue_delay_ms: u64,
    /// Receiver of cancellation transfers; the sending account when unset
    #[serde(default)]
    pub cancel_recipient: Option<Address>,
    pub health_check_interval_secs: u64,
}

impl RelayerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn queue_delay(&self) -> Option<Duration> {
        (self.queue_delay_ms > 0).then(|| Duration::from_millis(self.queue_delay_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    /// Expected value of the `Authorization` header
    pub auth_header: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Environment variable holding comma separated private keys
    pub private_keys_env: String,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("TREASURY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::from_file(&config_path)
    }

    /// Load settings from an explicit path
    pub fn from_file(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml(&config_str)
    }

    fn from_toml(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        // At least one chain must be enabled
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        for (name, chain) in &self.chains {
            if chain.enabled && chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
        }

        if self.relayer.blocks_before_retry == 0 {
            anyhow::bail!("relayer.blocks_before_retry must be at least 1");
        }
        if self.relayer.blocks_before_cancel < self.relayer.blocks_before_retry {
            tracing::warn!(
                "relayer.blocks_before_cancel ({}) is below blocks_before_retry ({}) - transactions will be cancelled without a retry",
                self.relayer.blocks_before_cancel,
                self.relayer.blocks_before_retry
            );
        }
        if self.api.auth_header.is_empty() {
            anyhow::bail!("api.auth_header must not be empty");
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid env var pattern");

    re.replace_all(input, |cap: &regex::Captures| {
        env::var(&cap[1]).unwrap_or_default()
    })
    .into_owned()
}
