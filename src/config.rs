//! Configuration management for txpipe
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::events::LogQuery;

use anyhow::{Context, Result};
use ethers::types::U256;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub node: NodeConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub nonce: NonceConfig,
    #[serde(default)]
    pub gas: GasConfig,
    #[serde(default)]
    pub streams: StreamConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub rpc_urls: Vec<String>,
    pub ws_url: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Environment variable holding the hex-encoded signing key
    pub private_key_env: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NonceConfig {
    /// Age after which the cached nonce is always re-read from the node
    pub resync_threshold_secs: u64,
    /// Idle time after which the background task re-anchors the nonce
    pub debounce_secs: u64,
    pub resync_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasStrategy {
    Fixed,
    Refreshed,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GasConfig {
    pub strategy: GasStrategy,
    /// Fixed price, and the fallback when the first refresh fails
    pub gas_price_gwei: u64,
    pub gas_limit: u64,
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub poll_interval_ms: u64,
    pub queue_capacity: usize,
    pub fanout_concurrency: usize,
    /// Resolve pending transaction hashes into full transactions in the binary
    pub pending_fanout: bool,
    pub logs: Vec<LogQuery>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            private_key_env: "TXPIPE_PRIVATE_KEY".to_string(),
        }
    }
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            resync_threshold_secs: 60,
            debounce_secs: 10,
            resync_interval_secs: 10,
        }
    }
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            strategy: GasStrategy::Fixed,
            gas_price_gwei: 5,
            gas_limit: 3_000_000,
            refresh_interval_secs: 60,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            queue_capacity: 500,
            fanout_concurrency: 3,
            pending_fanout: false,
            logs: Vec::new(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

impl NodeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl NonceConfig {
    pub fn resync_threshold(&self) -> Duration {
        Duration::from_secs(self.resync_threshold_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }
}

impl GasConfig {
    pub fn gas_price(&self) -> U256 {
        U256::from(self.gas_price_gwei) * U256::exp10(9)
    }

    pub fn gas_limit(&self) -> U256 {
        U256::from(self.gas_limit)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

impl StreamConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Settings {
    /// Load settings from `TXPIPE_CONFIG` or `config/default.toml`
    pub fn load() -> Result<Self> {
        let config_path = env::var("TXPIPE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::from_toml(&config_str)
    }

    /// Parse settings from TOML text, substituting `${VAR}` references first
    pub fn from_toml(input: &str) -> Result<Self> {
        let config_str = substitute_env_vars(input);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.node.rpc_urls.is_empty() {
            anyhow::bail!("At least one RPC URL must be configured");
        }
        if self.node.request_timeout_secs == 0 {
            anyhow::bail!("node.request_timeout_secs must be positive");
        }
        if self.nonce.resync_interval_secs == 0 {
            anyhow::bail!("nonce.resync_interval_secs must be positive");
        }
        if self.gas.strategy == GasStrategy::Refreshed && self.gas.refresh_interval_secs == 0 {
            anyhow::bail!("gas.refresh_interval_secs must be positive");
        }
        if self.streams.poll_interval_ms == 0 {
            anyhow::bail!("streams.poll_interval_ms must be positive");
        }
        if self.streams.queue_capacity == 0 {
            anyhow::bail!("streams.queue_capacity must be positive");
        }
        if self.streams.fanout_concurrency == 0 {
            anyhow::bail!("streams.fanout_concurrency must be positive");
        }

        for (index, query) in self.streams.logs.iter().enumerate() {
            query
                .validate()
                .with_context(|| format!("Invalid log stream #{}", index))?;
        }

        if self.nonce.debounce_secs >= self.nonce.resync_threshold_secs {
            tracing::warn!(
                "nonce.debounce_secs ({}) is not below nonce.resync_threshold_secs ({})",
                self.nonce.debounce_secs,
                self.nonce.resync_threshold_secs
            );
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();

    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TXPIPE_TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TXPIPE_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let settings = Settings::from_toml(
            r#"
            [node]
            rpc_urls = ["http://localhost:8545"]
            "#,
        )
        .unwrap();

        assert_eq!(settings.node.request_timeout(), Duration::from_secs(30));
        assert_eq!(settings.nonce.resync_threshold(), Duration::from_secs(60));
        assert_eq!(settings.nonce.debounce(), Duration::from_secs(10));
        assert_eq!(settings.gas.strategy, GasStrategy::Fixed);
        assert_eq!(settings.gas.gas_price(), U256::from(5_000_000_000u64));
        assert_eq!(settings.gas.gas_limit(), U256::from(3_000_000u64));
        assert_eq!(settings.streams.queue_capacity, 500);
        assert_eq!(settings.streams.fanout_concurrency, 3);
        assert_eq!(settings.wallet.private_key_env, "TXPIPE_PRIVATE_KEY");
        assert!(!settings.metrics.enabled);
    }

    #[test]
    fn parses_log_streams_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [node]
            rpc_urls = ["http://localhost:8545"]

            [gas]
            strategy = "refreshed"

            [[streams.logs]]
            addresses = ["0x7b4452dd6c38597fa9364ac8905c27ea44425832"]
            topics = [["0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"], []]
            "#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.gas.strategy, GasStrategy::Refreshed);
        assert_eq!(settings.streams.logs.len(), 1);

        let query = &settings.streams.logs[0];
        assert_eq!(query.addresses.len(), 1);
        assert_eq!(query.topics.len(), 2);
        assert!(query.topics[1].is_empty());
    }

    #[test]
    fn rejects_invalid_settings() {
        assert!(Settings::from_toml("[node]\nrpc_urls = []").is_err());
        assert!(Settings::from_toml(
            "[node]\nrpc_urls = [\"http://localhost:8545\"]\n[streams]\nfanout_concurrency = 0"
        )
        .is_err());
    }
}
