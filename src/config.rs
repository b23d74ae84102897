//! Configuration management for the dispersal relayer
//!
//! Loads configuration from TOML files with environment variable substitution.
//! The result is validated once at startup and threaded through constructors.

use crate::address::parse_address;
use crate::error::{DispersalError, DispersalResult};

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

lazy_static! {
    static ref ENV_VAR_PATTERN: Regex =
        Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static pattern compiles");
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub service: ServiceConfig,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    pub oracle: OracleConfig,
    #[serde(default)]
    pub distribution: DistributionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub instance_id: String,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub rpc_probe_timeout_ms: u64,
}

impl ServiceConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_probe_timeout_ms)
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
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcEndpointConfig {
    pub url: String,
    /// Lower is preferred
    #[serde(default)]
    pub priority: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_endpoints: Vec<RpcEndpointConfig>,
    pub treasury_address: String,
    /// ERC-20 tokens reported by the treasury balance sweep
    #[serde(default)]
    pub token_addresses: Vec<String>,
    #[serde(default)]
    pub confirmation_blocks: Option<u64>,
    #[serde(default)]
    pub fee_strategy: FeeStrategy,
    #[serde(default = "default_max_gas_price_gwei")]
    pub max_gas_price_gwei: u64,
    #[serde(default = "default_min_gas_price_gwei")]
    pub min_gas_price_gwei: u64,
    #[serde(default = "default_priority_fee_gwei")]
    pub priority_fee_gwei: u64,
    #[serde(default)]
    pub fixed_max_fee_gwei: Option<u64>,
    #[serde(default)]
    pub fixed_priority_fee_gwei: Option<u64>,
    /// Oracle feed pricing this chain's native token, e.g. "FLR/USD"
    pub native_feed: String,
    #[serde(default = "default_native_decimals")]
    pub native_decimals: u8,
    /// Environment variable holding a chain-specific operator key
    #[serde(default)]
    pub signer_key_env: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ChainConfig {
    /// Required confirmations, falling back to the per-network recommendation
    pub fn confirmations(&self) -> u64 {
        self.confirmation_blocks
            .unwrap_or_else(|| recommended_confirmations(self.chain_id))
    }
}

/// How gas is priced on a chain
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FeeStrategy {
    /// EIP-1559 when the latest block carries a base fee, legacy otherwise
    #[default]
    Auto,
    Eip1559,
    Legacy,
    /// Fixed conservative EIP-1559 fees for chains with unreliable fee data
    Fixed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Environment variable holding the shared operator key
    #[serde(default = "default_private_key_env")]
    pub private_key_env: String,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            private_key_env: default_private_key_env(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertsConfig {
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_min_severity: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub max_attempts: u32,
    pub max_nonce_retries: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub submission_timeout_secs: u64,
    pub confirmation_poll_interval_ms: u64,
    pub confirmation_timeout_secs: u64,
    pub gas_limit_buffer_percent: u64,
    pub gas_price_buffer_percent: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_nonce_retries: 3,
            retry_initial_delay_ms: 1_000,
            retry_max_delay_ms: 10_000,
            submission_timeout_secs: 30,
            confirmation_poll_interval_ms: 2_000,
            confirmation_timeout_secs: 300,
            gas_limit_buffer_percent: 20,
            gas_price_buffer_percent: 10,
        }
    }
}

impl ExecutorConfig {
    pub fn submission_timeout(&self) -> Duration {
        Duration::from_secs(self.submission_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.confirmation_poll_interval_ms)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
    /// Chain hosting the feed contract
    pub chain_id: u64,
    pub contract_address: String,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_oracle_retries")]
    pub max_retries: u32,
    #[serde(default = "default_oracle_initial_delay")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_oracle_max_delay")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_max_price_age")]
    pub max_price_age_secs: u64,
    #[serde(default = "default_max_future_skew")]
    pub max_future_skew_secs: u64,
    #[serde(default = "default_max_abs_decimals")]
    pub max_abs_decimals: i8,
    #[serde(default = "default_metrics_capacity")]
    pub metrics_capacity: usize,
    #[serde(default)]
    pub fallback: Option<FallbackConfig>,
}

impl OracleConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FallbackConfig {
    pub name: String,
    pub base_url: String,
    #[serde(default = "default_fallback_timeout")]
    pub timeout_ms: u64,
    /// Feed id -> provider asset id, e.g. "ETH/USD" -> "ethereum"
    pub asset_ids: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    /// Attempts on a chain before failure-rate escalation applies
    pub escalation_min_attempts: u64,
    pub warning_failure_rate: f64,
    pub critical_failure_rate: f64,
    /// Balance below this multiple of the requirement raises a warning
    pub low_liquidity_multiplier: u64,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            escalation_min_attempts: 5,
            warning_failure_rate: 0.2,
            critical_failure_rate: 0.5,
            low_liquidity_multiplier: 2,
        }
    }
}

impl Settings {
    /// Load settings from the file named by `DISPERSAL_CONFIG`
    pub fn load() -> DispersalResult<Self> {
        let config_path = env::var("DISPERSAL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(path: &Path) -> DispersalResult<Self> {
        let config_str = std::fs::read_to_string(path).map_err(|e| {
            DispersalError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        Self::from_toml_str(&config_str)
    }

    /// Parse and validate settings from TOML text
    pub fn from_toml_str(input: &str) -> DispersalResult<Self> {
        let config_str = substitute_env_vars(input);

        let settings: Settings = toml::from_str(&config_str)
            .map_err(|e| DispersalError::Config(format!("Failed to parse configuration: {}", e)))?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> DispersalResult<()> {
        let enabled = self.enabled_chains();
        if enabled.is_empty() {
            return Err(DispersalError::Config(
                "At least one chain must be enabled".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for chain in &enabled {
            if !seen.insert(chain.chain_id) {
                return Err(DispersalError::Config(format!(
                    "Chain id {} configured more than once",
                    chain.chain_id
                )));
            }
            if chain.rpc_endpoints.is_empty() {
                return Err(DispersalError::Config(format!(
                    "Chain {} has no RPC endpoints configured",
                    chain.name
                )));
            }
            parse_address(&chain.treasury_address).map_err(|e| {
                DispersalError::Config(format!("Chain {} treasury address: {}", chain.name, e))
            })?;
            for token in &chain.token_addresses {
                parse_address(token).map_err(|e| {
                    DispersalError::Config(format!("Chain {} token address: {}", chain.name, e))
                })?;
            }
            if chain.fee_strategy == FeeStrategy::Fixed
                && (chain.fixed_max_fee_gwei.is_none() || chain.fixed_priority_fee_gwei.is_none())
            {
                return Err(DispersalError::Config(format!(
                    "Chain {} uses the fixed fee strategy without fixed fees",
                    chain.name
                )));
            }
            if chain.native_feed.trim().is_empty() {
                return Err(DispersalError::Config(format!(
                    "Chain {} has no native price feed",
                    chain.name
                )));
            }
        }

        if self.get_chain_by_id(self.oracle.chain_id).is_none() {
            return Err(DispersalError::Config(format!(
                "Oracle chain {} is not an enabled chain",
                self.oracle.chain_id
            )));
        }
        parse_address(&self.oracle.contract_address)
            .map_err(|e| DispersalError::Config(format!("Oracle contract address: {}", e)))?;

        if self.oracle.max_retries == 0 || self.executor.max_attempts == 0 {
            return Err(DispersalError::Config(
                "Retry attempt counts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Get list of enabled chains, ordered by chain id
    pub fn enabled_chains(&self) -> Vec<&ChainConfig> {
        let mut chains: Vec<_> = self.chains.values().filter(|c| c.enabled).collect();
        chains.sort_by_key(|c| c.chain_id);
        chains
    }

    /// Get chain config by chain ID
    pub fn get_chain_by_id(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains
            .values()
            .find(|c| c.enabled && c.chain_id == chain_id)
    }
}

/// Get recommended confirmation blocks for a chain
pub fn recommended_confirmations(chain_id: u64) -> u64 {
    match chain_id {
        // Ethereum mainnet
        1 => 12,
        // Ethereum testnets
        11155111 | 17000 => 3,
        // Flare, Songbird and their testnets
        14 | 19 | 16 | 114 => 1,
        // Polygon
        137 | 80002 => 32,
        // Arbitrum, Optimism, Base
        42161 | 421614 | 10 | 11155420 | 8453 | 84532 => 3,
        // Avalanche (instant finality)
        43114 | 43113 => 1,
        // Default conservative
        _ => 6,
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(input, |caps: &regex::Captures| {
            env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

fn default_health_check_interval() -> u64 {
    60
}

fn default_probe_timeout() -> u64 {
    5_000
}

fn default_max_gas_price_gwei() -> u64 {
    500
}

fn default_min_gas_price_gwei() -> u64 {
    1
}

fn default_priority_fee_gwei() -> u64 {
    2
}

fn default_native_decimals() -> u8 {
    18
}

fn default_true() -> bool {
    true
}

fn default_private_key_env() -> String {
    "DISPERSAL_PRIVATE_KEY".to_string()
}

fn default_cache_ttl() -> u64 {
    30
}

fn default_oracle_retries() -> u32 {
    3
}

fn default_oracle_initial_delay() -> u64 {
    500
}

fn default_oracle_max_delay() -> u64 {
    5_000
}

fn default_max_price_age() -> u64 {
    300
}

fn default_max_future_skew() -> u64 {
    60
}

fn default_max_abs_decimals() -> i8 {
    18
}

fn default_metrics_capacity() -> usize {
    1_000
}

fn default_fallback_timeout() -> u64 {
    5_000
}
