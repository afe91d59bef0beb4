//! Configuration management for the swap orchestrator
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::assets::{ChainId, Network};

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub orchestrator: OrchestratorConfig,
    pub server: ServerConfig,
    pub wallet: WalletConfig,
    /// Keyed by the persisted chain name (`bitcoin`, `rsk`, ...)
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub swaps: SwapsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Lower bound of the randomised polling interval
    pub poll_min_ms: u64,
    /// Upper bound of the randomised polling interval
    pub poll_max_ms: u64,
    /// How long a lock waiter sleeps before retrying without an unlock event
    pub lock_retry_ms: u64,
    /// Optional ceiling on a single polling loop; unbounded when absent
    pub max_poll_duration_secs: Option<u64>,
    pub balance_sync_interval_secs: u64,
}

impl OrchestratorConfig {
    pub fn poll_window(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.poll_min_ms),
            Duration::from_millis(self.poll_max_ms),
        )
    }

    pub fn lock_retry(&self) -> Duration {
        Duration::from_millis(self.lock_retry_ms)
    }

    pub fn max_poll_duration(&self) -> Option<Duration> {
        self.max_poll_duration_secs.map(Duration::from_secs)
    }
}

/// HTTP listener shared by the JSON API and the Prometheus endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Serve quote, swap, send and history routes
    pub api: bool,
    /// Serve `/metrics`
    pub metrics: bool,
}

impl ServerConfig {
    pub fn enabled(&self) -> bool {
        self.api || self.metrics
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// JSON file holding accounts and history
    pub state_path: String,
    /// Environment variable holding the wallet mnemonic
    pub mnemonic_env: String,
    pub networks: Vec<Network>,
}

/// Per-chain connection parameters for both networks
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub mainnet: ChainNetworkConfig,
    pub testnet: ChainNetworkConfig,
}

impl ChainConfig {
    pub fn network(&self, network: Network) -> &ChainNetworkConfig {
        match network {
            Network::Mainnet => &self.mainnet,
            Network::Testnet => &self.testnet,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainNetworkConfig {
    pub name: String,
    /// EVM chain id (absent for non-EVM chains)
    pub chain_id: Option<u64>,
    pub rpc_url: String,
    pub coin_type: String,
    /// HTLC contract used for atomic swaps; absent disables swap support
    pub htlc_contract: Option<String>,
    /// Esplora REST endpoint (bitcoin)
    pub esplora_url: Option<String>,
    /// Recommended-fee endpoint (bitcoin mainnet)
    pub fee_api_url: Option<String>,
    /// Helper/indexer endpoint (near, terra)
    pub helper_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SwapsConfig {
    pub fastbtc: Option<FastBtcConfig>,
    pub uniswap: Option<UniswapConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FastBtcConfig {
    pub enabled: bool,
    pub bridge_endpoint: String,
    pub request_timeout_ms: u64,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UniswapConfig {
    pub enabled: bool,
    pub router_address: String,
    pub factory_address: String,
    pub init_code_hash: String,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("SWAP_ORCHESTRATOR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml(&config_str)
    }

    /// Parse and validate settings from TOML text
    pub fn from_toml(raw: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(raw);

        let settings: Settings = toml::from_str(&config_str)
            .with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.orchestrator.poll_min_ms > self.orchestrator.poll_max_ms {
            anyhow::bail!(
                "poll_min_ms ({}) exceeds poll_max_ms ({})",
                self.orchestrator.poll_min_ms,
                self.orchestrator.poll_max_ms
            );
        }

        if self.wallet.networks.is_empty() {
            anyhow::bail!("At least one wallet network must be configured");
        }

        for (name, config) in &self.chains {
            let chain: ChainId = name
                .parse()
                .map_err(|_| anyhow::anyhow!("Unknown chain {} in configuration", name))?;
            for network in [Network::Mainnet, Network::Testnet] {
                let net = config.network(network);
                if net.rpc_url.is_empty() {
                    anyhow::bail!("Chain {} has no RPC URL configured for {}", chain, network);
                }
                if chain.is_evm() && net.chain_id.is_none() {
                    anyhow::bail!("EVM chain {} has no chain_id for {}", chain, network);
                }
                if chain == ChainId::Bitcoin && net.esplora_url.is_none() {
                    anyhow::bail!("Bitcoin {} requires esplora_url", network);
                }
                if chain.is_evm() && net.htlc_contract.is_none() {
                    tracing::warn!("Chain {} ({}) has no HTLC contract - swaps disabled", chain, network);
                }
            }
        }

        Ok(())
    }

    /// Connection parameters for a chain on a network
    pub fn chain_network(&self, chain: ChainId, network: Network) -> Option<&ChainNetworkConfig> {
        self.chains.get(chain.as_str()).map(|c| c.network(network))
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex");

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
