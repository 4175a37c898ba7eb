//! Configuration management for the faucetful router
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::chain::recommended_confirmations;
use crate::error::ConfigError;
use crate::resolver::{ChainConfigResolver, ResolvedDeployment, TokenDefinition};

use anyhow::{Context, Result};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Chain designated as mainnet router
    #[serde(default)]
    pub mainnet: Option<String>,
    pub token: TokenConfig,
    pub chains: BTreeMap<String, ChainConnectionParams>,
    #[serde(default)]
    pub core: BTreeMap<String, CoreAddresses>,
    #[serde(default)]
    pub deployment: DeploymentConfig,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub name: String,
    pub symbol: String,
    #[serde(default = "default_initial_supply")]
    pub initial_supply: String,
}

/// Per-chain connection parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainConnectionParams {
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
    #[serde(default)]
    pub confirmations: u64,
    #[serde(default)]
    pub fee_overrides: Option<FeeOverrides>,
    /// Marks this chain as the mainnet router
    #[serde(default)]
    pub mainnet: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeOverrides {
    pub max_fee_per_gas_gwei: Option<u64>,
    pub max_priority_fee_per_gas_gwei: Option<u64>,
    pub gas_limit: Option<u64>,
}

/// Addresses of the messaging core a router connects to on one chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreAddresses {
    pub message_hub: Address,
    pub gas_paymaster: Address,
    #[serde(default)]
    pub owner: Option<Address>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    pub record_path: PathBuf,
    pub artifact_path: PathBuf,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            record_path: PathBuf::from("deployinfo/deploy.json"),
            artifact_path: PathBuf::from("artifacts/FaucetfulERC20.json"),
            max_retries: 3,
            retry_delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub private_key_env: String,
    pub owner: Option<Address>,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            private_key_env: "PRIVATE_KEY".to_string(),
            owner: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub poll_interval_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

fn default_initial_supply() -> String {
    "0".to_string()
}

impl Settings {
    /// Load settings from a configuration file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml(&config_str)
    }

    /// Parse settings from TOML text
    pub fn from_toml(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let mut settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.apply_defaults();
        settings.validate()?;

        Ok(settings)
    }

    fn apply_defaults(&mut self) {
        for params in self.chains.values_mut() {
            if params.confirmations == 0 {
                params.confirmations = recommended_confirmations(params.chain_id);
            }
        }
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.chains.is_empty() {
            anyhow::bail!("At least one chain must be configured");
        }

        for (name, chain) in &self.chains {
            if chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
        }

        if self.deployment.max_retries == 0 {
            anyhow::bail!("deployment.max_retries must be at least 1");
        }

        Ok(())
    }

    /// Every chain the configuration marks as mainnet, from the top-level key
    /// and the per-chain flags.
    pub fn mainnet_marks(&self) -> Vec<String> {
        let mut marks: Vec<String> = self.mainnet.iter().cloned().collect();
        marks.extend(
            self.chains
                .iter()
                .filter(|(_, c)| c.mainnet)
                .map(|(name, _)| name.clone()),
        );
        marks
    }

    pub fn token_definition(&self) -> Result<TokenDefinition, ConfigError> {
        TokenDefinition::parse(
            &self.token.name,
            &self.token.symbol,
            &self.token.initial_supply,
        )
    }

    /// Resolve the per-chain router configs. `default_owner` is used for chains
    /// whose core entry does not name an owner.
    pub fn resolve(&self, default_owner: Address) -> Result<ResolvedDeployment, ConfigError> {
        let token = self.token_definition()?;
        let owner = self.wallet.owner.unwrap_or(default_owner);
        ChainConfigResolver::new(&token, &self.chains, &self.core, owner)
            .resolve(&self.mainnet_marks())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = match regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}") {
        Ok(re) => re,
        Err(_) => return result,
    };

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        mainnet = "mumbai"

        [token]
        name = "Faucetful"
        symbol = "FCT"
        initial_supply = "0"

        [chains.goerli]
        chain_id = 5
        rpc_urls = ["https://goerli.example/${FAUCETFUL_TEST_KEY}"]

        [chains.mumbai]
        chain_id = 80001
        rpc_urls = ["https://mumbai.example"]
        confirmations = 3

        [chains.mumbai.fee_overrides]
        max_fee_per_gas_gwei = 60
        max_priority_fee_per_gas_gwei = 30
        gas_limit = 600000

        [core.goerli]
        message_hub = "0x0000000000000000000000000000000000000101"
        gas_paymaster = "0x0000000000000000000000000000000000000102"

        [core.mumbai]
        message_hub = "0x0000000000000000000000000000000000000201"
        gas_paymaster = "0x0000000000000000000000000000000000000202"
    "#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn parses_sample_config() {
        env::set_var("FAUCETFUL_TEST_KEY", "abc");
        let settings = Settings::from_toml(SAMPLE).unwrap();

        assert_eq!(settings.chains["goerli"].rpc_urls[0], "https://goerli.example/abc");
        // Defaults to the recommended confirmations for the chain id
        assert_eq!(settings.chains["goerli"].confirmations, 12);
        assert_eq!(settings.chains["mumbai"].confirmations, 3);
        assert_eq!(
            settings.chains["mumbai"]
                .fee_overrides
                .as_ref()
                .and_then(|f| f.gas_limit),
            Some(600_000)
        );
        assert_eq!(settings.deployment.max_retries, 3);
        assert_eq!(settings.wallet.private_key_env, "PRIVATE_KEY");
        assert!(settings.database.is_none());
    }

    #[test]
    fn shipped_default_config_resolves() {
        let settings = Settings::from_toml(include_str!("../config/default.toml")).unwrap();
        let resolved = settings.resolve(Address::from_low_u64_be(9)).unwrap();
        assert_eq!(resolved.mainnet().chain(), "mumbai");
        assert!(!settings.metrics.enabled);
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let config = format!("{}\n[deployment]\nmax_retries = 5\n", SAMPLE);
        let settings = Settings::from_toml(&config).unwrap();
        assert_eq!(settings.deployment.max_retries, 5);
        assert_eq!(settings.deployment.retry_delay_ms, 2_000);
    }

    #[test]
    fn resolves_sample_config() {
        let settings = Settings::from_toml(SAMPLE).unwrap();
        let resolved = settings.resolve(Address::from_low_u64_be(9)).unwrap();

        assert_eq!(resolved.mainnet().chain(), "mumbai");
        assert_eq!(resolved.mainnet().chain_id(), 80001);
        assert_eq!(resolved.len(), 2);
    }

    #[test]
    fn conflicting_marks_are_ambiguous() {
        let conflicting = SAMPLE.replace(
            "chain_id = 5\n",
            "chain_id = 5\n        mainnet = true\n",
        );
        let settings = Settings::from_toml(&conflicting).unwrap();
        assert_eq!(settings.mainnet_marks(), vec!["mumbai", "goerli"]);

        let err = settings.resolve(Address::zero()).unwrap_err();
        assert!(matches!(err, ConfigError::AmbiguousMainnet { found: 2, .. }));
    }

    #[test]
    fn rejects_chain_without_rpc() {
        let broken = SAMPLE.replace("rpc_urls = [\"https://mumbai.example\"]", "rpc_urls = []");
        assert!(Settings::from_toml(&broken).is_err());
    }
}
