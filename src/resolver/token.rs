//! Logical, chain-independent token definition

use crate::error::ConfigError;

use ethers::types::U256;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenDefinition {
    name: String,
    symbol: String,
    initial_supply: U256,
}

impl TokenDefinition {
    pub fn new(
        name: impl Into<String>,
        symbol: impl Into<String>,
        initial_supply: U256,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        let symbol = symbol.into();

        if name.trim().is_empty() {
            return Err(ConfigError::InvalidToken("name is empty".to_string()));
        }
        if symbol.trim().is_empty() {
            return Err(ConfigError::InvalidToken("symbol is empty".to_string()));
        }

        Ok(Self {
            name,
            symbol,
            initial_supply,
        })
    }

    /// Build a definition from a decimal supply string as found in config files.
    /// Negative and out-of-range supplies are rejected.
    pub fn parse(
        name: impl Into<String>,
        symbol: impl Into<String>,
        initial_supply: &str,
    ) -> Result<Self, ConfigError> {
        let supply = initial_supply.trim();
        if supply.starts_with('-') {
            return Err(ConfigError::InvalidToken(format!(
                "initial supply {} is negative",
                supply
            )));
        }
        let supply = U256::from_dec_str(supply).map_err(|e| {
            ConfigError::InvalidToken(format!("initial supply {}: {:?}", supply, e))
        })?;

        Self::new(name, symbol, supply)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn initial_supply(&self) -> U256 {
        self.initial_supply
    }
}
