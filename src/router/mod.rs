//! Router contract model
//!
//! This module provides:
//! - The one-time initializer arguments shared by every chain client
//! - The router state machine (deposit, local and remote transfers)
//! - Cross-chain transfer messages and their replay keys

pub mod instance;
pub mod message;

pub use instance::{ReplayGuard, RouterInstance, RouterState, RouterSummary};
pub use message::{MessageKey, TransferMessage};

use crate::resolver::{ChainRouterConfig, RouterRole};

use ethers::types::{Address, U256};
use serde::Serialize;

/// Arguments of the router's one-time initializer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitializeArgs {
    pub connection_manager: Address,
    pub gas_paymaster: Address,
    pub initial_supply: U256,
    pub name: String,
    pub symbol: String,
    pub role: RouterRole,
}

impl InitializeArgs {
    /// The ABI-level mainnet flag
    pub fn is_mainnet_router(&self) -> bool {
        self.role.is_mainnet()
    }
}

impl From<&ChainRouterConfig> for InitializeArgs {
    fn from(config: &ChainRouterConfig) -> Self {
        Self {
            connection_manager: config.message_hub(),
            gas_paymaster: config.gas_paymaster(),
            initial_supply: config.initial_supply(),
            name: config.token().name().to_string(),
            symbol: config.token().symbol().to_string(),
            role: config.role(),
        }
    }
}
