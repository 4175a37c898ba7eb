//! Chain module - clients that create and administer routers on each chain
//!
//! This module provides:
//! - The `ChainClient` seam the deployer drives
//! - An ethers-backed client for EVM chains with RPC failover
//! - An in-process chain used by the devnet and tests
//! - Fee override handling

pub mod gas;
pub mod local;
pub mod provider;

pub use gas::GasPrice;
pub use local::LocalChain;
pub use provider::EthersChainClient;

use crate::error::DeployError;
use crate::router::InitializeArgs;

use async_trait::async_trait;
use ethers::types::Address;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Operations the deployer needs from a chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Chain ID
    fn chain_id(&self) -> u64;

    /// Account that sends deployment transactions
    fn operator(&self) -> Address;

    /// Create an uninitialized router instance.
    ///
    /// A creation that was sent but never confirmed fails with
    /// `DeployError::CreationUnconfirmed`, carrying the address it lands at.
    async fn deploy_router(&self) -> Result<Address, DeployError>;

    /// Call the router's one-time initializer
    async fn initialize_router(
        &self,
        router: Address,
        args: InitializeArgs,
    ) -> Result<(), DeployError>;

    /// Enroll the router that speaks for `domain`
    async fn enroll_remote_router(
        &self,
        router: Address,
        domain: u64,
        remote: Address,
    ) -> Result<(), DeployError>;

    /// Hand router ownership to `new_owner`
    async fn transfer_ownership(
        &self,
        router: Address,
        new_owner: Address,
    ) -> Result<(), DeployError>;
}

/// Chain clients keyed by chain name
pub type ChainClients = BTreeMap<String, Arc<dyn ChainClient>>;

/// Get recommended confirmation blocks for a chain
pub fn recommended_confirmations(chain_id: u64) -> u64 {
    match chain_id {
        // Ethereum mainnet
        1 => 32,
        // Ethereum testnets
        11155111 | 5 => 12,
        // Polygon mainnet
        137 => 128,
        // Polygon testnets
        80001 | 80002 => 32,
        // Arbitrum
        42161 | 421614 => 64,
        // Optimism
        10 | 11155420 => 64,
        // Celo
        42220 | 44787 => 1,
        // Avalanche (instant finality)
        43114 | 43113 => 1,
        // Local development chains
        31337 | 1337 => 1,
        // Default conservative
        _ => 64,
    }
}
