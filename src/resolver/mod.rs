//! Chain configuration resolution
//!
//! Merges the logical token definition with per-chain connection parameters and
//! core contract addresses, and assigns the mainnet role to exactly one chain.
//! Resolution is pure: nothing here touches the network.

mod token;

pub use token::TokenDefinition;

use crate::config::{ChainConnectionParams, CoreAddresses};
use crate::error::ConfigError;

use ethers::types::{Address, U256};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Role of a router in the deployment set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouterRole {
    /// The single router allowed to mint supply from native deposits
    Mainnet,
    Secondary,
}

impl RouterRole {
    pub fn is_mainnet(self) -> bool {
        self == RouterRole::Mainnet
    }
}

/// Fully resolved configuration for one chain's router
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainRouterConfig {
    chain: String,
    token: TokenDefinition,
    connection: ChainConnectionParams,
    role: RouterRole,
    owner: Address,
    message_hub: Address,
    gas_paymaster: Address,
}

impl ChainRouterConfig {
    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub fn chain_id(&self) -> u64 {
        self.connection.chain_id
    }

    pub fn token(&self) -> &TokenDefinition {
        &self.token
    }

    pub fn connection(&self) -> &ChainConnectionParams {
        &self.connection
    }

    pub fn role(&self) -> RouterRole {
        self.role
    }

    pub fn owner(&self) -> Address {
        self.owner
    }

    pub fn message_hub(&self) -> Address {
        self.message_hub
    }

    pub fn gas_paymaster(&self) -> Address {
        self.gas_paymaster
    }

    /// Supply minted by the initializer. Only the mainnet router mints at
    /// initialization; secondaries start empty.
    pub fn initial_supply(&self) -> U256 {
        match self.role {
            RouterRole::Mainnet => self.token.initial_supply(),
            RouterRole::Secondary => U256::zero(),
        }
    }
}

/// The output of resolution: exactly one mainnet router plus any number of
/// secondaries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedDeployment {
    mainnet: ChainRouterConfig,
    secondaries: BTreeMap<String, ChainRouterConfig>,
}

impl ResolvedDeployment {
    pub fn mainnet(&self) -> &ChainRouterConfig {
        &self.mainnet
    }

    pub fn get(&self, chain: &str) -> Option<&ChainRouterConfig> {
        if self.mainnet.chain == chain {
            Some(&self.mainnet)
        } else {
            self.secondaries.get(chain)
        }
    }

    /// All router configs ordered by chain name
    pub fn iter(&self) -> impl Iterator<Item = &ChainRouterConfig> {
        let mut all: Vec<&ChainRouterConfig> = self.secondaries.values().collect();
        let idx = all
            .binary_search_by(|c| c.chain.as_str().cmp(self.mainnet.chain.as_str()))
            .unwrap_or_else(|i| i);
        all.insert(idx, &self.mainnet);
        all.into_iter()
    }

    pub fn chains(&self) -> Vec<&str> {
        self.iter().map(|c| c.chain()).collect()
    }

    pub fn len(&self) -> usize {
        self.secondaries.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Resolves per-chain router configs from the logical token definition
pub struct ChainConfigResolver<'a> {
    token: &'a TokenDefinition,
    connections: &'a BTreeMap<String, ChainConnectionParams>,
    core: &'a BTreeMap<String, CoreAddresses>,
    default_owner: Address,
}

impl<'a> ChainConfigResolver<'a> {
    pub fn new(
        token: &'a TokenDefinition,
        connections: &'a BTreeMap<String, ChainConnectionParams>,
        core: &'a BTreeMap<String, CoreAddresses>,
        default_owner: Address,
    ) -> Self {
        Self {
            token,
            connections,
            core,
            default_owner,
        }
    }

    /// Resolve the deployment set.
    ///
    /// `mainnet_marks` holds every chain the caller marked as mainnet. Repeated
    /// marks of the same chain count once; anything other than exactly one
    /// distinct chain is ambiguous.
    pub fn resolve(&self, mainnet_marks: &[String]) -> Result<ResolvedDeployment, ConfigError> {
        let marked: BTreeSet<&str> = mainnet_marks.iter().map(String::as_str).collect();
        if marked.len() != 1 {
            return Err(ConfigError::AmbiguousMainnet {
                found: marked.len(),
                chains: marked.into_iter().map(str::to_string).collect(),
            });
        }
        let mainnet_chain = marked.into_iter().next().unwrap_or_default();

        if !self.connections.contains_key(mainnet_chain) {
            return Err(ConfigError::MissingConnectionParams {
                chain: mainnet_chain.to_string(),
            });
        }

        if let Some(chain) = self
            .core
            .keys()
            .find(|chain| !self.connections.contains_key(*chain))
        {
            return Err(ConfigError::MissingConnectionParams {
                chain: chain.clone(),
            });
        }

        let mut seen_ids: HashMap<u64, &str> = HashMap::new();
        for (chain, params) in self.connections {
            if let Some(first) = seen_ids.insert(params.chain_id, chain) {
                return Err(ConfigError::DuplicateChainId {
                    chain_id: params.chain_id,
                    first: first.to_string(),
                    second: chain.clone(),
                });
            }
        }

        let mut mainnet = None;
        let mut secondaries = BTreeMap::new();
        for (chain, params) in self.connections {
            let core = self
                .core
                .get(chain)
                .ok_or_else(|| ConfigError::MissingCoreAddresses {
                    chain: chain.clone(),
                })?;

            let role = if chain == mainnet_chain {
                RouterRole::Mainnet
            } else {
                RouterRole::Secondary
            };

            let config = ChainRouterConfig {
                chain: chain.clone(),
                token: self.token.clone(),
                connection: params.clone(),
                role,
                owner: core.owner.unwrap_or(self.default_owner),
                message_hub: core.message_hub,
                gas_paymaster: core.gas_paymaster,
            };

            match role {
                RouterRole::Mainnet => mainnet = Some(config),
                RouterRole::Secondary => {
                    secondaries.insert(chain.clone(), config);
                }
            }
        }

        let mainnet = mainnet.ok_or_else(|| ConfigError::MissingConnectionParams {
            chain: mainnet_chain.to_string(),
        })?;

        Ok(ResolvedDeployment {
            mainnet,
            secondaries,
        })
    }
}
