//! Error types for the faucetful router
//!
//! Errors are split by the phase they belong to: configuration resolution,
//! per-chain deployment, router protocol operations and record persistence.

use ethers::types::{Address, U256};
use thiserror::Error;

/// Resolution-time errors. Fatal: nothing reaches the network after one of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Expected exactly one mainnet chain, found {found}: {chains:?}")]
    AmbiguousMainnet { found: usize, chains: Vec<String> },

    #[error("Chain {chain} has no connection parameters")]
    MissingConnectionParams { chain: String },

    #[error("Chain {chain} has no core contract addresses")]
    MissingCoreAddresses { chain: String },

    #[error("Chain id {chain_id} is configured for both {first} and {second}")]
    DuplicateChainId {
        chain_id: u64,
        first: String,
        second: String,
    },

    #[error("Invalid token definition: {0}")]
    InvalidToken(String),
}

/// Chain-scoped deployment errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeployError {
    #[error("Chain {chain} unreachable: {message}")]
    ChainUnreachable { chain: String, message: String },

    #[error("Router {router:?} on chain {chain} is already initialized")]
    AlreadyInitialized { chain: String, router: Address },

    #[error("Transaction rejected on chain {chain}: {reason}")]
    Rejected { chain: String, reason: String },

    #[error("Router creation {router:?} on chain {chain} was sent but not confirmed: {message}")]
    CreationUnconfirmed {
        chain: String,
        router: Address,
        message: String,
    },

    #[error("Router on chain {chain} is owned by {owner:?}; the operator can no longer enroll")]
    OwnershipHandedOver { chain: String, owner: Address },

    #[error("No chain client configured for {chain}")]
    NoClient { chain: String },

    #[error("Deployment record error: {0}")]
    Store(String),
}

impl DeployError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeployError::ChainUnreachable { .. })
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            DeployError::AlreadyInitialized { .. }
                | DeployError::OwnershipHandedOver { .. }
                | DeployError::Store(_)
        )
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            DeployError::ChainUnreachable { .. } => "chain_unreachable",
            DeployError::AlreadyInitialized { .. } => "already_initialized",
            DeployError::Rejected { .. } => "rejected",
            DeployError::CreationUnconfirmed { .. } => "creation_unconfirmed",
            DeployError::OwnershipHandedOver { .. } => "ownership_handed_over",
            DeployError::NoClient { .. } => "no_client",
            DeployError::Store(_) => "store",
        }
    }
}

/// Rejections of individual router operations. Router state is unchanged
/// whenever one of these is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Router is not initialized")]
    NotInitialized,

    #[error("Router is already initialized")]
    AlreadyInitialized,

    #[error("Deposits are only accepted by the mainnet router")]
    NotMainnetRouter,

    #[error("Insufficient balance: have {have}, need {need}")]
    InsufficientBalance { have: U256, need: U256 },

    #[error("Message from chain {origin_chain_id} with nonce {nonce} was already processed")]
    DuplicateMessage { origin_chain_id: u64, nonce: u64 },

    #[error("No remote router enrolled for domain {domain}")]
    UnknownRouter { domain: u64 },

    #[error("Sender {sender:?} is not the enrolled router for domain {origin_chain_id}")]
    UnauthorizedSender {
        origin_chain_id: u64,
        sender: Address,
    },

    #[error("Message for chain {actual} delivered to chain {expected}")]
    WrongDestination { expected: u64, actual: u64 },

    #[error("Remote transfer to the local chain {chain_id}")]
    LocalDestination { chain_id: u64 },

    #[error("Caller {caller:?} is not the router owner")]
    NotOwner { caller: Address },

    #[error("Supply overflow")]
    SupplyOverflow,

    #[error("No contract at {address:?}")]
    NoContract { address: Address },
}

/// Deployment record persistence errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt record entry for {chain}: {message}")]
    Corrupt { chain: String, message: String },
}

impl From<StoreError> for DeployError {
    fn from(err: StoreError) -> Self {
        DeployError::Store(err.to_string())
    }
}

/// Main error type for the router
#[derive(Error, Debug)]
pub enum RouterError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Chain {chain} not found")]
    UnknownChain { chain: String },
}

impl RouterError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            RouterError::Deploy(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        match self {
            RouterError::Deploy(e) => e.should_alert(),
            RouterError::Store(_) => true,
            _ => false,
        }
    }
}

/// Result type for router operations
pub type RouterResult<T> = Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unreachable_chains_are_retried() {
        let unreachable = DeployError::ChainUnreachable {
            chain: "goerli".into(),
            message: "connection refused".into(),
        };
        let initialized = DeployError::AlreadyInitialized {
            chain: "goerli".into(),
            router: Address::zero(),
        };

        assert!(unreachable.is_retryable());
        assert!(!initialized.is_retryable());
        assert!(initialized.should_alert());
        assert!(RouterError::from(unreachable).is_retryable());
    }

    #[test]
    fn unconfirmed_creation_is_resumed_not_retried() {
        let err = DeployError::CreationUnconfirmed {
            chain: "goerli".into(),
            router: Address::from_low_u64_be(0x51),
            message: "receipt timeout".into(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "creation_unconfirmed");

        let err = DeployError::OwnershipHandedOver {
            chain: "mumbai".into(),
            owner: Address::from_low_u64_be(0xbeef),
        };
        assert!(!err.is_retryable());
        assert!(err.should_alert());
    }

    #[test]
    fn protocol_rejections_are_not_retryable() {
        let err = RouterError::from(ProtocolError::NotMainnetRouter);
        assert!(!err.is_retryable());
        assert!(!err.should_alert());
    }
}
