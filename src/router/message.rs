//! Cross-chain transfer messages

use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

/// A remote transfer emitted by the origin router and consumed by the
/// destination router. Nonces increase per (origin, destination) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMessage {
    pub origin_chain_id: u64,
    /// Router that dispatched the message
    pub origin_router: Address,
    pub destination_chain_id: u64,
    pub recipient: Address,
    pub amount: U256,
    pub nonce: u64,
}

impl TransferMessage {
    /// Keccak-256 over the packed message fields
    pub fn id(&self) -> H256 {
        let mut amount = [0u8; 32];
        self.amount.to_big_endian(&mut amount);

        let mut hasher = Keccak256::new();
        hasher.update(self.origin_chain_id.to_be_bytes());
        hasher.update(self.origin_router.as_bytes());
        hasher.update(self.destination_chain_id.to_be_bytes());
        hasher.update(self.recipient.as_bytes());
        hasher.update(amount);
        hasher.update(self.nonce.to_be_bytes());
        H256::from_slice(&hasher.finalize())
    }

    pub fn key(&self) -> MessageKey {
        MessageKey {
            origin_chain_id: self.origin_chain_id,
            nonce: self.nonce,
        }
    }

    /// The (origin, destination) lane this message travels on
    pub fn lane(&self) -> (u64, u64) {
        (self.origin_chain_id, self.destination_chain_id)
    }
}

/// Replay-protection key of a message at its destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MessageKey {
    pub origin_chain_id: u64,
    pub nonce: u64,
}
