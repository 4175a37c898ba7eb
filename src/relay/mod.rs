//! Relay module - carries remote transfer messages between routers
//!
//! This module provides:
//! - The `RelayService` seam the transfer orchestrator submits messages to
//! - An in-memory relay with ordered, gap-free delivery per lane
//! - A background worker that drains the relay on an interval

mod memory;
mod worker;

pub use memory::InMemoryRelay;
pub use worker::RelayWorker;

use crate::error::{ProtocolError, RouterResult};
use crate::router::TransferMessage;

use async_trait::async_trait;
use serde::Serialize;

/// Destination side of the relay: applies one message to its router
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &TransferMessage) -> Result<(), ProtocolError>;
}

/// Message transport between routers.
///
/// Delivery is at-least-once. Handlers reject repeats with
/// `ProtocolError::DuplicateMessage`, which the relay treats as an ack.
#[async_trait]
pub trait RelayService: Send + Sync {
    /// Queue a message emitted by an origin router
    async fn submit(&self, message: TransferMessage) -> RouterResult<()>;

    /// Deliver everything deliverable right now
    async fn deliver_pending(&self, handler: &dyn MessageHandler) -> DeliveryStats;

    /// Messages queued and not yet acknowledged
    async fn pending(&self) -> usize;
}

/// Result of one delivery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    /// Messages applied by their destination
    pub delivered: usize,
    /// Repeats acknowledged without effect
    pub duplicates: usize,
    /// Rejected copies of nonces the lane had already acknowledged, dropped
    pub rejected: usize,
    /// Lanes that stopped on a gap or a rejected message
    pub blocked: usize,
}

impl DeliveryStats {
    pub fn is_idle(&self) -> bool {
        self.delivered == 0 && self.duplicates == 0 && self.rejected == 0
    }
}
