//! In-memory relay

use super::{DeliveryStats, MessageHandler, RelayService};
use crate::error::{ProtocolError, RouterResult};
use crate::router::TransferMessage;

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Messages of one (origin, destination) lane
#[derive(Debug, Default)]
struct Lane {
    /// Lowest nonce not yet acknowledged by the destination
    next_nonce: u64,
    /// Queued messages by nonce; repeats of one nonce stack up
    queued: BTreeMap<u64, VecDeque<TransferMessage>>,
}

impl Lane {
    fn len(&self) -> usize {
        self.queued.values().map(VecDeque::len).sum()
    }

    fn pop(&mut self, nonce: u64) -> Option<TransferMessage> {
        let slot = self.queued.get_mut(&nonce)?;
        let message = slot.pop_front();
        if slot.is_empty() {
            self.queued.remove(&nonce);
        }
        message
    }

    fn push_front(&mut self, message: TransferMessage) {
        self.queued
            .entry(message.nonce)
            .or_default()
            .push_front(message);
    }
}

/// Relay that keeps queued messages in process memory.
///
/// Within a lane, messages are delivered in nonce order and never past a gap.
/// Lanes are independent.
#[derive(Debug, Default)]
pub struct InMemoryRelay {
    lanes: Mutex<BTreeMap<(u64, u64), Lane>>,
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RelayService for InMemoryRelay {
    async fn submit(&self, message: TransferMessage) -> RouterResult<()> {
        let mut lanes = self.lanes.lock().await;
        debug!(
            origin = message.origin_chain_id,
            destination = message.destination_chain_id,
            nonce = message.nonce,
            "Message queued"
        );
        lanes
            .entry(message.lane())
            .or_default()
            .queued
            .entry(message.nonce)
            .or_default()
            .push_back(message);

        crate::metrics::set_relay_queue_depth(lanes.values().map(Lane::len).sum());
        Ok(())
    }

    async fn deliver_pending(&self, handler: &dyn MessageHandler) -> DeliveryStats {
        let mut lanes = self.lanes.lock().await;
        let mut stats = DeliveryStats::default();

        for (&(origin, destination), lane) in lanes.iter_mut() {
            while let Some(&nonce) = lane.queued.keys().next() {
                if nonce > lane.next_nonce {
                    debug!(
                        origin,
                        destination,
                        nonce,
                        expected = lane.next_nonce,
                        "Lane waiting on gap"
                    );
                    stats.blocked += 1;
                    break;
                }
                let Some(message) = lane.pop(nonce) else {
                    continue;
                };

                match handler.handle(&message).await {
                    Ok(()) => {
                        stats.delivered += 1;
                        crate::metrics::record_message_delivered(origin, destination);
                    }
                    Err(ProtocolError::DuplicateMessage { .. }) => {
                        warn!(origin, destination, nonce, "Duplicate delivery acknowledged");
                        stats.duplicates += 1;
                        crate::metrics::record_duplicate_message(origin, destination);
                    }
                    // The lane is already past this nonce, so holding the copy
                    // back would stall every later message behind it
                    Err(e) if nonce < lane.next_nonce => {
                        warn!(origin, destination, nonce, "Stale delivery dropped: {}", e);
                        stats.rejected += 1;
                        crate::metrics::record_message_rejected(origin, destination);
                    }
                    Err(e) => {
                        error!(origin, destination, nonce, "Delivery rejected: {}", e);
                        lane.push_front(message);
                        stats.blocked += 1;
                        break;
                    }
                }
                lane.next_nonce = lane.next_nonce.max(nonce + 1);
            }
        }

        lanes.retain(|_, lane| !lane.queued.is_empty() || lane.next_nonce > 0);
        crate::metrics::set_relay_queue_depth(lanes.values().map(Lane::len).sum());
        stats
    }

    async fn pending(&self) -> usize {
        self.lanes.lock().await.values().map(Lane::len).sum()
    }
}
