//! Transfer orchestration across deployed routers
//!
//! A remote transfer is a two-phase exchange. The origin router debits and
//! burns at once, and the message it emits is handed to the relay. The
//! destination router mints when the relay delivers, which may be much later.
//! Nothing rolls phase one back; undelivered value shows up as in flight.

use crate::chain::{ChainClient, LocalChain};
use crate::deploy::DeploymentRecord;
use crate::error::{ProtocolError, RouterError, RouterResult};
use crate::relay::{DeliveryStats, MessageHandler, RelayService};
use crate::resolver::RouterRole;
use crate::router::{RouterSummary, TransferMessage};

use async_trait::async_trait;
use ethers::types::{Address, U256};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// A chain and the router deployed on it
#[derive(Clone)]
struct Endpoint {
    chain: Arc<LocalChain>,
    router: Address,
}

/// Supply figures for one chain
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainSupply {
    pub chain_id: u64,
    pub router: Address,
    pub role: RouterRole,
    pub total_local_supply: U256,
    pub total_deposited: U256,
    /// Sum of account balances; equals the local supply on a healthy router
    pub total_balances: U256,
}

/// Global supply accounting across all routers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupplyReport {
    pub chains: BTreeMap<String, ChainSupply>,
    /// Initial supply plus every deposit
    pub total_minted: U256,
    /// Sum of local supplies
    pub circulating: U256,
    /// Burned on an origin, not yet minted on the destination
    pub in_flight: U256,
    pub in_flight_messages: usize,
    pub conserved: bool,
}

/// Drives deposits, local transfers and remote transfers against deployed
/// routers, and feeds relayed messages back into destination routers.
pub struct TransferOrchestrator {
    endpoints: BTreeMap<String, Endpoint>,
    relay: Arc<dyn RelayService>,
}

impl TransferOrchestrator {
    /// Bind every router in `record` to its chain
    pub fn new(
        chains: &BTreeMap<String, Arc<LocalChain>>,
        record: &DeploymentRecord,
        relay: Arc<dyn RelayService>,
    ) -> RouterResult<Self> {
        let mut endpoints = BTreeMap::new();
        for (name, entry) in &record.routers {
            let chain = chains.get(name).ok_or_else(|| RouterError::UnknownChain {
                chain: name.clone(),
            })?;
            endpoints.insert(
                name.clone(),
                Endpoint {
                    chain: chain.clone(),
                    router: entry.address,
                },
            );
        }
        Ok(Self { endpoints, relay })
    }

    fn endpoint(&self, chain: &str) -> RouterResult<&Endpoint> {
        self.endpoints.get(chain).ok_or_else(|| RouterError::UnknownChain {
            chain: chain.to_string(),
        })
    }

    fn endpoint_by_id(&self, chain_id: u64) -> Option<&Endpoint> {
        self.endpoints
            .values()
            .find(|e| e.chain.chain_id() == chain_id)
    }

    pub fn chains(&self) -> Vec<&str> {
        self.endpoints.keys().map(String::as_str).collect()
    }

    /// Mint against a native deposit on the mainnet router. Returns the new balance.
    pub async fn deposit(&self, chain: &str, account: Address, amount: U256) -> RouterResult<U256> {
        let endpoint = self.endpoint(chain)?;
        let balance = endpoint
            .chain
            .call(endpoint.router, |r| {
                r.deposit(account, amount)?;
                r.balance_of(account)
            })
            .await?;

        crate::metrics::record_deposit(chain);
        info!(chain, account = ?account, %amount, "Deposit accepted");
        Ok(balance)
    }

    pub async fn transfer(
        &self,
        chain: &str,
        from: Address,
        to: Address,
        amount: U256,
    ) -> RouterResult<()> {
        let endpoint = self.endpoint(chain)?;
        endpoint
            .chain
            .call(endpoint.router, |r| r.transfer(from, to, amount))
            .await?;
        Ok(())
    }

    /// Phase one of a remote transfer: debit on `origin` and hand the message
    /// to the relay. The debit stands even if the relay refuses the message;
    /// `resubmit_in_flight` can hand it over again.
    pub async fn transfer_remote(
        &self,
        origin: &str,
        sender: Address,
        destination: &str,
        recipient: Address,
        amount: U256,
    ) -> RouterResult<TransferMessage> {
        let from = self.endpoint(origin)?;
        let destination_chain_id = self.endpoint(destination)?.chain.chain_id();

        let message = from
            .chain
            .call(from.router, |r| {
                r.send_remote(sender, destination_chain_id, recipient, amount)
            })
            .await?;
        crate::metrics::record_message_dispatched(message.origin_chain_id, destination_chain_id);

        self.relay.submit(message.clone()).await?;
        Ok(message)
    }

    pub async fn balance_of(&self, chain: &str, account: Address) -> RouterResult<U256> {
        let endpoint = self.endpoint(chain)?;
        Ok(endpoint
            .chain
            .view(endpoint.router, |r| r.balance_of(account))
            .await??)
    }

    pub async fn total_local_supply(&self, chain: &str) -> RouterResult<U256> {
        let endpoint = self.endpoint(chain)?;
        Ok(endpoint
            .chain
            .view(endpoint.router, |r| r.total_local_supply())
            .await??)
    }

    /// Deliver everything the relay can deliver right now
    pub async fn process_messages(&self) -> DeliveryStats {
        self.relay.deliver_pending(self).await
    }

    /// Router summaries by chain name
    pub async fn routers(&self) -> RouterResult<BTreeMap<String, RouterSummary>> {
        let mut routers = BTreeMap::new();
        for (name, endpoint) in &self.endpoints {
            let summary = endpoint.chain.view(endpoint.router, |r| r.summary()).await?;
            routers.insert(name.clone(), summary);
        }
        Ok(routers)
    }

    /// Messages in any router's outbox and not yet processed by their destination
    pub async fn in_flight(&self) -> RouterResult<Vec<TransferMessage>> {
        let mut pending = Vec::new();
        for endpoint in self.endpoints.values() {
            let outbox = endpoint
                .chain
                .view(endpoint.router, |r| r.outbox())
                .await??;

            for message in outbox {
                let processed = match self.endpoint_by_id(message.destination_chain_id) {
                    Some(dest) => {
                        let key = message.key();
                        dest.chain
                            .view(dest.router, |r| r.is_processed(&key))
                            .await?
                    }
                    None => false,
                };
                if !processed {
                    pending.push(message);
                }
            }
        }
        Ok(pending)
    }

    /// Hand every in-flight message to the relay again. Destinations drop
    /// the ones they already hold, so this is safe to repeat.
    pub async fn resubmit_in_flight(&self) -> RouterResult<usize> {
        let messages = self.in_flight().await?;
        let count = messages.len();
        for message in messages {
            self.relay.submit(message).await?;
        }
        if count > 0 {
            warn!("Resubmitted {} in-flight messages", count);
        }
        Ok(count)
    }

    pub async fn supply_report(&self) -> RouterResult<SupplyReport> {
        let mut chains = BTreeMap::new();
        let mut total_minted = U256::zero();
        let mut circulating = U256::zero();
        let mut balanced = true;

        for (name, endpoint) in &self.endpoints {
            let (supply, initial) = endpoint
                .chain
                .view(endpoint.router, |r| -> Result<_, ProtocolError> {
                    let supply = ChainSupply {
                        chain_id: r.chain_id(),
                        router: r.address(),
                        role: r.role()?,
                        total_local_supply: r.total_local_supply()?,
                        total_deposited: r.total_deposited()?,
                        total_balances: r.total_balances()?,
                    };
                    Ok((supply, r.initial_supply()?))
                })
                .await??;

            total_minted = checked_sum(&[total_minted, initial, supply.total_deposited])?;
            circulating = checked_sum(&[circulating, supply.total_local_supply])?;
            balanced &= supply.total_balances == supply.total_local_supply;
            chains.insert(name.clone(), supply);
        }

        let messages = self.in_flight().await?;
        let mut in_flight = U256::zero();
        for message in &messages {
            in_flight = checked_sum(&[in_flight, message.amount])?;
        }

        let conserved = balanced && checked_sum(&[circulating, in_flight])? == total_minted;
        if !conserved {
            warn!(%total_minted, %circulating, %in_flight, "Supply not conserved");
        }

        Ok(SupplyReport {
            chains,
            total_minted,
            circulating,
            in_flight,
            in_flight_messages: messages.len(),
            conserved,
        })
    }
}

fn checked_sum(values: &[U256]) -> Result<U256, ProtocolError> {
    values.iter().try_fold(U256::zero(), |acc, v| {
        acc.checked_add(*v).ok_or(ProtocolError::SupplyOverflow)
    })
}

/// Phase two: apply a relayed message on its destination router
#[async_trait]
impl MessageHandler for TransferOrchestrator {
    async fn handle(&self, message: &TransferMessage) -> Result<(), ProtocolError> {
        let endpoint = self
            .endpoint_by_id(message.destination_chain_id)
            .ok_or(ProtocolError::UnknownRouter {
                domain: message.destination_chain_id,
            })?;
        let result = endpoint
            .chain
            .call(endpoint.router, |r| r.receive_remote(message))
            .await;

        // A repeat means an earlier copy landed, so it acknowledges as well
        if matches!(result, Ok(()) | Err(ProtocolError::DuplicateMessage { .. })) {
            self.acknowledge(message).await;
        }
        result
    }
}

impl TransferOrchestrator {
    /// Remove a delivered message from its origin router's outbox
    async fn acknowledge(&self, message: &TransferMessage) {
        let Some(origin) = self.endpoint_by_id(message.origin_chain_id) else {
            return;
        };
        let acked = origin
            .chain
            .call(origin.router, |r| {
                r.acknowledge_delivery(message.destination_chain_id, message.nonce)
            })
            .await;
        if let Err(e) = acked {
            warn!(
                origin = message.origin_chain_id,
                nonce = message.nonce,
                "Delivery acknowledgement failed: {}",
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devnet::{self, Devnet};
    use crate::resolver::tests::two_chains;
    use crate::resolver::{ChainConfigResolver, TokenDefinition};

    const MAINNET: &str = "mumbai";
    const SECONDARY: &str = "goerli";

    async fn devnet(initial_supply: u64) -> Devnet {
        let token = TokenDefinition::new("Faucetful", "FCT", U256::from(initial_supply)).unwrap();
        let (connections, core) = two_chains();
        let operator = Address::from_low_u64_be(0xaa);
        let resolved = ChainConfigResolver::new(&token, &connections, &core, operator)
            .resolve(&[MAINNET.to_string()])
            .unwrap();
        devnet::launch(&resolved, operator).await.unwrap()
    }

    fn account(n: u64) -> Address {
        Address::from_low_u64_be(0x1000 + n)
    }

    #[tokio::test]
    async fn deposit_only_on_mainnet() {
        let net = devnet(0).await;
        let orchestrator = &net.orchestrator;
        let depositor = account(1);

        let balance = orchestrator
            .deposit(MAINNET, depositor, U256::from(37))
            .await
            .unwrap();
        assert_eq!(balance, U256::from(37));
        assert_eq!(
            orchestrator.total_local_supply(MAINNET).await.unwrap(),
            U256::from(37)
        );

        let err = orchestrator
            .deposit(SECONDARY, depositor, U256::from(37))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RouterError::Protocol(ProtocolError::NotMainnetRouter)
        ));
        assert_eq!(
            orchestrator.total_local_supply(SECONDARY).await.unwrap(),
            U256::zero()
        );
        assert_eq!(
            orchestrator.balance_of(SECONDARY, depositor).await.unwrap(),
            U256::zero()
        );
    }

    #[tokio::test]
    async fn remote_transfer_is_two_phase() {
        let net = devnet(0).await;
        let orchestrator = &net.orchestrator;
        let depositor = account(1);
        let recipient = account(2);

        orchestrator
            .deposit(MAINNET, depositor, U256::from(37))
            .await
            .unwrap();
        let message = orchestrator
            .transfer_remote(MAINNET, depositor, SECONDARY, recipient, U256::from(12))
            .await
            .unwrap();
        assert_eq!(message.nonce, 0);
        assert_eq!(message.destination_chain_id, 5);

        // Phase one only
        assert_eq!(
            orchestrator.balance_of(MAINNET, depositor).await.unwrap(),
            U256::from(25)
        );
        assert_eq!(
            orchestrator.balance_of(SECONDARY, recipient).await.unwrap(),
            U256::zero()
        );
        let report = orchestrator.supply_report().await.unwrap();
        assert_eq!(report.in_flight, U256::from(12));
        assert_eq!(report.in_flight_messages, 1);
        assert!(report.conserved);

        let stats = orchestrator.process_messages().await;
        assert_eq!(stats.delivered, 1);

        assert_eq!(
            orchestrator.balance_of(SECONDARY, recipient).await.unwrap(),
            U256::from(12)
        );
        let report = orchestrator.supply_report().await.unwrap();
        assert_eq!(report.circulating, U256::from(37));
        assert_eq!(report.total_minted, U256::from(37));
        assert_eq!(report.in_flight, U256::zero());
        assert!(report.conserved);
    }

    #[tokio::test]
    async fn redelivered_message_credits_once() {
        let net = devnet(0).await;
        let orchestrator = &net.orchestrator;
        let recipient = account(2);

        orchestrator
            .deposit(MAINNET, account(1), U256::from(10))
            .await
            .unwrap();
        let message = orchestrator
            .transfer_remote(MAINNET, account(1), SECONDARY, recipient, U256::from(4))
            .await
            .unwrap();
        orchestrator.process_messages().await;

        net.relay.submit(message).await.unwrap();
        let stats = orchestrator.process_messages().await;
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.delivered, 0);

        assert_eq!(
            orchestrator.balance_of(SECONDARY, recipient).await.unwrap(),
            U256::from(4)
        );
        assert_eq!(orchestrator.resubmit_in_flight().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn supply_is_conserved_across_a_mixed_sequence() {
        let net = devnet(1_000).await;
        let orchestrator = &net.orchestrator;
        let operator = Address::from_low_u64_be(0xaa);
        let (a, b, c) = (account(1), account(2), account(3));

        orchestrator.deposit(MAINNET, a, U256::from(50)).await.unwrap();
        orchestrator.transfer(MAINNET, operator, b, U256::from(300)).await.unwrap();
        orchestrator
            .transfer_remote(MAINNET, b, SECONDARY, c, U256::from(120))
            .await
            .unwrap();
        orchestrator
            .transfer_remote(MAINNET, a, SECONDARY, a, U256::from(50))
            .await
            .unwrap();
        orchestrator.process_messages().await;

        orchestrator.transfer(SECONDARY, c, a, U256::from(20)).await.unwrap();
        orchestrator
            .transfer_remote(SECONDARY, a, MAINNET, b, U256::from(60))
            .await
            .unwrap();

        let report = orchestrator.supply_report().await.unwrap();
        assert_eq!(report.total_minted, U256::from(1_050));
        assert_eq!(report.in_flight, U256::from(60));
        assert!(report.conserved);

        orchestrator.process_messages().await;
        let report = orchestrator.supply_report().await.unwrap();
        assert_eq!(report.in_flight, U256::zero());
        assert_eq!(report.circulating, U256::from(1_050));
        assert_eq!(report.chains[SECONDARY].total_local_supply, U256::from(110));
        assert!(report.conserved);
    }

    #[tokio::test]
    async fn failed_send_changes_nothing() {
        let net = devnet(0).await;
        let orchestrator = &net.orchestrator;

        orchestrator.deposit(MAINNET, account(1), U256::from(5)).await.unwrap();
        let err = orchestrator
            .transfer_remote(MAINNET, account(1), SECONDARY, account(2), U256::from(6))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RouterError::Protocol(ProtocolError::InsufficientBalance { .. })
        ));

        let err = orchestrator
            .transfer_remote(MAINNET, account(1), MAINNET, account(2), U256::from(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RouterError::Protocol(ProtocolError::LocalDestination { .. })
        ));

        assert_eq!(
            orchestrator.balance_of(MAINNET, account(1)).await.unwrap(),
            U256::from(5)
        );
        assert_eq!(net.relay.pending().await, 0);
        assert!(matches!(
            orchestrator.balance_of("fuji", account(1)).await,
            Err(RouterError::UnknownChain { .. })
        ));
    }

    #[derive(Debug, Clone, Copy)]
    enum Step {
        /// account, amount
        Deposit(u64, u64),
        /// chain, from, to, amount
        Transfer(&'static str, u64, u64, u64),
        /// Remote transfer to the other chain: origin, from, to, amount
        Remote(&'static str, u64, u64, u64),
        Deliver,
        /// Hand the last sent message to the relay again
        ReplayLast,
        Resubmit,
    }

    /// Account 0 is the operator, which holds the initial supply
    fn who(n: u64) -> Address {
        if n == 0 {
            Address::from_low_u64_be(0xaa)
        } else {
            account(n)
        }
    }

    #[tokio::test]
    async fn supply_is_conserved_after_every_step() {
        use Step::*;

        // (name, steps, [in_flight, circulating, total_minted] at the end)
        let cases: Vec<(&str, Vec<Step>, [u64; 3])> = vec![
            (
                "round trip through the secondary",
                vec![
                    Deposit(1, 50),
                    Remote(MAINNET, 1, 2, 20),
                    Deliver,
                    Remote(SECONDARY, 2, 3, 15),
                    Deliver,
                    Transfer(MAINNET, 3, 1, 15),
                ],
                [0, 150, 150],
            ),
            (
                "replays and resubmits",
                vec![
                    Deposit(1, 30),
                    Remote(MAINNET, 1, 2, 10),
                    ReplayLast,
                    Deliver,
                    ReplayLast,
                    Deliver,
                    Resubmit,
                    Remote(SECONDARY, 2, 1, 10),
                    Resubmit,
                    ReplayLast,
                    Deliver,
                ],
                [0, 130, 130],
            ),
            (
                "undelivered sends stay in flight",
                vec![
                    Transfer(MAINNET, 0, 1, 40),
                    Remote(MAINNET, 1, 2, 25),
                    Remote(MAINNET, 1, 3, 5),
                    Deliver,
                    Remote(SECONDARY, 2, 4, 25),
                ],
                [25, 75, 100],
            ),
        ];

        for (name, steps, [in_flight, circulating, minted]) in cases {
            let net = devnet(100).await;
            let orchestrator = &net.orchestrator;
            let mut last = None;

            for (i, step) in steps.iter().enumerate() {
                match *step {
                    Deposit(account, amount) => {
                        orchestrator
                            .deposit(MAINNET, who(account), U256::from(amount))
                            .await
                            .unwrap();
                    }
                    Transfer(chain, from, to, amount) => orchestrator
                        .transfer(chain, who(from), who(to), U256::from(amount))
                        .await
                        .unwrap(),
                    Remote(origin, from, to, amount) => {
                        let destination = if origin == MAINNET { SECONDARY } else { MAINNET };
                        let message = orchestrator
                            .transfer_remote(origin, who(from), destination, who(to), amount.into())
                            .await
                            .unwrap();
                        last = Some(message);
                    }
                    Deliver => {
                        orchestrator.process_messages().await;
                    }
                    ReplayLast => {
                        let message = last.clone().expect("a message was sent");
                        net.relay.submit(message).await.unwrap();
                    }
                    Resubmit => {
                        orchestrator.resubmit_in_flight().await.unwrap();
                    }
                }

                let report = orchestrator.supply_report().await.unwrap();
                assert!(report.conserved, "{name}: step {i} {step:?}: {report:?}");
                let outboxes: usize = orchestrator
                    .routers()
                    .await
                    .unwrap()
                    .values()
                    .map(|r| r.outbox)
                    .sum();
                assert_eq!(outboxes, report.in_flight_messages, "{name}: step {i}");
            }

            let report = orchestrator.supply_report().await.unwrap();
            assert_eq!(report.in_flight, U256::from(in_flight), "{name}");
            assert_eq!(report.circulating, U256::from(circulating), "{name}");
            assert_eq!(report.total_minted, U256::from(minted), "{name}");
        }
    }
}
