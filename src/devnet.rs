//! In-process network for local runs and integration tests
//!
//! Every resolved chain becomes a `LocalChain`, routers are deployed onto them
//! with the regular deployer, and transfers flow through an in-memory relay.

use crate::chain::{ChainClient, ChainClients, LocalChain};
use crate::deploy::{DeployPolicy, DeploymentReport, MemoryRecordStore, RouterDeployer};
use crate::error::RouterResult;
use crate::relay::InMemoryRelay;
use crate::resolver::ResolvedDeployment;
use crate::transfer::TransferOrchestrator;

use ethers::types::Address;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

pub struct Devnet {
    pub chains: BTreeMap<String, Arc<LocalChain>>,
    pub relay: Arc<InMemoryRelay>,
    pub orchestrator: Arc<TransferOrchestrator>,
    pub report: DeploymentReport,
}

/// Deploy the resolved router set onto fresh in-process chains.
///
/// `operator` sends the deployment calls and receives the mainnet initial
/// supply. Fails if any chain could not be fully deployed.
pub async fn launch(resolved: &ResolvedDeployment, operator: Address) -> RouterResult<Devnet> {
    let chains: BTreeMap<String, Arc<LocalChain>> = resolved
        .iter()
        .map(|config| {
            (
                config.chain().to_string(),
                Arc::new(LocalChain::new(config.chain(), config.chain_id(), operator)),
            )
        })
        .collect();

    let clients: ChainClients = chains
        .iter()
        .map(|(name, chain)| (name.clone(), chain.clone() as Arc<dyn ChainClient>))
        .collect();

    // Local chains start empty, so the record must too
    let store = Arc::new(MemoryRecordStore::default());
    let report = RouterDeployer::new(clients, store, DeployPolicy::default())
        .deploy(resolved)
        .await?;
    if let Some(err) = report.failed.values().next() {
        return Err(err.clone().into());
    }

    let relay = Arc::new(InMemoryRelay::new());
    let orchestrator = Arc::new(TransferOrchestrator::new(
        &chains,
        &report.record,
        relay.clone(),
    )?);

    info!(
        "Devnet up: {} chains, mainnet {}",
        chains.len(),
        resolved.mainnet().chain()
    );

    Ok(Devnet {
        chains,
        relay,
        orchestrator,
        report,
    })
}
