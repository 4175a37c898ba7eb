//! In-process chain hosting router instances
//!
//! Each call holds the router's map entry for its whole duration, which
//! serializes calls into one contract the way a chain's execution
//! environment does.

use super::ChainClient;
use crate::error::{DeployError, ProtocolError};
use crate::router::{InitializeArgs, RouterInstance};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::Address;
use ethers::utils::get_contract_address;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};

pub struct LocalChain {
    name: String,
    chain_id: u64,
    /// Account that sends deployment transactions
    operator: Address,
    routers: DashMap<Address, RouterInstance>,
    /// Operator account nonce, used for CREATE address derivation
    nonce: AtomicU64,
    reachable: AtomicBool,
    /// Next creation lands but its receipt is lost
    lose_creation_receipt: AtomicBool,
}

impl LocalChain {
    pub fn new(name: impl Into<String>, chain_id: u64, operator: Address) -> Self {
        Self {
            name: name.into(),
            chain_id,
            operator,
            routers: DashMap::new(),
            nonce: AtomicU64::new(0),
            reachable: AtomicBool::new(true),
            lose_creation_receipt: AtomicBool::new(false),
        }
    }

    /// Simulate an RPC outage
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Simulate a creation whose transaction lands but whose receipt never
    /// reaches the caller
    pub fn lose_next_creation_receipt(&self) {
        self.lose_creation_receipt.store(true, Ordering::SeqCst);
    }

    fn ensure_reachable(&self) -> Result<(), DeployError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DeployError::ChainUnreachable {
                chain: self.name.clone(),
                message: "local chain is offline".to_string(),
            })
        }
    }

    /// Execute a state-changing call against a router
    pub async fn call<R>(
        &self,
        router: Address,
        f: impl FnOnce(&mut RouterInstance) -> Result<R, ProtocolError>,
    ) -> Result<R, ProtocolError> {
        let mut instance = self
            .routers
            .get_mut(&router)
            .ok_or(ProtocolError::NoContract { address: router })?;
        f(instance.value_mut())
    }

    /// Read router state
    pub async fn view<R>(
        &self,
        router: Address,
        f: impl FnOnce(&RouterInstance) -> R,
    ) -> Result<R, ProtocolError> {
        let instance = self
            .routers
            .get(&router)
            .ok_or(ProtocolError::NoContract { address: router })?;
        Ok(f(instance.value()))
    }

    pub async fn router_count(&self) -> usize {
        self.routers.len()
    }

    fn protocol_error(&self, router: Address, err: ProtocolError) -> DeployError {
        match err {
            ProtocolError::AlreadyInitialized => DeployError::AlreadyInitialized {
                chain: self.name.clone(),
                router,
            },
            other => DeployError::Rejected {
                chain: self.name.clone(),
                reason: other.to_string(),
            },
        }
    }
}

#[async_trait]
impl ChainClient for LocalChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn operator(&self) -> Address {
        self.operator
    }

    async fn deploy_router(&self) -> Result<Address, DeployError> {
        self.ensure_reachable()?;

        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        let address = get_contract_address(self.operator, nonce);
        self.routers
            .insert(address, RouterInstance::new(self.chain_id, address));

        info!("Chain {}: router created at {:?}", self.name, address);
        if self.lose_creation_receipt.swap(false, Ordering::SeqCst) {
            return Err(DeployError::CreationUnconfirmed {
                chain: self.name.clone(),
                router: address,
                message: "receipt lost".to_string(),
            });
        }
        Ok(address)
    }

    async fn initialize_router(
        &self,
        router: Address,
        args: InitializeArgs,
    ) -> Result<(), DeployError> {
        self.ensure_reachable()?;
        let operator = self.operator;
        self.call(router, |r| r.initialize(operator, args))
            .await
            .map_err(|e| self.protocol_error(router, e))
    }

    async fn enroll_remote_router(
        &self,
        router: Address,
        domain: u64,
        remote: Address,
    ) -> Result<(), DeployError> {
        self.ensure_reachable()?;
        let operator = self.operator;
        self.call(router, |r| r.enroll_remote_router(operator, domain, remote))
            .await
            .map_err(|e| self.protocol_error(router, e))?;
        debug!("Chain {}: enrolled {:?} for domain {}", self.name, remote, domain);
        Ok(())
    }

    async fn transfer_ownership(
        &self,
        router: Address,
        new_owner: Address,
    ) -> Result<(), DeployError> {
        self.ensure_reachable()?;
        let operator = self.operator;
        self.call(router, |r| r.transfer_ownership(operator, new_owner))
            .await
            .map_err(|e| self.protocol_error(router, e))
    }
}
