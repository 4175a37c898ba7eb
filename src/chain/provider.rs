//! Ethers-backed chain client with multi-RPC failover

use super::gas::build_transaction;
use super::ChainClient;
use crate::config::ChainConnectionParams;
use crate::error::DeployError;
use crate::router::InitializeArgs;

use async_trait::async_trait;
use ethers::abi::{encode, Token};
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::{get_contract_address, id};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

type SignerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

const INITIALIZE_SIGNATURE: &str = "initialize(address,address,uint256,string,string,bool)";
const ENROLL_SIGNATURE: &str = "enrollRemoteRouter(uint32,bytes32)";
const TRANSFER_OWNERSHIP_SIGNATURE: &str = "transferOwnership(address)";

/// Chain client that deploys routers to an EVM chain over JSON-RPC
pub struct EthersChainClient {
    /// Chain name from configuration
    name: String,
    /// Connection parameters
    params: ChainConnectionParams,
    /// Signing clients, one per RPC URL
    clients: Vec<SignerClient>,
    /// Current active client index
    current: AtomicUsize,
    /// Router creation bytecode
    bytecode: Bytes,
}

impl EthersChainClient {
    /// Create a client for one chain
    pub fn new(
        name: impl Into<String>,
        params: ChainConnectionParams,
        wallet: LocalWallet,
        bytecode: Bytes,
    ) -> Result<Self, DeployError> {
        let name = name.into();
        let wallet = wallet.with_chain_id(params.chain_id);
        let mut clients = Vec::new();

        for url in &params.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(500));
                    clients.push(SignerMiddleware::new(provider, wallet.clone()));
                    debug!("Added HTTP provider for chain {}: {}", name, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if clients.is_empty() {
            return Err(DeployError::ChainUnreachable {
                chain: name,
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            name,
            params,
            clients,
            current: AtomicUsize::new(0),
            bytecode,
        })
    }

    /// Get the active client
    fn client(&self) -> &SignerClient {
        let idx = self.current.load(Ordering::Relaxed);
        &self.clients[idx % self.clients.len()]
    }

    /// Switch to next available provider
    fn failover(&self) {
        let current = self.current.load(Ordering::Relaxed);
        let next = (current + 1) % self.clients.len();
        self.current.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.name, next);
    }

    /// Send a transaction and wait for the configured confirmations
    async fn send(
        &self,
        tx: TypedTransaction,
        what: &str,
    ) -> Result<TransactionReceipt, DeployError> {
        let tx_hash = self.submit(tx, what).await?;
        self.confirm(tx_hash, what).await
    }

    /// Broadcast a transaction. Unreachable providers are rotated before the
    /// error is returned.
    async fn submit(&self, tx: TypedTransaction, what: &str) -> Result<TxHash, DeployError> {
        let mut last_error = None;

        for _ in 0..self.clients.len() {
            match self.client().send_transaction(tx.clone(), None).await {
                Ok(pending) => {
                    let tx_hash = pending.tx_hash();
                    info!("Chain {}: {} sent in {:?}", self.name, what, tx_hash);
                    return Ok(tx_hash);
                }
                Err(e) => {
                    let err = classify_rpc_error(&self.name, &e.to_string());
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    self.failover();
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| DeployError::ChainUnreachable {
            chain: self.name.clone(),
            message: "All providers failed".to_string(),
        }))
    }

    /// Wait for a broadcast transaction to reach the configured confirmations
    async fn confirm(
        &self,
        tx_hash: TxHash,
        what: &str,
    ) -> Result<TransactionReceipt, DeployError> {
        let receipt = PendingTransaction::new(tx_hash, self.client().provider())
            .confirmations(self.params.confirmations as usize)
            .await
            .map_err(|e| DeployError::ChainUnreachable {
                chain: self.name.clone(),
                message: e.to_string(),
            })?
            .ok_or_else(|| DeployError::ChainUnreachable {
                chain: self.name.clone(),
                message: format!("{} {:?} dropped from mempool", what, tx_hash),
            })?;

        if receipt.status == Some(U64::zero()) {
            return Err(DeployError::Rejected {
                chain: self.name.clone(),
                reason: format!("{} {:?} reverted", what, tx_hash),
            });
        }
        Ok(receipt)
    }

    /// Simulate a call so reverts surface before gas is spent
    async fn simulate(&self, tx: &TypedTransaction) -> Result<(), DeployError> {
        self.client()
            .call(tx, None)
            .await
            .map(|_| ())
            .map_err(|e| classify_rpc_error(&self.name, &e.to_string()))
    }

    fn call_tx(&self, router: Address, data: Vec<u8>) -> TypedTransaction {
        build_transaction(
            Some(router),
            Bytes::from(data),
            self.params.fee_overrides.as_ref(),
        )
    }
}

#[async_trait]
impl ChainClient for EthersChainClient {
    fn chain_id(&self) -> u64 {
        self.params.chain_id
    }

    fn operator(&self) -> Address {
        self.client().address()
    }

    async fn deploy_router(&self) -> Result<Address, DeployError> {
        // Pin the nonce so the router address is known before anything is sent
        let operator = self.operator();
        let nonce = self
            .client()
            .get_transaction_count(operator, Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| classify_rpc_error(&self.name, &e.to_string()))?;
        let router = get_contract_address(operator, nonce);

        let mut tx = build_transaction(
            None,
            self.bytecode.clone(),
            self.params.fee_overrides.as_ref(),
        );
        tx.set_nonce(nonce);

        let tx_hash = self.submit(tx, "router creation").await?;
        match self.confirm(tx_hash, "router creation").await {
            Ok(receipt) => Ok(receipt.contract_address.unwrap_or(router)),
            Err(DeployError::ChainUnreachable { message, .. }) => {
                Err(DeployError::CreationUnconfirmed {
                    chain: self.name.clone(),
                    router,
                    message,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn initialize_router(
        &self,
        router: Address,
        args: InitializeArgs,
    ) -> Result<(), DeployError> {
        // A creation that is still in flight leaves no code yet, and a call
        // to an empty account succeeds without doing anything
        let code = self
            .client()
            .get_code(router, None)
            .await
            .map_err(|e| classify_rpc_error(&self.name, &e.to_string()))?;
        if code.is_empty() {
            return Err(DeployError::ChainUnreachable {
                chain: self.name.clone(),
                message: format!("router {:?} has no code yet", router),
            });
        }

        let tx = self.call_tx(router, initialize_calldata(&args));
        self.simulate(&tx).await.map_err(|e| match e {
            DeployError::AlreadyInitialized { chain, .. } => {
                DeployError::AlreadyInitialized { chain, router }
            }
            other => other,
        })?;
        self.send(tx, "initialize").await?;
        Ok(())
    }

    async fn enroll_remote_router(
        &self,
        router: Address,
        domain: u64,
        remote: Address,
    ) -> Result<(), DeployError> {
        let domain = u32::try_from(domain).map_err(|_| DeployError::Rejected {
            chain: self.name.clone(),
            reason: format!("domain {} does not fit in uint32", domain),
        })?;
        let tx = self.call_tx(router, enroll_calldata(domain, remote));
        self.send(tx, "enrollRemoteRouter").await?;
        Ok(())
    }

    async fn transfer_ownership(
        &self,
        router: Address,
        new_owner: Address,
    ) -> Result<(), DeployError> {
        let mut data = id(TRANSFER_OWNERSHIP_SIGNATURE).to_vec();
        data.extend(encode(&[Token::Address(new_owner)]));
        let tx = self.call_tx(router, data);
        self.send(tx, "transferOwnership").await?;
        Ok(())
    }
}

/// ABI-encoded initializer call
pub fn initialize_calldata(args: &InitializeArgs) -> Vec<u8> {
    let mut data = id(INITIALIZE_SIGNATURE).to_vec();
    data.extend(encode(&[
        Token::Address(args.connection_manager),
        Token::Address(args.gas_paymaster),
        Token::Uint(args.initial_supply),
        Token::String(args.name.clone()),
        Token::String(args.symbol.clone()),
        Token::Bool(args.is_mainnet_router()),
    ]));
    data
}

/// ABI-encoded remote router enrollment; the router address is left-padded to bytes32
pub fn enroll_calldata(domain: u32, remote: Address) -> Vec<u8> {
    let mut data = id(ENROLL_SIGNATURE).to_vec();
    data.extend(encode(&[
        Token::Uint(U256::from(domain)),
        Token::FixedBytes(H256::from(remote).as_bytes().to_vec()),
    ]));
    data
}

/// Map an RPC error message onto the deployment error taxonomy
pub fn classify_rpc_error(chain: &str, message: &str) -> DeployError {
    let lower = message.to_lowercase();
    if lower.contains("already initialized") {
        DeployError::AlreadyInitialized {
            chain: chain.to_string(),
            router: Address::zero(),
        }
    } else if lower.contains("execution reverted")
        || lower.contains("insufficient funds")
        || lower.contains("nonce too low")
        || lower.contains("invalid sender")
    {
        DeployError::Rejected {
            chain: chain.to_string(),
            reason: message.to_string(),
        }
    } else {
        DeployError::ChainUnreachable {
            chain: chain.to_string(),
            message: message.to_string(),
        }
    }
}

/// Load router creation bytecode from a compiled artifact (`{"bytecode": "0x..."}`)
pub fn load_bytecode(artifact: &serde_json::Value) -> anyhow::Result<Bytes> {
    let code = artifact
        .get("bytecode")
        .and_then(|b| b.as_str().or_else(|| b.get("object").and_then(|o| o.as_str())))
        .ok_or_else(|| anyhow::anyhow!("artifact has no bytecode field"))?;
    let raw = hex::decode(code.trim_start_matches("0x"))?;
    if raw.is_empty() {
        anyhow::bail!("artifact bytecode is empty");
    }
    Ok(Bytes::from(raw))
}
