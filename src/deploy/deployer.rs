//! Router deployment across the resolved chain set

use super::record::{DeploymentRecord, RecordStore};
use crate::chain::{ChainClient, ChainClients};
use crate::config::DeploymentConfig;
use crate::error::DeployError;
use crate::resolver::{ChainRouterConfig, ResolvedDeployment};
use crate::router::InitializeArgs;

use ethers::types::Address;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Retry behaviour for transient chain failures
#[derive(Debug, Clone)]
pub struct DeployPolicy {
    /// Attempts per step, including the first
    pub max_retries: u32,
    /// Delay before the first retry; doubled on every further retry
    pub retry_delay: Duration,
}

impl DeployPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(6);
        self.retry_delay.saturating_mul(1u32 << exp)
    }
}

impl Default for DeployPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

impl From<&DeploymentConfig> for DeployPolicy {
    fn from(config: &DeploymentConfig) -> Self {
        Self {
            max_retries: config.max_retries.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }
}

/// Outcome of one deployment run
#[derive(Debug, Clone)]
pub struct DeploymentReport {
    pub run_id: Uuid,
    /// Chains that got a new router in this run
    pub deployed: BTreeMap<String, Address>,
    /// Chains already present in the record
    pub skipped: BTreeSet<String>,
    /// Chains whose deployment, enrollment or ownership transfer failed
    pub failed: BTreeMap<String, DeployError>,
    /// Record as persisted at the end of the run
    pub record: DeploymentRecord,
}

impl DeploymentReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// One `enrollRemoteRouter` call: on `router`, enroll `remote` for `domain`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Enrollment {
    router: Address,
    domain: u64,
    remote: Address,
}

/// Enrollments the record does not show as done, by the chain that makes them.
/// Only pairs of resolved chains are connected.
fn enrollment_plan(
    resolved: &ResolvedDeployment,
    record: &DeploymentRecord,
) -> BTreeMap<String, Vec<Enrollment>> {
    let mut plan: BTreeMap<String, Vec<Enrollment>> = BTreeMap::new();
    for (chain, entry) in &record.routers {
        if resolved.get(chain).is_none() {
            continue;
        }
        for (other, remote) in &record.routers {
            if chain == other
                || resolved.get(other).is_none()
                || entry.enrolled.contains(&remote.chain_id)
            {
                continue;
            }
            plan.entry(chain.clone()).or_default().push(Enrollment {
                router: entry.address,
                domain: remote.chain_id,
                remote: remote.address,
            });
        }
    }
    plan
}

/// Deploys one router per resolved chain, then connects them.
///
/// Chains are deployed concurrently. Each step's result is written to the
/// record as soon as it is known, so a crash loses at most the in-flight step
/// and a later run resumes from what the record holds: pending routers are
/// initialized, missing enrollments are made, and an owed ownership handover
/// is completed.
pub struct RouterDeployer {
    clients: ChainClients,
    store: Arc<dyn RecordStore>,
    policy: DeployPolicy,
}

impl RouterDeployer {
    pub fn new(clients: ChainClients, store: Arc<dyn RecordStore>, policy: DeployPolicy) -> Self {
        Self {
            clients,
            store,
            policy,
        }
    }

    /// Deploy every chain in `resolved` that the record does not hold yet and
    /// finish connecting the ones it does.
    ///
    /// Chain-scoped failures are reported per chain and never abort the other
    /// chains. Only record persistence failures fail the whole run.
    pub async fn deploy(
        &self,
        resolved: &ResolvedDeployment,
    ) -> Result<DeploymentReport, DeployError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("deploy", run_id = %run_id);
        self.run(run_id, resolved).instrument(span).await
    }

    async fn run(
        &self,
        run_id: Uuid,
        resolved: &ResolvedDeployment,
    ) -> Result<DeploymentReport, DeployError> {
        let record = self.store.load().await?;

        let mut skipped = BTreeSet::new();
        let mut targets = Vec::new();
        for config in resolved.iter() {
            if record.contains(config.chain()) {
                info!("Chain {}: router already deployed, skipping", config.chain());
                skipped.insert(config.chain().to_string());
            } else {
                targets.push(config);
            }
        }

        info!(
            "Deploying {} of {} routers ({} on record)",
            targets.len(),
            resolved.len(),
            skipped.len()
        );

        let record = Mutex::new(record);
        let results = join_all(
            targets
                .iter()
                .map(|config| self.deploy_chain(config, &record)),
        )
        .await;

        let mut deployed = BTreeMap::new();
        let mut failed = BTreeMap::new();
        for (config, result) in targets.iter().zip(results) {
            let chain = config.chain().to_string();
            match result {
                Ok(router) => {
                    crate::metrics::record_router_deployed(&chain);
                    deployed.insert(chain, router);
                }
                Err(DeployError::Store(message)) => {
                    error!("Chain {}: deployment record write failed: {}", chain, message);
                    return Err(DeployError::Store(message));
                }
                Err(e) => {
                    if e.should_alert() {
                        error!("Chain {}: deployment needs attention: {}", chain, e);
                    } else {
                        warn!("Chain {}: deployment failed: {}", chain, e);
                    }
                    crate::metrics::record_deploy_failure(&chain, e.kind());
                    failed.insert(chain, e);
                }
            }
        }

        self.connect_routers(resolved, &record, &mut failed).await?;
        self.settle_ownership(resolved, &record, &mut failed).await?;

        Ok(DeploymentReport {
            run_id,
            deployed,
            skipped,
            failed,
            record: record.into_inner(),
        })
    }

    /// Create and initialize one chain's router.
    ///
    /// A router created by an earlier run but never initialized is picked up
    /// from the record's pending section instead of being created again.
    async fn deploy_chain(
        &self,
        config: &ChainRouterConfig,
        record: &Mutex<DeploymentRecord>,
    ) -> Result<Address, DeployError> {
        let chain = config.chain();
        let client = self.client(chain)?;

        let pending = record.lock().await.pending_router(chain);
        let router = match pending {
            Some(router) => {
                info!("Chain {}: resuming initialization of {:?}", chain, router);
                router
            }
            None => {
                let created = self
                    .with_retry(chain, "router creation", || client.deploy_router())
                    .await;
                let router = match created {
                    Ok(router) => router,
                    // Sending it again would leave a second router behind
                    Err(DeployError::CreationUnconfirmed {
                        router, message, ..
                    }) => {
                        warn!(
                            "Chain {}: creation of {:?} unconfirmed ({}), continuing with it",
                            chain, router, message
                        );
                        router
                    }
                    Err(e) => return Err(e),
                };
                let mut record = record.lock().await;
                record.mark_pending(chain, config.chain_id(), router);
                self.store.save(&record).await?;
                router
            }
        };

        // A lost acknowledgement of an initializer that did land resurfaces
        // here as AlreadyInitialized; it is reported, not retried.
        let args = InitializeArgs::from(config);
        self.with_retry(chain, "initialize", || {
            client.initialize_router(router, args.clone())
        })
        .await?;

        let mut record = record.lock().await;
        record.mark_deployed(chain, config.chain_id(), router);
        self.store.save(&record).await?;

        info!(
            "Chain {}: {} router deployed at {:?}",
            chain,
            if config.role().is_mainnet() { "mainnet" } else { "secondary" },
            router
        );
        Ok(router)
    }

    /// Make every enrollment between recorded routers that the record does
    /// not show as done yet, in both directions.
    async fn connect_routers(
        &self,
        resolved: &ResolvedDeployment,
        record: &Mutex<DeploymentRecord>,
        failed: &mut BTreeMap<String, DeployError>,
    ) -> Result<(), DeployError> {
        let plan = enrollment_plan(resolved, &*record.lock().await);
        if plan.is_empty() {
            info!("All recorded routers are connected");
            return Ok(());
        }

        // Enrollments on one chain share the operator's nonce, so they run in
        // order; chains run concurrently.
        let results = join_all(plan.into_iter().map(|(chain, enrollments)| async move {
            let result = self.enroll_chain(&chain, enrollments, record).await;
            (chain, result)
        }))
        .await;

        for (chain, result) in results {
            match result {
                Ok(()) => info!("Chain {}: remote routers enrolled", chain),
                Err(DeployError::Store(message)) => {
                    error!("Chain {}: deployment record write failed: {}", chain, message);
                    return Err(DeployError::Store(message));
                }
                Err(e) => {
                    if e.should_alert() {
                        error!("Chain {}: enrollment needs attention: {}", chain, e);
                    } else {
                        warn!("Chain {}: enrollment failed: {}", chain, e);
                    }
                    crate::metrics::record_deploy_failure(&chain, e.kind());
                    failed.entry(chain).or_insert(e);
                }
            }
        }
        Ok(())
    }

    async fn enroll_chain(
        &self,
        chain: &str,
        enrollments: Vec<Enrollment>,
        record: &Mutex<DeploymentRecord>,
    ) -> Result<(), DeployError> {
        let client = self.client(chain)?;

        let settled = record.lock().await.settled_owner(chain);
        if let Some(owner) = settled {
            if owner != client.operator() {
                return Err(DeployError::OwnershipHandedOver {
                    chain: chain.to_string(),
                    owner,
                });
            }
        }

        for e in enrollments {
            self.with_retry(chain, "enrollRemoteRouter", || {
                client.enroll_remote_router(e.router, e.domain, e.remote)
            })
            .await?;

            let mut record = record.lock().await;
            record.mark_enrolled(chain, e.domain);
            self.store.save(&record).await?;
        }
        Ok(())
    }

    /// Hand routers to their configured owner once the whole set is deployed
    /// and connected. Until then the operator keeps them, so that routers
    /// deployed later can still be enrolled everywhere.
    async fn settle_ownership(
        &self,
        resolved: &ResolvedDeployment,
        record: &Mutex<DeploymentRecord>,
        failed: &mut BTreeMap<String, DeployError>,
    ) -> Result<(), DeployError> {
        let owed = {
            let record = record.lock().await;
            let complete = failed.is_empty()
                && resolved.iter().all(|c| record.contains(c.chain()))
                && enrollment_plan(resolved, &record).is_empty();
            let owed = resolved
                .iter()
                .filter(|c| record.settled_owner(c.chain()) != Some(c.owner()))
                .filter_map(|c| {
                    let router = record.router(c.chain())?;
                    Some((c.chain().to_string(), router, c.owner()))
                })
                .collect::<Vec<_>>();

            if !complete {
                if !owed.is_empty() {
                    info!(
                        "Ownership handover of {} routers deferred until every chain is connected",
                        owed.len()
                    );
                }
                return Ok(());
            }
            owed
        };

        let results = join_all(owed.into_iter().map(|(chain, router, owner)| async move {
            let result = self.hand_over(&chain, router, owner, record).await;
            (chain, owner, result)
        }))
        .await;

        for (chain, owner, result) in results {
            match result {
                Ok(()) => info!("Chain {}: router owned by {:?}", chain, owner),
                Err(DeployError::Store(message)) => {
                    error!("Chain {}: deployment record write failed: {}", chain, message);
                    return Err(DeployError::Store(message));
                }
                Err(e) => {
                    warn!("Chain {}: ownership transfer failed: {}", chain, e);
                    crate::metrics::record_deploy_failure(&chain, e.kind());
                    failed.insert(chain, e);
                }
            }
        }
        Ok(())
    }

    async fn hand_over(
        &self,
        chain: &str,
        router: Address,
        owner: Address,
        record: &Mutex<DeploymentRecord>,
    ) -> Result<(), DeployError> {
        let client = self.client(chain)?;
        if owner != client.operator() {
            self.with_retry(chain, "transferOwnership", || {
                client.transfer_ownership(router, owner)
            })
            .await?;
        }

        let mut record = record.lock().await;
        record.mark_owner(chain, owner);
        self.store.save(&record).await?;
        Ok(())
    }

    fn client(&self, chain: &str) -> Result<&Arc<dyn ChainClient>, DeployError> {
        self.clients.get(chain).ok_or_else(|| DeployError::NoClient {
            chain: chain.to_string(),
        })
    }

    /// Run `op`, retrying only transient failures with exponential backoff
    async fn with_retry<T, F, Fut>(
        &self,
        chain: &str,
        step: &str,
        mut op: F,
    ) -> Result<T, DeployError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DeployError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.policy.max_retries => {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        "Chain {}: {} failed (attempt {}/{}): {}, retrying in {:?}",
                        chain, step, attempt, self.policy.max_retries, e, delay
                    );
                    crate::metrics::record_deploy_retry(chain);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
