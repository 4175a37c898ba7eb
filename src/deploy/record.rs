//! Deployment record and its persistence
//!
//! The record is the only source of truth for "already deployed" and for how
//! far each router got in being connected. Chains own disjoint keys, so
//! merging results from concurrent deployments is a union.

use crate::error::StoreError;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterEntry {
    pub chain_id: u64,
    pub address: Address,
    pub deployed_at: DateTime<Utc>,
    /// Domains whose remote router this router has enrolled
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub enrolled: BTreeSet<u64>,
    /// Final owner, set once the router no longer needs the operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Address>,
}

impl RouterEntry {
    fn new(chain_id: u64, address: Address) -> Self {
        Self {
            chain_id,
            address,
            deployed_at: Utc::now(),
            enrolled: BTreeSet::new(),
            owner: None,
        }
    }
}

/// Routers deployed per chain, plus routers created but not yet initialized
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    #[serde(default)]
    pub routers: BTreeMap<String, RouterEntry>,
    #[serde(default)]
    pub pending: BTreeMap<String, RouterEntry>,
}

impl DeploymentRecord {
    pub fn contains(&self, chain: &str) -> bool {
        self.routers.contains_key(chain)
    }

    pub fn router(&self, chain: &str) -> Option<Address> {
        self.routers.get(chain).map(|e| e.address)
    }

    /// Router created by an earlier run whose initializer has not completed
    pub fn pending_router(&self, chain: &str) -> Option<Address> {
        self.pending.get(chain).map(|e| e.address)
    }

    pub fn mark_pending(&mut self, chain: &str, chain_id: u64, address: Address) {
        self.pending
            .insert(chain.to_string(), RouterEntry::new(chain_id, address));
    }

    pub fn mark_deployed(&mut self, chain: &str, chain_id: u64, address: Address) {
        self.pending.remove(chain);
        self.routers
            .insert(chain.to_string(), RouterEntry::new(chain_id, address));
    }

    pub fn is_enrolled(&self, chain: &str, domain: u64) -> bool {
        self.routers
            .get(chain)
            .map(|e| e.enrolled.contains(&domain))
            .unwrap_or(false)
    }

    pub fn mark_enrolled(&mut self, chain: &str, domain: u64) {
        if let Some(entry) = self.routers.get_mut(chain) {
            entry.enrolled.insert(domain);
        }
    }

    /// Owner the router was settled on, if the handover is done
    pub fn settled_owner(&self, chain: &str) -> Option<Address> {
        self.routers.get(chain).and_then(|e| e.owner)
    }

    pub fn mark_owner(&mut self, chain: &str, owner: Address) {
        if let Some(entry) = self.routers.get_mut(chain) {
            entry.owner = Some(owner);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.routers.is_empty() && self.pending.is_empty()
    }
}

/// Persistence for the deployment record
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Load the record; a store that was never written yields an empty record
    async fn load(&self) -> Result<DeploymentRecord, StoreError>;

    async fn save(&self, record: &DeploymentRecord) -> Result<(), StoreError>;
}

/// Record kept as a JSON document on disk
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordStore for JsonFileStore {
    async fn load(&self) -> Result<DeploymentRecord, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DeploymentRecord::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, record: &DeploymentRecord) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        // Write-then-rename so a crash never leaves a torn record
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(record)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!("Saved deployment record to {:?}", self.path);
        Ok(())
    }
}

/// Record kept in memory, for the devnet and tests
#[derive(Default)]
pub struct MemoryRecordStore {
    record: RwLock<DeploymentRecord>,
    saves: AtomicUsize,
}

impl MemoryRecordStore {
    pub fn new(record: DeploymentRecord) -> Self {
        Self {
            record: RwLock::new(record),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of writes so far
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn load(&self) -> Result<DeploymentRecord, StoreError> {
        Ok(self.record.read().await.clone())
    }

    async fn save(&self, record: &DeploymentRecord) -> Result<(), StoreError> {
        *self.record.write().await = record.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
