//! Deploy module - creates, initializes and connects routers across chains
//!
//! This module provides:
//! - The deployment record and its stores (JSON file, in-memory)
//! - The deployer that drives chain clients to a fully connected router set

mod deployer;
pub mod record;

pub use deployer::{DeployPolicy, DeploymentReport, RouterDeployer};
pub use record::{DeploymentRecord, JsonFileStore, MemoryRecordStore, RecordStore, RouterEntry};
