//! State management with PostgreSQL persistence
//!
//! Keeps the deployment record in a `deployment_records` table, one row per
//! chain, so several operators can share it.

mod manager;

pub use manager::StateManager;
