//! Faucetful Router - multi-chain token router deployment and transfers
//!
//! Resolves one logical token into per-chain router configurations, deploys
//! and connects the routers, and runs the deposit and cross-chain transfer
//! protocol between them.

pub mod api;
pub mod chain;
pub mod config;
pub mod deploy;
pub mod devnet;
pub mod error;
pub mod metrics;
pub mod relay;
pub mod resolver;
pub mod router;
pub mod state;
pub mod transfer;
