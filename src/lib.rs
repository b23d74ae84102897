//! Dispersal Relayer - multi-chain native gas dispersal
//!
//! A user deposits on one chain and receives native gas on several
//! destination chains, paid from pre-funded treasuries and tracked as one
//! intent. This crate provides:
//! - Prioritized, health-checked RPC endpoint pools with failover
//! - Nonce-correct, gas-priced transaction submission and confirmation
//! - Liquidity-checked fan-out of one intent into per-chain payouts
//! - A cached price oracle client with a fallback provider

pub mod address;
pub mod alerts;
pub mod amount;
pub mod api;
pub mod chain;
pub mod config;
pub mod coordination;
pub mod error;
pub mod intent;
pub mod metrics;
pub mod oracle;
pub mod retry;
pub mod service;
pub mod state;
pub mod tx;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{DispersalError, DispersalResult};
pub use service::DispersalService;
