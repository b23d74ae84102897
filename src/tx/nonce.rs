//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Strictly serialized nonce assignment per (chain, signer)
//! - Reconciliation against the chain's pending nonce
//! - Invalidation after a detected conflict

use crate::chain::RpcClient;
use crate::error::DispersalResult;

use dashmap::DashMap;
use ethers::types::Address;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Per-(chain, signer) nonce state
#[derive(Debug, Default)]
struct NonceSlot {
    /// Next nonce to hand out; `None` until read from the chain or after invalidation
    next: Option<u64>,
}

/// Serializes nonce assignment across concurrent submissions
#[derive(Default)]
pub struct NonceManager {
    slots: DashMap<(u64, Address), Arc<Mutex<NonceSlot>>>,
}

impl NonceManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, chain_id: u64, signer: Address) -> Arc<Mutex<NonceSlot>> {
        self.slots
            .entry((chain_id, signer))
            .or_insert_with(|| Arc::new(Mutex::new(NonceSlot::default())))
            .clone()
    }

    /// Allocate the next nonce: max(cached, chain pending), then advance the cache
    pub async fn acquire(
        &self,
        chain_id: u64,
        signer: Address,
        client: &dyn RpcClient,
    ) -> DispersalResult<u64> {
        let slot = self.slot(chain_id, signer);
        let mut slot = slot.lock().await;

        let observed = client.pending_nonce(signer).await?;
        let nonce = match slot.next {
            Some(cached) if cached >= observed => cached,
            Some(cached) => {
                debug!(
                    "Chain {} pending nonce {} is ahead of cached {}",
                    chain_id, observed, cached
                );
                observed
            }
            None => observed,
        };
        slot.next = Some(nonce + 1);

        debug!("Allocated nonce {} for chain {}", nonce, chain_id);
        Ok(nonce)
    }

    /// Return a nonce that was never broadcast
    pub async fn release(&self, chain_id: u64, signer: Address, nonce: u64) {
        let slot = self.slot(chain_id, signer);
        let mut slot = slot.lock().await;

        if slot.next == Some(nonce + 1) {
            slot.next = Some(nonce);
            debug!("Released nonce {} for chain {}", nonce, chain_id);
        } else {
            // Later nonces are out; let the chain's pending count fill the gap
            slot.next = None;
            debug!(
                "Nonce {} for chain {} released out of order, cache invalidated",
                nonce, chain_id
            );
        }
    }

    /// Forget the cached nonce so the next acquire rebuilds from the chain
    pub async fn invalidate(&self, chain_id: u64, signer: Address) {
        let slot = self.slot(chain_id, signer);
        slot.lock().await.next = None;
        warn!("Nonce cache invalidated for chain {} signer {:?}", chain_id, signer);
    }

    /// Cached next nonce, if any
    pub async fn peek(&self, chain_id: u64, signer: Address) -> Option<u64> {
        let slot = self.slot(chain_id, signer);
        let next = slot.lock().await.next;
        next
    }
}
