//! Intent persistence
//!
//! The lifecycle manager reads and writes intents through [`IntentStore`].
//! Two implementations ship: an in-memory map for tests and single-node
//! runs, and PostgreSQL.

mod memory;
mod postgres;

pub use memory::MemoryIntentStore;
pub use postgres::PostgresIntentStore;

use crate::error::DispersalResult;
use crate::intent::Intent;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;

/// Intent counts for the ops API
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IntentStore: Send + Sync {
    /// Insert unless an intent with the same id exists; true when inserted
    async fn create(&self, intent: &Intent) -> DispersalResult<bool>;

    async fn get(&self, intent_id: &str) -> DispersalResult<Option<Intent>>;

    /// Overwrite an existing intent
    async fn update(&self, intent: &Intent) -> DispersalResult<()>;

    async fn health_check(&self) -> DispersalResult<()>;

    async fn stats(&self) -> DispersalResult<StoreStats>;
}
