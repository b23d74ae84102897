use super::{IntentStore, StoreStats};
use crate::error::{DispersalError, DispersalResult};
use crate::intent::Intent;

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Process-local store; contents are lost on restart
#[derive(Default)]
pub struct MemoryIntentStore {
    intents: RwLock<HashMap<String, Intent>>,
}

impl MemoryIntentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IntentStore for MemoryIntentStore {
    async fn create(&self, intent: &Intent) -> DispersalResult<bool> {
        let mut intents = self.intents.write().await;
        if intents.contains_key(&intent.id) {
            return Ok(false);
        }
        intents.insert(intent.id.clone(), intent.clone());
        Ok(true)
    }

    async fn get(&self, intent_id: &str) -> DispersalResult<Option<Intent>> {
        Ok(self.intents.read().await.get(intent_id).cloned())
    }

    async fn update(&self, intent: &Intent) -> DispersalResult<()> {
        let mut intents = self.intents.write().await;
        match intents.get_mut(&intent.id) {
            Some(existing) => {
                *existing = intent.clone();
                Ok(())
            }
            None => Err(DispersalError::IntentNotFound {
                intent_id: intent.id.clone(),
            }),
        }
    }

    async fn health_check(&self) -> DispersalResult<()> {
        Ok(())
    }

    async fn stats(&self) -> DispersalResult<StoreStats> {
        let intents = self.intents.read().await;
        let mut stats = StoreStats {
            total: intents.len() as u64,
            ..Default::default()
        };
        for intent in intents.values() {
            *stats
                .by_status
                .entry(intent.status.as_str().to_string())
                .or_default() += 1;
        }
        Ok(stats)
    }
}
