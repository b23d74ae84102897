//! RPC endpoint health bookkeeping

use super::rpc::{redact_url, RpcClient};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Rolling health of one endpoint
#[derive(Debug, Clone, Serialize)]
pub struct EndpointHealth {
    pub healthy: bool,
    pub last_checked: Option<DateTime<Utc>>,
    pub latency_ms: Option<u64>,
    pub last_error: Option<String>,
}

impl Default for EndpointHealth {
    fn default() -> Self {
        // Optimistic until the first probe says otherwise
        Self {
            healthy: true,
            last_checked: None,
            latency_ms: None,
            last_error: None,
        }
    }
}

/// A prioritized endpoint and its client
pub struct RpcEndpoint {
    pub url: String,
    /// Lower is preferred
    pub priority: u32,
    pub client: Arc<dyn RpcClient>,
    health: RwLock<EndpointHealth>,
}

impl RpcEndpoint {
    pub fn new(url: String, priority: u32, client: Arc<dyn RpcClient>) -> Self {
        Self {
            url,
            priority,
            client,
            health: RwLock::new(EndpointHealth::default()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health().healthy
    }

    pub fn health(&self) -> EndpointHealth {
        self.health
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn label(&self) -> String {
        redact_url(&self.url)
    }

    pub fn mark_healthy(&self, latency: Duration) {
        let mut health = self
            .health
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        health.healthy = true;
        health.last_checked = Some(Utc::now());
        health.latency_ms = Some(latency.as_millis() as u64);
        health.last_error = None;
    }

    pub fn mark_unhealthy(&self, error: String) {
        let mut health = self
            .health
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        health.healthy = false;
        health.last_checked = Some(Utc::now());
        health.last_error = Some(error);
    }
}

/// Allows one log line per key per window
pub struct LogLimiter {
    window: Duration,
    last_logged: DashMap<String, Instant>,
}

impl LogLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_logged: DashMap::new(),
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        match self.last_logged.entry(key.to_string()) {
            Entry::Occupied(mut last) => {
                if now.duration_since(*last.get()) >= self.window {
                    last.insert(now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }
}
