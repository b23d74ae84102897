//! Chain module - per-chain RPC endpoint pools with health checks and failover
//!
//! This module provides:
//! - Prioritized endpoint pools bound to one live endpoint per chain
//! - On-demand failover when the bound endpoint stops answering
//! - A background prober that keeps endpoint health current
//! - Treasury contract call helpers

pub mod endpoint;
pub mod rpc;
pub mod treasury;

pub use endpoint::{EndpointHealth, LogLimiter, RpcEndpoint};
pub use rpc::{EthersRpcClient, HttpConnector, RpcClient, RpcConnector};

use crate::config::Settings;
use crate::error::{DispersalError, DispersalResult};

use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const PROBE_LOG_WINDOW: Duration = Duration::from_secs(300);

/// Endpoints of one chain, sorted by priority
struct ChainPool {
    chain_id: u64,
    name: String,
    endpoints: Vec<Arc<RpcEndpoint>>,
    bound: AtomicUsize,
}

/// Snapshot of one endpoint for the ops API
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub endpoint: String,
    pub priority: u32,
    pub bound: bool,
    #[serde(flatten)]
    pub health: EndpointHealth,
}

/// Hands out live RPC connections per chain
pub struct RpcConnectionManager {
    pools: BTreeMap<u64, ChainPool>,
    probe_timeout: Duration,
    health_check_interval: Duration,
    log_limiter: LogLimiter,
}

impl RpcConnectionManager {
    /// Build pools for every enabled chain
    pub fn new(settings: &Settings, connector: &dyn RpcConnector) -> DispersalResult<Self> {
        let mut pools = BTreeMap::new();

        for chain in settings.enabled_chains() {
            let mut configured: Vec<_> = chain.rpc_endpoints.iter().collect();
            configured.sort_by_key(|e| e.priority);

            let mut endpoints = Vec::with_capacity(configured.len());
            for endpoint in configured {
                let client = connector.connect(chain.chain_id, &endpoint.url)?;
                debug!(
                    "Added RPC endpoint for chain {}: {} (priority {})",
                    chain.chain_id,
                    rpc::redact_url(&endpoint.url),
                    endpoint.priority
                );
                endpoints.push(Arc::new(RpcEndpoint::new(
                    endpoint.url.clone(),
                    endpoint.priority,
                    client,
                )));
            }

            info!(
                "Initialized chain {} (ID: {}) with {} endpoints",
                chain.name,
                chain.chain_id,
                endpoints.len()
            );

            pools.insert(
                chain.chain_id,
                ChainPool {
                    chain_id: chain.chain_id,
                    name: chain.name.clone(),
                    endpoints,
                    bound: AtomicUsize::new(0),
                },
            );
        }

        Ok(Self {
            pools,
            probe_timeout: settings.service.probe_timeout(),
            health_check_interval: settings.service.health_check_interval(),
            log_limiter: LogLimiter::new(PROBE_LOG_WINDOW),
        })
    }

    fn pool(&self, chain_id: u64) -> DispersalResult<&ChainPool> {
        self.pools
            .get(&chain_id)
            .ok_or(DispersalError::ChainNotFound { chain_id })
    }

    /// Return a connection that just answered a liveness call
    pub async fn get_connection(&self, chain_id: u64) -> DispersalResult<Arc<dyn RpcClient>> {
        let pool = self.pool(chain_id)?;
        let bound = pool.bound.load(Ordering::Acquire);

        if let Some(endpoint) = pool.endpoints.get(bound) {
            if self.probe(chain_id, endpoint).await {
                return Ok(endpoint.client.clone());
            }
        }

        for (idx, endpoint) in pool.endpoints.iter().enumerate() {
            if idx == bound || !endpoint.is_healthy() {
                continue;
            }
            if self.probe(chain_id, endpoint).await {
                pool.bound.store(idx, Ordering::Release);
                crate::metrics::record_failover(chain_id);
                warn!(
                    chain_id,
                    "Chain {} failover to endpoint {} (priority {})",
                    pool.name,
                    endpoint.label(),
                    endpoint.priority
                );
                return Ok(endpoint.client.clone());
            }
        }

        Err(DispersalError::RpcUnavailable { chain_id })
    }

    /// Liveness call under the probe timeout; always updates health
    async fn probe(&self, chain_id: u64, endpoint: &RpcEndpoint) -> bool {
        let started = Instant::now();
        let outcome = match timeout(self.probe_timeout, endpoint.client.block_number()).await {
            Ok(Ok(block)) => Ok(block),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("no response within {:?}", self.probe_timeout)),
        };
        let latency = started.elapsed();
        let label = endpoint.label();

        match outcome {
            Ok(block) => {
                endpoint.mark_healthy(latency);
                crate::metrics::record_endpoint_health(chain_id, &label, true, latency.as_secs_f64());
                debug!("Chain {} endpoint {} at block {} ({:?})", chain_id, label, block, latency);
                true
            }
            Err(error) => {
                if self.log_limiter.allow(&format!("{}/{}", chain_id, endpoint.url)) {
                    warn!("Chain {} endpoint {} probe failed: {}", chain_id, label, error);
                }
                endpoint.mark_unhealthy(error);
                crate::metrics::record_endpoint_health(chain_id, &label, false, 0.0);
                false
            }
        }
    }

    /// Probe every endpoint of every chain concurrently
    pub async fn probe_all(&self) -> Vec<(u64, String, bool)> {
        let probes = self.pools.values().flat_map(move |pool| {
            pool.endpoints.iter().map(move |endpoint| async move {
                let healthy = self.probe(pool.chain_id, endpoint).await;
                (pool.chain_id, endpoint.label(), healthy)
            })
        });
        join_all(probes).await
    }

    /// Re-probe all endpoints on the configured interval
    pub fn spawn_health_monitor(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.health_check_interval);
            loop {
                interval.tick().await;
                let results = self.probe_all().await;
                let unhealthy = results.iter().filter(|(_, _, healthy)| !healthy).count();
                debug!(
                    "Endpoint health sweep: {}/{} healthy",
                    results.len() - unhealthy,
                    results.len()
                );
            }
        })
    }

    /// Health of every endpoint of a chain, in priority order
    pub fn endpoint_health(&self, chain_id: u64) -> DispersalResult<Vec<EndpointStatus>> {
        let pool = self.pool(chain_id)?;
        let bound = pool.bound.load(Ordering::Acquire);
        Ok(pool
            .endpoints
            .iter()
            .enumerate()
            .map(|(idx, endpoint)| EndpointStatus {
                endpoint: endpoint.label(),
                priority: endpoint.priority,
                bound: idx == bound,
                health: endpoint.health(),
            })
            .collect())
    }

    /// Whether any endpoint of the chain is currently marked healthy
    pub fn has_healthy_endpoint(&self, chain_id: u64) -> bool {
        self.pools
            .get(&chain_id)
            .map(|pool| pool.endpoints.iter().any(|e| e.is_healthy()))
            .unwrap_or(false)
    }

    pub fn chain_ids(&self) -> Vec<u64> {
        self.pools.keys().copied().collect()
    }

    pub fn chain_name(&self, chain_id: u64) -> Option<&str> {
        self.pools.get(&chain_id).map(|p| p.name.as_str())
    }
}
