//! Service graph
//!
//! Every component is built once here and shared by `Arc`. The binary, the
//! ops API and embedding services all go through [`DispersalService`].

use crate::address::parse_address;
use crate::alerts::{Alert, AlertManager};
use crate::chain::{HttpConnector, RpcConnectionManager, RpcConnector};
use crate::config::Settings;
use crate::coordination::{
    CoordinatorMetrics, DistributionCoordinator, DistributionPlanner, DistributionRequest,
    DistributionResult, IntentLifecycleManager, TreasuryBalance,
};
use crate::error::{DispersalError, DispersalResult};
use crate::intent::{ChainUpdate, Intent, VerifiedDeposit};
use crate::oracle::{FtsoSource, HttpPriceSource, OracleMetricsSummary, PriceOracleClient, PriceSource};
use crate::state::{IntentStore, MemoryIntentStore, PostgresIntentStore, StoreStats};
use crate::tx::{SignerRegistry, TransactionExecutor};

use ethers::types::{Address, U256};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Snapshot served by `/stats`
#[derive(Debug, Clone, Serialize)]
pub struct ServiceMetrics {
    pub distributions: CoordinatorMetrics,
    pub oracle: OracleMetricsSummary,
    pub intents: StoreStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainReadiness {
    pub chain_id: u64,
    pub name: String,
    pub healthy: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
    pub ready: bool,
    pub store: bool,
    pub chains: Vec<ChainReadiness>,
}

pub struct DispersalService {
    pub rpc: Arc<RpcConnectionManager>,
    pub executor: Arc<TransactionExecutor>,
    pub coordinator: Arc<DistributionCoordinator>,
    pub oracle: Arc<PriceOracleClient>,
    pub lifecycle: IntentLifecycleManager,
    pub store: Arc<dyn IntentStore>,
    pub alerts: Arc<AlertManager>,
}

impl DispersalService {
    /// Wire the production graph from settings
    pub async fn build(settings: &Settings) -> DispersalResult<Self> {
        let rpc = Arc::new(RpcConnectionManager::new(settings, &HttpConnector)?);
        let signers = Arc::new(SignerRegistry::from_env(settings)?);

        let store: Arc<dyn IntentStore> = match &settings.database {
            Some(database) => {
                let store = PostgresIntentStore::new(database).await?;
                store.run_migrations().await?;
                info!("Intent store: PostgreSQL");
                Arc::new(store)
            }
            None => {
                warn!("No database configured, intents are kept in memory only");
                Arc::new(MemoryIntentStore::new())
            }
        };

        Self::assemble(settings, rpc, signers, store)
    }

    /// Wire the graph over an existing RPC pool and store
    pub fn assemble(
        settings: &Settings,
        rpc: Arc<RpcConnectionManager>,
        signers: Arc<SignerRegistry>,
        store: Arc<dyn IntentStore>,
    ) -> DispersalResult<Self> {
        let alerts = Arc::new(AlertManager::from_config(&settings.alerts));
        let executor = Arc::new(TransactionExecutor::new(settings, rpc.clone(), signers));
        let coordinator = Arc::new(DistributionCoordinator::new(
            settings,
            rpc.clone(),
            executor.clone(),
            alerts.clone(),
        )?);

        let primary: Arc<dyn PriceSource> = Arc::new(FtsoSource::new(
            rpc.clone(),
            settings.oracle.chain_id,
            parse_address(&settings.oracle.contract_address)?,
        ));
        let fallback: Option<Arc<dyn PriceSource>> = match &settings.oracle.fallback {
            Some(config) => {
                info!("Oracle fallback provider: {}", config.name);
                Some(Arc::new(HttpPriceSource::new(config)?))
            }
            None => None,
        };
        let oracle = Arc::new(PriceOracleClient::new(&settings.oracle, primary, fallback));
        let planner = Arc::new(DistributionPlanner::new(settings)?);

        let lifecycle = IntentLifecycleManager::new(
            store.clone(),
            coordinator.clone(),
            executor.clone(),
            oracle.clone(),
            planner,
            alerts.clone(),
        );

        Ok(Self {
            rpc,
            executor,
            coordinator,
            oracle,
            lifecycle,
            store,
            alerts,
        })
    }

    /// Wire the graph with a custom connector and an in-memory store
    pub fn with_connector(
        settings: &Settings,
        connector: &dyn RpcConnector,
        signers: Arc<SignerRegistry>,
    ) -> DispersalResult<Self> {
        let rpc = Arc::new(RpcConnectionManager::new(settings, connector)?);
        Self::assemble(settings, rpc, signers, Arc::new(MemoryIntentStore::new()))
    }

    pub async fn create_intent(&self, deposit: &VerifiedDeposit) -> DispersalResult<Intent> {
        self.lifecycle.create_intent(deposit).await
    }

    pub async fn enqueue_dispersal(&self, intent_id: &str) -> DispersalResult<Intent> {
        self.lifecycle.enqueue_dispersal(intent_id).await
    }

    pub async fn update_chain_dispersal_status(
        &self,
        intent_id: &str,
        chain_id: u64,
        update: ChainUpdate,
    ) -> DispersalResult<Intent> {
        self.lifecycle
            .update_chain_dispersal_status(intent_id, chain_id, update)
            .await
    }

    pub async fn recheck_broadcasted(&self, intent_id: &str) -> DispersalResult<Intent> {
        self.lifecycle.recheck_broadcasted(intent_id).await
    }

    pub async fn get_intent(&self, intent_id: &str) -> DispersalResult<Intent> {
        self.lifecycle.get_intent(intent_id).await
    }

    pub async fn distribute_to_chain(
        &self,
        chain_id: u64,
        recipient: Address,
        amount: U256,
        intent_id: &str,
    ) -> DistributionResult {
        self.coordinator
            .distribute_to_chain(chain_id, recipient, amount, intent_id)
            .await
    }

    pub async fn distribute_multi_chain(
        &self,
        requests: &[DistributionRequest],
        intent_id: &str,
    ) -> Vec<DistributionResult> {
        self.coordinator
            .distribute_multi_chain(requests, intent_id)
            .await
    }

    pub async fn validate_liquidity(&self, requests: &[DistributionRequest]) -> bool {
        self.coordinator.validate_liquidity(requests).await
    }

    pub async fn get_all_treasury_balances(&self) -> Vec<TreasuryBalance> {
        self.coordinator.get_all_treasury_balances().await
    }

    pub async fn get_metrics(&self) -> DispersalResult<ServiceMetrics> {
        Ok(ServiceMetrics {
            distributions: self.coordinator.metrics(),
            oracle: self.oracle.metrics_summary(),
            intents: self.store.stats().await?,
        })
    }

    pub fn on_alert<F>(&self, callback: F)
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        self.alerts.on_alert(callback);
    }

    /// Ready when the store answers and every chain has a healthy endpoint
    pub async fn readiness(&self) -> ReadinessReport {
        let store = match self.store.health_check().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Intent store health check failed: {}", e);
                false
            }
        };

        let chains: Vec<ChainReadiness> = self
            .rpc
            .chain_ids()
            .into_iter()
            .map(|chain_id| ChainReadiness {
                chain_id,
                name: self.rpc.chain_name(chain_id).unwrap_or_default().to_string(),
                healthy: self.rpc.has_healthy_endpoint(chain_id),
            })
            .collect();

        ReadinessReport {
            ready: store && chains.iter().all(|c| c.healthy),
            store,
            chains,
        }
    }

    /// Fail fast when a chain has no endpoint answering at startup
    pub async fn check_connectivity(&self) -> DispersalResult<()> {
        let results = self.rpc.probe_all().await;
        for chain_id in self.rpc.chain_ids() {
            if !results.iter().any(|(id, _, healthy)| *id == chain_id && *healthy) {
                return Err(DispersalError::RpcUnavailable { chain_id });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertSeverity;
    use crate::intent::Allocation;
    use crate::testing::{fake_settings, test_wallet, FakeConnector, FakeRpc};
    use std::sync::Mutex;

    const URL_A: &str = "http://a.test";
    const URL_B: &str = "http://b.test";

    fn service(a: Arc<FakeRpc>, b: Arc<FakeRpc>) -> DispersalService {
        let settings = fake_settings(&[(14, &[URL_A][..]), (114, &[URL_B][..])]);
        let connector = FakeConnector::new(&[(URL_A, a), (URL_B, b)]);
        DispersalService::with_connector(
            &settings,
            &connector,
            Arc::new(SignerRegistry::shared(test_wallet(), &[14, 114])),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_readiness_tracks_endpoint_health() {
        let a = FakeRpc::new();
        let b = FakeRpc::new();
        let service = service(a.clone(), b.clone());

        let report = service.readiness().await;
        assert!(report.ready);
        assert!(report.store);
        assert_eq!(report.chains.len(), 2);

        b.set_down(true);
        assert!(service.check_connectivity().await.is_err());
        let report = service.readiness().await;
        assert!(!report.ready);
        assert!(!report.chains.iter().find(|c| c.chain_id == 114).unwrap().healthy);
    }

    #[tokio::test]
    async fn test_metrics_snapshot_counts_intents() {
        let service = service(FakeRpc::new(), FakeRpc::new());

        let recipient = Address::from_low_u64_be(0xbeef);
        let result = service
            .distribute_to_chain(114, recipient, U256::from(1_000u64), "0x01")
            .await;
        assert!(result.is_confirmed());

        let metrics = service.get_metrics().await.unwrap();
        assert_eq!(metrics.distributions.total_attempts, 1);
        assert_eq!(metrics.distributions.total_confirmed, 1);
        assert_eq!(metrics.intents.total, 0);
    }

    #[tokio::test]
    async fn test_on_alert_receives_liquidity_failures() {
        let b = FakeRpc::new();
        b.set_treasury_balance(U256::zero());
        let service = service(FakeRpc::new(), b);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        service.on_alert(move |alert| sink.lock().unwrap().push(alert.severity));

        let requests = [DistributionRequest {
            chain_id: 114,
            recipient: Address::from_low_u64_be(0xbeef),
            amount: U256::from(10u64),
        }];
        assert!(!service.validate_liquidity(&requests).await);
        assert!(seen.lock().unwrap().contains(&AlertSeverity::Critical));
    }

    #[tokio::test]
    async fn test_treasury_balances_cover_every_chain() {
        let a = FakeRpc::new();
        a.fail_treasury_balance(true);
        let service = service(a, FakeRpc::new());

        let balances = service.get_all_treasury_balances().await;
        assert_eq!(balances.len(), 2);
        let a_balance = balances.iter().find(|b| b.chain_id == 14).unwrap();
        assert!(a_balance.error.is_some());
        let b_balance = balances.iter().find(|b| b.chain_id == 114).unwrap();
        assert!(b_balance.balance_display.as_deref().unwrap().starts_with("1000"));
    }

    #[tokio::test]
    async fn test_create_intent_requires_prices() {
        // No call response configured, so the feed contract read fails
        let service = service(FakeRpc::new(), FakeRpc::new());
        let deposit = VerifiedDeposit {
            source_chain_id: 1,
            deposit_tx_hash: "0xabc".to_string(),
            user_address: "0x1111111111111111111111111111111111111111".to_string(),
            token_address: "0x2222222222222222222222222222222222222222".to_string(),
            token_decimals: 6,
            amount: U256::from(1_000_000u64),
            price_feed: "USDC/USD".to_string(),
            allocations: vec![Allocation {
                chain_id: 114,
                recipient: "0x3333333333333333333333333333333333333333".to_string(),
                weight_bps: 10_000,
            }],
        };

        assert!(service.create_intent(&deposit).await.is_err());
        assert_eq!(service.get_metrics().await.unwrap().intents.total, 0);
    }
}
