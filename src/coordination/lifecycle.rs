//! Intent state machine
//!
//! Owns every write to an intent after creation. Per-chain updates are
//! serialized per intent; the aggregate status is always recomputed from
//! the legs.

use super::distributor::{
    DistributionCoordinator, DistributionOutcome, DistributionRequest, DistributionResult,
};
use super::planner::DistributionPlanner;
use crate::address::parse_address;
use crate::alerts::AlertManager;
use crate::error::{DispersalError, DispersalResult};
use crate::intent::{
    derive_intent_id, ChainUpdate, DistributionStatus, Intent, IntentStatus, VerifiedDeposit,
};
use crate::metrics;
use crate::oracle::PriceOracleClient;
use crate::state::IntentStore;
use crate::tx::TransactionExecutor;

use chrono::Utc;
use dashmap::DashMap;
use ethers::types::H256;
use futures::future::join_all;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const TIMEOUT_NOTE: &str = "confirmation timed out; awaiting recheck";

#[derive(Clone)]
pub struct IntentLifecycleManager {
    store: Arc<dyn IntentStore>,
    coordinator: Arc<DistributionCoordinator>,
    executor: Arc<TransactionExecutor>,
    oracle: Arc<PriceOracleClient>,
    planner: Arc<DistributionPlanner>,
    alerts: Arc<AlertManager>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl IntentLifecycleManager {
    pub fn new(
        store: Arc<dyn IntentStore>,
        coordinator: Arc<DistributionCoordinator>,
        executor: Arc<TransactionExecutor>,
        oracle: Arc<PriceOracleClient>,
        planner: Arc<DistributionPlanner>,
        alerts: Arc<AlertManager>,
    ) -> Self {
        Self {
            store,
            coordinator,
            executor,
            oracle,
            planner,
            alerts,
            locks: Arc::new(DashMap::new()),
        }
    }

    fn lock_for(&self, intent_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(intent_id.to_string())
            .or_default()
            .clone()
    }

    pub async fn get_intent(&self, intent_id: &str) -> DispersalResult<Intent> {
        self.store
            .get(intent_id)
            .await?
            .ok_or_else(|| DispersalError::IntentNotFound {
                intent_id: intent_id.to_string(),
            })
    }

    /// Price and plan a verified deposit, then store it. A deposit seen
    /// before returns the existing intent.
    pub async fn create_intent(&self, deposit: &VerifiedDeposit) -> DispersalResult<Intent> {
        self.planner.validate(deposit)?;
        let intent_id = derive_intent_id(deposit.source_chain_id, &deposit.deposit_tx_hash);

        if let Some(existing) = self.store.get(&intent_id).await? {
            debug!(intent_id = %intent_id, "Deposit already has an intent");
            return Ok(existing);
        }

        let feeds = self.planner.required_feeds(deposit)?;
        let quotes = self.oracle.get_prices(&feeds).await?;
        let quotes: HashMap<_, _> = feeds
            .into_iter()
            .zip(quotes)
            .filter_map(|(feed, quote)| quote.map(|q| (feed, q)))
            .collect();
        let plan = self.planner.plan(deposit, &quotes)?;

        let now = Utc::now();
        let intent = Intent {
            id: intent_id.clone(),
            user_address: deposit.user_address.to_lowercase(),
            source_chain_id: deposit.source_chain_id,
            source_token: deposit.token_address.to_lowercase(),
            source_amount: deposit.amount,
            deposit_tx_hash: deposit.deposit_tx_hash.trim().to_lowercase(),
            usd_value: plan.usd_value,
            status: IntentStatus::DepositConfirmed,
            distributions: plan.distributions,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        if !self.store.create(&intent).await? {
            // Lost a race with a concurrent create for the same deposit
            return self.get_intent(&intent_id).await;
        }

        metrics::record_intent_status(intent.status.as_str());
        info!(
            intent_id = %intent.id,
            usd_value = %intent.usd_value,
            "Created intent with {} distributions",
            intent.distributions.len()
        );
        Ok(intent)
    }

    /// Queue every pending leg and start dispersal in the background.
    /// Intents past DEPOSIT_CONFIRMED are returned unchanged.
    pub async fn enqueue_dispersal(&self, intent_id: &str) -> DispersalResult<Intent> {
        let lock = self.lock_for(intent_id);
        let queued = {
            let _guard = lock.lock().await;
            let mut intent = self.get_intent(intent_id).await?;
            if intent.status != IntentStatus::DepositConfirmed {
                debug!(intent_id, status = %intent.status, "Enqueue is a no-op");
                return Ok(intent);
            }

            for leg in intent
                .distributions
                .iter_mut()
                .filter(|d| d.status == DistributionStatus::NotStarted)
            {
                leg.apply(&ChainUpdate::status(DistributionStatus::Queued))?;
            }

            let readiness = intent
                .distributions
                .iter()
                .filter(|d| d.status == DistributionStatus::Queued)
                .try_for_each(|d| self.executor.ensure_ready(d.chain_id));

            if let Err(e) = readiness {
                return Err(self.fail_kickoff(intent, e).await);
            }

            intent.status = IntentStatus::DisperseQueued;
            intent.updated_at = Utc::now();
            self.store.update(&intent).await?;
            metrics::record_intent_status(intent.status.as_str());
            info!(intent_id, "Queued {} distributions", intent.distributions.len());
            intent
        };

        let this = self.clone();
        let id = intent_id.to_string();
        tokio::spawn(async move {
            this.run_dispersal(&id).await;
        });

        Ok(queued)
    }

    /// Kickoff could not start: fail the queued legs and hand the error back
    async fn fail_kickoff(&self, mut intent: Intent, err: DispersalError) -> DispersalError {
        let failure = ChainUpdate::failed(err.to_string()).with_note(err.kind().to_uppercase());
        for leg in intent
            .distributions
            .iter_mut()
            .filter(|d| d.status == DistributionStatus::Queued)
        {
            if let Err(e) = leg.apply(&failure) {
                return e;
            }
        }
        intent.recompute_status();

        if let Err(e) = self.store.update(&intent).await {
            return e;
        }
        metrics::record_intent_status(intent.status.as_str());
        self.alerts.emit(
            self.alerts
                .critical(
                    "Dispersal could not start",
                    format!("Intent {} failed before dispatch: {}", intent.id, err),
                )
                .with_intent(&intent.id),
        );
        err
    }

    /// Apply one per-chain update and recompute the aggregate status
    pub async fn update_chain_dispersal_status(
        &self,
        intent_id: &str,
        chain_id: u64,
        update: ChainUpdate,
    ) -> DispersalResult<Intent> {
        let lock = self.lock_for(intent_id);
        let intent = {
            let _guard = lock.lock().await;
            let mut intent = self.get_intent(intent_id).await?;
            let previous = intent.status;

            let leg = intent.distribution_mut(chain_id).ok_or_else(|| {
                DispersalError::Validation(format!(
                    "Intent {} has no distribution to chain {}",
                    intent_id, chain_id
                ))
            })?;
            leg.apply(&update)?;
            debug!(intent_id, chain_id, status = %update.status, "Applied chain update");

            let changed = intent.recompute_status();
            self.store.update(&intent).await?;

            if changed {
                metrics::record_intent_status(intent.status.as_str());
                info!(intent_id, "Intent {} -> {}", previous, intent.status);
                if intent.status == IntentStatus::Failed {
                    let detail = update.error.as_deref().unwrap_or("unknown error");
                    self.alerts.emit(
                        self.alerts
                            .critical(
                                "Intent failed",
                                format!("Intent {} failed on chain {}: {}", intent_id, chain_id, detail),
                            )
                            .with_chain(chain_id)
                            .with_intent(intent_id),
                    );
                }
            }
            intent
        };

        // Release the entry only once no leg can change and nobody else holds the lock
        drop(lock);
        if intent.distributions.iter().all(|d| d.status.is_terminal()) {
            self.locks
                .remove_if(intent_id, |_, lock| Arc::strong_count(lock) == 1);
        }
        Ok(intent)
    }

    /// Re-wait for legs left BROADCASTED after a confirmation timeout
    pub async fn recheck_broadcasted(&self, intent_id: &str) -> DispersalResult<Intent> {
        let intent = self.get_intent(intent_id).await?;
        let pending: Vec<(u64, H256)> = intent
            .distributions
            .iter()
            .filter(|d| d.status == DistributionStatus::Broadcasted)
            .filter_map(|d| {
                let hash = d.tx_hash.as_deref().and_then(|h| H256::from_str(h).ok());
                if hash.is_none() {
                    warn!(intent_id, chain_id = d.chain_id, "Broadcasted leg has no usable tx hash");
                }
                hash.map(|h| (d.chain_id, h))
            })
            .collect();

        if pending.is_empty() {
            return Ok(intent);
        }
        info!(intent_id, "Rechecking {} broadcasted distributions", pending.len());

        let results = join_all(pending.iter().map(|(chain_id, hash)| {
            self.coordinator.confirm_distribution(*chain_id, intent_id, *hash)
        }))
        .await;
        for result in &results {
            self.apply_result(intent_id, result).await;
        }

        self.get_intent(intent_id).await
    }

    async fn run_dispersal(&self, intent_id: &str) {
        let intent = match self.get_intent(intent_id).await {
            Ok(intent) => intent,
            Err(e) => {
                error!(intent_id, "Dispersal could not load intent: {}", e);
                return;
            }
        };

        let mut requests = Vec::new();
        for leg in intent
            .distributions
            .iter()
            .filter(|d| d.status == DistributionStatus::Queued)
        {
            match parse_address(&leg.recipient) {
                Ok(recipient) => requests.push(DistributionRequest {
                    chain_id: leg.chain_id,
                    recipient,
                    amount: leg.amount,
                }),
                Err(e) => self.record_update(intent_id, leg.chain_id, ChainUpdate::failed(e.to_string())).await,
            }
        }

        let report = self.coordinator.liquidity_report(&requests).await;
        if !report.sufficient {
            warn!(intent_id, "Insufficient liquidity, failing {} distributions", requests.len());
            for request in &requests {
                let result = self
                    .coordinator
                    .liquidity_failure(request.chain_id, intent_id, &report);
                self.apply_result(intent_id, &result).await;
            }
            return;
        }

        join_all(requests.iter().map(|r| self.run_leg(intent_id, r))).await;
        debug!(intent_id, "Dispersal task finished");
    }

    async fn run_leg(&self, intent_id: &str, request: &DistributionRequest) {
        let submitted = match self.coordinator.submit_distribution(request, intent_id).await {
            Ok(submitted) => submitted,
            Err(result) => {
                self.apply_result(intent_id, &result).await;
                return;
            }
        };

        let tx_hash = format!("{:?}", submitted.tx_hash);
        self.record_update(intent_id, request.chain_id, ChainUpdate::broadcasted(tx_hash))
            .await;

        let result = self
            .coordinator
            .confirm_distribution(request.chain_id, intent_id, submitted.tx_hash)
            .await;
        self.apply_result(intent_id, &result).await;
    }

    async fn apply_result(&self, intent_id: &str, result: &DistributionResult) {
        let update = match result.outcome {
            DistributionOutcome::Confirmed => ChainUpdate::confirmed(
                result.tx_hash.clone().unwrap_or_default(),
                result.confirmations.unwrap_or_default(),
            ),
            DistributionOutcome::Unconfirmed => {
                ChainUpdate::status(DistributionStatus::Broadcasted).with_note(TIMEOUT_NOTE)
            }
            DistributionOutcome::Failed => {
                let update = ChainUpdate::failed(result.error.clone().unwrap_or_default())
                    .with_note(
                        result
                            .failure_reason
                            .clone()
                            .unwrap_or_else(|| "FAILED".to_string()),
                    );
                match &result.tx_hash {
                    Some(hash) => update.with_tx_hash(hash.clone()),
                    None => update,
                }
            }
        };
        self.record_update(intent_id, result.chain_id, update).await;
    }

    async fn record_update(&self, intent_id: &str, chain_id: u64, update: ChainUpdate) {
        if let Err(e) = self
            .update_chain_dispersal_status(intent_id, chain_id, update)
            .await
        {
            error!(intent_id, chain_id, "Failed to record chain update: {}", e);
        }
    }
}
