//! Treasury fan-out: liquidity checks and per-chain `distribute` calls

use crate::address::parse_address;
use crate::alerts::{Alert, AlertManager};
use crate::amount::{display_units, u256_dec};
use crate::chain::{treasury, RpcConnectionManager};
use crate::config::{DistributionConfig, Settings};
use crate::error::{DispersalError, DispersalResult};
use crate::intent::intent_ref;
use crate::metrics;
use crate::tx::{SubmittedTx, TransactionExecutor, TxRequest};

use dashmap::DashMap;
use ethers::types::{Address, H256, U256};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One leg to pay out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionRequest {
    pub chain_id: u64,
    pub recipient: Address,
    pub amount: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DistributionOutcome {
    Confirmed,
    /// Broadcast, but no receipt before the confirmation timeout
    Unconfirmed,
    Failed,
}

impl DistributionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistributionOutcome::Confirmed => "confirmed",
            DistributionOutcome::Unconfirmed => "unconfirmed",
            DistributionOutcome::Failed => "failed",
        }
    }
}

/// Outcome of one leg; failures are values, not errors
#[derive(Debug, Clone, Serialize)]
pub struct DistributionResult {
    pub chain_id: u64,
    pub intent_id: String,
    pub outcome: DistributionOutcome,
    pub failure_reason: Option<String>,
    pub tx_hash: Option<String>,
    pub block_number: Option<u64>,
    pub confirmations: Option<u64>,
    pub error: Option<String>,
}

impl DistributionResult {
    fn failed(chain_id: u64, intent_id: &str, err: &DispersalError) -> Self {
        Self {
            chain_id,
            intent_id: intent_id.to_string(),
            outcome: DistributionOutcome::Failed,
            failure_reason: Some(err.kind().to_uppercase()),
            tx_hash: None,
            block_number: None,
            confirmations: None,
            error: Some(err.to_string()),
        }
    }

    fn with_tx_hash(mut self, tx_hash: H256) -> Self {
        self.tx_hash = Some(format!("{:?}", tx_hash));
        self
    }

    pub fn is_confirmed(&self) -> bool {
        self.outcome == DistributionOutcome::Confirmed
    }
}

/// Per-chain liquidity verdict
#[derive(Debug, Clone, Serialize)]
pub struct LiquidityCheck {
    pub chain_id: u64,
    #[serde(with = "u256_dec")]
    pub required: U256,
    pub available: Option<String>,
    pub sufficient: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiquidityReport {
    pub sufficient: bool,
    pub chains: Vec<LiquidityCheck>,
}

/// Treasury balance snapshot for one chain
#[derive(Debug, Clone, Serialize)]
pub struct TreasuryBalance {
    pub chain_id: u64,
    pub name: String,
    pub treasury: String,
    /// Base units as a decimal string
    pub balance: Option<String>,
    /// Whole native units, for humans
    pub balance_display: Option<String>,
    pub error: Option<String>,
    pub tokens: Vec<TokenBalance>,
}

/// ERC-20 holding of a treasury
#[derive(Debug, Clone, Serialize)]
pub struct TokenBalance {
    pub token: String,
    pub balance: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ChainStats {
    pub attempts: u64,
    pub confirmed: u64,
    pub unconfirmed: u64,
    pub failed: u64,
}

impl ChainStats {
    pub fn failure_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.failed as f64 / self.attempts as f64
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CoordinatorMetrics {
    pub total_attempts: u64,
    pub total_confirmed: u64,
    pub total_unconfirmed: u64,
    pub total_failed: u64,
    pub chains: BTreeMap<u64, ChainStats>,
}

struct TreasuryTarget {
    name: String,
    address: Address,
    native_decimals: u8,
    tokens: Vec<Address>,
}

/// Validates treasury liquidity and fans distributions out per chain
pub struct DistributionCoordinator {
    rpc: Arc<RpcConnectionManager>,
    executor: Arc<TransactionExecutor>,
    alerts: Arc<AlertManager>,
    treasuries: BTreeMap<u64, TreasuryTarget>,
    stats: DashMap<u64, ChainStats>,
    config: DistributionConfig,
}

impl DistributionCoordinator {
    pub fn new(
        settings: &Settings,
        rpc: Arc<RpcConnectionManager>,
        executor: Arc<TransactionExecutor>,
        alerts: Arc<AlertManager>,
    ) -> DispersalResult<Self> {
        let mut treasuries = BTreeMap::new();
        for chain in settings.enabled_chains() {
            let tokens = chain
                .token_addresses
                .iter()
                .map(|t| parse_address(t))
                .collect::<DispersalResult<Vec<_>>>()?;
            treasuries.insert(
                chain.chain_id,
                TreasuryTarget {
                    name: chain.name.clone(),
                    address: parse_address(&chain.treasury_address)?,
                    native_decimals: chain.native_decimals,
                    tokens,
                },
            );
        }

        Ok(Self {
            rpc,
            executor,
            alerts,
            treasuries,
            stats: DashMap::new(),
            config: settings.distribution.clone(),
        })
    }

    fn treasury(&self, chain_id: u64) -> DispersalResult<&TreasuryTarget> {
        self.treasuries
            .get(&chain_id)
            .ok_or(DispersalError::ChainNotFound { chain_id })
    }

    async fn native_balance(&self, chain_id: u64) -> DispersalResult<U256> {
        let target = self.treasury(chain_id)?;
        let client = self.rpc.get_connection(chain_id).await?;
        let balance = treasury::native_balance(client.as_ref(), chain_id, target.address).await?;

        let display = display_units(balance, target.native_decimals);
        if let Ok(value) = display.parse::<f64>() {
            metrics::record_treasury_balance(chain_id, value);
        }
        Ok(balance)
    }

    /// Per-chain comparison of required totals against treasury balances
    pub async fn liquidity_report(&self, requests: &[DistributionRequest]) -> LiquidityReport {
        let mut required: BTreeMap<u64, U256> = BTreeMap::new();
        for request in requests {
            let total = required.entry(request.chain_id).or_default();
            *total = total.saturating_add(request.amount);
        }

        let checks = join_all(
            required
                .into_iter()
                .map(|(chain_id, need)| self.check_chain_liquidity(chain_id, need)),
        )
        .await;

        LiquidityReport {
            sufficient: checks.iter().all(|c| c.sufficient),
            chains: checks,
        }
    }

    async fn check_chain_liquidity(&self, chain_id: u64, required: U256) -> LiquidityCheck {
        let balance = match self.native_balance(chain_id).await {
            Ok(balance) => balance,
            Err(e) => {
                self.alerts.emit(
                    self.alerts
                        .critical(
                            "Treasury balance unavailable",
                            format!("Could not read treasury balance on chain {}: {}", chain_id, e),
                        )
                        .with_chain(chain_id),
                );
                return LiquidityCheck {
                    chain_id,
                    required,
                    available: None,
                    sufficient: false,
                    error: Some(e.to_string()),
                };
            }
        };

        let sufficient = balance >= required;
        if !sufficient {
            self.alerts.emit(
                self.alerts
                    .critical(
                        "Insufficient treasury liquidity",
                        format!(
                            "Chain {} treasury holds {} but {} is required",
                            chain_id, balance, required
                        ),
                    )
                    .with_chain(chain_id),
            );
        } else if balance < required.saturating_mul(U256::from(self.config.low_liquidity_multiplier)) {
            self.alerts.emit(
                self.alerts
                    .warning(
                        "Low treasury liquidity",
                        format!(
                            "Chain {} treasury holds {}, under {}x the {} required",
                            chain_id, balance, self.config.low_liquidity_multiplier, required
                        ),
                    )
                    .with_chain(chain_id),
            );
        }

        debug!(chain_id, "Liquidity {} available, {} required", balance, required);
        LiquidityCheck {
            chain_id,
            required,
            available: Some(balance.to_string()),
            sufficient,
            error: None,
        }
    }

    /// Every chain's treasury can cover its summed requests
    pub async fn validate_liquidity(&self, requests: &[DistributionRequest]) -> bool {
        self.liquidity_report(requests).await.sufficient
    }

    /// Broadcast `distribute(recipient, amount, intentRef)` without waiting
    pub async fn submit_distribution(
        &self,
        request: &DistributionRequest,
        intent_id: &str,
    ) -> Result<SubmittedTx, DistributionResult> {
        let chain_id = request.chain_id;
        let submitted = async {
            let target = self.treasury(chain_id)?;
            let data = treasury::encode_distribute(
                request.recipient,
                request.amount,
                intent_ref(intent_id)?,
            );
            self.executor
                .submit(chain_id, TxRequest::call(target.address, data))
                .await
        }
        .await;

        submitted.map_err(|e| self.record_failure(chain_id, intent_id, &e, None))
    }

    /// Wait for a broadcast distribution and classify the outcome
    pub async fn confirm_distribution(
        &self,
        chain_id: u64,
        intent_id: &str,
        tx_hash: H256,
    ) -> DistributionResult {
        let confirmed = match self.executor.required_confirmations(chain_id) {
            Ok(confirmations) => {
                self.executor
                    .wait_for_confirmation(
                        chain_id,
                        tx_hash,
                        confirmations,
                        self.executor.confirmation_timeout(),
                    )
                    .await
            }
            Err(e) => Err(e),
        };

        match confirmed {
            Ok(confirmed) => {
                self.record_outcome(chain_id, DistributionOutcome::Confirmed);
                self.alerts.emit(
                    self.alerts
                        .info(
                            "Distribution confirmed",
                            format!(
                                "Chain {} distribution confirmed in block {}",
                                chain_id, confirmed.block_number
                            ),
                        )
                        .with_chain(chain_id)
                        .with_intent(intent_id),
                );
                DistributionResult {
                    chain_id,
                    intent_id: intent_id.to_string(),
                    outcome: DistributionOutcome::Confirmed,
                    failure_reason: None,
                    tx_hash: Some(format!("{:?}", tx_hash)),
                    block_number: Some(confirmed.block_number),
                    confirmations: Some(confirmed.confirmations),
                    error: None,
                }
            }
            Err(e @ DispersalError::ConfirmationTimeout { .. }) => {
                self.record_outcome(chain_id, DistributionOutcome::Unconfirmed);
                self.alerts.emit(
                    self.alerts
                        .warning("Distribution unconfirmed", e.to_string())
                        .with_chain(chain_id)
                        .with_intent(intent_id),
                );
                DistributionResult {
                    chain_id,
                    intent_id: intent_id.to_string(),
                    outcome: DistributionOutcome::Unconfirmed,
                    failure_reason: Some(e.kind().to_uppercase()),
                    tx_hash: Some(format!("{:?}", tx_hash)),
                    block_number: None,
                    confirmations: None,
                    error: Some(e.to_string()),
                }
            }
            Err(e) => self.record_failure(chain_id, intent_id, &e, Some(tx_hash)),
        }
    }

    /// Submit and confirm one leg
    pub async fn distribute_to_chain(
        &self,
        chain_id: u64,
        recipient: Address,
        amount: U256,
        intent_id: &str,
    ) -> DistributionResult {
        let request = DistributionRequest {
            chain_id,
            recipient,
            amount,
        };
        match self.submit_distribution(&request, intent_id).await {
            Ok(submitted) => {
                self.confirm_distribution(chain_id, intent_id, submitted.tx_hash)
                    .await
            }
            Err(result) => result,
        }
    }

    /// Liquidity check, then every leg concurrently. Partial success is final.
    pub async fn distribute_multi_chain(
        &self,
        requests: &[DistributionRequest],
        intent_id: &str,
    ) -> Vec<DistributionResult> {
        let report = self.liquidity_report(requests).await;
        if !report.sufficient {
            warn!(
                intent_id,
                "Liquidity check failed, dispatching none of {} distributions",
                requests.len()
            );
            return requests
                .iter()
                .map(|r| self.liquidity_failure(r.chain_id, intent_id, &report))
                .collect();
        }

        info!(intent_id, "Dispatching {} distributions", requests.len());
        join_all(requests.iter().map(|r| {
            self.distribute_to_chain(r.chain_id, r.recipient, r.amount, intent_id)
        }))
        .await
    }

    /// Failed result for a leg refused by the liquidity check. The leg's own
    /// chain is reported when it is short, otherwise the first short chain.
    pub fn liquidity_failure(
        &self,
        chain_id: u64,
        intent_id: &str,
        report: &LiquidityReport,
    ) -> DistributionResult {
        let short = report
            .chains
            .iter()
            .filter(|c| !c.sufficient)
            .find(|c| c.chain_id == chain_id)
            .or_else(|| report.chains.iter().find(|c| !c.sufficient));

        let err = match short {
            Some(check) => DispersalError::InsufficientLiquidity {
                chain_id: check.chain_id,
                have: check
                    .available
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
                need: check.required.to_string(),
            },
            None => DispersalError::Internal(format!(
                "Liquidity refused for chain {} without a short chain",
                chain_id
            )),
        };
        DistributionResult::failed(chain_id, intent_id, &err)
    }

    fn record_failure(
        &self,
        chain_id: u64,
        intent_id: &str,
        err: &DispersalError,
        tx_hash: Option<H256>,
    ) -> DistributionResult {
        self.record_outcome(chain_id, DistributionOutcome::Failed);
        self.alerts.emit(
            self.alerts
                .critical(
                    "Distribution failed",
                    format!("Chain {} distribution failed: {}", chain_id, err),
                )
                .with_chain(chain_id)
                .with_intent(intent_id),
        );

        let result = DistributionResult::failed(chain_id, intent_id, err);
        match tx_hash {
            Some(hash) => result.with_tx_hash(hash),
            None => result,
        }
    }

    fn record_outcome(&self, chain_id: u64, outcome: DistributionOutcome) {
        metrics::record_distribution(chain_id, outcome.as_str());

        let snapshot = {
            let mut stats = self.stats.entry(chain_id).or_default();
            stats.attempts += 1;
            match outcome {
                DistributionOutcome::Confirmed => stats.confirmed += 1,
                DistributionOutcome::Unconfirmed => stats.unconfirmed += 1,
                DistributionOutcome::Failed => stats.failed += 1,
            }
            *stats
        };

        if let Some(alert) = self.escalation(chain_id, &snapshot) {
            self.alerts.emit(alert);
        }
    }

    fn escalation(&self, chain_id: u64, stats: &ChainStats) -> Option<Alert> {
        if stats.attempts < self.config.escalation_min_attempts {
            return None;
        }
        let rate = stats.failure_rate();
        let message = format!(
            "Chain {} failure rate {:.0}% over {} attempts",
            chain_id,
            rate * 100.0,
            stats.attempts
        );
        let alert = if rate > self.config.critical_failure_rate {
            self.alerts.critical("Distribution failure rate critical", message)
        } else if rate > self.config.warning_failure_rate {
            self.alerts.warning("Distribution failure rate elevated", message)
        } else {
            return None;
        };
        Some(alert.with_chain(chain_id))
    }

    async fn token_balances(&self, chain_id: u64, target: &TreasuryTarget) -> Vec<TokenBalance> {
        if target.tokens.is_empty() {
            return Vec::new();
        }
        let client = match self.rpc.get_connection(chain_id).await {
            Ok(client) => client,
            Err(e) => {
                return target
                    .tokens
                    .iter()
                    .map(|token| TokenBalance {
                        token: format!("{:?}", token),
                        balance: None,
                        error: Some(e.to_string()),
                    })
                    .collect()
            }
        };

        join_all(target.tokens.iter().map(|token| {
            let client = client.clone();
            async move {
                let result =
                    treasury::token_balance(client.as_ref(), chain_id, target.address, *token).await;
                let (balance, error) = match result {
                    Ok(b) => (Some(b.to_string()), None),
                    Err(e) => (None, Some(e.to_string())),
                };
                TokenBalance {
                    token: format!("{:?}", token),
                    balance,
                    error,
                }
            }
        }))
        .await
    }

    /// Native and token balances of every configured treasury
    pub async fn get_all_treasury_balances(&self) -> Vec<TreasuryBalance> {
        join_all(self.treasuries.iter().map(|(chain_id, target)| async move {
            let balance = self.native_balance(*chain_id).await;
            let tokens = self.token_balances(*chain_id, target).await;
            let (balance, balance_display, error) = match balance {
                Ok(b) => (
                    Some(b.to_string()),
                    Some(display_units(b, target.native_decimals)),
                    None,
                ),
                Err(e) => (None, None, Some(e.to_string())),
            };
            TreasuryBalance {
                chain_id: *chain_id,
                name: target.name.clone(),
                treasury: format!("{:?}", target.address),
                balance,
                balance_display,
                error,
                tokens,
            }
        }))
        .await
    }

    pub fn metrics(&self) -> CoordinatorMetrics {
        let chains: BTreeMap<u64, ChainStats> =
            self.stats.iter().map(|e| (*e.key(), *e.value())).collect();
        let sum = |f: fn(&ChainStats) -> u64| -> u64 { chains.values().map(f).sum() };

        CoordinatorMetrics {
            total_attempts: sum(|s| s.attempts),
            total_confirmed: sum(|s| s.confirmed),
            total_unconfirmed: sum(|s| s.unconfirmed),
            total_failed: sum(|s| s.failed),
            chains,
        }
    }

    pub fn chain_ids(&self) -> Vec<u64> {
        self.treasuries.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertSeverity;
    use crate::intent::derive_intent_id;
    use crate::testing::{one_ether, Harness};
    use std::sync::Mutex;

    fn collect_alerts(harness: &Harness) -> Arc<Mutex<Vec<Alert>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        harness
            .alerts
            .on_alert(move |alert| sink.lock().unwrap().push(alert.clone()));
        seen
    }

    fn intent_id() -> String {
        derive_intent_id(1, "0xdeposit")
    }

    fn request(chain_id: u64, tenths: u64) -> DistributionRequest {
        DistributionRequest {
            chain_id,
            recipient: Address::repeat_byte(0x55),
            amount: one_ether() * tenths / 10,
        }
    }

    #[tokio::test]
    async fn test_validate_liquidity_sums_per_chain() {
        let harness = Harness::new(&[114]);
        let requests = [request(114, 10), request(114, 20)];

        harness.fake(114).set_treasury_balance(one_ether() * 25 / 10);
        assert!(!harness.coordinator.validate_liquidity(&requests).await);

        harness.fake(114).set_treasury_balance(one_ether() * 35 / 10);
        assert!(harness.coordinator.validate_liquidity(&requests).await);
    }

    #[tokio::test]
    async fn test_liquidity_alert_severities() {
        let harness = Harness::new(&[114]);
        let alerts = collect_alerts(&harness);
        let requests = [request(114, 10)];

        // 1.5x the requirement: warning only
        harness.fake(114).set_treasury_balance(one_ether() * 15 / 10);
        assert!(harness.coordinator.validate_liquidity(&requests).await);
        assert_eq!(alerts.lock().unwrap().last().unwrap().severity, AlertSeverity::Warning);

        harness.fake(114).fail_treasury_balance(true);
        assert!(!harness.coordinator.validate_liquidity(&requests).await);
        let last = alerts.lock().unwrap().last().unwrap().clone();
        assert_eq!(last.severity, AlertSeverity::Critical);
        assert_eq!(last.chain_id, Some(114));
    }

    #[tokio::test]
    async fn test_distribute_to_chain_confirms() {
        let harness = Harness::new(&[114]);
        let alerts = collect_alerts(&harness);

        let result = harness
            .coordinator
            .distribute_to_chain(114, Address::repeat_byte(0x55), one_ether(), &intent_id())
            .await;

        assert_eq!(result.outcome, DistributionOutcome::Confirmed);
        assert!(result.tx_hash.is_some());
        assert!(result.block_number.is_some());
        assert_eq!(harness.fake(114).sent_count(), 1);
        assert!(alerts
            .lock()
            .unwrap()
            .iter()
            .any(|a| a.severity == AlertSeverity::Info));
        assert_eq!(harness.coordinator.metrics().total_confirmed, 1);
    }

    #[tokio::test]
    async fn test_revert_is_failed_with_critical_alert() {
        let harness = Harness::new(&[114]);
        let alerts = collect_alerts(&harness);
        harness.fake(114).set_revert(true);

        let result = harness
            .coordinator
            .distribute_to_chain(114, Address::repeat_byte(0x55), one_ether(), &intent_id())
            .await;

        assert_eq!(result.outcome, DistributionOutcome::Failed);
        assert_eq!(result.failure_reason.as_deref(), Some("REVERTED"));
        assert!(result.tx_hash.is_some());
        let alerts = alerts.lock().unwrap();
        let critical = alerts
            .iter()
            .find(|a| a.severity == AlertSeverity::Critical)
            .unwrap();
        assert_eq!(critical.intent_id.as_deref(), Some(intent_id().as_str()));
    }

    #[tokio::test]
    async fn test_timeout_is_unconfirmed_not_failure() {
        let harness = Harness::with_settings(&[114], |s| s.executor.confirmation_timeout_secs = 0);
        harness.fake(114).set_mining(false);

        let result = harness
            .coordinator
            .distribute_to_chain(114, Address::repeat_byte(0x55), one_ether(), &intent_id())
            .await;

        assert_eq!(result.outcome, DistributionOutcome::Unconfirmed);
        let metrics = harness.coordinator.metrics();
        assert_eq!(metrics.total_failed, 0);
        assert_eq!(metrics.total_unconfirmed, 1);
    }

    #[tokio::test]
    async fn test_multi_chain_refused_without_liquidity() {
        let harness = Harness::new(&[14, 114]);
        harness.fake(114).set_treasury_balance(U256::zero());

        let results = harness
            .coordinator
            .distribute_multi_chain(&[request(14, 10), request(114, 10)], &intent_id())
            .await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| {
            r.outcome == DistributionOutcome::Failed
                && r.failure_reason.as_deref() == Some("INSUFFICIENT_LIQUIDITY")
                && r.error.as_deref()
                    == Some("Insufficient liquidity on chain 114: have 0, need 1000000000000000000")
        }));
        assert_eq!(harness.fake(14).send_attempts(), 0);
        assert_eq!(harness.fake(114).send_attempts(), 0);
    }

    #[tokio::test]
    async fn test_multi_chain_partial_success() {
        let harness = Harness::new(&[14, 114]);
        harness.fake(114).set_revert(true);

        let results = harness
            .coordinator
            .distribute_multi_chain(&[request(14, 10), request(114, 10)], &intent_id())
            .await;

        assert_eq!(results[0].chain_id, 14);
        assert_eq!(results[0].outcome, DistributionOutcome::Confirmed);
        assert_eq!(results[1].outcome, DistributionOutcome::Failed);
        assert_eq!(harness.fake(114).send_attempts(), 1);
    }

    #[tokio::test]
    async fn test_moderate_failure_rate_warns() {
        let harness = Harness::new(&[114]);
        let alerts = collect_alerts(&harness);

        for attempt in 0..6 {
            // 2 of 6 attempts revert: 33%
            harness.fake(114).set_revert(attempt >= 4);
            harness
                .coordinator
                .distribute_to_chain(114, Address::repeat_byte(0x55), one_ether(), &intent_id())
                .await;
        }

        let alerts = alerts.lock().unwrap();
        let warnings: Vec<_> = alerts
            .iter()
            .filter(|a| a.title == "Distribution failure rate elevated")
            .collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].severity, AlertSeverity::Warning);
        assert_eq!(warnings[0].chain_id, Some(114));
        assert!(!alerts
            .iter()
            .any(|a| a.title == "Distribution failure rate critical"));

        let stats = harness.coordinator.metrics().chains[&114];
        assert_eq!(stats.attempts, 6);
        assert_eq!(stats.failed, 2);
    }

    #[tokio::test]
    async fn test_five_failures_escalate_to_critical() {
        let harness = Harness::new(&[114]);
        let alerts = collect_alerts(&harness);
        harness.fake(114).set_revert(true);

        for _ in 0..5 {
            harness
                .coordinator
                .distribute_to_chain(114, Address::repeat_byte(0x55), one_ether(), &intent_id())
                .await;
        }

        let alerts = alerts.lock().unwrap();
        let escalations: Vec<_> = alerts
            .iter()
            .filter(|a| a.title == "Distribution failure rate critical")
            .collect();
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].severity, AlertSeverity::Critical);
        assert_eq!(harness.coordinator.metrics().chains[&114].failed, 5);
    }

    #[tokio::test]
    async fn test_treasury_balances_report_errors_per_chain() {
        let harness = Harness::new(&[14, 114]);
        harness.fake(14).set_down(true);

        let balances = harness.coordinator.get_all_treasury_balances().await;
        assert_eq!(balances.len(), 2);
        assert!(balances[0].error.is_some());
        assert_eq!(balances[1].balance_display.as_deref(), Some("1000.000000000000000000"));
    }

    #[tokio::test]
    async fn test_treasury_balances_include_tokens() {
        let token = "0x2222222222222222222222222222222222222222";
        let harness = Harness::with_settings(&[114], |s| {
            for chain in s.chains.values_mut() {
                chain.token_addresses = vec![token.to_string()];
            }
        });
        harness.fake(114).set_token_balance(U256::from(5_000_000u64));

        let balances = harness.coordinator.get_all_treasury_balances().await;
        assert_eq!(balances[0].tokens.len(), 1);
        assert_eq!(balances[0].tokens[0].token, token);
        assert_eq!(balances[0].tokens[0].balance.as_deref(), Some("5000000"));
    }
}
