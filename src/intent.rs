//! Intent and per-chain distribution records
//!
//! An intent's overall status is derived from the statuses of its
//! per-chain distributions and is never set directly, apart from the
//! queued mark applied when dispersal is enqueued.

use crate::amount::u256_dec;
use crate::error::{DispersalError, DispersalResult};

use chrono::{DateTime, Utc};
use ethers::types::U256;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;

/// Status of one destination-chain leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DistributionStatus {
    NotStarted,
    Queued,
    Broadcasted,
    Confirmed,
    Failed,
}

impl DistributionStatus {
    fn rank(&self) -> u8 {
        match self {
            DistributionStatus::NotStarted => 0,
            DistributionStatus::Queued => 1,
            DistributionStatus::Broadcasted => 2,
            DistributionStatus::Confirmed | DistributionStatus::Failed => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DistributionStatus::Confirmed | DistributionStatus::Failed
        )
    }

    /// Forward-only; a broadcasted leg may be re-stamped in place
    pub fn can_transition_to(&self, next: DistributionStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() > self.rank()
            || (*self == DistributionStatus::Broadcasted && next == DistributionStatus::Broadcasted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DistributionStatus::NotStarted => "NOT_STARTED",
            DistributionStatus::Queued => "QUEUED",
            DistributionStatus::Broadcasted => "BROADCASTED",
            DistributionStatus::Confirmed => "CONFIRMED",
            DistributionStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> DispersalResult<Self> {
        match value {
            "NOT_STARTED" => Ok(DistributionStatus::NotStarted),
            "QUEUED" => Ok(DistributionStatus::Queued),
            "BROADCASTED" => Ok(DistributionStatus::Broadcasted),
            "CONFIRMED" => Ok(DistributionStatus::Confirmed),
            "FAILED" => Ok(DistributionStatus::Failed),
            other => Err(DispersalError::Internal(format!(
                "Unknown distribution status {}",
                other
            ))),
        }
    }
}

impl fmt::Display for DistributionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate status of an intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentStatus {
    DepositConfirmed,
    DisperseQueued,
    DisperseInProgress,
    Dispersed,
    Failed,
}

impl IntentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IntentStatus::Dispersed | IntentStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::DepositConfirmed => "DEPOSIT_CONFIRMED",
            IntentStatus::DisperseQueued => "DISPERSE_QUEUED",
            IntentStatus::DisperseInProgress => "DISPERSE_IN_PROGRESS",
            IntentStatus::Dispersed => "DISPERSED",
            IntentStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> DispersalResult<Self> {
        match value {
            "DEPOSIT_CONFIRMED" => Ok(IntentStatus::DepositConfirmed),
            "DISPERSE_QUEUED" => Ok(IntentStatus::DisperseQueued),
            "DISPERSE_IN_PROGRESS" => Ok(IntentStatus::DisperseInProgress),
            "DISPERSED" => Ok(IntentStatus::Dispersed),
            "FAILED" => Ok(IntentStatus::Failed),
            other => Err(DispersalError::Internal(format!(
                "Unknown intent status {}",
                other
            ))),
        }
    }
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive the aggregate status from per-chain statuses
pub fn aggregate_status<I>(current: IntentStatus, statuses: I) -> IntentStatus
where
    I: IntoIterator<Item = DistributionStatus>,
{
    let mut seen_any = false;
    let mut all_confirmed = true;
    let mut any_failed = false;
    let mut any_active = false;

    for status in statuses {
        seen_any = true;
        all_confirmed &= status == DistributionStatus::Confirmed;
        any_failed |= status == DistributionStatus::Failed;
        any_active |= matches!(
            status,
            DistributionStatus::Queued | DistributionStatus::Broadcasted
        );
    }

    if !seen_any {
        current
    } else if all_confirmed {
        IntentStatus::Dispersed
    } else if any_failed {
        IntentStatus::Failed
    } else if any_active {
        IntentStatus::DisperseInProgress
    } else {
        current
    }
}

/// One destination-chain leg of an intent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainDistribution {
    pub chain_id: u64,
    /// Lowercase 0x address
    pub recipient: String,
    #[serde(with = "u256_dec")]
    pub amount: U256,
    pub status: DistributionStatus,
    pub tx_hash: Option<String>,
    pub confirmations: u64,
    pub error: Option<String>,
    pub note: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ChainDistribution {
    pub fn new(chain_id: u64, recipient: String, amount: U256) -> Self {
        Self {
            chain_id,
            recipient,
            amount,
            status: DistributionStatus::NotStarted,
            tx_hash: None,
            confirmations: 0,
            error: None,
            note: None,
            updated_at: Utc::now(),
        }
    }

    /// Apply an update, rejecting backward moves
    pub fn apply(&mut self, update: &ChainUpdate) -> DispersalResult<()> {
        if !self.status.can_transition_to(update.status) {
            return Err(DispersalError::InvalidStateTransition {
                from: self.status.to_string(),
                to: update.status.to_string(),
            });
        }

        self.status = update.status;
        if let Some(hash) = &update.tx_hash {
            self.tx_hash = Some(hash.clone());
        }
        if let Some(confirmations) = update.confirmations {
            self.confirmations = confirmations;
        }
        if let Some(error) = &update.error {
            self.error = Some(error.clone());
        }
        if let Some(note) = &update.note {
            self.note = Some(note.clone());
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// A single per-chain status change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainUpdate {
    pub status: DistributionStatus,
    pub tx_hash: Option<String>,
    pub confirmations: Option<u64>,
    pub error: Option<String>,
    pub note: Option<String>,
}

impl ChainUpdate {
    pub fn status(status: DistributionStatus) -> Self {
        Self {
            status,
            tx_hash: None,
            confirmations: None,
            error: None,
            note: None,
        }
    }

    pub fn broadcasted(tx_hash: impl Into<String>) -> Self {
        Self {
            tx_hash: Some(tx_hash.into()),
            ..Self::status(DistributionStatus::Broadcasted)
        }
    }

    pub fn confirmed(tx_hash: impl Into<String>, confirmations: u64) -> Self {
        Self {
            tx_hash: Some(tx_hash.into()),
            confirmations: Some(confirmations),
            ..Self::status(DistributionStatus::Confirmed)
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::status(DistributionStatus::Failed)
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_tx_hash(mut self, tx_hash: impl Into<String>) -> Self {
        self.tx_hash = Some(tx_hash.into());
        self
    }
}

/// A logical multi-chain dispersal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub id: String,
    pub user_address: String,
    pub source_chain_id: u64,
    pub source_token: String,
    #[serde(with = "u256_dec")]
    pub source_amount: U256,
    pub deposit_tx_hash: String,
    pub usd_value: Decimal,
    pub status: IntentStatus,
    pub distributions: Vec<ChainDistribution>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Intent {
    pub fn distribution(&self, chain_id: u64) -> Option<&ChainDistribution> {
        self.distributions.iter().find(|d| d.chain_id == chain_id)
    }

    pub fn distribution_mut(&mut self, chain_id: u64) -> Option<&mut ChainDistribution> {
        self.distributions.iter_mut().find(|d| d.chain_id == chain_id)
    }

    /// Recompute the aggregate status; returns whether it changed
    pub fn recompute_status(&mut self) -> bool {
        let next = aggregate_status(self.status, self.distributions.iter().map(|d| d.status));
        let now = Utc::now();
        self.updated_at = now;

        if next == self.status {
            return false;
        }
        self.status = next;
        if next.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
        true
    }
}

/// Destination share of a deposit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub chain_id: u64,
    pub recipient: String,
    /// Basis points; a deposit's weights sum to 10_000
    pub weight_bps: u32,
}

/// A deposit already verified by the attestation layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedDeposit {
    pub source_chain_id: u64,
    pub deposit_tx_hash: String,
    pub user_address: String,
    pub token_address: String,
    pub token_decimals: u8,
    #[serde(with = "u256_dec")]
    pub amount: U256,
    /// Oracle feed pricing the deposited token, e.g. "USDC/USD"
    pub price_feed: String,
    pub allocations: Vec<Allocation>,
}

/// Deterministic intent id for a deposit
pub fn derive_intent_id(source_chain_id: u64, deposit_tx_hash: &str) -> String {
    let mut hasher = Keccak256::new();
    hasher.update(format!("{}:{}", source_chain_id, deposit_tx_hash.trim().to_lowercase()));
    format!("0x{}", hex::encode(hasher.finalize()))
}

/// 32-byte on-chain reference for an intent id
pub fn intent_ref(intent_id: &str) -> DispersalResult<[u8; 32]> {
    let raw = intent_id.strip_prefix("0x").unwrap_or(intent_id);
    let bytes = hex::decode(raw)
        .map_err(|e| DispersalError::Validation(format!("Intent id {} is not hex: {}", intent_id, e)))?;
    bytes.try_into().map_err(|_| {
        DispersalError::Validation(format!("Intent id {} is not 32 bytes", intent_id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use DistributionStatus::*;

    fn permutations(items: &[DistributionStatus]) -> Vec<Vec<DistributionStatus>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head);
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn test_aggregate_rules() {
        let current = IntentStatus::DisperseQueued;
        assert_eq!(aggregate_status(current, [Confirmed, Confirmed]), IntentStatus::Dispersed);
        assert_eq!(aggregate_status(current, [Confirmed, Failed]), IntentStatus::Failed);
        assert_eq!(aggregate_status(current, [Broadcasted, Failed]), IntentStatus::Failed);
        assert_eq!(
            aggregate_status(current, [Confirmed, Broadcasted]),
            IntentStatus::DisperseInProgress
        );
        assert_eq!(
            aggregate_status(current, [Queued, NotStarted]),
            IntentStatus::DisperseInProgress
        );
        assert_eq!(
            aggregate_status(IntentStatus::DepositConfirmed, [NotStarted, NotStarted]),
            IntentStatus::DepositConfirmed
        );
    }

    #[test]
    fn test_aggregate_is_order_independent() {
        let sets: [&[DistributionStatus]; 4] = [
            &[Confirmed, Failed, Broadcasted],
            &[Confirmed, Confirmed, Queued],
            &[Broadcasted, Queued, NotStarted],
            &[Confirmed, Confirmed, Confirmed],
        ];
        for set in sets {
            let expected = aggregate_status(IntentStatus::DisperseQueued, set.iter().copied());
            for order in permutations(set) {
                assert_eq!(
                    aggregate_status(IntentStatus::DisperseQueued, order),
                    expected
                );
            }
        }
    }

    #[test]
    fn test_transitions_are_monotonic() {
        assert!(NotStarted.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Failed));
        assert!(Broadcasted.can_transition_to(Broadcasted));
        assert!(!Broadcasted.can_transition_to(Queued));
        assert!(!Confirmed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Confirmed));
        assert!(!Queued.can_transition_to(Queued));
    }

    #[test]
    fn test_apply_rejects_regression() {
        let mut leg = ChainDistribution::new(14, "0xabc".to_string(), U256::from(1));
        leg.apply(&ChainUpdate::status(Queued)).unwrap();
        leg.apply(&ChainUpdate::broadcasted("0x01")).unwrap();

        let err = leg.apply(&ChainUpdate::status(Queued)).unwrap_err();
        assert!(matches!(err, DispersalError::InvalidStateTransition { .. }));
        assert_eq!(leg.status, Broadcasted);

        leg.apply(&ChainUpdate::broadcasted("0x02").with_note("rebroadcast"))
            .unwrap();
        assert_eq!(leg.tx_hash.as_deref(), Some("0x02"));
        assert_eq!(leg.note.as_deref(), Some("rebroadcast"));
    }

    #[test]
    fn test_intent_id_is_deterministic() {
        let a = derive_intent_id(114, "0xABCDEF");
        let b = derive_intent_id(114, "0xabcdef");
        let c = derive_intent_id(14, "0xabcdef");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(intent_ref(&a).unwrap().len(), 32);
        assert!(intent_ref("0x1234").is_err());
    }

    #[test]
    fn test_status_strings_round_trip() {
        for status in [NotStarted, Queued, Broadcasted, Confirmed, Failed] {
            assert_eq!(DistributionStatus::parse(status.as_str()).unwrap(), status);
        }
        assert_eq!(
            serde_json::to_string(&IntentStatus::DisperseInProgress).unwrap(),
            "\"DISPERSE_IN_PROGRESS\""
        );
    }
}
