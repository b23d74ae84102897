//! Error types for the dispersal relayer

use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum DispersalError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("No healthy RPC endpoint for chain {chain_id}")]
    RpcUnavailable { chain_id: u64 },

    #[error("RPC error on chain {chain_id}: {message}")]
    Rpc { chain_id: u64, message: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Nonce conflict on chain {chain_id}: {message}")]
    NonceConflict { chain_id: u64, message: String },

    #[error("Transaction rejected by chain {chain_id}: {message}")]
    Rejected { chain_id: u64, message: String },

    #[error("Transaction {tx_hash} reverted on chain {chain_id}")]
    TransactionReverted { chain_id: u64, tx_hash: String },

    #[error("No confirmation for {tx_hash} on chain {chain_id} after {waited_secs}s")]
    ConfirmationTimeout {
        chain_id: u64,
        tx_hash: String,
        waited_secs: u64,
    },

    #[error("Gas estimation error on chain {chain_id}: {message}")]
    GasEstimation { chain_id: u64, message: String },

    #[error("Price unavailable for feed {feed_id}: {message}")]
    PriceUnavailable { feed_id: String, message: String },

    #[error("Insufficient liquidity on chain {chain_id}: have {have}, need {need}")]
    InsufficientLiquidity {
        chain_id: u64,
        have: String,
        need: String,
    },

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Chain {chain_id} not configured")]
    ChainNotFound { chain_id: u64 },

    #[error("Intent {intent_id} not found")]
    IntentNotFound { intent_id: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispersalError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispersalError::RpcUnavailable { .. }
                | DispersalError::Rpc { .. }
                | DispersalError::NonceConflict { .. }
                | DispersalError::GasEstimation { .. }
                | DispersalError::Timeout { .. }
        )
    }

    /// Stable label for metrics and persisted failure reasons
    pub fn kind(&self) -> &'static str {
        match self {
            DispersalError::Config(_) => "configuration",
            DispersalError::Database(_) => "database",
            DispersalError::RpcUnavailable { .. } => "rpc_unavailable",
            DispersalError::Rpc { .. } => "rpc",
            DispersalError::Validation(_) => "validation",
            DispersalError::NonceConflict { .. } => "nonce_conflict",
            DispersalError::Rejected { .. } => "rejected",
            DispersalError::TransactionReverted { .. } => "reverted",
            DispersalError::ConfirmationTimeout { .. } => "confirmation_timeout",
            DispersalError::GasEstimation { .. } => "gas_estimation",
            DispersalError::PriceUnavailable { .. } => "price_unavailable",
            DispersalError::InsufficientLiquidity { .. } => "insufficient_liquidity",
            DispersalError::Wallet(_) => "wallet",
            DispersalError::Timeout { .. } => "timeout",
            DispersalError::ChainNotFound { .. } => "chain_not_found",
            DispersalError::IntentNotFound { .. } => "intent_not_found",
            DispersalError::InvalidStateTransition { .. } => "invalid_transition",
            DispersalError::Internal(_) => "internal",
        }
    }
}

/// Result type for relayer operations
pub type DispersalResult<T> = Result<T, DispersalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revert_is_not_retryable() {
        let err = DispersalError::TransactionReverted {
            chain_id: 1,
            tx_hash: "0xabc".to_string(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "reverted");
    }

    #[test]
    fn test_confirmation_timeout_is_not_retryable() {
        let err = DispersalError::ConfirmationTimeout {
            chain_id: 1,
            tx_hash: "0xabc".to_string(),
            waited_secs: 300,
        };
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "confirmation_timeout");
    }

    #[test]
    fn test_insufficient_liquidity_label() {
        let err = DispersalError::InsufficientLiquidity {
            chain_id: 14,
            have: "1".to_string(),
            need: "2".to_string(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.kind().to_uppercase(), "INSUFFICIENT_LIQUIDITY");
        assert_eq!(err.to_string(), "Insufficient liquidity on chain 14: have 1, need 2");
    }

    #[test]
    fn test_nonce_conflict_is_retryable() {
        let err = DispersalError::NonceConflict {
            chain_id: 14,
            message: "nonce too low".to_string(),
        };
        assert!(err.is_retryable());
        assert!(!err.is_terminal());
    }
}
