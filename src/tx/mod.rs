//! Transaction submission module with nonce management and gas pricing

mod executor;
mod gas;
mod nonce;
mod wallet;

pub use executor::{classify_rpc_error, ConfirmedTx, SubmittedTx, TransactionExecutor, TxRequest};
pub use gas::{GasEstimator, GasPrice};
pub use nonce::NonceManager;
pub use wallet::SignerRegistry;
