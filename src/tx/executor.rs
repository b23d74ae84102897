//! Transaction executor with nonce-conflict recovery, backoff and confirmation polling

use super::gas::{GasEstimator, GasPrice};
use super::nonce::NonceManager;
use super::wallet::SignerRegistry;
use crate::chain::{RpcClient, RpcConnectionManager};
use crate::config::{ChainConfig, ExecutorConfig, Settings};
use crate::error::{DispersalError, DispersalResult};
use crate::retry::ExponentialBackoff;

use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const NONCE_CONFLICT_PATTERNS: &[&str] = &[
    "nonce too low",
    "nonce too high",
    "already known",
    "known transaction",
    "replacement transaction underpriced",
    "nonce has already been used",
];

const REJECTION_PATTERNS: &[&str] = &[
    "insufficient funds",
    "intrinsic gas too low",
    "execution reverted",
    "exceeds block gas limit",
];

/// A call to execute on a chain
#[derive(Debug, Clone)]
pub struct TxRequest {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    /// Skips estimation when set
    pub gas_limit: Option<U256>,
}

impl TxRequest {
    pub fn call(to: Address, data: Bytes) -> Self {
        Self {
            to,
            data,
            value: U256::zero(),
            gas_limit: None,
        }
    }
}

/// A transaction accepted by a node
#[derive(Debug, Clone)]
pub struct SubmittedTx {
    pub chain_id: u64,
    pub tx_hash: H256,
    pub nonce: u64,
    pub from: Address,
    pub gas_limit: U256,
    pub gas_price: GasPrice,
    /// Submission attempts including nonce-conflict retries
    pub attempts: u32,
    pub submitted_at: Instant,
}

/// A mined, successful transaction with enough confirmations
#[derive(Debug, Clone)]
pub struct ConfirmedTx {
    pub tx_hash: H256,
    pub block_number: u64,
    pub confirmations: u64,
    pub gas_used: Option<U256>,
    pub receipt: TransactionReceipt,
}

/// Map a node error message onto the failure taxonomy
pub fn classify_rpc_error(err: DispersalError) -> DispersalError {
    let (chain_id, message) = match &err {
        DispersalError::Rpc { chain_id, message } => (*chain_id, message.to_lowercase()),
        _ => return err,
    };

    if NONCE_CONFLICT_PATTERNS.iter().any(|p| message.contains(p)) {
        DispersalError::NonceConflict {
            chain_id,
            message: err_message(err),
        }
    } else if REJECTION_PATTERNS.iter().any(|p| message.contains(p)) {
        DispersalError::Rejected {
            chain_id,
            message: err_message(err),
        }
    } else {
        err
    }
}

fn err_message(err: DispersalError) -> String {
    match err {
        DispersalError::Rpc { message, .. } => message,
        other => other.to_string(),
    }
}

/// Submits and confirms transactions on any configured chain
pub struct TransactionExecutor {
    rpc: Arc<RpcConnectionManager>,
    signers: Arc<SignerRegistry>,
    nonces: NonceManager,
    gas: GasEstimator,
    chains: HashMap<u64, ChainConfig>,
    config: ExecutorConfig,
}

impl TransactionExecutor {
    pub fn new(
        settings: &Settings,
        rpc: Arc<RpcConnectionManager>,
        signers: Arc<SignerRegistry>,
    ) -> Self {
        let chains = settings
            .enabled_chains()
            .into_iter()
            .map(|c| (c.chain_id, c.clone()))
            .collect();

        Self {
            rpc,
            signers,
            nonces: NonceManager::new(),
            gas: GasEstimator::new(&settings.executor),
            chains,
            config: settings.executor.clone(),
        }
    }

    fn chain(&self, chain_id: u64) -> DispersalResult<&ChainConfig> {
        self.chains
            .get(&chain_id)
            .ok_or(DispersalError::ChainNotFound { chain_id })
    }

    /// Fails when a chain cannot be submitted to at all
    pub fn ensure_ready(&self, chain_id: u64) -> DispersalResult<()> {
        self.chain(chain_id)?;
        self.signers.signer(chain_id)?;
        Ok(())
    }

    pub fn required_confirmations(&self, chain_id: u64) -> DispersalResult<u64> {
        self.chain(chain_id).map(|c| c.confirmations())
    }

    pub fn confirmation_timeout(&self) -> Duration {
        self.config.confirmation_timeout()
    }

    /// Submit and wait for the chain's confirmation count
    pub async fn execute(&self, chain_id: u64, request: TxRequest) -> DispersalResult<ConfirmedTx> {
        let submitted = self.submit(chain_id, request).await?;
        let confirmations = self.required_confirmations(chain_id)?;
        self.wait_for_confirmation(
            chain_id,
            submitted.tx_hash,
            confirmations,
            self.config.confirmation_timeout(),
        )
        .await
    }

    /// Sign and broadcast, retrying nonce conflicts and transient failures
    pub async fn submit(&self, chain_id: u64, request: TxRequest) -> DispersalResult<SubmittedTx> {
        let chain = self.chain(chain_id)?;
        let wallet = self.signers.signer(chain_id)?;
        let from = wallet.address();

        let mut backoff = ExponentialBackoff::from_millis(
            self.config.retry_initial_delay_ms,
            self.config.retry_max_delay_ms,
        );
        let mut transient_failures = 0u32;
        let mut nonce_retries = 0u32;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.try_submit(chain, wallet, &request).await {
                Ok(mut submitted) => {
                    submitted.attempts = attempts;
                    return Ok(submitted);
                }
                Err(err @ DispersalError::NonceConflict { .. }) => {
                    self.nonces.invalidate(chain_id, from).await;
                    if nonce_retries >= self.config.max_nonce_retries {
                        error!("Chain {} nonce conflicts persisted: {}", chain_id, err);
                        crate::metrics::record_tx_failed(chain_id, err.kind());
                        return Err(err);
                    }
                    nonce_retries += 1;
                    crate::metrics::record_tx_retry(chain_id, err.kind());
                    warn!(
                        "Nonce conflict on chain {}, retrying with fresh nonce ({}/{})",
                        chain_id, nonce_retries, self.config.max_nonce_retries
                    );
                }
                Err(err) if err.is_retryable() => {
                    transient_failures += 1;
                    if transient_failures >= self.config.max_attempts {
                        error!(
                            "Chain {} submission failed after {} attempts: {}",
                            chain_id, transient_failures, err
                        );
                        crate::metrics::record_tx_failed(chain_id, err.kind());
                        return Err(err);
                    }
                    let delay = backoff.next_delay();
                    crate::metrics::record_tx_retry(chain_id, err.kind());
                    warn!(
                        "Chain {} submission attempt {}/{} failed, retrying in {:?}: {}",
                        chain_id, transient_failures, self.config.max_attempts, delay, err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!("Chain {} submission rejected: {}", chain_id, err);
                    crate::metrics::record_tx_failed(chain_id, err.kind());
                    return Err(err);
                }
            }
        }
    }

    /// One attempt; an unbroadcast nonce is handed back
    async fn try_submit(
        &self,
        chain: &ChainConfig,
        wallet: &LocalWallet,
        request: &TxRequest,
    ) -> DispersalResult<SubmittedTx> {
        let chain_id = chain.chain_id;
        let from = wallet.address();
        let client = self.rpc.get_connection(chain_id).await?;
        let nonce = self.nonces.acquire(chain_id, from, client.as_ref()).await?;

        match self
            .sign_and_send(chain, wallet, client.as_ref(), request, nonce)
            .await
        {
            Ok(submitted) => Ok(submitted),
            Err(err) => {
                if !matches!(err, DispersalError::NonceConflict { .. }) {
                    self.nonces.release(chain_id, from, nonce).await;
                }
                Err(err)
            }
        }
    }

    async fn sign_and_send(
        &self,
        chain: &ChainConfig,
        wallet: &LocalWallet,
        client: &dyn RpcClient,
        request: &TxRequest,
        nonce: u64,
    ) -> DispersalResult<SubmittedTx> {
        let chain_id = chain.chain_id;
        let from = wallet.address();

        let gas_limit = match request.gas_limit {
            Some(limit) => limit,
            None => {
                let probe: TypedTransaction = TransactionRequest::new()
                    .from(from)
                    .to(request.to)
                    .data(request.data.clone())
                    .value(request.value)
                    .nonce(nonce)
                    .into();
                let estimate = client
                    .estimate_gas(&probe)
                    .await
                    .map_err(|e| match classify_rpc_error(e) {
                        DispersalError::Rpc { chain_id, message } => {
                            DispersalError::GasEstimation { chain_id, message }
                        }
                        other => other,
                    })?;
                self.gas.buffered_limit(estimate)
            }
        };

        let gas_price = self.gas.gas_price(chain, client).await?;
        let tx = build_tx(chain_id, from, request, nonce, gas_limit, &gas_price);

        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| DispersalError::Wallet(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);

        let tx_hash = timeout(
            self.config.submission_timeout(),
            client.send_raw_transaction(raw),
        )
        .await
        .map_err(|_| DispersalError::Timeout {
            operation: format!("broadcast on chain {}", chain_id),
        })?
        .map_err(classify_rpc_error)?;

        crate::metrics::record_tx_submitted(chain_id);
        info!(
            chain_id,
            tx_hash = ?tx_hash,
            "Transaction sent on chain {} with nonce {}",
            chain_id,
            nonce
        );

        Ok(SubmittedTx {
            chain_id,
            tx_hash,
            nonce,
            from,
            gas_limit,
            gas_price,
            attempts: 1,
            submitted_at: Instant::now(),
        })
    }

    /// Poll for a receipt until it has `confirmations` blocks or `wait` elapses
    pub async fn wait_for_confirmation(
        &self,
        chain_id: u64,
        tx_hash: H256,
        confirmations: u64,
        wait: Duration,
    ) -> DispersalResult<ConfirmedTx> {
        let started = Instant::now();
        let poll_interval = self.config.poll_interval();

        let polled = timeout(wait, async {
            loop {
                match self.poll_receipt(chain_id, tx_hash, confirmations).await {
                    Ok(Some(confirmed)) => return Ok(confirmed),
                    Ok(None) => {}
                    Err(err @ DispersalError::TransactionReverted { .. }) => return Err(err),
                    Err(err) => {
                        warn!("Receipt poll for {:?} on chain {} failed: {}", tx_hash, chain_id, err);
                    }
                }
                tokio::time::sleep(poll_interval).await;
            }
        })
        .await;

        match polled {
            Ok(Ok(confirmed)) => {
                crate::metrics::record_tx_confirmed(chain_id, started.elapsed().as_secs_f64());
                info!(
                    chain_id,
                    tx_hash = ?tx_hash,
                    "Transaction confirmed in block {} ({} confirmations)",
                    confirmed.block_number,
                    confirmed.confirmations
                );
                Ok(confirmed)
            }
            Ok(Err(err)) => {
                error!(chain_id, tx_hash = ?tx_hash, "Transaction reverted on chain {}", chain_id);
                crate::metrics::record_tx_failed(chain_id, err.kind());
                Err(err)
            }
            Err(_) => {
                warn!(
                    chain_id,
                    tx_hash = ?tx_hash,
                    "No confirmation on chain {} after {:?}",
                    chain_id,
                    wait
                );
                Err(DispersalError::ConfirmationTimeout {
                    chain_id,
                    tx_hash: format!("{:?}", tx_hash),
                    waited_secs: wait.as_secs(),
                })
            }
        }
    }

    async fn poll_receipt(
        &self,
        chain_id: u64,
        tx_hash: H256,
        required: u64,
    ) -> DispersalResult<Option<ConfirmedTx>> {
        let client = self.rpc.get_connection(chain_id).await?;
        let Some(receipt) = client.transaction_receipt(tx_hash).await? else {
            debug!("No receipt yet for {:?} on chain {}", tx_hash, chain_id);
            return Ok(None);
        };

        if receipt.status == Some(U64::zero()) {
            return Err(DispersalError::TransactionReverted {
                chain_id,
                tx_hash: format!("{:?}", tx_hash),
            });
        }

        let Some(mined_in) = receipt.block_number.map(|b| b.as_u64()) else {
            return Ok(None);
        };
        let head = client.block_number().await?;
        let confirmations = head.saturating_sub(mined_in) + 1;
        if confirmations < required {
            debug!(
                "{:?} on chain {} has {}/{} confirmations",
                tx_hash, chain_id, confirmations, required
            );
            return Ok(None);
        }

        Ok(Some(ConfirmedTx {
            tx_hash,
            block_number: mined_in,
            confirmations,
            gas_used: receipt.gas_used,
            receipt,
        }))
    }

    /// Signer address for a chain
    pub fn signer_address(&self, chain_id: u64) -> DispersalResult<Address> {
        self.signers.address(chain_id)
    }
}

fn build_tx(
    chain_id: u64,
    from: Address,
    request: &TxRequest,
    nonce: u64,
    gas_limit: U256,
    gas_price: &GasPrice,
) -> TypedTransaction {
    match gas_price {
        GasPrice::Legacy(price) => TransactionRequest::new()
            .from(from)
            .to(request.to)
            .data(request.data.clone())
            .value(request.value)
            .nonce(nonce)
            .gas(gas_limit)
            .gas_price(*price)
            .chain_id(chain_id)
            .into(),
        GasPrice::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => Eip1559TransactionRequest::new()
            .from(from)
            .to(request.to)
            .data(request.data.clone())
            .value(request.value)
            .nonce(nonce)
            .gas(gas_limit)
            .max_fee_per_gas(*max_fee_per_gas)
            .max_priority_fee_per_gas(*max_priority_fee_per_gas)
            .chain_id(chain_id)
            .into(),
    }
}
