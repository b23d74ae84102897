//! JSON-RPC client seam
//!
//! Everything above this module talks to chains through [`RpcClient`], so
//! endpoints can be swapped for in-process fakes in tests.

use crate::error::{DispersalError, DispersalResult};

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, BlockNumber, Bytes, TransactionReceipt, H256, U256};
use std::sync::Arc;
use std::time::Duration;

/// Operations the relayer needs from one RPC endpoint
#[async_trait]
pub trait RpcClient: Send + Sync {
    fn url(&self) -> &str;

    async fn block_number(&self) -> DispersalResult<u64>;

    /// Transaction count including the pending pool
    async fn pending_nonce(&self, address: Address) -> DispersalResult<u64>;

    /// Base fee of the latest block, if the chain has one
    async fn base_fee(&self) -> DispersalResult<Option<U256>>;

    async fn gas_price(&self) -> DispersalResult<U256>;

    async fn estimate_gas(&self, tx: &TypedTransaction) -> DispersalResult<U256>;

    async fn call(&self, tx: &TypedTransaction) -> DispersalResult<Bytes>;

    async fn send_raw_transaction(&self, raw: Bytes) -> DispersalResult<H256>;

    async fn transaction_receipt(&self, hash: H256) -> DispersalResult<Option<TransactionReceipt>>;

    async fn balance(&self, address: Address) -> DispersalResult<U256>;
}

/// Builds clients for configured endpoint URLs
pub trait RpcConnector: Send + Sync {
    fn connect(&self, chain_id: u64, url: &str) -> DispersalResult<Arc<dyn RpcClient>>;
}

/// ethers-backed HTTP client
pub struct EthersRpcClient {
    chain_id: u64,
    url: String,
    provider: Provider<Http>,
}

impl EthersRpcClient {
    pub fn new(chain_id: u64, url: &str) -> DispersalResult<Self> {
        let provider = Provider::<Http>::try_from(url)
            .map_err(|e| DispersalError::Config(format!("Invalid RPC URL {}: {}", url, e)))?
            .interval(Duration::from_millis(100));

        Ok(Self {
            chain_id,
            url: url.to_string(),
            provider,
        })
    }

    fn rpc_error(&self, e: impl std::fmt::Display) -> DispersalError {
        DispersalError::Rpc {
            chain_id: self.chain_id,
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl RpcClient for EthersRpcClient {
    fn url(&self) -> &str {
        &self.url
    }

    async fn block_number(&self) -> DispersalResult<u64> {
        self.provider
            .get_block_number()
            .await
            .map(|b| b.as_u64())
            .map_err(|e| self.rpc_error(e))
    }

    async fn pending_nonce(&self, address: Address) -> DispersalResult<u64> {
        self.provider
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await
            .map(|n| n.as_u64())
            .map_err(|e| self.rpc_error(e))
    }

    async fn base_fee(&self) -> DispersalResult<Option<U256>> {
        let block = self
            .provider
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| self.rpc_error(e))?;
        Ok(block.and_then(|b| b.base_fee_per_gas))
    }

    async fn gas_price(&self) -> DispersalResult<U256> {
        self.provider
            .get_gas_price()
            .await
            .map_err(|e| self.rpc_error(e))
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> DispersalResult<U256> {
        self.provider
            .estimate_gas(tx, None)
            .await
            .map_err(|e| self.rpc_error(e))
    }

    async fn call(&self, tx: &TypedTransaction) -> DispersalResult<Bytes> {
        self.provider
            .call(tx, None)
            .await
            .map_err(|e| self.rpc_error(e))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> DispersalResult<H256> {
        self.provider
            .send_raw_transaction(raw)
            .await
            .map(|pending| pending.tx_hash())
            .map_err(|e| self.rpc_error(e))
    }

    async fn transaction_receipt(&self, hash: H256) -> DispersalResult<Option<TransactionReceipt>> {
        self.provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| self.rpc_error(e))
    }

    async fn balance(&self, address: Address) -> DispersalResult<U256> {
        self.provider
            .get_balance(address, None)
            .await
            .map_err(|e| self.rpc_error(e))
    }
}

/// Default connector producing HTTP clients
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpConnector;

impl RpcConnector for HttpConnector {
    fn connect(&self, chain_id: u64, url: &str) -> DispersalResult<Arc<dyn RpcClient>> {
        Ok(Arc::new(EthersRpcClient::new(chain_id, url)?))
    }
}

/// Scheme and host only, for logs and metric labels
pub fn redact_url(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, rest)) => {
            let host = rest.split(['/', '?']).next().unwrap_or(rest);
            format!("{}://{}", scheme, host)
        }
        None => url.split(['/', '?']).next().unwrap_or(url).to_string(),
    }
}
