//! Gas limit buffering and per-chain fee selection

use crate::chain::RpcClient;
use crate::config::{ChainConfig, ExecutorConfig, FeeStrategy};
use crate::error::{DispersalError, DispersalResult};

use ethers::types::U256;
use serde::Serialize;
use tracing::debug;

const GWEI: u64 = 1_000_000_000;

fn gwei(amount: u64) -> U256 {
    U256::from(amount) * U256::from(GWEI)
}

/// Gas price types
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

/// Gas estimator for transactions
#[derive(Debug, Clone)]
pub struct GasEstimator {
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
}

impl GasEstimator {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            gas_limit_buffer_percent: config.gas_limit_buffer_percent,
            gas_price_buffer_percent: config.gas_price_buffer_percent,
        }
    }

    /// Apply the gas limit buffer to a node estimate
    pub fn buffered_limit(&self, estimate: U256) -> U256 {
        estimate * (100 + self.gas_limit_buffer_percent) / 100
    }

    fn with_price_buffer(&self, value: U256) -> U256 {
        value * (100 + self.gas_price_buffer_percent) / 100
    }

    /// Choose pricing for a chain according to its fee strategy
    pub async fn gas_price(
        &self,
        chain: &ChainConfig,
        client: &dyn RpcClient,
    ) -> DispersalResult<GasPrice> {
        let price = match chain.fee_strategy {
            FeeStrategy::Fixed => fixed_price(chain)?,
            FeeStrategy::Legacy => self.legacy_price(chain, client.gas_price().await?),
            FeeStrategy::Eip1559 => {
                let base_fee = client.base_fee().await?.ok_or_else(|| {
                    DispersalError::GasEstimation {
                        chain_id: chain.chain_id,
                        message: "No base fee in latest block".to_string(),
                    }
                })?;
                self.eip1559_price(chain, base_fee)
            }
            FeeStrategy::Auto => match client.base_fee().await? {
                Some(base_fee) => self.eip1559_price(chain, base_fee),
                None => self.legacy_price(chain, client.gas_price().await?),
            },
        };

        debug!("Gas price for chain {}: {:?}", chain.chain_id, price);
        Ok(price)
    }

    /// Max fee = 2 x base fee + priority fee, buffered, capped at the chain max
    pub fn eip1559_price(&self, chain: &ChainConfig, base_fee: U256) -> GasPrice {
        let cap = gwei(chain.max_gas_price_gwei);
        let priority = self.with_price_buffer(gwei(chain.priority_fee_gwei));
        let max_fee = self.with_price_buffer(base_fee * 2 + gwei(chain.priority_fee_gwei));
        let max_fee = std::cmp::min(max_fee, cap);

        GasPrice::Eip1559 {
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: std::cmp::min(priority, max_fee),
        }
    }

    /// Node gas price plus buffer, floored and capped
    pub fn legacy_price(&self, chain: &ChainConfig, node_price: U256) -> GasPrice {
        let price = self.with_price_buffer(node_price);
        let price = std::cmp::max(price, gwei(chain.min_gas_price_gwei));
        GasPrice::Legacy(std::cmp::min(price, gwei(chain.max_gas_price_gwei)))
    }
}

fn fixed_price(chain: &ChainConfig) -> DispersalResult<GasPrice> {
    match (chain.fixed_max_fee_gwei, chain.fixed_priority_fee_gwei) {
        (Some(max_fee), Some(priority)) => Ok(GasPrice::Eip1559 {
            max_fee_per_gas: gwei(max_fee),
            max_priority_fee_per_gas: gwei(priority),
        }),
        _ => Err(DispersalError::Config(format!(
            "Chain {} uses fixed fees without configuring them",
            chain.chain_id
        ))),
    }
}
