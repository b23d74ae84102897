//! On-chain feed contract source: `getFeedsById(bytes21[])`

use super::{FeedId, PriceSource, RawFeedValue};
use crate::chain::RpcConnectionManager;
use crate::error::{DispersalError, DispersalResult};

use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionRequest, U256};
use ethers::utils::id;
use std::sync::Arc;
use tracing::{debug, warn};

const GET_FEEDS_BY_ID_SIG: &str = "getFeedsById(bytes21[])";

/// Reads feeds from the oracle contract through the RPC pool
pub struct FtsoSource {
    rpc: Arc<RpcConnectionManager>,
    chain_id: u64,
    contract: Address,
}

impl FtsoSource {
    pub fn new(rpc: Arc<RpcConnectionManager>, chain_id: u64, contract: Address) -> Self {
        Self {
            rpc,
            chain_id,
            contract,
        }
    }

    fn malformed(&self, detail: impl Into<String>) -> DispersalError {
        DispersalError::Rpc {
            chain_id: self.chain_id,
            message: format!("Malformed getFeedsById response: {}", detail.into()),
        }
    }
}

pub fn encode_get_feeds(feeds: &[FeedId]) -> Bytes {
    let ids = feeds
        .iter()
        .map(|f| Token::FixedBytes(f.to_bytes21().to_vec()))
        .collect();
    let mut data = id(GET_FEEDS_BY_ID_SIG).to_vec();
    data.extend(abi::encode(&[Token::Array(ids)]));
    data.into()
}

/// int8 arrives sign-extended to 256 bits; anything else is malformed
fn token_to_i8(value: U256) -> Option<i8> {
    if value <= U256::from(i8::MAX as u8) {
        return Some(value.low_u32() as i8);
    }
    let magnitude = (!value).overflowing_add(U256::one()).0;
    if magnitude <= U256::from(128u32) {
        return Some((-(magnitude.low_u32() as i32)) as i8);
    }
    None
}

#[async_trait]
impl PriceSource for FtsoSource {
    fn name(&self) -> String {
        format!("ftso:{}", self.chain_id)
    }

    async fn fetch(&self, feeds: &[FeedId]) -> DispersalResult<Vec<Option<RawFeedValue>>> {
        let client = self.rpc.get_connection(self.chain_id).await?;
        let call: TypedTransaction = TransactionRequest::new()
            .to(self.contract)
            .data(encode_get_feeds(feeds))
            .into();
        let output = client.call(&call).await?;

        let tokens = abi::decode(
            &[
                ParamType::Array(Box::new(ParamType::Uint(256))),
                ParamType::Array(Box::new(ParamType::Int(8))),
                ParamType::Uint(64),
            ],
            &output,
        )
        .map_err(|e| self.malformed(e.to_string()))?;

        let mut tokens = tokens.into_iter();
        let (Some(Token::Array(values)), Some(Token::Array(decimals)), Some(Token::Uint(timestamp))) =
            (tokens.next(), tokens.next(), tokens.next())
        else {
            return Err(self.malformed("unexpected token layout"));
        };
        if values.len() != feeds.len() || decimals.len() != feeds.len() {
            return Err(self.malformed(format!(
                "{} values and {} decimals for {} feeds",
                values.len(),
                decimals.len(),
                feeds.len()
            )));
        }

        if timestamp > U256::from(u64::MAX) {
            return Err(self.malformed(format!("timestamp {} exceeds uint64", timestamp)));
        }
        let timestamp = timestamp.low_u64();
        debug!("Read {} feeds from chain {} at {}", feeds.len(), self.chain_id, timestamp);

        Ok(values
            .into_iter()
            .zip(decimals)
            .map(|(value, decimals)| match (value, decimals) {
                (Token::Uint(value), Token::Int(decimals)) => match token_to_i8(decimals) {
                    Some(decimals) => Some(RawFeedValue {
                        value,
                        decimals,
                        timestamp,
                    }),
                    None => {
                        warn!(chain_id = self.chain_id, "Dropping feed with malformed decimals word {}", decimals);
                        None
                    }
                },
                _ => None,
            })
            .collect())
    }
}

/// ABI-encode a `getFeedsById` response
#[cfg(test)]
pub fn encode_feeds_response(values: &[(U256, i8)], timestamp: u64) -> Bytes {
    let (vals, decs): (Vec<_>, Vec<_>) = values
        .iter()
        .map(|(value, decimals)| {
            let signed = if *decimals < 0 {
                U256::MAX - U256::from(decimals.unsigned_abs()) + 1
            } else {
                U256::from(*decimals as u8)
            };
            (Token::Uint(*value), Token::Int(signed))
        })
        .unzip();
    abi::encode(&[
        Token::Array(vals),
        Token::Array(decs),
        Token::Uint(U256::from(timestamp)),
    ])
    .into()
}
