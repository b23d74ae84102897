//! Price oracle - cached, retried feed reads with an optional fallback source
//!
//! The primary source is an on-chain FTSO-style feed contract; the fallback
//! is an HTTP price API.

mod client;
mod fallback;
mod ftso;

pub use client::{MetricSource, OracleMetricsSummary, PriceOracleClient, QueryMetric};
pub use fallback::HttpPriceSource;
pub use ftso::FtsoSource;

use crate::amount::u256_dec;
use crate::error::{DispersalError, DispersalResult};

use async_trait::async_trait;
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Feed category byte for crypto pairs
const CRYPTO_CATEGORY: u8 = 0x01;
const FEED_ID_LEN: usize = 21;

/// Feed identifier such as `ETH/USD`, or a literal 21-byte hex id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeedId(String);

impl FeedId {
    pub fn parse(input: &str) -> DispersalResult<Self> {
        let trimmed = input.trim();
        if let Some(hex_part) = trimmed.strip_prefix("0x") {
            if hex_part.len() == FEED_ID_LEN * 2 && hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
                return Ok(Self(format!("0x{}", hex_part.to_lowercase())));
            }
            return Err(DispersalError::Validation(format!(
                "Feed id {} is not 21 hex bytes",
                input
            )));
        }

        if trimmed.is_empty()
            || trimmed.len() > FEED_ID_LEN - 1
            || !trimmed.chars().all(|c| c.is_ascii_graphic())
        {
            return Err(DispersalError::Validation(format!(
                "Feed name {:?} must be 1-20 printable ASCII characters",
                input
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// On-chain bytes21 form: category byte then the zero-padded name
    pub fn to_bytes21(&self) -> [u8; FEED_ID_LEN] {
        let mut out = [0u8; FEED_ID_LEN];
        match self.0.strip_prefix("0x").and_then(|h| hex::decode(h).ok()) {
            Some(raw) if raw.len() == FEED_ID_LEN => out.copy_from_slice(&raw),
            _ => {
                out[0] = CRYPTO_CATEGORY;
                let name = self.0.as_bytes();
                out[1..1 + name.len()].copy_from_slice(name);
            }
        }
        out
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a quote came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuoteSource {
    Primary,
    Fallback,
}

/// Unvalidated value as returned by a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFeedValue {
    pub value: U256,
    /// price = value x 10^-decimals
    pub decimals: i8,
    /// Unix seconds
    pub timestamp: u64,
}

/// A validated price
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub feed_id: FeedId,
    #[serde(with = "u256_dec")]
    pub value: U256,
    pub decimals: i8,
    pub timestamp: u64,
    pub source: QuoteSource,
}

/// A batch price source; entries align with the requested feeds
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceSource: Send + Sync {
    fn name(&self) -> String;

    /// One round-trip for all feeds; `None` marks a feed the source lacks
    async fn fetch(&self, feeds: &[FeedId]) -> DispersalResult<Vec<Option<RawFeedValue>>>;
}
