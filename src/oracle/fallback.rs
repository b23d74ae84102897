//! HTTP fallback price source (CoinGecko `simple/price` shape)

use super::{FeedId, PriceSource, RawFeedValue};
use crate::config::FallbackConfig;
use crate::error::{DispersalError, DispersalResult};

use async_trait::async_trait;
use ethers::types::U256;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Most precision kept from a provider price
const MAX_SCALE: u32 = 18;

#[derive(Debug, Deserialize)]
struct AssetPrice {
    usd: Decimal,
    #[serde(default)]
    last_updated_at: Option<u64>,
}

pub struct HttpPriceSource {
    name: String,
    base_url: String,
    /// Feed id -> provider asset id
    asset_ids: HashMap<String, String>,
    client: reqwest::Client,
}

impl HttpPriceSource {
    pub fn new(config: &FallbackConfig) -> DispersalResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| DispersalError::Config(format!("Fallback HTTP client: {}", e)))?;

        Ok(Self {
            name: config.name.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            asset_ids: config.asset_ids.clone(),
            client,
        })
    }

    fn unavailable(&self, message: String) -> DispersalError {
        DispersalError::PriceUnavailable {
            feed_id: "*".to_string(),
            message: format!("{}: {}", self.name, message),
        }
    }
}

/// Split a decimal price into integer value and decimal exponent
pub fn decimal_to_raw(price: Decimal, timestamp: u64) -> Option<RawFeedValue> {
    if price.is_sign_negative() || price.is_zero() {
        return None;
    }
    let price = price.round_dp(MAX_SCALE).normalize();
    let mantissa = u128::try_from(price.mantissa()).ok()?;
    Some(RawFeedValue {
        value: U256::from(mantissa),
        decimals: price.scale() as i8,
        timestamp,
    })
}

#[async_trait]
impl PriceSource for HttpPriceSource {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn fetch(&self, feeds: &[FeedId]) -> DispersalResult<Vec<Option<RawFeedValue>>> {
        let assets: Vec<Option<&String>> = feeds
            .iter()
            .map(|f| self.asset_ids.get(f.as_str()))
            .collect();
        let mut ids: Vec<&str> = assets.iter().flatten().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.is_empty() {
            return Ok(vec![None; feeds.len()]);
        }

        let url = format!("{}/simple/price", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("ids", ids.join(",")),
                ("vs_currencies", "usd".to_string()),
                ("include_last_updated_at", "true".to_string()),
            ])
            .send()
            .await
            .map_err(|e| self.unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(self.unavailable(format!("HTTP {}", response.status())));
        }

        let prices: HashMap<String, AssetPrice> = response
            .json()
            .await
            .map_err(|e| self.unavailable(format!("bad response body: {}", e)))?;
        debug!("{} returned {} prices", self.name, prices.len());

        let now = chrono::Utc::now().timestamp().max(0) as u64;
        Ok(assets
            .into_iter()
            .map(|asset| {
                let quote = prices.get(asset?)?;
                decimal_to_raw(quote.usd, quote.last_updated_at.unwrap_or(now))
            })
            .collect())
    }
}
