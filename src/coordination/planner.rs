//! Deposit -> per-chain native amounts
//!
//! All price math is integer fixed point in 512 bits with one floor division
//! per result, so a plan is exact and reproducible.

use crate::address::{normalize, parse_address};
use crate::config::Settings;
use crate::error::{DispersalError, DispersalResult};
use crate::intent::{ChainDistribution, VerifiedDeposit};
use crate::oracle::{FeedId, PriceQuote};

use ethers::types::{U256, U512};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use tracing::debug;

pub const TOTAL_BPS: u32 = 10_000;

/// Decimal places kept on the USD value
const USD_SCALE: u32 = 8;

/// Largest power of ten applied in one step; 10^154 still fits U512
const MAX_EXPONENT: u32 = 150;

#[derive(Debug, Clone)]
struct Destination {
    feed: FeedId,
    native_decimals: u8,
}

/// Computed legs of a deposit
#[derive(Debug, Clone, PartialEq)]
pub struct DistributionPlan {
    pub usd_value: Decimal,
    pub distributions: Vec<ChainDistribution>,
}

/// Turns verified deposits into per-chain amounts using oracle quotes
pub struct DistributionPlanner {
    destinations: HashMap<u64, Destination>,
}

impl DistributionPlanner {
    pub fn new(settings: &Settings) -> DispersalResult<Self> {
        let mut destinations = HashMap::new();
        for chain in settings.enabled_chains() {
            let feed = FeedId::parse(&chain.native_feed).map_err(|e| {
                DispersalError::Config(format!("Chain {} native feed: {}", chain.name, e))
            })?;
            destinations.insert(
                chain.chain_id,
                Destination {
                    feed,
                    native_decimals: chain.native_decimals,
                },
            );
        }
        Ok(Self { destinations })
    }

    /// Check a deposit before it is priced
    pub fn validate(&self, deposit: &VerifiedDeposit) -> DispersalResult<()> {
        parse_address(&deposit.user_address)?;
        parse_address(&deposit.token_address)?;
        if deposit.deposit_tx_hash.trim().is_empty() {
            return Err(DispersalError::Validation("Deposit tx hash is empty".to_string()));
        }
        if deposit.amount.is_zero() {
            return Err(DispersalError::Validation("Deposit amount is zero".to_string()));
        }
        FeedId::parse(&deposit.price_feed)?;

        if deposit.allocations.is_empty() {
            return Err(DispersalError::Validation("No allocations".to_string()));
        }

        let mut seen = HashSet::new();
        let mut total_bps: u64 = 0;
        for allocation in &deposit.allocations {
            if !self.destinations.contains_key(&allocation.chain_id) {
                return Err(DispersalError::Validation(format!(
                    "Chain {} is not a configured destination",
                    allocation.chain_id
                )));
            }
            if !seen.insert(allocation.chain_id) {
                return Err(DispersalError::Validation(format!(
                    "Chain {} allocated more than once",
                    allocation.chain_id
                )));
            }
            if allocation.weight_bps == 0 {
                return Err(DispersalError::Validation(format!(
                    "Allocation to chain {} has zero weight",
                    allocation.chain_id
                )));
            }
            parse_address(&allocation.recipient)?;
            total_bps += u64::from(allocation.weight_bps);
        }

        if total_bps != u64::from(TOTAL_BPS) {
            return Err(DispersalError::Validation(format!(
                "Allocation weights sum to {} bps, expected {}",
                total_bps, TOTAL_BPS
            )));
        }
        Ok(())
    }

    /// Feeds needed to price a deposit: the source feed, then each
    /// destination's native feed, deduplicated
    pub fn required_feeds(&self, deposit: &VerifiedDeposit) -> DispersalResult<Vec<FeedId>> {
        let mut feeds = vec![FeedId::parse(&deposit.price_feed)?];
        for allocation in &deposit.allocations {
            let feed = &self.destination(allocation.chain_id)?.feed;
            if !feeds.contains(feed) {
                feeds.push(feed.clone());
            }
        }
        Ok(feeds)
    }

    fn destination(&self, chain_id: u64) -> DispersalResult<&Destination> {
        self.destinations
            .get(&chain_id)
            .ok_or(DispersalError::ChainNotFound { chain_id })
    }

    /// Compute every leg's native amount and the deposit's USD value
    pub fn plan(
        &self,
        deposit: &VerifiedDeposit,
        quotes: &HashMap<FeedId, PriceQuote>,
    ) -> DispersalResult<DistributionPlan> {
        let source_feed = FeedId::parse(&deposit.price_feed)?;
        let source = quote_for(quotes, &source_feed)?;

        let usd_value = usd_value(deposit.amount, deposit.token_decimals, source)?;

        let mut distributions = Vec::with_capacity(deposit.allocations.len());
        for allocation in &deposit.allocations {
            let destination = self.destination(allocation.chain_id)?;
            let dest = quote_for(quotes, &destination.feed)?;

            let amount = native_amount(
                deposit.amount,
                deposit.token_decimals,
                source,
                allocation.weight_bps,
                destination.native_decimals,
                dest,
            )?;
            if amount.is_zero() {
                return Err(DispersalError::Validation(format!(
                    "Allocation to chain {} rounds to zero",
                    allocation.chain_id
                )));
            }

            debug!(
                chain_id = allocation.chain_id,
                "Planned {} base units for {} bps",
                amount,
                allocation.weight_bps
            );
            distributions.push(ChainDistribution::new(
                allocation.chain_id,
                normalize(&allocation.recipient)?,
                amount,
            ));
        }

        Ok(DistributionPlan {
            usd_value,
            distributions,
        })
    }
}

fn quote_for<'a>(
    quotes: &'a HashMap<FeedId, PriceQuote>,
    feed: &FeedId,
) -> DispersalResult<&'a PriceQuote> {
    quotes.get(feed).ok_or_else(|| DispersalError::PriceUnavailable {
        feed_id: feed.to_string(),
        message: "no quote".to_string(),
    })
}

fn overflow() -> DispersalError {
    DispersalError::Validation("Amount out of range".to_string())
}

fn pow10(exp: u32) -> DispersalResult<U512> {
    if exp > MAX_EXPONENT {
        return Err(overflow());
    }
    Ok(U512::from(10u8).pow(U512::from(exp)))
}

/// A fraction in 512-bit integers, floored once at the end
struct Fraction {
    num: U512,
    den: U512,
}

impl Fraction {
    fn one() -> Self {
        Self {
            num: U512::one(),
            den: U512::one(),
        }
    }

    fn mul(mut self, value: impl Into<U512>) -> DispersalResult<Self> {
        self.num = self.num.checked_mul(value.into()).ok_or_else(overflow)?;
        Ok(self)
    }

    fn div(mut self, value: impl Into<U512>) -> DispersalResult<Self> {
        self.den = self.den.checked_mul(value.into()).ok_or_else(overflow)?;
        Ok(self)
    }

    /// Multiply by 10^exp; negative exponents land in the denominator
    fn scale(self, exp: i32) -> DispersalResult<Self> {
        if exp >= 0 {
            let factor = pow10(exp.unsigned_abs())?;
            self.mul(factor)
        } else {
            let factor = pow10(exp.unsigned_abs())?;
            self.div(factor)
        }
    }

    fn floor(&self) -> DispersalResult<U512> {
        if self.den.is_zero() {
            return Err(DispersalError::Validation("Zero price".to_string()));
        }
        Ok(self.num / self.den)
    }
}

fn u256_to_u512(value: U256) -> U512 {
    U512::from(value)
}

/// amount x srcValue x bps x 10^nativeDecimals x 10^destDecimals
///   / (10^tokenDecimals x 10^srcDecimals x destValue x 10000)
pub fn native_amount(
    amount: U256,
    token_decimals: u8,
    source: &PriceQuote,
    weight_bps: u32,
    native_decimals: u8,
    dest: &PriceQuote,
) -> DispersalResult<U256> {
    let exponent = i32::from(native_decimals) + i32::from(dest.decimals)
        - i32::from(token_decimals)
        - i32::from(source.decimals);

    let wei = Fraction::one()
        .mul(u256_to_u512(amount))?
        .mul(u256_to_u512(source.value))?
        .mul(weight_bps)?
        .div(u256_to_u512(dest.value))?
        .div(TOTAL_BPS)?
        .scale(exponent)?
        .floor()?;

    U256::try_from(wei).map_err(|_| overflow())
}

/// amount x srcValue / 10^(tokenDecimals + srcDecimals), to 8 places
pub fn usd_value(amount: U256, token_decimals: u8, source: &PriceQuote) -> DispersalResult<Decimal> {
    let exponent =
        USD_SCALE as i32 - i32::from(token_decimals) - i32::from(source.decimals);
    let scaled = Fraction::one()
        .mul(u256_to_u512(amount))?
        .mul(u256_to_u512(source.value))?
        .scale(exponent)?
        .floor()?;

    if scaled.bits() > 127 {
        return Err(overflow());
    }
    Decimal::try_from_i128_with_scale(scaled.low_u128() as i128, USD_SCALE).map_err(|_| overflow())
}
