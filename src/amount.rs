//! 256-bit amounts on the wire
//!
//! Amounts travel as base-10 strings so that values beyond 2^53 survive JSON
//! round-trips.

use crate::error::{DispersalError, DispersalResult};

use ethers::types::U256;
use ethers::utils::{format_units, parse_units};
use serde::{Deserialize, Deserializer, Serializer};

/// Parse a decimal integer string
pub fn parse_amount(input: &str) -> DispersalResult<U256> {
    let trimmed = input.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_digit()) {
        return Err(DispersalError::Validation(format!(
            "Amount {:?} is not a decimal integer",
            input
        )));
    }

    U256::from_dec_str(trimmed)
        .map_err(|e| DispersalError::Validation(format!("Amount {} out of range: {}", input, e)))
}

/// Format as a decimal integer string
pub fn format_amount(amount: &U256) -> String {
    amount.to_string()
}

/// Convert a human-readable quantity ("1.5") into base units
pub fn to_base_units(quantity: &str, decimals: u8) -> DispersalResult<U256> {
    parse_units(quantity, decimals as u32)
        .map(Into::into)
        .map_err(|e| DispersalError::Validation(format!("Invalid quantity {}: {}", quantity, e)))
}

/// Render base units for logs and the ops API
pub fn display_units(amount: U256, decimals: u8) -> String {
    format_units(amount, decimals as u32).unwrap_or_else(|_| format_amount(&amount))
}

/// Serde adapter for `U256` fields carried as decimal strings
pub mod u256_dec {
    use super::*;

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_amount(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_amount(&raw).map_err(serde::de::Error::custom)
    }
}
