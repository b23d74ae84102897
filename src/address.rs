//! Address validation at the service boundary
//!
//! Mixed-case input must carry a valid EIP-55 checksum. Addresses are stored
//! in lowercase form.

use crate::error::{DispersalError, DispersalResult};

use ethers::types::Address;
use ethers::utils::to_checksum;

/// Parse and checksum-validate a hex address
pub fn parse_address(input: &str) -> DispersalResult<Address> {
    let trimmed = input.trim();
    let hex_part = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .ok_or_else(|| DispersalError::Validation(format!("Address {} lacks 0x prefix", input)))?;

    if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(DispersalError::Validation(format!(
            "Address {} is not 20 hex bytes",
            input
        )));
    }

    let address: Address = format!("0x{}", hex_part)
        .parse()
        .map_err(|e| DispersalError::Validation(format!("Invalid address {}: {}", input, e)))?;

    let has_lower = hex_part.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = hex_part.chars().any(|c| c.is_ascii_uppercase());
    if has_lower && has_upper && to_checksum(&address, None)[2..] != *hex_part {
        return Err(DispersalError::Validation(format!(
            "Address {} has an invalid EIP-55 checksum",
            input
        )));
    }

    Ok(address)
}

/// Canonical stored form: 0x-prefixed lowercase hex
pub fn normalize_address(address: &Address) -> String {
    format!("{:?}", address)
}

/// Validate and return the stored form in one step
pub fn normalize(input: &str) -> DispersalResult<String> {
    parse_address(input).map(|a| normalize_address(&a))
}
