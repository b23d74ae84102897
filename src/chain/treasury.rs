//! Treasury contract calls
//!
//! distribute(address,uint256,bytes32), getNativeBalance() and
//! getTokenBalance(address), ABI-encoded by hand.

use super::rpc::RpcClient;
use crate::error::{DispersalError, DispersalResult};

use ethers::abi::{self, ParamType, Token};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionRequest, U256};
use ethers::utils::id;

const DISTRIBUTE_SIG: &str = "distribute(address,uint256,bytes32)";
const NATIVE_BALANCE_SIG: &str = "getNativeBalance()";
const TOKEN_BALANCE_SIG: &str = "getTokenBalance(address)";

fn with_selector(signature: &str, args: &[Token]) -> Bytes {
    let mut data = id(signature).to_vec();
    data.extend(abi::encode(args));
    data.into()
}

/// Calldata for `distribute(recipient, amount, intentRef)`
pub fn encode_distribute(recipient: Address, amount: U256, intent_ref: [u8; 32]) -> Bytes {
    with_selector(
        DISTRIBUTE_SIG,
        &[
            Token::Address(recipient),
            Token::Uint(amount),
            Token::FixedBytes(intent_ref.to_vec()),
        ],
    )
}

pub fn encode_native_balance() -> Bytes {
    with_selector(NATIVE_BALANCE_SIG, &[])
}

pub fn encode_token_balance(token: Address) -> Bytes {
    with_selector(TOKEN_BALANCE_SIG, &[Token::Address(token)])
}

/// Decode a single `uint256` return value
pub fn decode_uint(chain_id: u64, output: &[u8]) -> DispersalResult<U256> {
    let tokens = abi::decode(&[ParamType::Uint(256)], output).map_err(|e| DispersalError::Rpc {
        chain_id,
        message: format!("Malformed uint256 return data: {}", e),
    })?;
    match tokens.into_iter().next() {
        Some(Token::Uint(value)) => Ok(value),
        _ => Err(DispersalError::Rpc {
            chain_id,
            message: "Empty uint256 return data".to_string(),
        }),
    }
}

fn call_request(to: Address, data: Bytes) -> TypedTransaction {
    TransactionRequest::new().to(to).data(data).into()
}

/// Treasury's native balance via `getNativeBalance()`
pub async fn native_balance(
    client: &dyn RpcClient,
    chain_id: u64,
    treasury: Address,
) -> DispersalResult<U256> {
    let output = client
        .call(&call_request(treasury, encode_native_balance()))
        .await?;
    decode_uint(chain_id, &output)
}

/// Treasury's balance of an ERC-20 via `getTokenBalance(token)`
pub async fn token_balance(
    client: &dyn RpcClient,
    chain_id: u64,
    treasury: Address,
    token: Address,
) -> DispersalResult<U256> {
    let output = client
        .call(&call_request(treasury, encode_token_balance(token)))
        .await?;
    decode_uint(chain_id, &output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distribute_layout() {
        let recipient: Address = "0x00000000000000000000000000000000000000aa".parse().unwrap();
        let data = encode_distribute(recipient, U256::from(7), [0x11; 32]);

        assert_eq!(data.len(), 4 + 32 * 3);
        assert_eq!(&data[..4], &id(DISTRIBUTE_SIG));
        assert_eq!(data[4 + 31], 0xaa);
        assert_eq!(data[4 + 32 + 31], 7);
        assert_eq!(&data[4 + 64..], &[0x11; 32]);
    }

    #[test]
    fn test_decode_uint() {
        let encoded = abi::encode(&[Token::Uint(U256::from(35u64) * U256::exp10(17))]);
        assert_eq!(
            decode_uint(114, &encoded).unwrap(),
            U256::from(3_500_000_000_000_000_000u64)
        );
        assert!(decode_uint(114, &[1, 2, 3]).is_err());
    }
}
