//! Operator signing keys, one per chain or one shared

use crate::config::Settings;
use crate::error::{DispersalError, DispersalResult};

use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use std::collections::HashMap;
use tracing::{info, warn};

/// Signing keys indexed by chain id, each bound to its chain id
pub struct SignerRegistry {
    wallets: HashMap<u64, LocalWallet>,
}

impl SignerRegistry {
    /// Load keys from the environment variables named in configuration
    pub fn from_env(settings: &Settings) -> DispersalResult<Self> {
        let mut wallets = HashMap::new();

        for chain in settings.enabled_chains() {
            let var = chain
                .signer_key_env
                .as_deref()
                .unwrap_or(&settings.wallet.private_key_env);

            match std::env::var(var) {
                Ok(key) => {
                    let wallet = parse_key(&key)?.with_chain_id(chain.chain_id);
                    info!(
                        "Signer for chain {} loaded from {}: {:?}",
                        chain.chain_id,
                        var,
                        wallet.address()
                    );
                    wallets.insert(chain.chain_id, wallet);
                }
                Err(_) => {
                    warn!(
                        "No signing key for chain {} ({} is unset); dispersals to it will fail",
                        chain.chain_id, var
                    );
                }
            }
        }

        Ok(Self { wallets })
    }

    /// Use one wallet for every listed chain
    pub fn shared(wallet: LocalWallet, chain_ids: &[u64]) -> Self {
        let wallets = chain_ids
            .iter()
            .map(|&chain_id| (chain_id, wallet.clone().with_chain_id(chain_id)))
            .collect();
        Self { wallets }
    }

    pub fn signer(&self, chain_id: u64) -> DispersalResult<&LocalWallet> {
        self.wallets.get(&chain_id).ok_or_else(|| {
            DispersalError::Wallet(format!("No signing key configured for chain {}", chain_id))
        })
    }

    pub fn address(&self, chain_id: u64) -> DispersalResult<Address> {
        self.signer(chain_id).map(|w| w.address())
    }

    pub fn has_signer(&self, chain_id: u64) -> bool {
        self.wallets.contains_key(&chain_id)
    }
}

fn parse_key(key: &str) -> DispersalResult<LocalWallet> {
    key.trim()
        .trim_start_matches("0x")
        .parse::<LocalWallet>()
        .map_err(|e| DispersalError::Wallet(format!("Invalid private key: {}", e)))
}
