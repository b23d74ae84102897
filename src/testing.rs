//! Shared test doubles: an in-process chain behind [`RpcClient`] and a
//! fully wired component graph over it.

use crate::alerts::AlertManager;
use crate::chain::{RpcClient, RpcConnectionManager, RpcConnector};
use crate::config::Settings;
use crate::coordination::DistributionCoordinator;
use crate::error::{DispersalError, DispersalResult};
use crate::tx::{SignerRegistry, TransactionExecutor};

use async_trait::async_trait;
use ethers::abi::{self, Token};
use ethers::signers::LocalWallet;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionReceipt, H256, U256, U64};
use ethers::utils::{id, keccak256};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};

/// Well-known development key (anvil account 0)
pub const TEST_PRIVATE_KEY: &str =
    "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcaf784d7bf4f2ff80";

pub const ORACLE_CONTRACT: &str = "0x0000000000000000000000000000000000000abc";

pub fn test_wallet() -> LocalWallet {
    TEST_PRIVATE_KEY.parse().unwrap()
}

pub fn one_ether() -> U256 {
    U256::exp10(18)
}

struct FakeChainState {
    down: bool,
    block: u64,
    block_calls: usize,
    base_nonce: u64,
    sent: Vec<H256>,
    send_attempts: usize,
    send_errors: VecDeque<String>,
    estimate_errors: VecDeque<String>,
    base_fee: Option<U256>,
    gas_price: U256,
    gas_estimate: U256,
    mine: bool,
    revert: bool,
    mined_at: HashMap<H256, u64>,
    treasury_balance: U256,
    treasury_balance_error: bool,
    token_balance: U256,
    call_response: Option<Bytes>,
}

/// One in-process chain endpoint. Blocks advance on every `block_number`
/// call; sent transactions are mined in the block current at send time.
pub struct FakeRpc {
    url: OnceLock<String>,
    chain_id: OnceLock<u64>,
    state: Mutex<FakeChainState>,
}

impl FakeRpc {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            url: OnceLock::new(),
            chain_id: OnceLock::new(),
            state: Mutex::new(FakeChainState {
                down: false,
                block: 100,
                block_calls: 0,
                base_nonce: 0,
                sent: Vec::new(),
                send_attempts: 0,
                send_errors: VecDeque::new(),
                estimate_errors: VecDeque::new(),
                base_fee: Some(U256::from(25_000_000_000u64)),
                gas_price: U256::from(25_000_000_000u64),
                gas_estimate: U256::from(100_000),
                mine: true,
                revert: false,
                mined_at: HashMap::new(),
                treasury_balance: one_ether() * 1_000,
                treasury_balance_error: false,
                token_balance: U256::zero(),
                call_response: None,
            }),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeChainState> {
        self.state.lock().unwrap()
    }

    fn chain(&self) -> u64 {
        self.chain_id.get().copied().unwrap_or_default()
    }

    fn error(&self, message: impl Into<String>) -> DispersalError {
        DispersalError::Rpc {
            chain_id: self.chain(),
            message: message.into(),
        }
    }

    fn check_up(&self) -> DispersalResult<()> {
        if self.state().down {
            return Err(self.error("connection refused"));
        }
        Ok(())
    }

    pub fn set_down(&self, down: bool) {
        self.state().down = down;
    }

    pub fn block_calls(&self) -> usize {
        self.state().block_calls
    }

    pub fn set_base_nonce(&self, nonce: u64) {
        self.state().base_nonce = nonce;
    }

    pub fn push_send_error(&self, message: &str) {
        self.state().send_errors.push_back(message.to_string());
    }

    pub fn push_estimate_error(&self, message: &str) {
        self.state().estimate_errors.push_back(message.to_string());
    }

    pub fn sent_count(&self) -> usize {
        self.state().sent.len()
    }

    pub fn send_attempts(&self) -> usize {
        self.state().send_attempts
    }

    pub fn set_revert(&self, revert: bool) {
        self.state().revert = revert;
    }

    pub fn set_mining(&self, mine: bool) {
        self.state().mine = mine;
    }

    pub fn mined_block(&self, hash: H256) -> Option<u64> {
        self.state().mined_at.get(&hash).copied()
    }

    pub fn set_base_fee(&self, base_fee: Option<U256>) {
        self.state().base_fee = base_fee;
    }

    pub fn set_gas_price(&self, price: U256) {
        self.state().gas_price = price;
    }

    pub fn set_call_response(&self, response: Bytes) {
        self.state().call_response = Some(response);
    }

    pub fn set_treasury_balance(&self, balance: U256) {
        self.state().treasury_balance = balance;
    }

    /// Make `getNativeBalance()` fail while the endpoint stays up
    pub fn fail_treasury_balance(&self, fail: bool) {
        self.state().treasury_balance_error = fail;
    }

    pub fn set_token_balance(&self, balance: U256) {
        self.state().token_balance = balance;
    }
}

#[async_trait]
impl RpcClient for FakeRpc {
    fn url(&self) -> &str {
        self.url.get().map(String::as_str).unwrap_or("fake://rpc")
    }

    async fn block_number(&self) -> DispersalResult<u64> {
        self.check_up()?;
        let mut state = self.state();
        state.block_calls += 1;
        state.block += 1;
        Ok(state.block)
    }

    async fn pending_nonce(&self, _address: Address) -> DispersalResult<u64> {
        self.check_up()?;
        let state = self.state();
        Ok(state.base_nonce + state.sent.len() as u64)
    }

    async fn base_fee(&self) -> DispersalResult<Option<U256>> {
        self.check_up()?;
        Ok(self.state().base_fee)
    }

    async fn gas_price(&self) -> DispersalResult<U256> {
        self.check_up()?;
        Ok(self.state().gas_price)
    }

    async fn estimate_gas(&self, _tx: &TypedTransaction) -> DispersalResult<U256> {
        self.check_up()?;
        let mut state = self.state();
        match state.estimate_errors.pop_front() {
            Some(message) => Err(self.error(message)),
            None => Ok(state.gas_estimate),
        }
    }

    async fn call(&self, tx: &TypedTransaction) -> DispersalResult<Bytes> {
        self.check_up()?;
        let state = self.state();
        let selector = tx.data().map(|d| d.to_vec()).unwrap_or_default();

        if selector.starts_with(&id("getNativeBalance()")) {
            if state.treasury_balance_error {
                return Err(self.error("execution reverted"));
            }
            return Ok(abi::encode(&[Token::Uint(state.treasury_balance)]).into());
        }
        if selector.starts_with(&id("getTokenBalance(address)")) {
            return Ok(abi::encode(&[Token::Uint(state.token_balance)]).into());
        }
        state
            .call_response
            .clone()
            .ok_or_else(|| self.error("execution reverted"))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> DispersalResult<H256> {
        self.check_up()?;
        let mut state = self.state();
        state.send_attempts += 1;
        if let Some(message) = state.send_errors.pop_front() {
            return Err(self.error(message));
        }

        let hash = H256::from(keccak256(&raw));
        state.sent.push(hash);
        let block = state.block;
        state.mined_at.insert(hash, block);
        Ok(hash)
    }

    async fn transaction_receipt(&self, hash: H256) -> DispersalResult<Option<TransactionReceipt>> {
        self.check_up()?;
        let state = self.state();
        if !state.mine {
            return Ok(None);
        }
        Ok(state.mined_at.get(&hash).map(|block| TransactionReceipt {
            transaction_hash: hash,
            block_number: Some(U64::from(*block)),
            status: Some(U64::from(if state.revert { 0 } else { 1 })),
            gas_used: Some(U256::from(21_000)),
            ..Default::default()
        }))
    }

    async fn balance(&self, _address: Address) -> DispersalResult<U256> {
        self.check_up()?;
        Ok(one_ether())
    }
}

/// Hands out registered fakes by URL; unknown URLs get a fresh fake
pub struct FakeConnector {
    fakes: HashMap<String, Arc<FakeRpc>>,
}

impl FakeConnector {
    pub fn new(fakes: &[(&str, Arc<FakeRpc>)]) -> Self {
        Self {
            fakes: fakes
                .iter()
                .map(|(url, fake)| (url.to_string(), fake.clone()))
                .collect(),
        }
    }
}

impl RpcConnector for FakeConnector {
    fn connect(&self, chain_id: u64, url: &str) -> DispersalResult<Arc<dyn RpcClient>> {
        let fake = self.fakes.get(url).cloned().unwrap_or_else(FakeRpc::new);
        let _ = fake.url.set(url.to_string());
        let _ = fake.chain_id.set(chain_id);
        Ok(fake)
    }
}

pub fn native_feed_for(chain_id: u64) -> String {
    match chain_id {
        114 => "C2FLR/USD".to_string(),
        14 => "FLR/USD".to_string(),
        1 => "ETH/USD".to_string(),
        other => format!("C{}/USD", other),
    }
}

pub fn treasury_for(chain_id: u64) -> Address {
    Address::from_low_u64_be(0x7000 + chain_id)
}

/// Settings for the given chains and endpoint URLs (priority = position),
/// with fast retry and polling intervals
pub fn fake_settings(chains: &[(u64, &[&str])]) -> Settings {
    let oracle_chain = chains.first().map(|(id, _)| *id).unwrap_or(114);
    let mut toml = format!(
        r#"
[service]
instance_id = "test"
health_check_interval_secs = 1
rpc_probe_timeout_ms = 200

[api]
host = "127.0.0.1"
port = 0

[metrics]
enabled = false
port = 0

[executor]
max_attempts = 3
max_nonce_retries = 3
retry_initial_delay_ms = 1
retry_max_delay_ms = 5
submission_timeout_secs = 2
confirmation_poll_interval_ms = 5
confirmation_timeout_secs = 2

[oracle]
chain_id = {oracle_chain}
contract_address = "{ORACLE_CONTRACT}"
retry_initial_delay_ms = 1
retry_max_delay_ms = 2
"#
    );

    for (chain_id, urls) in chains {
        let endpoints = urls
            .iter()
            .enumerate()
            .map(|(priority, url)| format!("{{ url = \"{}\", priority = {} }}", url, priority))
            .collect::<Vec<_>>()
            .join(", ");
        toml.push_str(&format!(
            r#"
[chains.c{chain_id}]
chain_id = {chain_id}
name = "c{chain_id}"
treasury_address = "{treasury:?}"
native_feed = "{feed}"
confirmation_blocks = 1
rpc_endpoints = [{endpoints}]
"#,
            treasury = treasury_for(*chain_id),
            feed = native_feed_for(*chain_id),
        ));
    }

    Settings::from_toml_str(&toml).unwrap()
}

/// Component graph over one fake endpoint per chain
pub struct Harness {
    pub settings: Settings,
    pub rpc: Arc<RpcConnectionManager>,
    pub executor: Arc<TransactionExecutor>,
    pub alerts: Arc<AlertManager>,
    pub coordinator: Arc<DistributionCoordinator>,
    fakes: HashMap<u64, Arc<FakeRpc>>,
}

impl Harness {
    pub fn new(chain_ids: &[u64]) -> Self {
        Self::build(chain_ids, true, |_| {})
    }

    pub fn without_signers(chain_ids: &[u64]) -> Self {
        Self::build(chain_ids, false, |_| {})
    }

    /// Adjust settings before the graph is wired
    pub fn with_settings(chain_ids: &[u64], adjust: impl FnOnce(&mut Settings)) -> Self {
        Self::build(chain_ids, true, adjust)
    }

    fn build(chain_ids: &[u64], with_signers: bool, adjust: impl FnOnce(&mut Settings)) -> Self {
        let urls: Vec<(u64, String)> = chain_ids
            .iter()
            .map(|id| (*id, format!("http://chain-{}.test", id)))
            .collect();
        let url_refs: Vec<[&str; 1]> = urls.iter().map(|(_, url)| [url.as_str()]).collect();
        let chains: Vec<(u64, &[&str])> = urls
            .iter()
            .zip(&url_refs)
            .map(|((id, _), url)| (*id, &url[..]))
            .collect();

        let mut settings = fake_settings(&chains);
        adjust(&mut settings);

        let fakes: HashMap<u64, Arc<FakeRpc>> =
            chain_ids.iter().map(|id| (*id, FakeRpc::new())).collect();
        let registered: Vec<(&str, Arc<FakeRpc>)> = urls
            .iter()
            .map(|(id, url)| (url.as_str(), fakes[id].clone()))
            .collect();
        let connector = FakeConnector::new(&registered);

        let rpc = Arc::new(RpcConnectionManager::new(&settings, &connector).unwrap());
        let signers = if with_signers {
            SignerRegistry::shared(test_wallet(), chain_ids)
        } else {
            SignerRegistry::shared(test_wallet(), &[])
        };
        let executor = Arc::new(TransactionExecutor::new(
            &settings,
            rpc.clone(),
            Arc::new(signers),
        ));
        let alerts = Arc::new(AlertManager::new());
        let coordinator = Arc::new(DistributionCoordinator::new(
            &settings,
            rpc.clone(),
            executor.clone(),
            alerts.clone(),
        )
        .unwrap());

        Self {
            settings,
            rpc,
            executor,
            alerts,
            coordinator,
            fakes,
        }
    }

    pub fn fake(&self, chain_id: u64) -> Arc<FakeRpc> {
        self.fakes[&chain_id].clone()
    }
}
