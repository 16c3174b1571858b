//! Shared mocks for engine tests: an in-memory state, the external
//! collaborators, and transaction/bid factories.

use crate::{
    bid::Bid,
    builder_client::{BidIssue, BuilderClient},
    env::{Environment, StateDb},
    interrupt::Interrupt,
    traits::{BidWorker, BlockExecutor, ChainContext, ChainHeadEvent, ConsensusEngine, WorkParams},
    BoxError,
};
use alloy_consensus::{Header, Receipt, Signed, TxEip4844, TxEnvelope, TxLegacy};
use alloy_primitives::{keccak256, Address, Bytes, Signature, TxKind, B256, U256};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::mpsc;

/// Genesis balances plus a live-environment counter. Each environment
/// snapshot starts from the genesis view and diverges independently, like
/// a state opened at a parent block.
#[derive(Clone, Default)]
pub(crate) struct SharedState {
    genesis: Arc<Mutex<HashMap<Address, U256>>>,
    live_envs: Arc<AtomicUsize>,
}

impl SharedState {
    pub(crate) fn credit(&self, address: Address, amount: U256) {
        *self.genesis.lock().entry(address).or_default() += amount;
    }

    pub(crate) fn set_balance(&self, address: Address, amount: U256) {
        self.genesis.lock().insert(address, amount);
    }

    /// Environments created and not yet dropped or discarded.
    pub(crate) fn live_envs(&self) -> usize {
        self.live_envs.load(Ordering::SeqCst)
    }

    pub(crate) fn state_handle(&self) -> Box<dyn StateDb> {
        self.live_envs.fetch_add(1, Ordering::SeqCst);
        Box::new(MockState {
            balances: self.genesis.lock().clone(),
            live_envs: self.live_envs.clone(),
        })
    }
}

struct MockState {
    balances: HashMap<Address, U256>,
    live_envs: Arc<AtomicUsize>,
}

impl StateDb for MockState {
    fn balance(&self, address: Address) -> U256 {
        self.balances.get(&address).copied().unwrap_or_default()
    }

    fn add_balance(&mut self, address: Address, amount: U256) {
        *self.balances.entry(address).or_default() += amount;
    }
}

impl Drop for MockState {
    fn drop(&mut self) {
        self.live_envs.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) fn test_env(state: &SharedState, block_number: u64, gas_limit: u64) -> Environment {
    let header = Header {
        number: block_number,
        gas_limit,
        timestamp: 1_700_000_000,
        ..Default::default()
    };
    Environment::new(header, Address::ZERO, state.state_handle())
}

pub(crate) fn make_transfer_tx(nonce: u64, to: Address, value: U256) -> TxEnvelope {
    let tx = TxLegacy {
        chain_id: Some(56),
        nonce,
        gas_price: 1_000_000_000,
        gas_limit: 21_000,
        to: TxKind::Call(to),
        value,
        input: Bytes::new(),
    };
    let signature = Signature::new(U256::from(1u64), U256::from(2u64), false);
    let mut preimage = Vec::new();
    preimage.extend_from_slice(&nonce.to_be_bytes());
    preimage.extend_from_slice(to.as_slice());
    preimage.extend_from_slice(&value.to_be_bytes::<32>());
    let hash = keccak256(&preimage);
    TxEnvelope::Legacy(Signed::new_unchecked(tx, signature, hash))
}

pub(crate) fn make_blob_tx(nonce: u64, to: Address) -> TxEnvelope {
    let tx = TxEip4844 {
        chain_id: 56,
        nonce,
        gas_limit: 100_000,
        max_fee_per_gas: 1_000_000_000,
        max_priority_fee_per_gas: 1_000_000_000,
        to,
        value: U256::ZERO,
        access_list: Default::default(),
        blob_versioned_hashes: vec![B256::repeat_byte(0xbb)],
        max_fee_per_blob_gas: 1,
        input: Bytes::new(),
    };
    let signature = Signature::new(U256::from(1u64), U256::from(2u64), false);
    let mut preimage = b"blob".to_vec();
    preimage.extend_from_slice(&nonce.to_be_bytes());
    let hash = keccak256(&preimage);
    TxEnvelope::Eip4844(Signed::new_unchecked(tx.into(), signature, hash))
}

pub(crate) fn make_bid(
    builder: Address,
    parent_hash: B256,
    block_number: u64,
    txs: Vec<TxEnvelope>,
    gas_fee: U256,
    nontaxable_fee: U256,
) -> Bid {
    let gas_used = 21_000 * txs.len() as u64;
    Bid {
        builder,
        block_number,
        parent_hash,
        txs,
        un_revertible: HashSet::new(),
        gas_used,
        gas_fee,
        nontaxable_fee,
        blob_sidecars: HashMap::new(),
        bid_hash: B256::random(),
    }
}

/// Executor that burns 21k gas per transaction, credits the environment's
/// state per configured tx hash, and fails or errors on request.
#[derive(Default)]
pub(crate) struct MockExecutor {
    /// Transactions that execute but end with a failed receipt.
    fail: Mutex<HashSet<B256>>,
    /// Transactions that error out of execution entirely.
    error: Mutex<HashSet<B256>>,
    /// System-address credit applied when the given transaction executes.
    credits: Mutex<HashMap<B256, U256>>,
    /// Artificial execution time per transaction.
    delay: Mutex<Duration>,
}

impl MockExecutor {
    pub(crate) fn fail_tx(&self, hash: B256) {
        self.fail.lock().insert(hash);
    }

    pub(crate) fn error_tx(&self, hash: B256) {
        self.error.lock().insert(hash);
    }

    /// Credit the system address by `amount` when `hash` executes.
    pub(crate) fn credit_for(&self, hash: B256, amount: U256) {
        self.credits.lock().insert(hash, amount);
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }
}

impl BlockExecutor for MockExecutor {
    fn apply_transaction(
        &self,
        env: &mut Environment,
        tx: &TxEnvelope,
    ) -> Result<Receipt, BoxError> {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let tx_hash = *tx.tx_hash();
        if self.error.lock().contains(&tx_hash) {
            return Err("execution reverted: out of gas".into());
        }
        if let Some(pool) = env.gas_pool.as_mut() {
            pool.sub_gas(21_000)?;
        }
        if let Some(amount) = self.credits.lock().get(&tx_hash).copied() {
            if let Some(state) = env.state_mut() {
                state.add_balance(crate::runtime::SYSTEM_ADDRESS, amount);
            }
        }

        let success = !self.fail.lock().contains(&tx_hash);
        env.header.gas_used += 21_000;
        Ok(Receipt {
            status: success.into(),
            cumulative_gas_used: env.header.gas_used,
            logs: vec![],
        })
    }
}

pub(crate) struct MockWorker {
    state: SharedState,
    etherbase: Address,
    gas_limit: u64,
    block_number: u64,
    initial_size: AtomicU64,
    /// System-address credit applied by the mempool fill, pretending one
    /// extra transaction landed.
    fill_credit: Mutex<Option<U256>>,
    prepare_error: Mutex<Option<String>>,
}

impl MockWorker {
    pub(crate) fn new(state: SharedState, gas_limit: u64) -> Self {
        Self {
            state,
            etherbase: Address::repeat_byte(0xee),
            gas_limit,
            block_number: 100,
            initial_size: AtomicU64::new(0),
            fill_credit: Mutex::new(None),
            prepare_error: Mutex::new(None),
        }
    }

    pub(crate) fn set_initial_size(&self, size: u64) {
        self.initial_size.store(size, Ordering::SeqCst);
    }

    pub(crate) fn set_fill_credit(&self, amount: U256) {
        *self.fill_credit.lock() = Some(amount);
    }

    pub(crate) fn set_prepare_error(&self, message: &str) {
        *self.prepare_error.lock() = Some(message.to_string());
    }
}

impl BidWorker for MockWorker {
    fn prepare_work(&self, params: &WorkParams) -> Result<Environment, BoxError> {
        if let Some(message) = self.prepare_error.lock().clone() {
            return Err(message.into());
        }
        let header = Header {
            number: self.block_number,
            gas_limit: self.gas_limit,
            timestamp: 1_700_000_000,
            parent_hash: params.parent_hash,
            beneficiary: params.coinbase,
            ..Default::default()
        };
        let mut env = Environment::new(header, params.coinbase, self.state.state_handle());
        env.size = self.initial_size.load(Ordering::SeqCst);
        Ok(env)
    }

    fn etherbase(&self) -> Address {
        self.etherbase
    }

    fn fill_transactions(
        &self,
        _interrupt: &Interrupt,
        env: &mut Environment,
        _bid_txs: &std::collections::HashSet<B256>,
    ) -> Result<(), BoxError> {
        if let Some(amount) = *self.fill_credit.lock() {
            if let Some(state) = env.state_mut() {
                state.add_balance(crate::runtime::SYSTEM_ADDRESS, amount);
            }
            env.tcount += 1;
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MockChain {
    head_senders: Mutex<Vec<mpsc::UnboundedSender<ChainHeadEvent>>>,
    headers: Mutex<HashMap<B256, Header>>,
    tries_in_memory: u64,
}

impl MockChain {
    pub(crate) fn with_tries_in_memory(tries_in_memory: u64) -> Self {
        Self { tries_in_memory, ..Default::default() }
    }

    pub(crate) fn insert_header(&self, hash: B256, header: Header) {
        self.headers.lock().insert(hash, header);
    }

    pub(crate) fn announce_head(&self, event: ChainHeadEvent) {
        for sender in self.head_senders.lock().iter() {
            let _ = sender.send(event.clone());
        }
    }
}

impl ChainContext for MockChain {
    fn subscribe_chain_head(&self) -> mpsc::UnboundedReceiver<ChainHeadEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.head_senders.lock().push(tx);
        rx
    }

    fn header_by_hash(&self, hash: &B256) -> Option<Header> {
        self.headers.lock().get(hash).cloned()
    }

    fn tries_in_memory(&self) -> u64 {
        self.tries_in_memory
    }
}

pub(crate) struct MockConsensus {
    delay: Mutex<Option<Duration>>,
}

impl MockConsensus {
    pub(crate) fn with_delay(delay: Option<Duration>) -> Self {
        Self { delay: Mutex::new(delay) }
    }

    pub(crate) fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }
}

impl ConsensusEngine for MockConsensus {
    fn delay(&self, _header: &Header, _left_over: Duration) -> Option<Duration> {
        *self.delay.lock()
    }
}

/// Builder client that records every reported issue.
#[derive(Default)]
pub(crate) struct RecordingBuilderClient {
    issues: Mutex<Vec<BidIssue>>,
}

impl RecordingBuilderClient {
    pub(crate) fn issues(&self) -> Vec<BidIssue> {
        self.issues.lock().clone()
    }
}

#[async_trait]
impl BuilderClient for RecordingBuilderClient {
    async fn report_issue(&self, issue: &BidIssue) -> Result<(), BoxError> {
        self.issues.lock().push(issue.clone());
        Ok(())
    }
}
