use alloy_consensus::{BlobTransactionSidecar, Header, Receipt, TxEnvelope};
use alloy_primitives::{Address, B256, U256};
use tracing::trace;

/// Gas left for transaction execution inside one candidate block.
#[derive(Debug, Clone, Copy)]
pub struct GasPool(u64);

#[derive(Debug, thiserror::Error)]
#[error("gas limit reached")]
pub struct GasPoolExhausted;

impl GasPool {
    pub fn new(gas: u64) -> Self {
        Self(gas)
    }

    pub fn gas(&self) -> u64 {
        self.0
    }

    pub fn add_gas(&mut self, amount: u64) {
        self.0 = self.0.saturating_add(amount);
    }

    pub fn sub_gas(&mut self, amount: u64) -> Result<(), GasPoolExhausted> {
        if self.0 < amount {
            return Err(GasPoolExhausted);
        }
        self.0 -= amount;
        Ok(())
    }
}

/// Access to the pending execution state of an environment.
///
/// The engine itself only ever reads the balance of the system sink
/// address; mutation belongs to the block executor applying transactions.
pub trait StateDb: Send + Sync {
    fn balance(&self, address: Address) -> U256;

    fn add_balance(&mut self, address: Address, amount: U256);
}

/// A blob sidecar retained alongside the environment until sealing.
#[derive(Debug, Clone)]
pub struct EnvSidecar {
    pub tx_hash: B256,
    pub tx_index: u64,
    pub sidecar: BlobTransactionSidecar,
}

/// Execution context for one candidate block.
///
/// Owned by exactly one `BidRuntime` at a time and transferred, never
/// copied. Whoever abandons the owning runtime must call [`discard`]
/// to release the state handle, otherwise accumulated trie state leaks.
///
/// [`discard`]: Environment::discard
pub struct Environment {
    /// Header of the block under construction, timing set by consensus.
    pub header: Header,
    pub coinbase: Address,
    /// Initialized lazily by the simulator once the reserves are known.
    pub gas_pool: Option<GasPool>,
    state: Option<Box<dyn StateDb>>,
    pub txs: Vec<TxEnvelope>,
    pub receipts: Vec<Receipt>,
    pub sidecars: Vec<EnvSidecar>,
    /// Count of transactions applied so far.
    pub tcount: usize,
    /// Accumulated encoded size of the applied transactions in bytes.
    pub size: u64,
    /// Count of blobs carried by the applied transactions.
    pub blobs: usize,
}

impl Environment {
    pub fn new(header: Header, coinbase: Address, state: Box<dyn StateDb>) -> Self {
        Self {
            header,
            coinbase,
            gas_pool: None,
            state: Some(state),
            txs: Vec::new(),
            receipts: Vec::new(),
            sidecars: Vec::new(),
            tcount: 0,
            size: 0,
            blobs: 0,
        }
    }

    /// Balance of `address` in the pending state, zero once discarded.
    pub fn state_balance(&self, address: Address) -> U256 {
        self.state.as_ref().map(|s| s.balance(address)).unwrap_or_default()
    }

    /// Mutable handle to the pending state, gone once discarded.
    pub fn state_mut(&mut self) -> Option<&mut (dyn StateDb + '_)> {
        match self.state.as_mut() {
            Some(state) => Some(&mut **state as &mut dyn StateDb),
            None => None,
        }
    }

    /// Release the state handle. Idempotent: the handle is taken out, so a
    /// second call finds nothing to release.
    pub fn discard(&mut self) {
        if let Some(state) = self.state.take() {
            drop(state);
            trace!(block_number = self.header.number, "execution environment discarded");
        }
    }

    pub fn is_discarded(&self) -> bool {
        self.state.is_none()
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("block_number", &self.header.number)
            .field("tcount", &self.tcount)
            .field("size", &self.size)
            .field("blobs", &self.blobs)
            .field("discarded", &self.is_discarded())
            .finish()
    }
}
