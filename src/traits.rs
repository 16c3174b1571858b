//! Seams between the engine and the surrounding node.
//!
//! The host implements these for its own chain, consensus, executor, and
//! transaction pool; the engine never reaches past them.

use crate::{env::Environment, interrupt::Interrupt, BoxError};
use alloy_consensus::{Header, Receipt, TxEnvelope};
use alloy_primitives::{Address, B256};
use std::{collections::HashSet, time::Duration};
use tokio::sync::mpsc;

/// Parameters for preparing a fresh execution environment.
#[derive(Debug, Clone)]
pub struct WorkParams {
    pub parent_hash: B256,
    pub coinbase: Address,
}

/// Canonical head advance, delivered to the janitor.
#[derive(Debug, Clone)]
pub struct ChainHeadEvent {
    pub hash: B256,
    pub parent_hash: B256,
    pub block_number: u64,
}

/// The miner-side worker the engine borrows for environment setup and the
/// optional mempool fill.
pub trait BidWorker: Send + Sync {
    /// Build a ready environment on top of `parent_hash`: header timing set
    /// by consensus, state opened, trie prefetching started.
    fn prepare_work(&self, params: &WorkParams) -> Result<Environment, BoxError>;

    /// The validator's fee recipient.
    fn etherbase(&self) -> Address;

    /// Append the best non-conflicting mempool transactions to `env`,
    /// skipping everything in `bid_txs`. Honors `interrupt` between
    /// transactions; errors are advisory.
    fn fill_transactions(
        &self,
        interrupt: &Interrupt,
        env: &mut Environment,
        bid_txs: &HashSet<B256>,
    ) -> Result<(), BoxError>;
}

/// Consensus timing oracle.
pub trait ConsensusEngine: Send + Sync {
    /// Time remaining before the sealing deadline of `header`, minus
    /// `left_over`. `None` (or zero) means there is no budget left and no
    /// new work should start.
    fn delay(&self, header: &Header, left_over: Duration) -> Option<Duration>;
}

/// Chain access needed by the janitor and submission path.
pub trait ChainContext: Send + Sync {
    /// Subscribe to canonical head advances. The engine treats channel
    /// closure as fatal and shuts its loops down.
    fn subscribe_chain_head(&self) -> mpsc::UnboundedReceiver<ChainHeadEvent>;

    fn header_by_hash(&self, hash: &B256) -> Option<Header>;

    /// Retained historical trie depth; best bids older than this past the
    /// head are pruned.
    fn tries_in_memory(&self) -> u64;
}

/// Applies a single transaction to an environment's pending state.
///
/// The executor deducts the environment's gas pool, mutates the state, and
/// returns the receipt; appending the transaction to the environment is
/// the caller's job.
pub trait BlockExecutor: Send + Sync {
    fn apply_transaction(
        &self,
        env: &mut Environment,
        tx: &TxEnvelope,
    ) -> Result<Receipt, BoxError>;
}
