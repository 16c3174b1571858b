use crate::{bid::Bid, runtime::BidRuntime};
use alloy_primitives::{B256, U256};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

/// Winning simulated bid per parent hash.
///
/// An entry owns its runtime (and through it the execution environment);
/// every replacement releases the outgoing environment before the new
/// runtime is installed.
#[derive(Default)]
pub struct BestBids {
    inner: RwLock<HashMap<B256, BidRuntime>>,
}

impl BestBids {
    /// Install `runtime` unconditionally, releasing the previous winner's
    /// environment.
    pub fn insert(&self, parent_hash: B256, runtime: BidRuntime) {
        let mut inner = self.inner.write();
        if let Some(mut last) = inner.insert(parent_hash, runtime) {
            last.discard_env();
        }
    }

    /// Install `runtime` only when it is strictly more rewarding than the
    /// current entry; otherwise hand it back for cleanup.
    pub fn try_insert(&self, parent_hash: B256, runtime: BidRuntime) -> Result<(), BidRuntime> {
        let mut inner = self.inner.write();
        if let Some(best) = inner.get(&parent_hash) {
            if runtime.total_reward() <= best.total_reward() {
                return Err(runtime);
            }
        }
        if let Some(mut last) = inner.insert(parent_hash, runtime) {
            last.discard_env();
        }
        Ok(())
    }

    pub fn bid(&self, parent_hash: &B256) -> Option<Arc<Bid>> {
        self.inner.read().get(parent_hash).map(|rt| rt.bid.clone())
    }

    pub fn total_reward(&self, parent_hash: &B256) -> Option<U256> {
        self.inner.read().get(parent_hash).map(|rt| rt.total_reward())
    }

    pub fn total_reward_from_builder(&self, parent_hash: &B256) -> Option<U256> {
        self.inner.read().get(parent_hash).map(|rt| rt.total_reward_from_builder())
    }

    /// Transfer ownership of the winning runtime to the caller, typically
    /// the sealing miner. The environment travels with it undisturbed.
    pub fn take(&self, parent_hash: &B256) -> Option<BidRuntime> {
        self.inner.write().remove(parent_hash)
    }

    /// Evict the entry for `parent_hash` and everything at or below the
    /// pruning horizon, releasing each environment.
    pub fn clear_stale(&self, parent_hash: B256, block_number: u64, tries_in_memory: u64) {
        let mut inner = self.inner.write();
        if let Some(mut evicted) = inner.remove(&parent_hash) {
            evicted.discard_env();
        }
        let horizon = block_number.saturating_sub(tries_in_memory);
        inner.retain(|_, rt| {
            if rt.bid.block_number <= horizon {
                debug!(
                    bid_hash = %rt.bid.bid_hash,
                    block_number = rt.bid.block_number,
                    "pruning stale best bid"
                );
                rt.discard_env();
                false
            } else {
                true
            }
        });
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// The bid currently holding the simulation slot for each parent hash.
///
/// At most one entry per parent exists across the whole engine; the
/// environment of the run stays with the simulator, so sweeping entries
/// here is pure bookkeeping.
#[derive(Debug, Default)]
pub struct SimulatingBids {
    inner: RwLock<HashMap<B256, Arc<Bid>>>,
}

impl SimulatingBids {
    pub fn insert(&self, parent_hash: B256, bid: Arc<Bid>) {
        self.inner.write().insert(parent_hash, bid);
    }

    pub fn bid(&self, parent_hash: &B256) -> Option<Arc<Bid>> {
        self.inner.read().get(parent_hash).cloned()
    }

    pub fn remove(&self, parent_hash: &B256) {
        self.inner.write().remove(parent_hash);
    }

    pub fn clear_stale(&self, block_number: u64, tries_in_memory: u64) {
        let horizon = block_number.saturating_sub(tries_in_memory);
        self.inner.write().retain(|_, bid| bid.block_number > horizon);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
