use crate::error::BidError;
use alloy_primitives::{Address, B256};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// Max bid number per builder for one block.
pub const MAX_BIDS_PER_BUILDER_PER_BLOCK: usize = 3;

/// Bids in flight, keyed by block number, builder, and bid hash.
///
/// Guards duplicate submissions and the per-builder quota. Each operation
/// takes the single internal lock, so checks and mutations are atomic with
/// respect to one another.
#[derive(Debug, Default)]
pub struct PendingBids {
    inner: RwLock<HashMap<u64, HashMap<Address, HashSet<B256>>>>,
}

impl PendingBids {
    /// Admission check: rejects a hash already recorded for this block and
    /// builders at quota.
    pub fn check(&self, block_number: u64, builder: Address, bid_hash: B256) -> Result<(), BidError> {
        let inner = self.inner.read();
        if let Some(hashes) = inner.get(&block_number).and_then(|b| b.get(&builder)) {
            if hashes.contains(&bid_hash) {
                return Err(BidError::DuplicateBid);
            }
            if hashes.len() >= MAX_BIDS_PER_BUILDER_PER_BLOCK {
                return Err(BidError::TooManyBids);
            }
        }
        Ok(())
    }

    /// Record a bid. The caller must have passed [`check`] first.
    ///
    /// [`check`]: PendingBids::check
    pub fn add(&self, block_number: u64, builder: Address, bid_hash: B256) {
        self.inner
            .write()
            .entry(block_number)
            .or_default()
            .entry(builder)
            .or_default()
            .insert(bid_hash);
    }

    /// Forget everything recorded for `block_number`.
    pub fn drop_block(&self, block_number: u64) {
        self.inner.write().remove(&block_number);
    }

    /// Total bids currently tracked, across all blocks and builders.
    pub fn bid_count(&self) -> usize {
        self.inner
            .read()
            .values()
            .flat_map(|builders| builders.values())
            .map(|hashes| hashes.len())
            .sum()
    }
}
