use crate::runtime::reward_after_burn;
use alloy_consensus::{BlobTransactionSidecar, TxEnvelope};
use alloy_primitives::{Address, B256, U256};
use std::collections::{HashMap, HashSet};

/// A fully formed candidate block body offered by a builder.
///
/// The transaction list is ordered; the final transaction is the pay-bid
/// transaction that transfers the builder's commitment to the validator
/// and is always executed unrevertibly.
#[derive(Debug, Clone)]
pub struct Bid {
    pub builder: Address,
    pub block_number: u64,
    pub parent_hash: B256,
    pub txs: Vec<TxEnvelope>,
    /// Hashes of transactions whose revert invalidates the whole bid.
    pub un_revertible: HashSet<B256>,
    /// Gas the builder claims the bid consumes.
    pub gas_used: u64,
    /// Claimed total gas reward, before the protocol burn.
    pub gas_fee: U256,
    /// Claimed direct tip to the validator, outside the burn.
    pub nontaxable_fee: U256,
    /// Sidecars for any blob transactions in the bid, keyed by tx hash.
    pub blob_sidecars: HashMap<B256, BlobTransactionSidecar>,
    /// Stable content hash computed at the submission boundary.
    pub bid_hash: B256,
}

impl Bid {
    pub fn hash(&self) -> B256 {
        self.bid_hash
    }

    /// The reward the builder claims this bid is worth, post-burn. Used to
    /// rank bids before any of them has executed.
    pub fn expected_reward_after_burn(&self) -> U256 {
        reward_after_burn(self.gas_fee) + self.nontaxable_fee
    }

    /// The pay-bid transaction closing the bid, if any transaction exists.
    pub fn pay_bid_tx(&self) -> Option<&TxEnvelope> {
        self.txs.last()
    }
}
