use crate::{
    bid::Bid,
    env::Environment,
    error::SimulationError,
    traits::BlockExecutor,
};
use alloy_consensus::{Receipt, Transaction, TxReceipt};
use alloy_eips::eip2718::Encodable2718;
use alloy_primitives::{address, Address, U256};
use std::{
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

/// Sink address that accumulates the base gas reward during execution;
/// its balance is the pre-burn packed reward of a candidate block.
pub const SYSTEM_ADDRESS: Address = address!("0xfffffffffffffffffffffffffffffffffffffffe");

/// Share of the base gas reward kept after the protocol burn.
const BURN_KEEP_NUMERATOR: u64 = 99;
const BURN_DENOMINATOR: u64 = 100;

/// Gas consumed by one blob.
pub const BLOB_TX_BLOB_GAS_PER_BLOB: u64 = 131_072;
/// Blob gas ceiling for a single block.
pub const MAX_BLOB_GAS_PER_BLOCK: u64 = 6 * BLOB_TX_BLOB_GAS_PER_BLOB;

/// Reward remaining after the fixed 1% base-reward burn. Integer floor,
/// never floating point: the comparison path depends on exact arithmetic.
pub fn reward_after_burn(pre_burn: U256) -> U256 {
    pre_burn * U256::from(BURN_KEEP_NUMERATOR) / U256::from(BURN_DENOMINATOR)
}

/// Mutable execution context of a single bid.
///
/// Owned by the simulator while simulating, then either moved into the
/// best-bid table or discarded; never shared between the two.
pub struct BidRuntime {
    pub bid: Arc<Bid>,
    pub env: Option<Environment>,

    /// System sink balance frozen after the last builder-supplied
    /// transaction, pre-burn.
    packed_reward_builder: U256,
    /// Running system sink balance, pre-burn; diverges from the builder
    /// value only when the mempool merge added transactions.
    packed_reward_final: U256,
    /// Value transferred directly to configured validator EOAs.
    direct_bribe: U256,

    /// One-shot completion flag, set when the simulation run exits.
    pub finished: Arc<AtomicBool>,
    /// Wall time of the successful simulation run.
    pub duration: Option<Duration>,
}

impl BidRuntime {
    pub fn new(bid: Arc<Bid>) -> Self {
        Self {
            bid,
            env: None,
            packed_reward_builder: U256::ZERO,
            packed_reward_final: U256::ZERO,
            direct_bribe: U256::ZERO,
            finished: Arc::new(AtomicBool::new(false)),
            duration: None,
        }
    }

    /// Snapshot the system sink balance into the packed reward. With
    /// `raw_bid` set the builder accumulator freezes too; the mempool
    /// merge afterwards only moves the final one.
    pub fn update_pack_reward(&mut self, raw_bid: bool) {
        let balance = self
            .env
            .as_ref()
            .map(|env| env.state_balance(SYSTEM_ADDRESS))
            .unwrap_or_default();
        self.packed_reward_final = balance;
        if raw_bid {
            self.packed_reward_builder = balance;
        }
    }

    /// The builder's claim, used to rank bids before execution.
    pub fn expected_reward_from_builder(&self) -> U256 {
        self.bid.expected_reward_after_burn()
    }

    /// Post-execution reward attributable to the builder's own
    /// transactions.
    pub fn total_reward_from_builder(&self) -> U256 {
        reward_after_burn(self.packed_reward_builder) + self.direct_bribe
    }

    /// Full post-execution reward, including mempool-merged transactions.
    pub fn total_reward(&self) -> U256 {
        reward_after_burn(self.packed_reward_final) + self.direct_bribe
    }

    /// The executed bid delivers at least what the builder claimed.
    pub fn valid_reward(&self) -> bool {
        self.direct_bribe >= self.bid.nontaxable_fee
            && self.packed_reward_builder >= self.bid.gas_fee
    }

    pub fn direct_bribe(&self) -> U256 {
        self.direct_bribe
    }

    /// Credit a successful plain transfer to a configured validator EOA as
    /// direct tip.
    pub fn check_validator_bribe(
        &mut self,
        accept_eoas: &[Address],
        tx: &alloy_consensus::TxEnvelope,
        receipt: &Receipt,
    ) {
        if accept_eoas.is_empty() {
            return;
        }
        let Some(to) = tx.to() else { return };
        if receipt.status() && tx.value() > U256::ZERO && accept_eoas.contains(&to) {
            self.direct_bribe += tx.value();
        }
    }

    /// Apply one bid transaction to the environment.
    ///
    /// Enforces the blob-gas ceiling and sidecar presence for blob
    /// transactions, and rejects the whole bid when an unrevertible
    /// transaction reverts. On success the transaction, receipt and any
    /// sidecar are appended and the environment counters advance.
    pub fn commit_transaction(
        &mut self,
        executor: &dyn BlockExecutor,
        tx: &alloy_consensus::TxEnvelope,
        un_revertible: bool,
    ) -> Result<Receipt, SimulationError> {
        let Some(env) = self.env.as_mut() else {
            return Err(SimulationError::EnvironmentMissing);
        };
        let tx_hash = *tx.tx_hash();

        let sidecar = match tx.blob_versioned_hashes() {
            Some(hashes) if !hashes.is_empty() => {
                let Some(sidecar) = self.bid.blob_sidecars.get(&tx_hash) else {
                    return Err(SimulationError::MissingBlobSidecar);
                };
                let blob_count = sidecar.blobs.len() as u64;
                // The executor does not meter blob gas, so the ceiling is
                // checked here before the state changes.
                if (env.blobs as u64 + blob_count) * BLOB_TX_BLOB_GAS_PER_BLOB
                    > MAX_BLOB_GAS_PER_BLOCK
                {
                    return Err(SimulationError::MaxBlobsReached);
                }
                Some(sidecar.clone())
            }
            _ => None,
        };

        let receipt = executor
            .apply_transaction(env, tx)
            .map_err(|err| SimulationError::InvalidTx(err.to_string()))?;
        if un_revertible && !receipt.status() {
            return Err(SimulationError::UnRevertibleTxFailed);
        }

        if let Some(sidecar) = sidecar {
            let blob_count = sidecar.blobs.len() as u64;
            env.blobs += sidecar.blobs.len();
            let blob_gas = blob_count * BLOB_TX_BLOB_GAS_PER_BLOB;
            env.header.blob_gas_used =
                Some(env.header.blob_gas_used.unwrap_or_default() + blob_gas);
            env.sidecars.push(crate::env::EnvSidecar {
                tx_hash,
                tx_index: env.txs.len() as u64,
                sidecar,
            });
        }

        env.txs.push(tx.clone());
        env.receipts.push(receipt.clone());
        env.tcount += 1;
        env.size += tx.encode_2718_len() as u64;

        Ok(receipt)
    }

    /// Release the environment if one is still attached.
    pub fn discard_env(&mut self) {
        if let Some(env) = self.env.as_mut() {
            env.discard();
        }
    }
}

impl std::fmt::Debug for BidRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BidRuntime")
            .field("bid_hash", &self.bid.bid_hash)
            .field("builder", &self.bid.builder)
            .field("block_number", &self.bid.block_number)
            .field("total_reward", &self.total_reward())
            .finish()
    }
}
