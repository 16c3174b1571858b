use alloy_primitives::U256;

/// Errors surfaced to a builder submitting a bid.
///
/// Only `MevBusy` is retryable; the admission rejections are final for the
/// offending bid and `Discarded` means a stronger candidate already holds
/// the slot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BidError {
    /// The admission channel was full or the verdict did not arrive in time.
    #[error("mev busy")]
    MevBusy,
    /// The same bid hash was already submitted for this block.
    #[error("bid already exists")]
    DuplicateBid,
    /// The builder reached its per-block bid quota.
    #[error("too many bids")]
    TooManyBids,
    /// The bid is weaker than the in-flight or best candidate.
    #[error("bid is discarded, current best is {current_best} wei (after burn)")]
    Discarded {
        /// Post-burn reward of the candidate the bid lost to.
        current_best: U256,
    },
}

/// Failures inside a single bid simulation. Reported to the builder and
/// never retried by the engine.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("environment not prepared")]
    EnvironmentMissing,
    #[error("gas used exceeds gas limit")]
    GasExceeded,
    #[error("simulation abort due to better bid arrived")]
    BetterBidArrived,
    #[error("miner exit")]
    MinerExit,
    #[error("invalid tx in bid, {0}")]
    InvalidTx(String),
    #[error("no revertible transaction failed")]
    UnRevertibleTxFailed,
    #[error("reward does not achieve the expectation")]
    RewardNotAchieved,
    #[error("invalid bid size")]
    InvalidBidSize,
    #[error("blob transaction without blobs in miner")]
    MissingBlobSidecar,
    #[error("max data blobs reached")]
    MaxBlobsReached,
    /// Failure preparing the execution environment, message from the worker.
    #[error("{0}")]
    Worker(String),
}
