//! Bid arbitration engine for a block-producing validator.
//!
//! Competing builders submit fully formed block payloads ("bids") for the
//! next block. For each parent hash the engine admits bids under a
//! per-builder quota, arbitrates them by expected reward, simulates at most
//! one candidate at a time (preempting a weaker in-flight run when a
//! stronger bid arrives), and keeps the single best simulated bid for the
//! sealing miner to take.
//!
//! The surrounding node supplies the chain through the narrow seams in
//! [`traits`]: a [`traits::BidWorker`] that prepares execution
//! environments and fills from the mempool, a [`traits::ConsensusEngine`]
//! that knows the sealing deadline, a [`traits::ChainContext`] for head
//! events and headers, and a [`traits::BlockExecutor`] that applies
//! transactions.

pub mod bid;
pub mod builder_client;
pub mod config;
pub mod env;
pub mod error;
pub mod interrupt;
pub mod metrics;
pub mod pending;
pub mod rpc;
pub mod runtime;
pub mod simulator;
pub mod tables;
pub mod traits;

#[cfg(test)]
pub(crate) mod test_util;

pub use bid::Bid;
pub use config::{BuilderEntry, MevConfig};
pub use error::{BidError, SimulationError};
pub use runtime::BidRuntime;
pub use simulator::BidSimulator;

/// Convenient alias for boxed errors crossing the host-node seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
