use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A builder the validator is willing to accept bids from, as configured
/// by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuilderEntry {
    pub address: Address,
    /// RPC endpoint for reporting issues back. May be empty when the
    /// builder is reachable only through the sentry.
    #[serde(default)]
    pub url: String,
}

/// MEV options recognized by the engine, embedded in the node's own
/// configuration layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MevConfig {
    /// Start receiving bids immediately on launch.
    pub enabled: bool,
    /// Central fan-out endpoint; when set, all builders multiplex through
    /// it instead of being dialed directly.
    pub sentry_url: Option<String>,
    pub builders: Vec<BuilderEntry>,
    /// Addresses whose received value inside a bid counts as direct tip to
    /// the validator.
    pub validator_bribe_eoas: Vec<Address>,
    /// Fill the winning environment from the mempool after replaying the
    /// bid, deadline permitting.
    pub greedy_merge_tx: bool,
    /// Slack subtracted from the consensus deadline before the simulation
    /// cutoff, in milliseconds.
    pub bid_simulation_left_over_ms: u64,
}

impl Default for MevConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sentry_url: None,
            builders: Vec::new(),
            validator_bribe_eoas: Vec::new(),
            greedy_merge_tx: false,
            bid_simulation_left_over_ms: 50,
        }
    }
}

impl MevConfig {
    pub fn bid_simulation_left_over(&self) -> Duration {
        Duration::from_millis(self.bid_simulation_left_over_ms)
    }
}
