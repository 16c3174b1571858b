use alloy_primitives::Address;
use metrics::{Counter, Gauge, Histogram};
use metrics_derive::Metrics;

/// Engine-wide MEV metrics.
#[derive(Metrics, Clone)]
#[metrics(scope = "mev")]
pub struct MevMetrics {
    /// Wall time of a full bid simulation
    pub bid_sim_duration_seconds: Histogram,
    /// Bids currently tracked by the pending ledger
    pub pending_bids: Gauge,
    /// Simulated bids that won the best-bid slot
    pub valid_bids_total: Counter,
    /// Simulated bids that failed or lost to the current best
    pub invalid_bids_total: Counter,
}

/// Per-builder issue counter, registered on demand when a simulation for
/// that builder fails.
pub fn record_builder_issue(builder: Address) {
    metrics::counter!("mev_bid_err_total", "builder" => builder.to_string()).increment(1);
}
