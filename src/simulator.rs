use crate::{
    bid::Bid,
    builder_client::{BidIssue, BuilderClient, HttpBuilderClient},
    config::MevConfig,
    env::GasPool,
    error::{BidError, SimulationError},
    interrupt::{Interrupt, COMMIT_INTERRUPT_BETTER_BID},
    metrics::{record_builder_issue, MevMetrics},
    pending::PendingBids,
    runtime::BidRuntime,
    tables::{BestBids, SimulatingBids},
    traits::{BidWorker, BlockExecutor, ChainContext, ConsensusEngine, WorkParams},
    BoxError,
};
use alloy_primitives::{Address, B256, U256};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Gas reserved for end-of-block system transactions.
pub const SYSTEM_TXS_GAS: u64 = 5_000_000;
/// Gas reserved for the pay-bid transaction closing a bid.
pub const PAY_BID_TX_GAS_LIMIT: u64 = 25_000;
/// Hard cap on the wire size of a block message.
pub const MAX_MESSAGE_SIZE: u64 = 10 * 1024 * 1024;
/// Headroom kept below the message cap for the header and sidecar framing.
pub const BLOCK_RESERVE_SIZE: u64 = 100 * 1024;

/// Buffered capacity of the bid arrival channel.
const NEW_BID_CHANNEL_SIZE: usize = 100;
/// Shared deadline for the admission send and the verdict wait.
const BID_ADMISSION_TIMEOUT: Duration = Duration::from_secs(1);

/// A newly arrived bid together with the submitter's feedback channel.
struct NewBidPackage {
    bid: Arc<Bid>,
    feedback: Option<oneshot::Sender<Result<(), BidError>>>,
}

/// Handoff from the arbiter to the simulation loop. The channel holding
/// these has a single slot, which serializes simulations per engine.
struct SimRequest {
    interrupt: Interrupt,
    runtime: BidRuntime,
}

struct LoopChannels {
    new_bid_rx: mpsc::Receiver<NewBidPackage>,
    sim_rx: mpsc::Receiver<SimRequest>,
}

enum SimProgress {
    /// Ran through the size check; eligible for the best-bid slot.
    Completed,
    /// Ran out of budget before executing; no error, nothing reported.
    Aborted,
}

/// The bid arbitration engine.
///
/// Receives bids from builders, arbitrates them by expected reward,
/// simulates at most one candidate per parent hash (preempting a weaker
/// in-flight run when a stronger bid arrives), maintains the best
/// simulated bid per parent, and reports failed bids back to their
/// builders.
pub struct BidSimulator {
    config: MevConfig,
    /// Total slack subtracted from the consensus deadline before any
    /// simulation work starts.
    sim_left_over: Duration,
    min_gas_price: U256,

    chain: Arc<dyn ChainContext>,
    engine: Arc<dyn ConsensusEngine>,
    executor: Arc<dyn BlockExecutor>,
    worker: Arc<dyn BidWorker>,

    running: AtomicBool,
    bid_receiving: AtomicBool,
    shutdown: CancellationToken,

    sentry: RwLock<Option<Arc<dyn BuilderClient>>>,
    /// Registered builders. `None` means registered without a reachable
    /// transport (issues are counted but not delivered).
    builders: RwLock<HashMap<Address, Option<Arc<dyn BuilderClient>>>>,

    new_bid_tx: mpsc::Sender<NewBidPackage>,
    sim_tx: mpsc::Sender<SimRequest>,
    loops: Mutex<Option<LoopChannels>>,

    pending: PendingBids,
    best_bids: BestBids,
    simulating: SimulatingBids,

    metrics: MevMetrics,
}

impl BidSimulator {
    pub fn new(
        config: MevConfig,
        delay_left_over: Duration,
        min_gas_price: U256,
        chain: Arc<dyn ChainContext>,
        engine: Arc<dyn ConsensusEngine>,
        executor: Arc<dyn BlockExecutor>,
        worker: Arc<dyn BidWorker>,
    ) -> Arc<Self> {
        let (new_bid_tx, new_bid_rx) = mpsc::channel(NEW_BID_CHANNEL_SIZE);
        let (sim_tx, sim_rx) = mpsc::channel(1);

        let sim_left_over = delay_left_over + config.bid_simulation_left_over();
        let enabled = config.enabled;

        let simulator = Arc::new(Self {
            config,
            sim_left_over,
            min_gas_price,
            chain,
            engine,
            executor,
            worker,
            running: AtomicBool::new(false),
            bid_receiving: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            sentry: RwLock::new(None),
            builders: RwLock::new(HashMap::new()),
            new_bid_tx,
            sim_tx,
            loops: Mutex::new(Some(LoopChannels { new_bid_rx, sim_rx })),
            pending: PendingBids::default(),
            best_bids: BestBids::default(),
            simulating: SimulatingBids::default(),
            metrics: MevMetrics::default(),
        });

        if enabled {
            simulator.bid_receiving.store(true, Ordering::Release);
            simulator.dial_sentry_and_builders();
            if simulator.builders.read().is_empty() {
                warn!("no valid builders configured");
            }
        }

        simulator
    }

    /// Mark the engine running and spawn the worker loops. The loops are
    /// spawned once; later calls only flip the flag back on.
    pub fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::Release);
        let Some(channels) = self.loops.lock().take() else { return };

        let arbiter = self.clone();
        tokio::spawn(async move { arbiter.new_bid_loop(channels.new_bid_rx).await });
        let sim = self.clone();
        tokio::spawn(async move { sim.sim_loop(channels.sim_rx).await });
        let janitor = self.clone();
        tokio::spawn(async move { janitor.clear_loop().await });
        info!("bid simulator started");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Stop permanently: the worker loops exit and cannot be restarted.
    pub fn close(&self) {
        self.running.store(false, Ordering::Release);
        self.shutdown.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn receiving_bids(&self) -> bool {
        self.bid_receiving.load(Ordering::Acquire)
    }

    pub fn start_receiving_bids(&self) {
        self.dial_sentry_and_builders();
        self.bid_receiving.store(true, Ordering::Release);
    }

    pub fn stop_receiving_bids(&self) {
        self.bid_receiving.store(false, Ordering::Release);
    }

    // --- builder registry ---

    fn dial_sentry_and_builders(&self) {
        if let Some(url) = self.config.sentry_url.clone() {
            match HttpBuilderClient::dial(&url) {
                Ok(client) => *self.sentry.write() = Some(Arc::new(client)),
                Err(err) => error!(%url, %err, "failed to dial sentry"),
            }
        }
        for entry in self.config.builders.clone() {
            if let Err(err) = self.add_builder(entry.address, &entry.url) {
                error!(builder = %entry.address, url = %entry.url, %err, "failed to dial builder");
            }
        }
    }

    /// Register a builder. With a sentry configured all builders share its
    /// client; otherwise the URL is dialed directly. An empty URL
    /// registers the builder without a transport.
    pub fn add_builder(&self, builder: Address, url: &str) -> Result<(), BoxError> {
        let client: Option<Arc<dyn BuilderClient>> =
            if let Some(sentry) = self.sentry.read().clone() {
                Some(sentry)
            } else if url.is_empty() {
                None
            } else {
                Some(Arc::new(HttpBuilderClient::dial(url)?))
            };
        self.builders.write().insert(builder, client);
        Ok(())
    }

    /// Register a builder with a caller-supplied transport.
    pub fn add_builder_client(&self, builder: Address, client: Arc<dyn BuilderClient>) {
        self.builders.write().insert(builder, Some(client));
    }

    pub fn remove_builder(&self, builder: Address) {
        self.builders.write().remove(&builder);
    }

    pub fn exist_builder(&self, builder: Address) -> bool {
        self.builders.read().contains_key(&builder)
    }

    // --- submission path ---

    /// Admission check without recording. Exposed for hosts that gate
    /// submissions at their own boundary before calling [`send_bid`].
    ///
    /// [`send_bid`]: BidSimulator::send_bid
    pub fn check_pending(
        &self,
        block_number: u64,
        builder: Address,
        bid_hash: B256,
    ) -> Result<(), BidError> {
        self.pending.check(block_number, builder, bid_hash)
    }

    pub fn add_pending(&self, block_number: u64, builder: Address, bid_hash: B256) {
        self.pending.add(block_number, builder, bid_hash);
        self.metrics.pending_bids.set(self.pending.bid_count() as f64);
    }

    /// Submit a bid for arbitration and await the verdict.
    ///
    /// `Ok` means the bid was committed for simulation, including the
    /// case where it preempted a weaker in-flight run; it is not a
    /// promise that the bid ends up the final best. A full admission
    /// channel or a verdict that misses the shared 1 s deadline yields
    /// [`BidError::MevBusy`].
    pub async fn send_bid(&self, bid: Bid) -> Result<(), BidError> {
        self.check_pending(bid.block_number, bid.builder, bid.bid_hash)?;

        let (block_number, builder, bid_hash) =
            (bid.block_number, bid.builder, bid.bid_hash);
        let (reply_tx, reply_rx) = oneshot::channel();
        let package = NewBidPackage { bid: Arc::new(bid), feedback: Some(reply_tx) };

        let deadline = tokio::time::Instant::now() + BID_ADMISSION_TIMEOUT;
        match tokio::time::timeout_at(deadline, self.new_bid_tx.send(package)).await {
            Ok(Ok(())) => self.add_pending(block_number, builder, bid_hash),
            Ok(Err(_)) | Err(_) => return Err(BidError::MevBusy),
        }

        match tokio::time::timeout_at(deadline, reply_rx).await {
            Ok(Ok(verdict)) => verdict,
            // the arbiter dropped the feedback (engine not running) or the
            // verdict missed the deadline
            Ok(Err(_)) | Err(_) => Err(BidError::MevBusy),
        }
    }

    // --- best-bid access for the sealer ---

    pub fn best_bid(&self, parent_hash: &B256) -> Option<Arc<Bid>> {
        self.best_bids.bid(parent_hash)
    }

    pub fn best_bid_reward(&self, parent_hash: &B256) -> Option<U256> {
        self.best_bids.total_reward(parent_hash)
    }

    /// Hand the winning runtime (environment included) to the caller.
    pub fn take_best_bid(&self, parent_hash: &B256) -> Option<BidRuntime> {
        self.best_bids.take(parent_hash)
    }

    // --- arbitration loop ---

    async fn new_bid_loop(self: Arc<Self>, mut new_bid_rx: mpsc::Receiver<NewBidPackage>) {
        // interrupt of the most recently committed simulation; replaced on
        // every commit so each run gets its own single-use token
        let mut interrupt: Option<Interrupt> = None;

        loop {
            let package = tokio::select! {
                maybe = new_bid_rx.recv() => match maybe {
                    Some(package) => package,
                    None => return,
                },
                _ = self.shutdown.cancelled() => return,
            };
            if !self.is_running() {
                continue;
            }

            let bid = package.bid.clone();
            let expected = bid.expected_reward_after_burn();

            // a bid in simulation is always at least as strong as the best
            // finished one, so it is the comparison target when present
            let verdict = if let Some(simulating) = self.simulating.bid(&bid.parent_hash) {
                if expected > simulating.expected_reward_after_burn() {
                    Ok(())
                } else {
                    Err(BidError::Discarded {
                        current_best: simulating.expected_reward_after_burn(),
                    })
                }
            } else {
                match self.best_bids.total_reward_from_builder(&bid.parent_hash) {
                    Some(best) if expected <= best => {
                        Err(BidError::Discarded { current_best: best })
                    }
                    _ => Ok(()),
                }
            };

            if verdict.is_ok() {
                if let Some(previous) = interrupt.take() {
                    previous.fire(COMMIT_INTERRUPT_BETTER_BID);
                }
                let token = Interrupt::new();
                interrupt = Some(token.clone());

                let runtime = BidRuntime::new(bid.clone());
                tokio::select! {
                    sent = self.sim_tx.send(SimRequest { interrupt: token, runtime }) => {
                        if sent.is_err() {
                            return;
                        }
                        debug!(builder = %bid.builder, bid_hash = %bid.bid_hash,
                            "bid committed for simulation");
                    }
                    _ = self.shutdown.cancelled() => return,
                }
            }

            if let Some(feedback) = package.feedback {
                let accepted = verdict.is_ok();
                let _ = feedback.send(verdict);
                info!(
                    block = bid.block_number,
                    builder = %bid.builder,
                    accepted,
                    gas_fee = %wei_to_ether_string(bid.gas_fee),
                    nontaxable = %wei_to_ether_string(bid.nontaxable_fee),
                    tx = bid.txs.len(),
                    hash = %bid.bid_hash,
                    "[BID ARRIVED]"
                );
            }
        }
    }

    // --- simulation loop ---

    async fn sim_loop(self: Arc<Self>, mut sim_rx: mpsc::Receiver<SimRequest>) {
        loop {
            let request = tokio::select! {
                maybe = sim_rx.recv() => match maybe {
                    Some(request) => request,
                    None => return,
                },
                _ = self.shutdown.cancelled() => return,
            };
            if !self.is_running() {
                continue;
            }
            self.simulate(request.interrupt, request.runtime);
        }
    }

    /// Simulate one bid end to end. Every exit path releases the runtime's
    /// environment exactly once (unless it was installed as best bid, in
    /// which case ownership moved with it), removes the simulation-slot
    /// entry, and sets the completion flag.
    fn simulate(&self, interrupt: Interrupt, mut bid_runtime: BidRuntime) {
        // the engine may have stopped between arbitration and pickup
        if !self.is_running() || !self.receiving_bids() {
            return;
        }

        let start = Instant::now();
        let bid = bid_runtime.bid.clone();
        let parent_hash = bid.parent_hash;
        let finished = bid_runtime.finished.clone();

        self.simulating.insert(parent_hash, bid.clone());

        let progress = self.run_bid_simulation(&interrupt, &mut bid_runtime);

        let mut success = false;
        let mut sim_err: Option<SimulationError> = None;
        let mut loser: Option<BidRuntime> = None;

        match progress {
            Err(err) => {
                sim_err = Some(err);
                loser = Some(bid_runtime);
            }
            Ok(SimProgress::Aborted) => {
                loser = Some(bid_runtime);
            }
            Ok(SimProgress::Completed) => {
                bid_runtime.duration = Some(start.elapsed());
                let new_reward = bid_runtime.total_reward();
                let prior = self.best_bids.bid(&parent_hash).map(|b| b.bid_hash);
                let prior_reward = self.best_bids.total_reward(&parent_hash);

                match self.best_bids.try_insert(parent_hash, bid_runtime) {
                    Ok(()) => success = true,
                    Err(beaten) => loser = Some(beaten),
                }

                if prior != Some(bid.bid_hash) {
                    info!(
                        win = success,
                        bid_hash = %bid.bid_hash,
                        best_hash = ?prior,
                        bid_reward = %wei_to_ether_string(new_reward),
                        best_reward = %prior_reward.map(wei_to_ether_string).unwrap_or_default(),
                        sim_elapsed = ?start.elapsed(),
                        "[BID RESULT]"
                    );
                }
            }
        }

        if let Some(loser) = loser.as_mut() {
            loser.discard_env();
        }
        self.simulating.remove(&parent_hash);
        finished.store(true, Ordering::Release);

        if let Some(err) = sim_err {
            info!(
                block_number = bid.block_number,
                parent_hash = %parent_hash,
                builder = %bid.builder,
                gas_used = bid.gas_used,
                %err,
                "bid simulation failed"
            );
            self.metrics.invalid_bids_total.increment(1);
            self.report_issue(bid, err.to_string());
            return;
        }

        if success {
            self.metrics.bid_sim_duration_seconds.record(start.elapsed().as_secs_f64());
            self.metrics.valid_bids_total.increment(1);
            // refill the slot with this bid so the mempool merge gets
            // another pass against newer state, but never ahead of bids
            // already waiting
            if self.new_bid_channel_empty() {
                let _ = self.new_bid_tx.try_send(NewBidPackage { bid, feedback: None });
            }
        } else {
            self.metrics.invalid_bids_total.increment(1);
            if progress_completed(&loser) && self.new_bid_channel_empty() {
                // completed but lost: keep the slot warm with the
                // strongest known candidate
                if let Some(best) = self.best_bids.bid(&parent_hash) {
                    let _ = self.new_bid_tx.try_send(NewBidPackage { bid: best, feedback: None });
                }
            }
        }
    }

    /// Steps 4–11 of a simulation run: prepare the environment, enforce
    /// the deadline and gas budget, replay the bid, validate the reward,
    /// optionally merge from the mempool, settle the pay-bid transaction,
    /// and check the block size.
    fn run_bid_simulation(
        &self,
        interrupt: &Interrupt,
        bid_runtime: &mut BidRuntime,
    ) -> Result<SimProgress, SimulationError> {
        let bid = bid_runtime.bid.clone();
        let Some(pay_bid_tx) = bid.pay_bid_tx().cloned() else {
            return Err(SimulationError::InvalidTx("bid has no transactions".to_string()));
        };

        // header timing and trie prefetching are the worker's business
        let env = self
            .worker
            .prepare_work(&WorkParams {
                parent_hash: bid.parent_hash,
                coinbase: self.worker.etherbase(),
            })
            .map_err(|err| SimulationError::Worker(err.to_string()))?;
        bid_runtime.env = Some(env);

        let header = match bid_runtime.env.as_ref() {
            Some(env) => env.header.clone(),
            None => return Err(SimulationError::EnvironmentMissing),
        };
        match self.engine.delay(&header, self.sim_left_over) {
            Some(delay) if !delay.is_zero() => {}
            _ => {
                info!(builder = %bid.builder, bid_hash = %bid.bid_hash,
                    "abort commit, not enough time to simulate");
                return Ok(SimProgress::Aborted);
            }
        }

        {
            let Some(env) = bid_runtime.env.as_mut() else {
                return Err(SimulationError::EnvironmentMissing);
            };
            if env.gas_pool.is_none() {
                let budget = env
                    .header
                    .gas_limit
                    .saturating_sub(SYSTEM_TXS_GAS)
                    .saturating_sub(PAY_BID_TX_GAS_LIMIT);
                env.gas_pool = Some(GasPool::new(budget));
            }
            let available = env.gas_pool.map(|pool| pool.gas()).unwrap_or_default();
            if bid.gas_used > available {
                return Err(SimulationError::GasExceeded);
            }
        }

        // replay the bid body; the final transaction is the pay-bid tx and
        // settles after the optional mempool merge
        for tx in bid.txs.iter().take(bid.txs.len() - 1) {
            if interrupt.is_fired() {
                return Err(SimulationError::BetterBidArrived);
            }
            if self.shutdown.is_cancelled() {
                return Err(SimulationError::MinerExit);
            }

            let un_revertible = bid.un_revertible.contains(tx.tx_hash());
            let receipt =
                bid_runtime.commit_transaction(self.executor.as_ref(), tx, un_revertible)?;
            bid_runtime.check_validator_bribe(&self.config.validator_bribe_eoas, tx, &receipt);
        }

        bid_runtime.update_pack_reward(true);
        if !bid_runtime.valid_reward() {
            return Err(SimulationError::RewardNotAchieved);
        }

        if bid.gas_used > 0 {
            let bid_gas_price = bid.gas_fee / U256::from(bid.gas_used);
            if bid_gas_price < self.min_gas_price {
                debug!(%bid_gas_price, min_gas_price = %self.min_gas_price,
                    "bid gas price below minimum, ignore");
                return Ok(SimProgress::Aborted);
            }
        }

        if self.config.greedy_merge_tx {
            let merge_budget = self.engine.delay(&header, self.sim_left_over);
            if matches!(merge_budget, Some(delay) if !delay.is_zero()) {
                let bid_tx_hashes: HashSet<B256> =
                    bid.txs.iter().map(|tx| *tx.tx_hash()).collect();
                if let Some(env) = bid_runtime.env.as_mut() {
                    if let Err(err) =
                        self.worker.fill_transactions(interrupt, env, &bid_tx_hashes)
                    {
                        trace!(block = header.number, builder = %bid.builder, %err,
                            "mempool merge stopped");
                    }
                }
                bid_runtime.update_pack_reward(false);
            }
        }

        // the pay-bid transaction gets its reserved gas back and must not
        // revert
        if let Some(env) = bid_runtime.env.as_mut() {
            if let Some(pool) = env.gas_pool.as_mut() {
                pool.add_gas(PAY_BID_TX_GAS_LIMIT);
            }
        }
        bid_runtime.commit_transaction(self.executor.as_ref(), &pay_bid_tx, true)?;

        let size = bid_runtime.env.as_ref().map(|env| env.size).unwrap_or_default();
        if size + BLOCK_RESERVE_SIZE > MAX_MESSAGE_SIZE {
            return Err(SimulationError::InvalidBidSize);
        }

        Ok(SimProgress::Completed)
    }

    fn new_bid_channel_empty(&self) -> bool {
        self.new_bid_tx.capacity() == self.new_bid_tx.max_capacity()
    }

    /// Report a failed simulation back to its builder, fire and forget.
    fn report_issue(&self, bid: Arc<Bid>, message: String) {
        record_builder_issue(bid.builder);

        let client = self.builders.read().get(&bid.builder).cloned().flatten();
        let Some(client) = client else { return };
        let validator = self.worker.etherbase();

        tokio::spawn(async move {
            let issue = BidIssue {
                validator,
                builder: bid.builder,
                bid_hash: bid.bid_hash,
                message,
            };
            if let Err(err) = client.report_issue(&issue).await {
                warn!(builder = %bid.builder, %err, "failed to report bid issue");
            }
        });
    }

    // --- janitor loop ---

    async fn clear_loop(self: Arc<Self>) {
        let mut head_rx = self.chain.subscribe_chain_head();
        loop {
            let event = tokio::select! {
                maybe = head_rx.recv() => match maybe {
                    Some(event) => event,
                    None => {
                        warn!("chain head subscription closed, stopping bid simulator");
                        self.shutdown.cancel();
                        return;
                    }
                },
                _ = self.shutdown.cancelled() => return,
            };
            if !self.is_running() {
                continue;
            }
            self.clear(event.parent_hash, event.block_number);
        }
    }

    /// Drop per-block state made stale by a new canonical head.
    fn clear(&self, parent_hash: B256, block_number: u64) {
        self.pending.drop_block(block_number);
        let tries_in_memory = self.chain.tries_in_memory();
        self.best_bids.clear_stale(parent_hash, block_number, tries_in_memory);
        self.simulating.clear_stale(block_number, tries_in_memory);
        self.metrics.pending_bids.set(self.pending.bid_count() as f64);
    }
}

/// Whether the loser runtime came from a completed run (as opposed to a
/// failed or aborted one); completed losers trigger the best-bid recommit.
fn progress_completed(loser: &Option<BidRuntime>) -> bool {
    loser.as_ref().is_some_and(|rt| rt.duration.is_some())
}

fn wei_to_ether_string(wei: U256) -> String {
    let ether = wei.to_string().parse::<f64>().unwrap_or(0.0) / 1e18;
    format!("{ether:.6}")
}
