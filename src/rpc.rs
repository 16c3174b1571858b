//! `mev` namespace RPC surface for builders and operators.
//!
//! Builder identity arrives pre-authenticated on [`BidArgs`]; bid
//! signature verification happens upstream at the sentry.

use crate::{
    bid::Bid,
    simulator::{BidSimulator, PAY_BID_TX_GAS_LIMIT},
    traits::ChainContext,
};
use alloy_consensus::{BlobTransactionSidecar, TxEip4844Variant, TxEnvelope};
use alloy_eips::eip2718::Decodable2718;
use alloy_primitives::{keccak256, Address, Bytes, B256, U256, U64};
use alloy_rlp::Encodable;
use jsonrpsee::{
    core::RpcResult,
    proc_macros::rpc,
    types::ErrorObject,
};
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, info};

/// Raw bid payload as sent by a builder.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBid {
    /// Number of the block the bid builds.
    pub block_number: U64,
    pub parent_hash: B256,
    /// RLP-encoded transactions; blob transactions travel in network form
    /// with their sidecars attached.
    pub txs: Vec<Bytes>,
    /// Hashes of transactions that must not revert.
    #[serde(default)]
    pub un_revertible: Vec<B256>,
    pub gas_used: U64,
    pub gas_fee: U256,
    /// Direct tip to the validator, outside the burn.
    #[serde(default)]
    pub nontaxable_fee: U256,
}

/// A bid submission: the raw bid plus sentry-side metadata.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidArgs {
    pub raw_bid: RawBid,
    /// Builder identity, authenticated by the upstream sentry.
    pub builder: Address,
    /// Payment transaction closing the bid.
    #[serde(default)]
    pub pay_bid_tx: Bytes,
    #[serde(default)]
    pub pay_bid_tx_gas_used: U64,
}

/// Engine parameters advertised to builders.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MevParams {
    /// Simulation slack in nanoseconds.
    pub bid_simulation_left_over: u64,
    pub max_bids_per_builder: u32,
    pub greedy_merge_tx: bool,
    pub version: String,
}

#[rpc(server, namespace = "mev")]
pub trait MevApi {
    /// Submit a bid; returns its content hash.
    #[method(name = "sendBid")]
    async fn send_bid(&self, bid: BidArgs) -> RpcResult<B256>;

    #[method(name = "params")]
    async fn params(&self) -> RpcResult<MevParams>;

    #[method(name = "running")]
    async fn running(&self) -> RpcResult<bool>;

    #[method(name = "hasBuilder")]
    async fn has_builder(&self, builder: Address) -> RpcResult<bool>;

    #[method(name = "addBuilder")]
    async fn add_builder(&self, builder: Address, url: String) -> RpcResult<bool>;

    #[method(name = "removeBuilder")]
    async fn remove_builder(&self, builder: Address) -> RpcResult<bool>;
}

pub struct MevApiImpl {
    engine: Arc<BidSimulator>,
    chain: Arc<dyn ChainContext>,
    bid_simulation_left_over_ms: u64,
    greedy_merge_tx: bool,
}

impl MevApiImpl {
    pub fn new(
        engine: Arc<BidSimulator>,
        chain: Arc<dyn ChainContext>,
        bid_simulation_left_over_ms: u64,
        greedy_merge_tx: bool,
    ) -> Self {
        Self { engine, chain, bid_simulation_left_over_ms, greedy_merge_tx }
    }
}

fn invalid_params(message: impl Into<String>) -> ErrorObject<'static> {
    ErrorObject::owned(-32602, message.into(), None::<()>)
}

fn engine_error(message: impl Into<String>) -> ErrorObject<'static> {
    ErrorObject::owned(-32000, message.into(), None::<()>)
}

/// Stable content hash of a raw bid: keccak256 of the RLP list of its
/// fields in submission order.
pub fn raw_bid_hash(raw_bid: &RawBid) -> B256 {
    let payload_length = raw_bid.block_number.length()
        + raw_bid.parent_hash.length()
        + raw_bid.txs.length()
        + raw_bid.un_revertible.length()
        + raw_bid.gas_used.length()
        + raw_bid.gas_fee.length()
        + raw_bid.nontaxable_fee.length();

    let mut buf = Vec::with_capacity(payload_length + 4);
    alloy_rlp::Header { list: true, payload_length }.encode(&mut buf);
    raw_bid.block_number.encode(&mut buf);
    raw_bid.parent_hash.encode(&mut buf);
    raw_bid.txs.encode(&mut buf);
    raw_bid.un_revertible.encode(&mut buf);
    raw_bid.gas_used.encode(&mut buf);
    raw_bid.gas_fee.encode(&mut buf);
    raw_bid.nontaxable_fee.encode(&mut buf);

    keccak256(&buf)
}

/// Decode one bid transaction, pulling out the blob sidecar when the
/// transaction travels in network form.
fn decode_bid_transaction(
    bytes: &Bytes,
) -> Result<(TxEnvelope, Option<BlobTransactionSidecar>), String> {
    if bytes.is_empty() {
        return Err("empty transaction bytes".to_string());
    }
    let tx = TxEnvelope::network_decode(&mut bytes.as_ref())
        .map_err(|err| format!("failed to decode transaction: {err}"))?;

    let sidecar = match &tx {
        TxEnvelope::Eip4844(signed) => match signed.tx() {
            TxEip4844Variant::TxEip4844WithSidecar(with_sidecar) => {
                with_sidecar.sidecar.clone().into_eip4844()
            }
            TxEip4844Variant::TxEip4844(_) => None,
        },
        _ => None,
    };
    Ok((tx, sidecar))
}

/// Assemble the engine-side [`Bid`] from a submission.
pub fn to_bid(args: &BidArgs, bid_hash: B256) -> Result<Bid, String> {
    let mut txs = Vec::with_capacity(args.raw_bid.txs.len() + 1);
    let mut blob_sidecars = HashMap::new();

    for tx_bytes in &args.raw_bid.txs {
        let (tx, sidecar) = decode_bid_transaction(tx_bytes)?;
        if let Some(sidecar) = sidecar {
            debug!(tx_hash = %tx.tx_hash(), blobs = sidecar.blobs.len(),
                "found blob sidecar in bid");
            blob_sidecars.insert(*tx.tx_hash(), sidecar);
        }
        txs.push(tx);
    }

    if args.raw_bid.un_revertible.len() > txs.len() {
        return Err(format!(
            "expect unRevertible no more than {}, got {}",
            txs.len(),
            args.raw_bid.un_revertible.len()
        ));
    }

    if !args.pay_bid_tx.is_empty() {
        let (tx, sidecar) = decode_bid_transaction(&args.pay_bid_tx)
            .map_err(|err| format!("failed to parse payBidTx: {err}"))?;
        if let Some(sidecar) = sidecar {
            blob_sidecars.insert(*tx.tx_hash(), sidecar);
        }
        txs.push(tx);
    }

    Ok(Bid {
        builder: args.builder,
        block_number: args.raw_bid.block_number.to(),
        parent_hash: args.raw_bid.parent_hash,
        txs,
        un_revertible: args.raw_bid.un_revertible.iter().copied().collect(),
        gas_used: args.raw_bid.gas_used.to(),
        gas_fee: args.raw_bid.gas_fee,
        nontaxable_fee: args.raw_bid.nontaxable_fee,
        blob_sidecars,
        bid_hash,
    })
}

#[async_trait::async_trait]
impl MevApiServer for MevApiImpl {
    async fn send_bid(&self, bid: BidArgs) -> RpcResult<B256> {
        if !self.engine.is_running() || !self.engine.receiving_bids() {
            return Err(engine_error("mev is not running"));
        }
        if !self.engine.exist_builder(bid.builder) {
            return Err(engine_error(format!("builder {} is not registered", bid.builder)));
        }

        let parent = self
            .chain
            .header_by_hash(&bid.raw_bid.parent_hash)
            .ok_or_else(|| invalid_params("parent block not found"))?;
        let block_number: u64 = bid.raw_bid.block_number.to();
        if parent.number + 1 != block_number {
            return Err(invalid_params("stale bid, parent is not the chain head"));
        }

        if bid.raw_bid.gas_fee.is_zero() || bid.raw_bid.gas_used.is_zero() {
            return Err(invalid_params("gas fee or gas used is 0"));
        }
        if bid.pay_bid_tx.is_empty() || bid.pay_bid_tx_gas_used.is_zero() {
            return Err(invalid_params("pay bid tx is empty or gas used is 0"));
        }
        if bid.pay_bid_tx_gas_used > U64::from(PAY_BID_TX_GAS_LIMIT) {
            return Err(invalid_params("pay bid tx gas used exceeds limit"));
        }

        let bid_hash = raw_bid_hash(&bid.raw_bid);
        let bid_obj = to_bid(&bid, bid_hash).map_err(invalid_params)?;

        info!(block = block_number, builder = %bid.builder, hash = %bid_hash,
            "bid received");
        self.engine.send_bid(bid_obj).await.map_err(|err| engine_error(err.to_string()))?;

        Ok(bid_hash)
    }

    async fn params(&self) -> RpcResult<MevParams> {
        Ok(MevParams {
            bid_simulation_left_over: self.bid_simulation_left_over_ms * 1_000_000,
            max_bids_per_builder: crate::pending::MAX_BIDS_PER_BUILDER_PER_BLOCK as u32,
            greedy_merge_tx: self.greedy_merge_tx,
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    async fn running(&self) -> RpcResult<bool> {
        Ok(self.engine.is_running() && self.engine.receiving_bids())
    }

    async fn has_builder(&self, builder: Address) -> RpcResult<bool> {
        Ok(self.engine.exist_builder(builder))
    }

    async fn add_builder(&self, builder: Address, url: String) -> RpcResult<bool> {
        self.engine
            .add_builder(builder, &url)
            .map_err(|err| engine_error(err.to_string()))?;
        Ok(true)
    }

    async fn remove_builder(&self, builder: Address) -> RpcResult<bool> {
        self.engine.remove_builder(builder);
        Ok(true)
    }
}
