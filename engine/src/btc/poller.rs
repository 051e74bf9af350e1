//! The commitment poller: walks the best chain forward from the last seen
//! block, matches transaction outputs against unseen escrow addresses, and
//! tracks confirmations until every flagged escrow holds a confirmed
//! deposit. The Bitcoin client is owned by this one task; concurrent
//! sessions must go through their own poller instance.

use std::{sync::Arc, time::Duration};

use bitcoin::Amount;
use tracing::{debug, info, warn};

use crate::{
	btc::rpc::BtcRpcApi,
	errors::RpcError,
	mixing::input_peers::InputPeerTable,
};

pub const POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const REQUIRED_CONFIRMATIONS: u64 = 6;

pub struct DepositPoller<C> {
	client: C,
	input_peers: Arc<InputPeerTable>,
	/// Expected deposit: denomination plus the mixing fee.
	expected_value: Amount,
	last_block_hash: String,
}

impl<C: BtcRpcApi> DepositPoller<C> {
	pub async fn new(
		client: C,
		input_peers: Arc<InputPeerTable>,
		expected_value: Amount,
	) -> Result<Self, RpcError> {
		let last_block_hash = client.best_block_hash().await?;
		info!(last_block_hash, "commitment poller starting");
		Ok(DepositPoller { client, input_peers, expected_value, last_block_hash })
	}

	/// Poll until the input-peer set is frozen and every flagged escrow
	/// has a deposit with enough confirmations.
	pub async fn run(mut self) -> Result<(), RpcError> {
		loop {
			self.poll_once().await?;
			if self.input_peers.is_frozen() && self.input_peers.all_payments_received() {
				info!("all input peers committed their coins");
				return Ok(())
			}
			tokio::time::sleep(POLL_INTERVAL).await;
		}
	}

	pub async fn poll_once(&mut self) -> Result<(), RpcError> {
		let unseen = self.input_peers.unseen_addresses();
		if !unseen.is_empty() {
			debug!(?unseen, "looking for deposits");
			self.scan_new_blocks(&unseen).await?;
		}

		for txid in self.input_peers.unconfirmed_txids() {
			let tx = self.client.raw_transaction(&txid).await?;
			if tx.confirmations.unwrap_or(0) >= REQUIRED_CONFIRMATIONS {
				self.input_peers.confirm_transaction(&txid);
			}
		}
		Ok(())
	}

	/// Advance through the chain from the last processed block, flagging
	/// matching outputs.
	async fn scan_new_blocks(&mut self, unseen: &[String]) -> Result<(), RpcError> {
		let mut block = self.client.block(&self.last_block_hash).await?;
		while let Some(next_hash) = block.next_block_hash.clone() {
			block = self.client.block(&next_hash).await?;
			debug!(hash = block.hash, "checking block");

			for txid in &block.tx {
				let tx = self.client.raw_transaction(txid).await?;
				for output in &tx.vout {
					let Some(address) = output.script_pub_key.addresses.first() else {
						continue
					};
					if !unseen.contains(address) {
						continue
					}
					let value = match Amount::from_btc(output.value) {
						Ok(value) => value,
						Err(error) => {
							warn!(%error, txid, "unrepresentable output value");
							continue
						},
					};
					info!(txid, address, %value, "found deposit transaction");
					if let Err(reason) = self.input_peers.found_transaction(
						address,
						value,
						self.expected_value,
						tx.txid.clone(),
						output.n,
					) {
						warn!(txid, reason, "deposit not accepted");
					}
				}
			}
			self.last_block_hash = block.hash.clone();
		}
		Ok(())
	}
}
