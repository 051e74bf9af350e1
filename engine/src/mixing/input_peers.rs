//! The table of input users and their escrows. Every escrow slot is
//! precomputed; registration binds a slot to a user session, the
//! commitment poller binds it to an on-chain deposit, and the shuffle
//! finally binds it to an output address.

use std::{
	collections::BTreeSet,
	sync::Mutex,
};

use bitcoin::Amount;
use num_bigint::BigUint;
use smpc::promise::{promise, Promise, PromiseResolver};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct EscrowSlot {
	pub index: u32,
	/// Uncompressed SEC1 encoding of the escrow public key.
	pub pubkey: Vec<u8>,
	pub address: String,
	pub session_id: Option<[u8; 32]>,
	pub encrypted_output: Option<Vec<u8>>,
	/// The user's additive hash shares, one per decryption layer.
	pub hash_shares: Option<Vec<BigUint>>,
	pub txid: Option<String>,
	pub vout: Option<u32>,
	pub deposit: Option<Amount>,
	pub confirmed: bool,
	pub output_address: Option<Vec<u8>>,
}

impl EscrowSlot {
	pub fn is_flagged(&self) -> bool {
		self.session_id.is_some()
	}
}

struct TableInner {
	slots: Vec<EscrowSlot>,
	/// Flagged escrow addresses with no deposit seen yet.
	unseen_addresses: BTreeSet<String>,
	unconfirmed_txids: Vec<String>,
	frozen: bool,
}

pub struct InputPeerTable {
	inner: Mutex<TableInner>,
	/// Number of decryption layers, i.e. the mixnet size.
	layers: u32,
	min_peers: u32,
	max_peers: u32,
	frozen_tx: PromiseResolver<()>,
	frozen_rx: Promise<()>,
}

impl InputPeerTable {
	pub fn new(layers: u32, min_peers: u32, max_peers: u32) -> Self {
		let (frozen_tx, frozen_rx) = promise();
		InputPeerTable {
			inner: Mutex::new(TableInner {
				slots: Vec::new(),
				unseen_addresses: BTreeSet::new(),
				unconfirmed_txids: Vec::new(),
				frozen: false,
			}),
			layers,
			min_peers,
			max_peers,
			frozen_tx,
			frozen_rx,
		}
	}

	/// Record one precomputed escrow. Slots are stored in index order so
	/// the assignment is identical on every peer.
	pub fn store_generated_escrow(&self, index: u32, pubkey: Vec<u8>, address: String) {
		let mut inner = self.lock();
		debug_assert_eq!(inner.slots.len(), index as usize);
		inner.slots.push(EscrowSlot {
			index,
			pubkey,
			address,
			session_id: None,
			encrypted_output: None,
			hash_shares: None,
			txid: None,
			vout: None,
			deposit: None,
			confirmed: false,
			output_address: None,
		});
	}

	/// Pick an unflagged escrow from this peer's assignment partition
	/// (slot index congruent to our rank) for a locally registering user.
	pub fn assign_escrow(&self, rank: u32, mixnet_size: u32) -> Option<(u32, Vec<u8>, String)> {
		let inner = self.lock();
		if inner.frozen {
			return None
		}
		inner
			.slots
			.iter()
			.find(|slot| !slot.is_flagged() && slot.index % mixnet_size == rank)
			.map(|slot| (slot.index, slot.pubkey.clone(), slot.address.clone()))
	}

	/// Bind an escrow to a user session. Called both for local
	/// registrations and on HELO from the registering peer.
	pub fn flag_input_peer(
		&self,
		escrow_address: &str,
		session_id: [u8; 32],
		encrypted_output: Vec<u8>,
	) -> Result<(), String> {
		let mut inner = self.lock();
		if inner.frozen {
			return Err("input_peers_frozen".into())
		}
		let slot = inner
			.slots
			.iter_mut()
			.find(|slot| slot.address == escrow_address)
			.ok_or_else(|| "escrow_not_found".to_string())?;
		if slot.is_flagged() {
			return Err("escrow_taken".to_string())
		}
		slot.session_id = Some(session_id);
		slot.encrypted_output = Some(encrypted_output);
		let address = slot.address.clone();
		inner.unseen_addresses.insert(address);

		let flagged = inner.slots.iter().filter(|slot| slot.is_flagged()).count() as u32;
		info!(flagged, "input peer registered");
		if flagged >= self.max_peers {
			self.freeze_locked(&mut inner);
		}
		Ok(())
	}

	/// Store the user's per-layer hash shares.
	pub fn deposit_hash_share(
		&self,
		session_id: &[u8; 32],
		shares: Vec<BigUint>,
	) -> Result<(), String> {
		if shares.len() != self.layers as usize {
			return Err("hash_share_count_mismatch".to_string())
		}
		let mut inner = self.lock();
		let slot = inner
			.slots
			.iter_mut()
			.find(|slot| slot.session_id.as_ref() == Some(session_id))
			.ok_or_else(|| "session_not_found".to_string())?;
		if slot.hash_shares.is_some() {
			return Err("hash_share_already_deposited".to_string())
		}
		slot.hash_shares = Some(shares);
		Ok(())
	}

	/// A deposit to a flagged escrow was seen on-chain.
	pub fn found_transaction(
		&self,
		address: &str,
		value: Amount,
		expected: Amount,
		txid: String,
		vout: u32,
	) -> Result<(), String> {
		let mut inner = self.lock();
		if !inner.unseen_addresses.remove(address) {
			return Err("escrow_not_found".to_string())
		}
		let slot = inner
			.slots
			.iter_mut()
			.find(|slot| slot.address == address)
			.expect("unseen addresses always refer to existing slots");

		if value != expected {
			// There is no safe refund destination for a stranger's coins;
			// a wrong-valued deposit fails the slot instead
			warn!(address, %value, %expected, "deposit with wrong value; failing input peer");
			slot.session_id = None;
			slot.encrypted_output = None;
			slot.hash_shares = None;
			return Err("wrong_value".to_string())
		}

		debug!(address, txid, "deposit found");
		slot.txid = Some(txid.clone());
		slot.vout = Some(vout);
		slot.deposit = Some(value);
		inner.unconfirmed_txids.push(txid);
		Ok(())
	}

	pub fn unconfirmed_txids(&self) -> Vec<String> {
		self.lock().unconfirmed_txids.clone()
	}

	pub fn unseen_addresses(&self) -> Vec<String> {
		self.lock().unseen_addresses.iter().cloned().collect()
	}

	pub fn confirm_transaction(&self, txid: &str) {
		let mut inner = self.lock();
		inner.unconfirmed_txids.retain(|candidate| candidate != txid);
		if let Some(slot) =
			inner.slots.iter_mut().find(|slot| slot.txid.as_deref() == Some(txid))
		{
			info!(txid, escrow = slot.index, "deposit confirmed");
			slot.confirmed = true;
		}
	}

	pub fn peer_count(&self) -> u32 {
		self.lock().slots.iter().filter(|slot| slot.is_flagged()).count() as u32
	}

	pub fn is_frozen(&self) -> bool {
		self.lock().frozen
	}

	/// Close registration if the minimum participation has been reached;
	/// called when the commitment window elapses.
	pub fn freeze_if_minimum_reached(&self) -> bool {
		let mut inner = self.lock();
		if !inner.frozen &&
			inner.slots.iter().filter(|slot| slot.is_flagged()).count() as u32 >=
				self.min_peers
		{
			self.freeze_locked(&mut inner);
		}
		inner.frozen
	}

	/// Resolves once the input-peer set is immutable.
	pub fn frozen(&self) -> Promise<()> {
		self.frozen_rx.clone()
	}

	fn freeze_locked(&self, inner: &mut TableInner) {
		if !inner.frozen {
			info!("input peer set frozen");
			inner.frozen = true;
			self.frozen_tx.resolve(());
		}
	}

	/// Every flagged escrow has a confirmed deposit and the set is frozen.
	pub fn all_payments_received(&self) -> bool {
		let inner = self.lock();
		inner.frozen &&
			inner.unseen_addresses.is_empty() &&
			inner.unconfirmed_txids.is_empty() &&
			inner.slots.iter().filter(|slot| slot.is_flagged()).count() > 0 &&
			inner
				.slots
				.iter()
				.filter(|slot| slot.is_flagged())
				.all(|slot| slot.confirmed)
	}

	/// All flagged users have deposited their hash shares.
	pub fn hash_shares_complete(&self) -> bool {
		let inner = self.lock();
		inner
			.slots
			.iter()
			.filter(|slot| slot.is_flagged())
			.all(|slot| slot.hash_shares.is_some())
	}

	/// The assigned escrows in index order; identical across peers.
	pub fn assigned_escrows(&self) -> Vec<EscrowSlot> {
		self.lock().slots.iter().filter(|slot| slot.is_flagged()).cloned().collect()
	}

	pub fn encrypted_outputs(&self) -> Vec<Vec<u8>> {
		self.lock()
			.slots
			.iter()
			.filter(|slot| slot.is_flagged())
			.filter_map(|slot| slot.encrypted_output.clone())
			.collect()
	}

	/// Bind the shuffled output addresses to the assigned escrows, in
	/// order.
	pub fn assign_output_addresses(&self, outputs: Vec<Vec<u8>>) -> Result<(), String> {
		let mut inner = self.lock();
		let mut outputs = outputs.into_iter();
		for slot in inner.slots.iter_mut().filter(|slot| slot.is_flagged()) {
			slot.output_address =
				Some(outputs.next().ok_or_else(|| "too_few_outputs".to_string())?);
		}
		Ok(())
	}

	pub fn slot_by_session(&self, session_id: &[u8; 32]) -> Option<EscrowSlot> {
		self.lock()
			.slots
			.iter()
			.find(|slot| slot.session_id.as_ref() == Some(session_id))
			.cloned()
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, TableInner> {
		self.inner.lock().expect("input peer table lock cannot be poisoned")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn table_with_slots(count: u32) -> InputPeerTable {
		let table = InputPeerTable::new(3, 2, count);
		for index in 0..count {
			table.store_generated_escrow(
				index,
				vec![4u8; 65],
				format!("escrow-address-{index}"),
			);
		}
		table
	}

	fn shares() -> Vec<BigUint> {
		(0..3u32).map(BigUint::from).collect()
	}

	#[test]
	fn registration_flow() {
		let table = table_with_slots(2);
		assert_eq!(table.peer_count(), 0);

		table
			.flag_input_peer("escrow-address-0", [1; 32], b"onion-0".to_vec())
			.unwrap();
		assert_eq!(table.peer_count(), 1);
		assert!(!table.is_frozen());

		// Duplicate flagging of the same escrow is refused
		assert_eq!(
			table.flag_input_peer("escrow-address-0", [2; 32], vec![]),
			Err("escrow_taken".to_string())
		);

		// Reaching the maximum freezes the set
		table
			.flag_input_peer("escrow-address-1", [2; 32], b"onion-1".to_vec())
			.unwrap();
		assert!(table.is_frozen());
		assert!(table.frozen().try_get().is_some());
		assert_eq!(
			table.flag_input_peer("escrow-address-1", [3; 32], vec![]),
			Err("input_peers_frozen".to_string())
		);
	}

	#[test]
	fn deposit_lifecycle() {
		let table = table_with_slots(2);
		table
			.flag_input_peer("escrow-address-0", [1; 32], b"onion".to_vec())
			.unwrap();
		table.deposit_hash_share(&[1; 32], shares()).unwrap();

		let expected = Amount::from_btc(0.1001).unwrap();
		table
			.found_transaction("escrow-address-0", expected, expected, "txid-a".into(), 0)
			.unwrap();
		assert_eq!(table.unseen_addresses().len(), 0);
		assert!(!table.all_payments_received());

		table.confirm_transaction("txid-a");
		table.freeze_if_minimum_reached();
		assert!(!table.is_frozen(), "one peer is below the minimum");

		table
			.flag_input_peer("escrow-address-1", [2; 32], b"onion-2".to_vec())
			.unwrap();
		assert!(table.is_frozen());
		// The second deposit is still outstanding
		assert!(!table.all_payments_received());

		table
			.found_transaction("escrow-address-1", expected, expected, "txid-b".into(), 1)
			.unwrap();
		table.confirm_transaction("txid-b");
		assert!(table.all_payments_received());
	}

	#[test]
	fn wrong_value_fails_the_slot() {
		let table = table_with_slots(2);
		table
			.flag_input_peer("escrow-address-0", [1; 32], b"onion".to_vec())
			.unwrap();
		let expected = Amount::from_btc(0.1001).unwrap();
		let short = Amount::from_btc(0.05).unwrap();
		assert_eq!(
			table.found_transaction("escrow-address-0", short, expected, "txid".into(), 0),
			Err("wrong_value".to_string())
		);
		// The slot is free again
		assert_eq!(table.peer_count(), 0);
	}

	#[test]
	fn hash_share_bookkeeping() {
		let table = table_with_slots(1);
		table
			.flag_input_peer("escrow-address-0", [1; 32], b"onion".to_vec())
			.unwrap();
		assert!(!table.hash_shares_complete());
		assert_eq!(
			table.deposit_hash_share(&[9; 32], shares()),
			Err("session_not_found".to_string())
		);
		assert_eq!(
			table.deposit_hash_share(&[1; 32], vec![BigUint::from(1u32)]),
			Err("hash_share_count_mismatch".to_string())
		);
		table.deposit_hash_share(&[1; 32], shares()).unwrap();
		assert!(table.hash_shares_complete());
		assert_eq!(
			table.deposit_hash_share(&[1; 32], shares()),
			Err("hash_share_already_deposited".to_string())
		);
	}

	#[test]
	fn escrow_partitioning_by_rank() {
		let table = table_with_slots(4);
		// Rank 1 of a 2-peer mixnet owns the odd slots
		let (index, _, address) = table.assign_escrow(1, 2).unwrap();
		assert_eq!(index, 1);
		assert_eq!(address, "escrow-address-1");
	}

	#[test]
	fn output_assignment() {
		let table = table_with_slots(2);
		table.flag_input_peer("escrow-address-0", [1; 32], vec![]).unwrap();
		table.flag_input_peer("escrow-address-1", [2; 32], vec![]).unwrap();
		table
			.assign_output_addresses(vec![b"out-x".to_vec(), b"out-y".to_vec()])
			.unwrap();
		let escrows = table.assigned_escrows();
		assert_eq!(escrows[0].output_address.as_deref(), Some(b"out-x".as_ref()));
		assert_eq!(escrows[1].output_address.as_deref(), Some(b"out-y".as_ref()));
		assert_eq!(
			table.assign_output_addresses(vec![b"only-one".to_vec()]),
			Err("too_few_outputs".to_string())
		);
	}
}
