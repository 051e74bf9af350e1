//! Escrow precomputation: for every escrow index a threshold-shared
//! private key d, a nonce k with its public point, and the signing helpers
//! k^-1 and k^-1 * d, derived without any peer learning k or d.

use std::sync::Arc;

use smpc::{
	address::pubkey_to_bitcoin_address,
	curve::{scalar_field, Point},
	Algorithm, InitRequest, SlotId, SmpcStore, ValueHandle,
};
use tracing::{debug, info};

use crate::{errors::SessionError, mixing::input_peers::InputPeerTable};

/// The per-escrow signing material. `ki` and `kid` are consumed exactly
/// once, by the signer.
pub struct Escrow {
	pub index: u32,
	/// Uncompressed SEC1 encoding of `d * G`.
	pub pubkey: Vec<u8>,
	pub address: String,
	pub d: ValueHandle,
	/// `k * G`; its x coordinate is the signature's r.
	pub k_point: Point,
	/// Share of `k^-1`.
	pub ki: ValueHandle,
	/// Share of `k^-1 * d`.
	pub kid: ValueHandle,
}

/// Generate `amount` escrows sequentially (one DKG pipeline in flight at a
/// time bounds the concurrent load). `h` is the session's common Pedersen
/// point from the one-time JF-DKG.
pub async fn generate_escrows(
	store: &Arc<SmpcStore>,
	input_peers: &InputPeerTable,
	h: Point,
	amount: u32,
	testnet: bool,
) -> Result<Vec<Escrow>, SessionError> {
	info!(amount, "generating escrow addresses");
	let field = scalar_field();
	let mut escrows = Vec::with_capacity(amount as usize);

	for index in 0..amount {
		// The threshold-shared private key; its public point becomes the
		// escrow address
		let d = store.initiate(
			SlotId::new(Algorithm::Dkg, b"d", index),
			InitRequest::Dkg { field, h, with_public: true },
		);

		// The signing nonce k, with k * G published
		let k = store.initiate(
			SlotId::new(Algorithm::Dkg, b"k", index),
			InitRequest::Dkg { field, h, with_public: true },
		);

		// Side computation for k^-1: a random helper e, u = e * k opened
		// publicly, then k^-1 = u^-1 * e (since u^-1 * e = (ek)^-1 e)
		let e = store.initiate(
			SlotId::new(Algorithm::Dkg, b"e", index),
			InitRequest::Dkg { field, h, with_public: false },
		);
		let us = store.initiate(
			SlotId::new(Algorithm::Mul, b"us", index),
			InitRequest::Mul { factor1: e.clone(), factor2: k.clone() },
		);
		let u = store.initiate(
			SlotId::new(Algorithm::Rec, b"u", index),
			InitRequest::Rec { value: us, field },
		);

		let d_point = d
			.public_value()
			.await
			.and_then(|public| public.into_point())
			.map_err(|error| SessionError::EscrowFailure(error.to_string()))?;
		let k_point = k
			.public_value()
			.await
			.and_then(|public| public.into_point())
			.map_err(|error| SessionError::EscrowFailure(error.to_string()))?;
		let u_value = u
			.public_value()
			.await
			.and_then(|public| public.into_scalar())
			.map_err(|error| SessionError::EscrowFailure(error.to_string()))?;

		let u_inverse = field
			.invert(&u_value)
			.map_err(|error| SessionError::EscrowFailure(error.to_string()))?;
		let ki = store.cmul(u_inverse, &e, field);
		let kid = store.initiate(
			SlotId::new(Algorithm::Mul, b"kid", index),
			InitRequest::Mul { factor1: ki.clone(), factor2: d.clone() },
		);

		let pubkey = d_point
			.serialize_uncompressed()
			.map_err(|error| SessionError::EscrowFailure(error.to_string()))?
			.to_vec();
		let address = pubkey_to_bitcoin_address(&pubkey, testnet);
		debug!(index, address, "escrow address derived");
		input_peers.store_generated_escrow(index, pubkey.clone(), address.clone());

		escrows.push(Escrow { index, pubkey, address, d, k_point, ki, kid });
	}

	info!("escrow address generation concluded");
	Ok(escrows)
}
