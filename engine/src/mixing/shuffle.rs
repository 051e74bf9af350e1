//! The layered decryption shuffle. Peer 0 peels the outermost encryption
//! layer off every output address and broadcasts a random permutation of
//! the result; each following rank verifies the previous layer against the
//! recombined hash-share checksum, peels its own layer and passes the list
//! on. The last layer is plaintext; it is ordered lexicographically and
//! permuted deterministically under a checksum-derived seed so all peers
//! reach the same assignment.

use std::{collections::VecDeque, sync::Arc};

use aes_gcm::{
	aead::{Aead, KeyInit},
	Aes256Gcm, Nonce,
};
use num_bigint::BigUint;
use num_traits::Zero;
use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use secp256k1::{ecdh::SharedSecret, PublicKey, SecretKey, SECP256K1};
use sha2::{Digest, Sha256};
use smpc::{
	field::{HASH_CHECKSUM_MODULUS, HASH_SHARING_PRIME},
	Algorithm, InitRequest, SlotId, SmpcStore,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info};

use crate::{errors::SessionError, mixing::input_peers::InputPeerTable};

/// Render a checksum the way it travels between peers: 64 hex digits of
/// its low 256 bits.
pub fn checksum_to_hex(checksum: &BigUint) -> String {
	let reduced = checksum % &*HASH_CHECKSUM_MODULUS;
	format!("{reduced:064x}")
}

/// `sum_i sha256(entry_i) mod p_hash` over a received address list; the
/// sum is permutation-invariant by construction.
pub fn reference_checksum(entries: &[Vec<u8>]) -> BigUint {
	let field = &*HASH_SHARING_PRIME;
	entries.iter().fold(BigUint::zero(), |acc, entry| {
		let digest = BigUint::from_bytes_be(&Sha256::digest(entry));
		field.add(&acc, &digest)
	})
}

/// One onion layer: ephemeral public key, AES-256-GCM nonce, ciphertext.
/// The symmetric key is the hashed ECDH secret between the ephemeral key
/// and the peer's identity key.
pub fn encrypt_layer(plaintext: &[u8], peer_identity: &PublicKey) -> Vec<u8> {
	let ephemeral = SecretKey::new(&mut rand::thread_rng());
	let shared = SharedSecret::new(peer_identity, &ephemeral);
	let cipher = Aes256Gcm::new_from_slice(&Sha256::digest(shared.as_ref()))
		.expect("sha256 output is a valid aes-256 key");

	let nonce_bytes: [u8; 12] = rand::thread_rng().gen();
	let nonce = Nonce::from_slice(&nonce_bytes);
	let ciphertext = cipher
		.encrypt(nonce, plaintext)
		.expect("aes-gcm encryption cannot fail for in-memory data");

	let mut out = ephemeral.public_key(SECP256K1).serialize().to_vec();
	out.extend_from_slice(&nonce_bytes);
	out.extend_from_slice(&ciphertext);
	out
}

pub fn decrypt_layer(layer: &[u8], identity: &SecretKey) -> Result<Vec<u8>, String> {
	if layer.len() < 33 + 12 + 16 {
		return Err("layer_too_short".to_string())
	}
	let ephemeral =
		PublicKey::from_slice(&layer[..33]).map_err(|_| "bad_ephemeral_key".to_string())?;
	let shared = SharedSecret::new(&ephemeral, identity);
	let cipher = Aes256Gcm::new_from_slice(&Sha256::digest(shared.as_ref()))
		.expect("sha256 output is a valid aes-256 key");
	let nonce = Nonce::from_slice(&layer[33..45]);
	cipher
		.decrypt(nonce, &layer[45..])
		.map_err(|_| "layer_decryption_failed".to_string())
}

/// Outcome of a completed shuffle: the canonical output-address order and
/// the final-layer checksum (hex) that seeded it.
pub struct ShuffleResult {
	pub outputs: Vec<Vec<u8>>,
	pub final_checksum_hex: String,
}

pub struct ShuffleDriver {
	pub rank: u32,
	pub n: u32,
	pub smpc: Arc<SmpcStore>,
	pub input_peers: Arc<InputPeerTable>,
	pub identity: SecretKey,
	/// Shuffled lists received from other peers: (sender rank, addresses).
	pub incoming: UnboundedReceiver<(u32, Vec<Vec<u8>>)>,
	/// Our own ADDR broadcasts, handed to the transport.
	pub broadcast: Box<dyn Fn(Vec<Vec<u8>>) + Send + Sync>,
}

impl ShuffleDriver {
	pub async fn run(mut self) -> Result<ShuffleResult, SessionError> {
		info!(rank = self.rank, "entering shuffling phase");
		let expected = self.input_peers.assigned_escrows().len();

		// Locally produced lists are processed through the same queue as
		// received ones, so every peer checks every layer including its
		// own.
		let mut pending: VecDeque<(u32, Vec<Vec<u8>>)> = VecDeque::new();

		if self.rank == 0 {
			let outputs = self.input_peers.encrypted_outputs();
			let peeled = self.peel_and_shuffle(outputs)?;
			(self.broadcast)(peeled.clone());
			pending.push_back((0, peeled));
		}

		loop {
			let (sender, addresses) = match pending.pop_front() {
				Some(event) => event,
				None => self
					.incoming
					.recv()
					.await
					.ok_or(SessionError::Cancelled)?,
			};

			if addresses.len() < expected {
				return Err(SessionError::ShortShuffle {
					got: addresses.len(),
					expected,
				})
			}

			// The layer checksum binds the list content (not its order)
			// to the hash shares the users deposited
			let checksum_hex = self.layer_checksum(sender).await?;
			let reference_hex = checksum_to_hex(&reference_checksum(&addresses));
			debug!(layer = sender, checksum_hex, reference_hex, "checksum comparison");
			if checksum_hex != reference_hex {
				return Err(SessionError::ChecksumMismatch { layer: sender })
			}

			if sender + 1 == self.rank {
				// Our turn: peel and pass on
				let peeled = self.peel_and_shuffle(addresses)?;
				(self.broadcast)(peeled.clone());
				pending.push_back((self.rank, peeled));
			} else if sender == self.n - 1 {
				// The list is plaintext now; derive the canonical
				// assignment all peers agree on
				let outputs = finalize_permutation(addresses, &checksum_hex);
				self.input_peers
					.assign_output_addresses(outputs.clone())
					.map_err(|_| SessionError::ShortShuffle {
						got: outputs.len(),
						expected,
					})?;
				info!(rank = self.rank, "shuffle complete");
				return Ok(ShuffleResult { outputs, final_checksum_hex: checksum_hex })
			}
		}
	}

	/// Remove one encryption layer from every entry, then apply a fresh
	/// uniformly random permutation.
	fn peel_and_shuffle(&self, addresses: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, SessionError> {
		let mut peeled = addresses
			.iter()
			.map(|layer| decrypt_layer(layer, &self.identity))
			.collect::<Result<Vec<_>, _>>()
			.map_err(SessionError::EscrowFailure)?;
		peeled.shuffle(&mut rand::thread_rng());
		Ok(peeled)
	}

	/// Recombine the layer checksum from the users' hash shares via a
	/// public reconstruction over the hash-sharing prime.
	async fn layer_checksum(&self, layer: u32) -> Result<String, SessionError> {
		let field = &*HASH_SHARING_PRIME;
		let mut share = BigUint::zero();
		for escrow in self.input_peers.assigned_escrows() {
			let hash_shares = escrow.hash_shares.as_ref().ok_or_else(|| {
				SessionError::EscrowFailure("missing hash shares".to_string())
			})?;
			let layer_share = hash_shares
				.get(layer as usize)
				.ok_or_else(|| SessionError::ChecksumMismatch { layer })?;
			share = field.add(&share, layer_share);
		}

		let wrapped = self.smpc.wrap(share);
		let slot = SlotId::new(Algorithm::Rec, b"c", layer);
		let checksum = self
			.smpc
			.initiate(slot.clone(), InitRequest::Rec { value: wrapped, field })
			.public_value()
			.await
			.and_then(|public| public.into_scalar())
			.map_err(|error| SessionError::SmpcFailure {
				slot,
				reason: error.to_string(),
			})?;
		Ok(checksum_to_hex(&checksum))
	}
}

/// Order lexicographically, then Fisher-Yates under a PRNG seeded with the
/// final-layer checksum. No single peer controls the checksum, so no
/// single peer can bias this permutation.
fn finalize_permutation(mut outputs: Vec<Vec<u8>>, checksum_hex: &str) -> Vec<Vec<u8>> {
	outputs.sort();
	let seed: [u8; 32] = hex::decode(checksum_hex)
		.expect("checksum hex is produced locally")
		.try_into()
		.expect("checksum is 32 bytes");
	let mut prng = ChaCha20Rng::from_seed(seed);
	outputs.shuffle(&mut prng);
	outputs
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_utils::SmpcCluster;
	use smpc::shamir;
	use tokio::sync::mpsc::unbounded_channel;

	#[test]
	fn layer_encryption_round_trip() {
		let identity = SecretKey::new(&mut rand::thread_rng());
		let public = identity.public_key(SECP256K1);
		let layer = encrypt_layer(b"tb1q-some-address", &public);
		assert_eq!(decrypt_layer(&layer, &identity).unwrap(), b"tb1q-some-address");

		let wrong_key = SecretKey::new(&mut rand::thread_rng());
		assert!(decrypt_layer(&layer, &wrong_key).is_err());
	}

	#[test]
	fn reference_checksum_is_permutation_invariant() {
		let a = vec![b"x".to_vec(), b"y".to_vec(), b"z".to_vec()];
		let b = vec![b"z".to_vec(), b"x".to_vec(), b"y".to_vec()];
		assert_eq!(reference_checksum(&a), reference_checksum(&b));

		let c = vec![b"x".to_vec(), b"y".to_vec(), b"w".to_vec()];
		assert_ne!(reference_checksum(&a), reference_checksum(&c));
	}

	#[test]
	fn final_permutation_is_deterministic() {
		let outputs =
			vec![b"addr-b".to_vec(), b"addr-a".to_vec(), b"addr-c".to_vec()];
		let checksum = "ab".repeat(32);
		let once = finalize_permutation(outputs.clone(), &checksum);
		let twice = finalize_permutation(outputs.clone(), &checksum);
		assert_eq!(once, twice);

		let other_checksum = "cd".repeat(32);
		// A different seed almost surely gives a different order, but it
		// must still be the same multiset
		let mut sorted = finalize_permutation(outputs, &other_checksum);
		sorted.sort();
		let mut expected = once.clone();
		expected.sort();
		assert_eq!(sorted, expected);
	}

	/// Full three-peer shuffle over two inputs: onions peel layer by
	/// layer, every checksum matches, and all peers end with the same
	/// input-to-output assignment.
	#[tokio::test]
	async fn three_peer_shuffle_agrees() {
		let n = 3u32;
		let t = 1u32;
		let field = &*HASH_SHARING_PRIME;
		let cluster = SmpcCluster::honest(n, t);

		let identities: Vec<SecretKey> =
			(0..n).map(|_| SecretKey::new(&mut rand::thread_rng())).collect();
		let publics: Vec<PublicKey> =
			identities.iter().map(|sk| sk.public_key(SECP256K1)).collect();

		let plain_outputs = [b"output-address-alpha".to_vec(), b"output-address-beta".to_vec()];

		// Build the onions inside-out and record each intermediate level:
		// level r is what rank r broadcasts after peeling
		let mut onions = Vec::new();
		let mut levels: Vec<Vec<Vec<u8>>> = vec![Vec::new(); n as usize];
		for plain in &plain_outputs {
			let mut layered = plain.clone();
			levels[2].push(layered.clone());
			layered = encrypt_layer(&layered, &publics[2]);
			levels[1].push(layered.clone());
			layered = encrypt_layer(&layered, &publics[1]);
			levels[0].push(layered.clone());
			layered = encrypt_layer(&layered, &publics[0]);
			onions.push(layered);
		}

		// Per input and layer, Shamir-share the level digest sum
		// contribution: user i shares sha256(level_r_i)
		let mut tables = Vec::new();
		for _ in 0..n {
			tables.push(Arc::new(InputPeerTable::new(n, 2, 2)));
		}
		for (input, onion) in onions.iter().enumerate() {
			let mut per_peer_shares: Vec<Vec<BigUint>> =
				vec![Vec::new(); n as usize];
			for level in levels.iter() {
				let digest =
					BigUint::from_bytes_be(&Sha256::digest(&level[input]));
				let (shares, _) = shamir::share(&digest, n, t, field);
				for (rank, (_, share)) in shares.into_iter().enumerate() {
					per_peer_shares[rank].push(share);
				}
			}
			for (rank, table) in tables.iter().enumerate() {
				table.store_generated_escrow(
					input as u32,
					vec![4; 65],
					format!("escrow-{input}"),
				);
				table
					.flag_input_peer(
						&format!("escrow-{input}"),
						[input as u8 + 1; 32],
						onion.clone(),
					)
					.unwrap();
				table
					.deposit_hash_share(
						&[input as u8 + 1; 32],
						per_peer_shares[rank].clone(),
					)
					.unwrap();
			}
		}

		// Wire the ADDR broadcasts: each driver's broadcast closure feeds
		// every other driver's incoming queue
		let mut incoming_txs = Vec::new();
		let mut incoming_rxs = Vec::new();
		for _ in 0..n {
			let (tx, rx) = unbounded_channel();
			incoming_txs.push(tx);
			incoming_rxs.push(rx);
		}

		let mut handles = Vec::new();
		for (rank, incoming) in incoming_rxs.into_iter().enumerate() {
			let txs = incoming_txs.clone();
			let driver = ShuffleDriver {
				rank: rank as u32,
				n,
				smpc: cluster.store(rank).clone(),
				input_peers: tables[rank].clone(),
				identity: identities[rank],
				incoming,
				broadcast: Box::new(move |addresses| {
					for (to, tx) in txs.iter().enumerate() {
						if to != rank {
							let _ = tx.send((rank as u32, addresses.clone()));
						}
					}
				}),
			};
			handles.push(tokio::spawn(driver.run()));
		}

		let results: Vec<ShuffleResult> = futures::future::join_all(handles)
			.await
			.into_iter()
			.map(|result| result.unwrap().unwrap())
			.collect();

		// Identical assignment everywhere, covering exactly the plaintext
		// outputs
		for result in &results[1..] {
			assert_eq!(result.outputs, results[0].outputs);
			assert_eq!(result.final_checksum_hex, results[0].final_checksum_hex);
		}
		let mut delivered = results[0].outputs.clone();
		delivered.sort();
		let mut expected: Vec<Vec<u8>> = plain_outputs.to_vec();
		expected.sort();
		assert_eq!(delivered, expected);
	}
}
