//! Threshold ECDSA signing and disbursement. The signature is assembled
//! from the precomputed escrow material: every peer contributes
//! `s_i = e * ki_i + r * kid_i`, the shares are publicly recombined to s,
//! and (r, s) is DER-encoded into a standard P2PKH scriptSig.

use std::{
	str::FromStr,
	sync::{
		atomic::{AtomicU32, Ordering},
		Arc,
	},
};

use bitcoin::{
	absolute::LockTime,
	hashes::Hash,
	sighash::{EcdsaSighashType, SighashCache},
	Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use num_bigint::BigUint;
use secp256k1::{ecdsa::Signature, Message, PublicKey, SECP256K1};
use sha2::{Digest, Sha256};
use smpc::{
	curve::scalar_field, Algorithm, InitRequest, SecretScalar, SlotId, SmpcStore,
};
use tracing::{debug, info, warn};

use crate::{
	btc::rpc::BtcRpcApi,
	errors::SessionError,
	mixing::{escrow::Escrow, input_peers::InputPeerTable, strategies},
};

/// Monotonic index for the `S` recombination slots, one per signed
/// transaction within the session.
pub struct SignatureCounter(AtomicU32);

impl SignatureCounter {
	pub fn new() -> Self {
		SignatureCounter(AtomicU32::new(0))
	}

	fn next(&self) -> u32 {
		self.0.fetch_add(1, Ordering::Relaxed)
	}
}

impl Default for SignatureCounter {
	fn default() -> Self {
		Self::new()
	}
}

/// Build and threshold-sign the transaction spending `escrow`'s deposit to
/// `output_address`. Returns the hex-serialized transaction ready for
/// broadcast.
pub async fn create_transaction(
	smpc: &Arc<SmpcStore>,
	counter: &SignatureCounter,
	escrow: &Escrow,
	prev_txid: &str,
	prev_vout: u32,
	value: Amount,
	output_address: &str,
	testnet: bool,
) -> Result<String, SessionError> {
	let fail = |reason: String| SessionError::SigningFailure { escrow: escrow.index, reason };

	let pubkey =
		PublicKey::from_slice(&escrow.pubkey).map_err(|error| fail(error.to_string()))?;
	let bitcoin_pubkey = bitcoin::PublicKey { compressed: false, inner: pubkey };
	let script_pubkey = ScriptBuf::new_p2pkh(&bitcoin_pubkey.pubkey_hash());

	let network =
		if testnet { bitcoin::Network::Testnet } else { bitcoin::Network::Bitcoin };
	let output_script = bitcoin::Address::from_str(output_address)
		.map_err(|error| fail(error.to_string()))?
		.require_network(network)
		.map_err(|error| fail(error.to_string()))?
		.script_pubkey();

	let txid = Txid::from_str(prev_txid).map_err(|error| fail(error.to_string()))?;
	let mut tx = Transaction {
		version: bitcoin::transaction::Version::ONE,
		lock_time: LockTime::ZERO,
		input: vec![TxIn {
			previous_output: OutPoint { txid, vout: prev_vout },
			script_sig: ScriptBuf::new(),
			sequence: Sequence::MAX,
			witness: Witness::new(),
		}],
		output: vec![TxOut { value, script_pubkey: output_script }],
	};

	// Legacy SIGHASH_ALL digest of the transaction against the escrow's
	// scriptPubKey
	let sighash = SighashCache::new(&tx)
		.legacy_signature_hash(0, &script_pubkey, EcdsaSighashType::All.to_u32())
		.map_err(|error| fail(error.to_string()))?;
	let sighash_bytes: [u8; 32] = sighash.to_byte_array();

	let signature = threshold_sign(smpc, counter, escrow, &sighash_bytes).await?;

	// Sanity: the assembled signature must verify under the escrow key
	// before anything reaches the network
	let message = Message::from_digest_slice(&sighash_bytes).expect("sighash is 32 bytes");
	SECP256K1
		.verify_ecdsa(&message, &signature, &pubkey)
		.map_err(|_| fail("assembled signature does not verify".to_string()))?;

	let mut signature_bytes = signature.serialize_der().to_vec();
	signature_bytes.push(EcdsaSighashType::All.to_u32() as u8);

	let script_sig = ScriptBuf::builder()
		.push_slice(
			<&bitcoin::script::PushBytes>::try_from(signature_bytes.as_slice())
				.expect("der signature fits push bytes"),
		)
		.push_slice(
			<&bitcoin::script::PushBytes>::try_from(escrow.pubkey.as_slice())
				.expect("pubkey fits push bytes"),
		)
		.into_script();
	tx.input[0].script_sig = script_sig;

	debug!(escrow = escrow.index, "disbursement transaction signed");
	Ok(bitcoin::consensus::encode::serialize_hex(&tx))
}

/// `s = e * k^-1 + r * k^-1 d` assembled from shares and recombined.
async fn threshold_sign(
	smpc: &Arc<SmpcStore>,
	counter: &SignatureCounter,
	escrow: &Escrow,
	sighash: &[u8; 32],
) -> Result<Signature, SessionError> {
	let fail = |reason: String| SessionError::SigningFailure { escrow: escrow.index, reason };
	let field = scalar_field();

	let e = field.reduce(BigUint::from_bytes_be(sighash));
	let r = escrow.k_point.x_scalar().map_err(|error| fail(error.to_string()))?;

	// The escrow material is consumed exactly once; the wrappers wipe the
	// local copies when this function returns
	let ki_share =
		SecretScalar::new(escrow.ki.secret_share().await.map_err(|error| fail(error.to_string()))?);
	let kid_share = SecretScalar::new(
		escrow.kid.secret_share().await.map_err(|error| fail(error.to_string()))?,
	);

	let summand1 = smpc.cmul(e, &smpc.wrap(ki_share.expose().clone()), field);
	let summand2 = smpc.cmul(r.clone(), &smpc.wrap(kid_share.expose().clone()), field);
	let s_share = smpc.add(&summand1, &summand2, field);

	let slot = SlotId::new(Algorithm::Rec, b"S", counter.next());
	let s = smpc
		.initiate(slot.clone(), InitRequest::Rec { value: s_share, field })
		.public_value()
		.await
		.and_then(|public| public.into_scalar())
		.map_err(|error| SessionError::SmpcFailure { slot, reason: error.to_string() })?;

	let mut compact = [0u8; 64];
	compact[..32].copy_from_slice(&field.to_bytes(&r));
	compact[32..].copy_from_slice(&field.to_bytes(&s));
	let mut signature =
		Signature::from_compact(&compact).map_err(|error| fail(error.to_string()))?;
	// Bitcoin consensus prefers the low-s form; both encode the same
	// valid signature
	signature.normalize_s();
	Ok(signature)
}

/// The streaming phase: derive every escrow's splitting and schedule from
/// the shuffle checksum, then launch the disbursements in global time
/// order. Rebroadcasts of transactions other peers already submitted
/// surface as "already in chain" and are absorbed.
pub async fn run_streaming<C: BtcRpcApi>(
	smpc: &Arc<SmpcStore>,
	rpc: &C,
	input_peers: &InputPeerTable,
	escrows: &[Escrow],
	final_checksum_hex: &str,
	payout_value: Amount,
	mixing_window_mins: u64,
	testnet: bool,
) -> Result<(), SessionError> {
	info!("entering streaming phase");
	let counter = SignatureCounter::new();

	let seed: [u8; 32] = Sha256::digest(final_checksum_hex.as_bytes()).into();
	let mut prng = <rand_chacha::ChaCha20Rng as rand::SeedableRng>::from_seed(seed);

	let assigned = input_peers.assigned_escrows();
	let splits: Vec<Vec<Amount>> = assigned
		.iter()
		.map(|_| strategies::split_single_transaction(payout_value))
		.collect::<Result<_, _>>()
		.map_err(SessionError::EscrowFailure)?;
	let schedules: Vec<Vec<std::time::Duration>> = splits
		.iter()
		.map(|split| strategies::schedule_random(split.len(), mixing_window_mins, &mut prng))
		.collect();

	let start = tokio::time::Instant::now();
	let mut next_sub_payment = vec![0usize; splits.len()];
	for (position, offset) in strategies::serialize_schedules(&schedules) {
		let slot = &assigned[position];
		let sub_payment = next_sub_payment[position];
		next_sub_payment[position] += 1;
		let escrow = escrows
			.iter()
			.find(|escrow| escrow.index == slot.index)
			.expect("assigned escrows were all generated");

		tokio::time::sleep_until(start + offset).await;

		let (txid, vout, output_address) = match (
			slot.txid.as_ref(),
			slot.vout,
			slot.output_address.as_ref(),
		) {
			(Some(txid), Some(vout), Some(output)) => (
				txid.clone(),
				vout,
				String::from_utf8(output.clone()).map_err(|_| {
					SessionError::SigningFailure {
						escrow: slot.index,
						reason: "output address is not utf-8".to_string(),
					}
				})?,
			),
			_ => {
				warn!(escrow = slot.index, "skipping escrow without deposit or output");
				continue
			},
		};

		let tx_hex = create_transaction(
			smpc,
			&counter,
			escrow,
			&txid,
			vout,
			splits[position][sub_payment],
			&output_address,
			testnet,
		)
		.await?;

		match rpc.send_raw_transaction(&tx_hex).await {
			Ok(txid) => info!(txid, escrow = slot.index, "disbursement broadcast"),
			Err(error) if error.is_already_in_chain() => {
				debug!(escrow = slot.index, "transaction already known; absorbed");
			},
			Err(error) => return Err(SessionError::Rpc(error.to_string())),
		}
	}

	info!("everything has been transmitted");
	Ok(())
}
