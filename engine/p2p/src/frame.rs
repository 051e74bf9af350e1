//! The signed binary frame every peer-to-peer message travels in.
//!
//! Header layout (big-endian, 85 bytes):
//!
//! ```text
//! u8  version (0x01)
//! u8  message type
//! u16 sender rank
//! u32 sequence number
//! u32 frame length (header + payload)
//! 73B signature: u8 DER length | up to 72 bytes DER | zero padding
//! ```
//!
//! The signature is ECDSA over SHA-256 of the entire frame with the
//! signature field zeroed.

use secp256k1::{ecdsa::Signature, Message, PublicKey, SecretKey, SECP256K1};
use sha2::{Digest, Sha256};

use crate::error::P2pError;

pub const PROTOCOL_VERSION: u8 = 0x01;
pub const HEADER_LEN: usize = 85;
pub const SIG_FIELD_LEN: usize = 73;
/// Frames larger than this are treated as hostile and drop the connection.
pub const MAX_FRAME_LEN: usize = 1 << 20;

const LENGTH_OFFSET: usize = 8;
const SIG_OFFSET: usize = 12;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
	Helo = 0x00,
	Addr = 0x01,
	Ackn = 0x0F,
	Mpcs = 0x10,
	Mpcp = 0x11,
	Comp = 0x12,
	Cmpr = 0x13,
	Ncmp = 0x14,
	Rbrc = 0xF0,
	Cbrc = 0xF1,
}

impl MessageType {
	pub fn from_wire(byte: u8) -> Result<Self, P2pError> {
		Ok(match byte {
			0x00 => MessageType::Helo,
			0x01 => MessageType::Addr,
			0x0F => MessageType::Ackn,
			0x10 => MessageType::Mpcs,
			0x11 => MessageType::Mpcp,
			0x12 => MessageType::Comp,
			0x13 => MessageType::Cmpr,
			0x14 => MessageType::Ncmp,
			0xF0 => MessageType::Rbrc,
			0xF1 => MessageType::Cbrc,
			other => return Err(P2pError::UnknownMessageType(other)),
		})
	}
}

/// A decoded frame; `payload` is everything after the header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
	pub message_type: MessageType,
	pub sender_rank: u16,
	pub seq: u32,
	pub payload: Vec<u8>,
}

/// Build, sign and serialize a frame in one go.
pub fn encode_frame(
	message_type: MessageType,
	sender_rank: u16,
	seq: u32,
	payload: &[u8],
	signing_key: &SecretKey,
) -> Vec<u8> {
	let total_len = HEADER_LEN + payload.len();
	let mut frame = Vec::with_capacity(total_len);
	frame.push(PROTOCOL_VERSION);
	frame.push(message_type as u8);
	frame.extend_from_slice(&sender_rank.to_be_bytes());
	frame.extend_from_slice(&seq.to_be_bytes());
	frame.extend_from_slice(&(total_len as u32).to_be_bytes());
	frame.extend_from_slice(&[0u8; SIG_FIELD_LEN]);
	frame.extend_from_slice(payload);

	let signature = sign_frame_digest(&frame, signing_key);
	let der = signature.serialize_der();
	frame[SIG_OFFSET] = der.len() as u8;
	frame[SIG_OFFSET + 1..SIG_OFFSET + 1 + der.len()].copy_from_slice(&der);
	frame
}

/// Parse a frame without checking its signature; transports verify
/// separately because the key depends on the claimed rank.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, P2pError> {
	if bytes.len() < HEADER_LEN {
		return Err(P2pError::TruncatedFrame)
	}
	if bytes[0] != PROTOCOL_VERSION {
		return Err(P2pError::BadVersion(bytes[0]))
	}
	let declared_len =
		u32::from_be_bytes(bytes[LENGTH_OFFSET..LENGTH_OFFSET + 4].try_into().expect("4 bytes"))
			as usize;
	if declared_len != bytes.len() {
		return Err(P2pError::TruncatedFrame)
	}
	Ok(Frame {
		message_type: MessageType::from_wire(bytes[1])?,
		sender_rank: u16::from_be_bytes(bytes[2..4].try_into().expect("2 bytes")),
		seq: u32::from_be_bytes(bytes[4..8].try_into().expect("4 bytes")),
		payload: bytes[HEADER_LEN..].to_vec(),
	})
}

fn frame_digest(frame: &[u8]) -> Message {
	// Hash with the signature field zeroed
	let mut hasher = Sha256::new();
	hasher.update(&frame[..SIG_OFFSET]);
	hasher.update([0u8; SIG_FIELD_LEN]);
	hasher.update(&frame[HEADER_LEN..]);
	Message::from_digest_slice(&hasher.finalize()).expect("sha256 digest is a valid message")
}

fn sign_frame_digest(frame: &[u8], signing_key: &SecretKey) -> Signature {
	SECP256K1.sign_ecdsa(&frame_digest(frame), signing_key)
}

/// Detached signature over arbitrary bytes; used for consistent-broadcast
/// echoes, where peers countersign the encapsulated message.
pub fn sign_bytes(bytes: &[u8], signing_key: &SecretKey) -> Vec<u8> {
	let digest = Message::from_digest_slice(&Sha256::digest(bytes))
		.expect("sha256 digest is a valid message");
	SECP256K1.sign_ecdsa(&digest, signing_key).serialize_der().to_vec()
}

pub fn verify_bytes(bytes: &[u8], signature_der: &[u8], key: &PublicKey) -> bool {
	let digest = match Message::from_digest_slice(&Sha256::digest(bytes)) {
		Ok(digest) => digest,
		Err(_) => return false,
	};
	let signature = match Signature::from_der(signature_der) {
		Ok(signature) => signature,
		Err(_) => return false,
	};
	SECP256K1.verify_ecdsa(&digest, &signature, key).is_ok()
}

/// Check the embedded signature of a serialized frame against the claimed
/// sender's identity key.
pub fn verify_frame(bytes: &[u8], key: &PublicKey) -> bool {
	if bytes.len() < HEADER_LEN {
		return false
	}
	let sig_len = bytes[SIG_OFFSET] as usize;
	if sig_len > SIG_FIELD_LEN - 1 {
		return false
	}
	let signature = match Signature::from_der(&bytes[SIG_OFFSET + 1..SIG_OFFSET + 1 + sig_len]) {
		Ok(signature) => signature,
		Err(_) => return false,
	};
	SECP256K1.verify_ecdsa(&frame_digest(bytes), &signature, key).is_ok()
}

/// Incremental frame extraction for a streaming connection. Bytes are
/// buffered until the length field says a frame is complete.
#[derive(Default)]
pub struct FrameDecoder {
	buffer: Vec<u8>,
}

impl FrameDecoder {
	pub fn new() -> Self {
		Self::default()
	}

	/// Feed bytes from the wire; returns all frames completed by them.
	pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>, P2pError> {
		self.buffer.extend_from_slice(bytes);

		let mut frames = Vec::new();
		loop {
			if self.buffer.len() < LENGTH_OFFSET + 4 {
				break
			}
			let declared_len = u32::from_be_bytes(
				self.buffer[LENGTH_OFFSET..LENGTH_OFFSET + 4]
					.try_into()
					.expect("4 bytes"),
			) as usize;
			if declared_len < HEADER_LEN || declared_len > MAX_FRAME_LEN {
				return Err(P2pError::OversizedFrame(declared_len))
			}
			if self.buffer.len() < declared_len {
				break
			}
			let rest = self.buffer.split_off(declared_len);
			frames.push(std::mem::replace(&mut self.buffer, rest));
		}
		Ok(frames)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use secp256k1::rand::thread_rng;

	fn keypair() -> (SecretKey, PublicKey) {
		SECP256K1.generate_keypair(&mut thread_rng())
	}

	#[test]
	fn frame_round_trip() {
		let (sk, pk) = keypair();
		let payload = b"some payload bytes";
		let bytes = encode_frame(MessageType::Mpcs, 2, 0xDEADBEEF, payload, &sk);

		assert_eq!(bytes.len(), HEADER_LEN + payload.len());
		assert!(verify_frame(&bytes, &pk));

		let frame = decode_frame(&bytes).unwrap();
		assert_eq!(frame.message_type, MessageType::Mpcs);
		assert_eq!(frame.sender_rank, 2);
		assert_eq!(frame.seq, 0xDEADBEEF);
		assert_eq!(frame.payload, payload);
	}

	#[test]
	fn tampering_breaks_the_signature() {
		let (sk, pk) = keypair();
		let mut bytes = encode_frame(MessageType::Helo, 0, 7, b"payload", &sk);
		assert!(verify_frame(&bytes, &pk));

		*bytes.last_mut().unwrap() ^= 0x01;
		assert!(!verify_frame(&bytes, &pk));
	}

	#[test]
	fn wrong_key_fails_verification() {
		let (sk, _) = keypair();
		let (_, other_pk) = keypair();
		let bytes = encode_frame(MessageType::Helo, 0, 7, b"payload", &sk);
		assert!(!verify_frame(&bytes, &other_pk));
	}

	#[test]
	fn decoder_reassembles_split_frames() {
		let (sk, _) = keypair();
		let frame1 = encode_frame(MessageType::Ncmp, 1, 1, b"", &sk);
		let frame2 = encode_frame(MessageType::Ncmp, 1, 2, b"xyz", &sk);

		let mut stream = frame1.clone();
		stream.extend_from_slice(&frame2);

		let mut decoder = FrameDecoder::new();
		// Push in awkward chunk sizes
		let mut collected = Vec::new();
		for chunk in stream.chunks(7) {
			collected.extend(decoder.push(chunk).unwrap());
		}
		assert_eq!(collected, vec![frame1, frame2]);
	}

	#[test]
	fn decoder_rejects_oversized_frames() {
		let mut bogus = vec![PROTOCOL_VERSION, 0x14, 0, 1, 0, 0, 0, 1];
		bogus.extend_from_slice(&(u32::MAX).to_be_bytes());
		let mut decoder = FrameDecoder::new();
		assert!(matches!(decoder.push(&bogus), Err(P2pError::OversizedFrame(_))));
	}

	#[test]
	fn unknown_message_type_is_rejected() {
		let (sk, _) = keypair();
		let mut bytes = encode_frame(MessageType::Helo, 0, 1, b"", &sk);
		bytes[1] = 0x77;
		assert!(matches!(decode_frame(&bytes), Err(P2pError::UnknownMessageType(0x77))));
	}
}
