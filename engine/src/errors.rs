//! Session-level error taxonomy. Protocol violations are handled (and
//! logged) where they occur; everything surfacing here goes through the
//! session's error promise and tears that session down.

use smpc::SlotId;

#[derive(thiserror::Error, Debug, Clone)]
pub enum SessionError {
	#[error("smpc value {slot} failed: {reason}")]
	SmpcFailure { slot: SlotId, reason: String },
	#[error("shuffle checksum mismatch at layer {layer}")]
	ChecksumMismatch { layer: u32 },
	#[error("shuffle output count {got} does not cover all {expected} input peers")]
	ShortShuffle { got: usize, expected: usize },
	#[error("escrow generation failed: {0}")]
	EscrowFailure(String),
	#[error("bitcoin rpc failure: {0}")]
	Rpc(String),
	#[error("signing failed for escrow {escrow}: {reason}")]
	SigningFailure { escrow: u32, reason: String },
	#[error("session cancelled")]
	Cancelled,
}

#[derive(thiserror::Error, Debug)]
pub enum RpcError {
	#[error("transport: {0}")]
	Transport(String),
	#[error("rpc error {code}: {message}")]
	Rpc { code: i64, message: String },
	#[error("malformed rpc response: {0}")]
	Malformed(String),
}

impl RpcError {
	/// Error code bitcoind returns for a transaction it already knows.
	/// All N peers submit the same signed transaction, so the signer
	/// swallows this one.
	pub const ALREADY_IN_CHAIN: i64 = -25;

	pub fn is_already_in_chain(&self) -> bool {
		matches!(self, RpcError::Rpc { code, .. } if *code == Self::ALREADY_IN_CHAIN)
	}
}
