#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum P2pError {
	#[error("frame truncated or length field inconsistent")]
	TruncatedFrame,
	#[error("unsupported protocol version {0:#04x}")]
	BadVersion(u8),
	#[error("unknown message type {0:#04x}")]
	UnknownMessageType(u8),
	#[error("frame of {0} bytes exceeds the frame size cap")]
	OversizedFrame(usize),
	#[error("malformed {0} payload")]
	MalformedPayload(&'static str),
	#[error("invalid frame signature from rank {0}")]
	BadSignature(u16),
	#[error("message from unknown rank {0}")]
	UnknownRank(u16),
	#[error("unexpected response from rank {got} (expected {expected})")]
	UnexpectedResponder { got: u16, expected: u16 },
	#[error("rank {0} responded more than once")]
	DuplicateResponse(u16),
	#[error("peer rank {0} rejected the request: {1}")]
	PeerNak(u16, String),
	#[error("transaction cancelled")]
	Cancelled,
}
