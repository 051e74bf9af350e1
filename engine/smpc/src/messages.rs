//! The logical message model of the shared-value engine. Wire encoding of
//! these lives in the p2p crate; protocol tasks only ever see this form.

use crate::error::SmpcError;

/// Algorithm discriminants as they appear in the SMPC wire subheader.
/// `Wrap`, `Cmul` and `Add` never communicate, but the first two still own
/// wire ids for historical reasons.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Algorithm {
	Wrap = 0x00,
	Cmul = 0x01,
	Rec = 0x02,
	Mul = 0x03,
	Dkg = 0x04,
	Jfdkg = 0x05,
}

impl Algorithm {
	pub fn from_wire(byte: u8) -> Result<Self, SmpcError> {
		Ok(match byte {
			0x00 => Algorithm::Wrap,
			0x01 => Algorithm::Cmul,
			0x02 => Algorithm::Rec,
			0x03 => Algorithm::Mul,
			0x04 => Algorithm::Dkg,
			0x05 => Algorithm::Jfdkg,
			other => return Err(SmpcError::UnknownAlgorithm(other)),
		})
	}

	pub fn to_wire(self) -> u8 {
		self as u8
	}
}

impl std::fmt::Display for Algorithm {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Algorithm::Wrap => write!(f, "wrap"),
			Algorithm::Cmul => write!(f, "cmul"),
			Algorithm::Rec => write!(f, "rec"),
			Algorithm::Mul => write!(f, "mul"),
			Algorithm::Dkg => write!(f, "dkg"),
			Algorithm::Jfdkg => write!(f, "jfdkg"),
		}
	}
}

/// Identifies one shared value within a session: a short name (such as `d`,
/// `k`, `ki`, `kid`, `H`, `c`) plus an index, typically the escrow index.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId {
	pub algorithm: Algorithm,
	pub id: Vec<u8>,
	pub index: u32,
}

impl SlotId {
	pub fn new(algorithm: Algorithm, id: impl AsRef<[u8]>, index: u32) -> Self {
		SlotId { algorithm, id: id.as_ref().to_vec(), index }
	}
}

impl std::fmt::Display for SlotId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}:{}[{}]", self.algorithm, String::from_utf8_lossy(&self.id), self.index)
	}
}

/// Payload of one SMPC protocol message, after the transport has stripped
/// framing, signatures and broadcast wrappers. Byte payloads stay opaque
/// here; each protocol knows its own layout (e.g. the Pedersen DKG packs
/// `s || s'` share pairs and tags its public values with a kind byte).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SmpcData {
	/// MPCS: a secret share, delivered point-to-point.
	SecretShare(Vec<u8>),
	/// MPCP: a public contribution (commitment vector or opened share).
	PublicValue(Vec<u8>),
	/// COMP: the sender accuses `accused` of misbehaving in this slot.
	Complaint { accused: u16 },
	/// CMPR: reaction to a complaint, opening the share sent to `accuser`.
	ComplaintReaction { accuser: u16, share: Vec<u8> },
	/// NCMP: the sender will not raise complaints for this slot.
	NoComplaint,
}

impl SmpcData {
	pub fn kind(&self) -> &'static str {
		match self {
			SmpcData::SecretShare(_) => "mpcs",
			SmpcData::PublicValue(_) => "mpcp",
			SmpcData::Complaint { .. } => "comp",
			SmpcData::ComplaintReaction { .. } => "cmpr",
			SmpcData::NoComplaint => "ncmp",
		}
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SmpcEnvelope {
	pub slot: SlotId,
	pub data: SmpcData,
}

/// Traffic leaving the shared-value engine. The engine maps these onto the
/// transport's transaction kinds; tests map them onto loopback routers.
#[derive(Debug)]
pub enum OutgoingSmpcMessages {
	/// Plain broadcast transaction expecting one ACKN per peer.
	Broadcast(SmpcEnvelope),
	/// A distinct private message for each peer rank.
	Eachcast(Vec<(u32, SmpcEnvelope)>),
	/// Integrity-protected broadcast (Cachin-Kursawe).
	ConsistentBroadcast(SmpcEnvelope),
}

/// Kind bytes distinguishing the two public-value flavours of the
/// Pedersen DKG.
pub const DKG_PUBLIC_COMMITMENT: u8 = 0x00;
pub const DKG_PUBLIC_FELDMAN: u8 = 0x01;
