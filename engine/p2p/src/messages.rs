//! Typed payload codecs for every message that can follow the frame header.
//! All integers are big-endian; layouts are part of the wire contract.

use smpc::{Algorithm, SlotId, SmpcData};

use crate::{
	error::P2pError,
	frame::{Frame, MessageType},
};

/// Escrow addresses are carried in a fixed, null-padded field.
pub const ESCROW_ADDRESS_FIELD_LEN: usize = 35;
pub const SESSION_ID_LEN: usize = 32;

/// A frame payload in decoded form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
	/// Introduce a registered input user to the other mixing peers.
	Helo {
		session_id: [u8; SESSION_ID_LEN],
		escrow_address: String,
		encrypted_output: Vec<u8>,
	},
	/// Acknowledgement; an empty error means success.
	Ackn { error: Option<String> },
	/// One layer of shuffled output addresses.
	Addr { outputs: Vec<Vec<u8>> },
	/// Any of the five SMPC message kinds (MPCS, MPCP, COMP, CMPR, NCMP).
	Smpc { slot: SlotId, data: SmpcData },
	/// Consistent broadcast wrapper.
	Cbrc(CbrcPayload),
	/// Reliable broadcast wrapper.
	Rbrc(RbrcPayload),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CbrcPayload {
	/// The encapsulated, fully signed frame being broadcast.
	Send { inner: Vec<u8> },
	/// Countersignature over the encapsulated frame, returned to the sender.
	Echo { signature: Vec<u8> },
	/// The sender's collected countersignatures; verifying them delivers.
	Final { signatures: Vec<(u16, Vec<u8>)> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RbrcPayload {
	Send { inner: Vec<u8> },
	Echo { inner: Vec<u8> },
	Ready { inner: Vec<u8> },
}

const CBRC_SEND: u8 = 0x00;
const CBRC_ECHO: u8 = 0x01;
const CBRC_FINL: u8 = 0x02;

const RBRC_SEND: u8 = 0x00;
const RBRC_ECHO: u8 = 0x01;
const RBRC_READY: u8 = 0x02;

impl Payload {
	pub fn message_type(&self) -> MessageType {
		match self {
			Payload::Helo { .. } => MessageType::Helo,
			Payload::Ackn { .. } => MessageType::Ackn,
			Payload::Addr { .. } => MessageType::Addr,
			Payload::Smpc { data, .. } => match data {
				SmpcData::SecretShare(_) => MessageType::Mpcs,
				SmpcData::PublicValue(_) => MessageType::Mpcp,
				SmpcData::Complaint { .. } => MessageType::Comp,
				SmpcData::ComplaintReaction { .. } => MessageType::Cmpr,
				SmpcData::NoComplaint => MessageType::Ncmp,
			},
			Payload::Cbrc(_) => MessageType::Cbrc,
			Payload::Rbrc(_) => MessageType::Rbrc,
		}
	}

	pub fn encode(&self) -> Vec<u8> {
		let mut out = Vec::new();
		match self {
			Payload::Helo { session_id, escrow_address, encrypted_output } => {
				out.extend_from_slice(session_id);
				let mut address = [0u8; ESCROW_ADDRESS_FIELD_LEN];
				let bytes = escrow_address.as_bytes();
				address[..bytes.len()].copy_from_slice(bytes);
				out.extend_from_slice(&address);
				out.extend_from_slice(&(encrypted_output.len() as u32).to_be_bytes());
				out.extend_from_slice(encrypted_output);
			},
			Payload::Ackn { error } => {
				let error = error.as_deref().unwrap_or("");
				out.push(error.len() as u8);
				out.extend_from_slice(error.as_bytes());
			},
			Payload::Addr { outputs } => {
				out.extend_from_slice(&(outputs.len() as u16).to_be_bytes());
				for output in outputs {
					out.extend_from_slice(&(output.len() as u32).to_be_bytes());
					out.extend_from_slice(output);
				}
			},
			Payload::Smpc { slot, data } => {
				out.push(slot.algorithm.to_wire());
				out.extend_from_slice(&slot.index.to_be_bytes());
				out.push(slot.id.len() as u8);
				out.extend_from_slice(&slot.id);
				match data {
					SmpcData::SecretShare(share) => {
						out.extend_from_slice(&(share.len() as u16).to_be_bytes());
						out.extend_from_slice(share);
					},
					SmpcData::PublicValue(value) => {
						out.extend_from_slice(&(value.len() as u16).to_be_bytes());
						out.extend_from_slice(value);
					},
					SmpcData::Complaint { accused } => {
						out.extend_from_slice(&accused.to_be_bytes());
					},
					SmpcData::ComplaintReaction { accuser, share } => {
						out.extend_from_slice(&accuser.to_be_bytes());
						out.extend_from_slice(&(share.len() as u16).to_be_bytes());
						out.extend_from_slice(share);
					},
					SmpcData::NoComplaint => {},
				}
			},
			Payload::Cbrc(cbrc) => match cbrc {
				CbrcPayload::Send { inner } => {
					out.push(CBRC_SEND);
					out.extend_from_slice(&(inner.len() as u32).to_be_bytes());
					out.extend_from_slice(inner);
				},
				CbrcPayload::Echo { signature } => {
					out.push(CBRC_ECHO);
					out.push(signature.len() as u8);
					out.extend_from_slice(signature);
				},
				CbrcPayload::Final { signatures } => {
					out.push(CBRC_FINL);
					out.extend_from_slice(&(signatures.len() as u16).to_be_bytes());
					for (rank, signature) in signatures {
						out.extend_from_slice(&rank.to_be_bytes());
						out.push(signature.len() as u8);
						out.extend_from_slice(signature);
					}
				},
			},
			Payload::Rbrc(rbrc) => {
				let (subtype, inner) = match rbrc {
					RbrcPayload::Send { inner } => (RBRC_SEND, inner),
					RbrcPayload::Echo { inner } => (RBRC_ECHO, inner),
					RbrcPayload::Ready { inner } => (RBRC_READY, inner),
				};
				out.push(subtype);
				out.extend_from_slice(&(inner.len() as u32).to_be_bytes());
				out.extend_from_slice(inner);
			},
		}
		out
	}

	pub fn decode(frame: &Frame) -> Result<Payload, P2pError> {
		let mut reader = Reader::new(&frame.payload);
		let payload = match frame.message_type {
			MessageType::Helo => {
				let session_id: [u8; SESSION_ID_LEN] = reader
					.take(SESSION_ID_LEN)?
					.try_into()
					.expect("reader returned requested length");
				let address_field = reader.take(ESCROW_ADDRESS_FIELD_LEN)?;
				let address_len = address_field
					.iter()
					.position(|b| *b == 0)
					.unwrap_or(ESCROW_ADDRESS_FIELD_LEN);
				let escrow_address = String::from_utf8(address_field[..address_len].to_vec())
					.map_err(|_| P2pError::MalformedPayload("helo"))?;
				let output_len = reader.u32()? as usize;
				let encrypted_output = reader.take(output_len)?.to_vec();
				Payload::Helo { session_id, escrow_address, encrypted_output }
			},
			MessageType::Ackn => {
				let error_len = reader.u8()? as usize;
				let error = if error_len == 0 {
					None
				} else {
					Some(
						String::from_utf8(reader.take(error_len)?.to_vec())
							.map_err(|_| P2pError::MalformedPayload("ackn"))?,
					)
				};
				Payload::Ackn { error }
			},
			MessageType::Addr => {
				let count = reader.u16()? as usize;
				let outputs = (0..count)
					.map(|_| {
						let len = reader.u32()? as usize;
						Ok(reader.take(len)?.to_vec())
					})
					.collect::<Result<Vec<_>, P2pError>>()?;
				Payload::Addr { outputs }
			},
			MessageType::Mpcs |
			MessageType::Mpcp |
			MessageType::Comp |
			MessageType::Cmpr |
			MessageType::Ncmp => {
				let algorithm = Algorithm::from_wire(reader.u8()?)
					.map_err(|_| P2pError::MalformedPayload("smpc"))?;
				let index = reader.u32()?;
				let id_len = reader.u8()? as usize;
				let id = reader.take(id_len)?.to_vec();
				let slot = SlotId { algorithm, id, index };

				let data = match frame.message_type {
					MessageType::Mpcs => {
						let len = reader.u16()? as usize;
						SmpcData::SecretShare(reader.take(len)?.to_vec())
					},
					MessageType::Mpcp => {
						let len = reader.u16()? as usize;
						SmpcData::PublicValue(reader.take(len)?.to_vec())
					},
					MessageType::Comp => SmpcData::Complaint { accused: reader.u16()? },
					MessageType::Cmpr => {
						let accuser = reader.u16()?;
						let len = reader.u16()? as usize;
						SmpcData::ComplaintReaction {
							accuser,
							share: reader.take(len)?.to_vec(),
						}
					},
					MessageType::Ncmp => SmpcData::NoComplaint,
					_ => unreachable!("outer match covers the smpc types"),
				};
				Payload::Smpc { slot, data }
			},
			MessageType::Cbrc => {
				let subtype = reader.u8()?;
				Payload::Cbrc(match subtype {
					CBRC_SEND => {
						let len = reader.u32()? as usize;
						CbrcPayload::Send { inner: reader.take(len)?.to_vec() }
					},
					CBRC_ECHO => {
						let len = reader.u8()? as usize;
						CbrcPayload::Echo { signature: reader.take(len)?.to_vec() }
					},
					CBRC_FINL => {
						let count = reader.u16()? as usize;
						let signatures = (0..count)
							.map(|_| {
								let rank = reader.u16()?;
								let len = reader.u8()? as usize;
								Ok((rank, reader.take(len)?.to_vec()))
							})
							.collect::<Result<Vec<_>, P2pError>>()?;
						CbrcPayload::Final { signatures }
					},
					_ => return Err(P2pError::MalformedPayload("cbrc")),
				})
			},
			MessageType::Rbrc => {
				let subtype = reader.u8()?;
				let len = reader.u32()? as usize;
				let inner = reader.take(len)?.to_vec();
				Payload::Rbrc(match subtype {
					RBRC_SEND => RbrcPayload::Send { inner },
					RBRC_ECHO => RbrcPayload::Echo { inner },
					RBRC_READY => RbrcPayload::Ready { inner },
					_ => return Err(P2pError::MalformedPayload("rbrc")),
				})
			},
		};
		Ok(payload)
	}
}

struct Reader<'a> {
	bytes: &'a [u8],
	offset: usize,
}

impl<'a> Reader<'a> {
	fn new(bytes: &'a [u8]) -> Self {
		Reader { bytes, offset: 0 }
	}

	fn take(&mut self, len: usize) -> Result<&'a [u8], P2pError> {
		let end = self
			.offset
			.checked_add(len)
			.filter(|end| *end <= self.bytes.len())
			.ok_or(P2pError::TruncatedFrame)?;
		let slice = &self.bytes[self.offset..end];
		self.offset = end;
		Ok(slice)
	}

	fn u8(&mut self) -> Result<u8, P2pError> {
		Ok(self.take(1)?[0])
	}

	fn u16(&mut self) -> Result<u16, P2pError> {
		Ok(u16::from_be_bytes(self.take(2)?.try_into().expect("2 bytes")))
	}

	fn u32(&mut self) -> Result<u32, P2pError> {
		Ok(u32::from_be_bytes(self.take(4)?.try_into().expect("4 bytes")))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::frame::{decode_frame, encode_frame};
	use secp256k1::{rand::thread_rng, SECP256K1};

	fn round_trip(payload: Payload) {
		let (sk, _) = SECP256K1.generate_keypair(&mut thread_rng());
		let bytes = encode_frame(payload.message_type(), 1, 42, &payload.encode(), &sk);
		let frame = decode_frame(&bytes).unwrap();
		assert_eq!(Payload::decode(&frame).unwrap(), payload);
	}

	fn slot() -> SlotId {
		SlotId::new(Algorithm::Dkg, b"d", 3)
	}

	#[test]
	fn helo_round_trip() {
		round_trip(Payload::Helo {
			session_id: [7u8; SESSION_ID_LEN],
			escrow_address: "mrCDrCybB6J1vRfbwM5hemdJz73FwDBC8r".into(),
			encrypted_output: vec![1, 2, 3, 4, 5],
		});
	}

	#[test]
	fn ackn_round_trip() {
		round_trip(Payload::Ackn { error: None });
		round_trip(Payload::Ackn { error: Some("escrow_not_found".into()) });
	}

	#[test]
	fn addr_round_trip() {
		round_trip(Payload::Addr {
			outputs: vec![b"address-one".to_vec(), b"address-two".to_vec(), vec![]],
		});
	}

	#[test]
	fn smpc_round_trips() {
		round_trip(Payload::Smpc {
			slot: slot(),
			data: SmpcData::SecretShare(vec![0xAB; 64]),
		});
		round_trip(Payload::Smpc {
			slot: slot(),
			data: SmpcData::PublicValue(vec![0xCD; 131]),
		});
		round_trip(Payload::Smpc { slot: slot(), data: SmpcData::Complaint { accused: 2 } });
		round_trip(Payload::Smpc {
			slot: slot(),
			data: SmpcData::ComplaintReaction { accuser: 1, share: vec![9; 32] },
		});
		round_trip(Payload::Smpc { slot: slot(), data: SmpcData::NoComplaint });
	}

	#[test]
	fn broadcast_wrappers_round_trip() {
		round_trip(Payload::Cbrc(CbrcPayload::Send { inner: vec![0x55; 100] }));
		round_trip(Payload::Cbrc(CbrcPayload::Echo { signature: vec![0x66; 70] }));
		round_trip(Payload::Cbrc(CbrcPayload::Final {
			signatures: vec![(0, vec![1; 70]), (2, vec![2; 71])],
		}));
		round_trip(Payload::Rbrc(RbrcPayload::Send { inner: vec![0x11; 90] }));
		round_trip(Payload::Rbrc(RbrcPayload::Echo { inner: vec![0x22; 90] }));
		round_trip(Payload::Rbrc(RbrcPayload::Ready { inner: vec![0x33; 90] }));
	}

	#[test]
	fn truncated_payload_is_rejected() {
		let (sk, _) = SECP256K1.generate_keypair(&mut thread_rng());
		let payload = Payload::Addr { outputs: vec![b"abc".to_vec()] };
		let mut bytes = encode_frame(MessageType::Addr, 1, 1, &payload.encode(), &sk);
		// Chop the last byte and fix up the length field
		bytes.pop();
		let new_len = (bytes.len() as u32).to_be_bytes();
		bytes[8..12].copy_from_slice(&new_len);
		let frame = decode_frame(&bytes).unwrap();
		assert!(Payload::decode(&frame).is_err());
	}
}
