//! Peer-to-peer transport of the CoinParty mixing peer: length-prefixed
//! signed frames, the sequence-numbered transaction registry, and the two
//! Byzantine broadcast primitives (consistent and reliable) that carry VSS
//! traffic with integrity under t faulty peers.

pub mod broadcast;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod messages;
pub mod transactions;

pub use broadcast::PeerCrypt;
pub use endpoint::PeerEndpoint;
pub use error::P2pError;
pub use frame::{FrameDecoder, MessageType, HEADER_LEN, MAX_FRAME_LEN};
pub use messages::{Payload, ESCROW_ADDRESS_FIELD_LEN, SESSION_ID_LEN};
pub use transactions::{DeliverFn, LocalPeer, Outbound, TransactionStore, TxOutcome};
