//! The sequence-numbered registry of in-flight requests. Every message a
//! peer sends that expects further traffic (acknowledgements, broadcast
//! echoes) registers a transaction here; incoming frames are dispatched by
//! their sequence number. Delivered broadcasts leave a drain handle behind
//! that swallows late stragglers without resurrecting state.

use std::{
	collections::{BTreeSet, HashMap},
	sync::{Arc, Mutex},
};

use rand::Rng;
use smpc::promise::{promise, Promise, PromiseResolver};
use tracing::{debug, warn};

use crate::{
	broadcast::{CbStep, ConsistentBroadcast, PeerCrypt, RbStep, ReliableBroadcast},
	error::P2pError,
	frame::{decode_frame, encode_frame, verify_frame, Frame, MessageType},
	messages::{CbrcPayload, Payload, RbrcPayload},
};

pub type TxOutcome = Result<(), P2pError>;

/// Logical delivery callback: a fully verified message reaches the engine.
/// A returned error string is reported back to the sender in the ACKN.
pub type DeliverFn = Arc<dyn Fn(u16, Payload) -> Result<(), String> + Send + Sync>;

/// Outbound access to the connected peers.
pub trait Outbound: Send + Sync {
	fn send_to(&self, rank: u16, frame: Vec<u8>);
	/// Connected peer ranks, excluding ourselves.
	fn connected_ranks(&self) -> Vec<u16>;
}

pub struct LocalPeer {
	pub rank: u16,
	pub n: u16,
	pub t: u16,
	pub crypt: Arc<PeerCrypt>,
}

enum Entry {
	Await(AwaitAcks),
	Consistent(Box<ConsistentBroadcast>, PromiseResolver<TxOutcome>),
	Reliable(Box<ReliableBroadcast>, PromiseResolver<TxOutcome>),
	/// Sender-side zombie of a delivered consistent broadcast.
	DrainEchoes(BTreeSet<u16>),
	/// Zombie of a delivered reliable broadcast.
	DrainBracha { send_pending: bool, echoes: BTreeSet<u16>, readies: BTreeSet<u16> },
}

struct AwaitAcks {
	expected: BTreeSet<u16>,
	/// For singlecasts: the only rank allowed to answer.
	exclusive: Option<u16>,
	outcome: PromiseResolver<TxOutcome>,
}

enum Effect {
	Send(u16, Vec<u8>),
	SendAll(Vec<u8>),
	Deliver(Vec<u8>),
}

pub struct TransactionStore {
	local: LocalPeer,
	outbound: Arc<dyn Outbound>,
	deliver: DeliverFn,
	inner: Mutex<Inner>,
}

struct Inner {
	seq: u32,
	transactions: HashMap<u32, Entry>,
}

impl TransactionStore {
	pub fn new(local: LocalPeer, outbound: Arc<dyn Outbound>, deliver: DeliverFn) -> Arc<Self> {
		let seq = rand::thread_rng().gen();
		Arc::new(TransactionStore {
			local,
			outbound,
			deliver,
			inner: Mutex::new(Inner { seq, transactions: HashMap::new() }),
		})
	}

	/// Strictly monotonic (wrapping) sequence numbers.
	pub fn next_seq(&self) -> u32 {
		let mut inner = self.inner.lock().expect("store lock cannot be poisoned");
		inner.seq = if inner.seq < u32::MAX { inner.seq + 1 } else { 0 };
		inner.seq
	}

	/// Request/response with a single peer.
	pub fn singlecast(
		&self,
		to: u16,
		message_type: MessageType,
		payload: &[u8],
	) -> Promise<TxOutcome> {
		let seq = self.next_seq();
		let frame = encode_frame(
			message_type,
			self.local.rank,
			seq,
			payload,
			&self.local.crypt.secret,
		);
		let (resolver, outcome) = promise();
		self.register(
			seq,
			Entry::Await(AwaitAcks {
				expected: BTreeSet::from([to]),
				exclusive: Some(to),
				outcome: resolver,
			}),
		);
		self.outbound.send_to(to, frame);
		outcome
	}

	/// The same frame to every connected peer; completes when each of them
	/// has acknowledged exactly once.
	pub fn broadcast(&self, message_type: MessageType, payload: &[u8]) -> Promise<TxOutcome> {
		let seq = self.next_seq();
		let frame = encode_frame(
			message_type,
			self.local.rank,
			seq,
			payload,
			&self.local.crypt.secret,
		);
		let peers: BTreeSet<u16> = self.outbound.connected_ranks().into_iter().collect();
		let (resolver, outcome) = promise();
		if peers.is_empty() {
			resolver.resolve(Ok(()));
			return outcome
		}
		self.register(
			seq,
			Entry::Await(AwaitAcks { expected: peers.clone(), exclusive: None, outcome: resolver }),
		);
		for rank in peers {
			self.outbound.send_to(rank, frame.clone());
		}
		outcome
	}

	/// A distinct private message per peer, all under one sequence number.
	pub fn eachcast(&self, messages: Vec<(u16, MessageType, Vec<u8>)>) -> Promise<TxOutcome> {
		let seq = self.next_seq();
		let peers: BTreeSet<u16> = messages.iter().map(|(rank, _, _)| *rank).collect();
		assert_eq!(peers.len(), messages.len(), "one message per peer");

		let (resolver, outcome) = promise();
		if peers.is_empty() {
			resolver.resolve(Ok(()));
			return outcome
		}
		self.register(
			seq,
			Entry::Await(AwaitAcks { expected: peers, exclusive: None, outcome: resolver }),
		);
		for (rank, message_type, payload) in messages {
			let frame = encode_frame(
				message_type,
				self.local.rank,
				seq,
				&payload,
				&self.local.crypt.secret,
			);
			self.outbound.send_to(rank, frame);
		}
		outcome
	}

	/// Consistent broadcast of a message built from `inner_type` and
	/// `inner_payload`; resolves when the broadcast delivers locally.
	pub fn consistent_broadcast(
		&self,
		inner_type: MessageType,
		inner_payload: &[u8],
	) -> Promise<TxOutcome> {
		let seq = self.next_seq();
		let inner_frame = encode_frame(
			inner_type,
			self.local.rank,
			seq,
			inner_payload,
			&self.local.crypt.secret,
		);
		let (machine, steps) = ConsistentBroadcast::new_sender(
			self.local.n,
			self.local.t,
			self.local.rank,
			self.local.crypt.clone(),
			inner_frame,
		);
		let (resolver, outcome) = promise();
		self.register(seq, Entry::Consistent(Box::new(machine), resolver));
		self.perform(self.cb_effects(seq, steps));
		outcome
	}

	/// Reliable (Bracha) broadcast of a message built from `inner_type`
	/// and `inner_payload`.
	pub fn reliable_broadcast(
		&self,
		inner_type: MessageType,
		inner_payload: &[u8],
	) -> Promise<TxOutcome> {
		let seq = self.next_seq();
		let inner_frame = encode_frame(
			inner_type,
			self.local.rank,
			seq,
			inner_payload,
			&self.local.crypt.secret,
		);
		let (machine, steps) = ReliableBroadcast::new_sender(
			self.local.n,
			self.local.t,
			self.local.rank,
			inner_frame,
		);
		let (resolver, outcome) = promise();
		self.register(seq, Entry::Reliable(Box::new(machine), resolver));
		self.perform(self.rb_effects(seq, steps));
		outcome
	}

	/// Handle one verified-length frame from the wire. Returns the ACKN
	/// frame to send back, when the message calls for one.
	pub fn handle_frame(&self, raw: &[u8]) -> Result<Option<Vec<u8>>, P2pError> {
		let frame = decode_frame(raw)?;
		if frame.sender_rank >= self.local.n || frame.sender_rank == self.local.rank {
			return Err(P2pError::UnknownRank(frame.sender_rank))
		}
		if !self.local.crypt.verify_frame_for(frame.sender_rank, raw) {
			return Err(P2pError::BadSignature(frame.sender_rank))
		}

		match frame.message_type {
			MessageType::Ackn => {
				self.on_ackn(&frame)?;
				Ok(None)
			},
			MessageType::Cbrc => {
				self.on_cbrc(&frame)?;
				Ok(None)
			},
			MessageType::Rbrc => {
				self.on_rbrc(&frame)?;
				Ok(None)
			},
			_ => {
				// A plain request; deliver and acknowledge
				let payload = Payload::decode(&frame)?;
				let error = match (self.deliver)(frame.sender_rank, payload) {
					Ok(()) => None,
					Err(error) => Some(error),
				};
				let reply = encode_frame(
					MessageType::Ackn,
					self.local.rank,
					frame.seq,
					&Payload::Ackn { error }.encode(),
					&self.local.crypt.secret,
				);
				Ok(Some(reply))
			},
		}
	}

	/// Abort all open transactions; used on session shutdown.
	pub fn shutdown(&self) {
		let mut inner = self.inner.lock().expect("store lock cannot be poisoned");
		for (_, entry) in inner.transactions.drain() {
			match entry {
				Entry::Await(AwaitAcks { outcome, .. }) |
				Entry::Consistent(_, outcome) |
				Entry::Reliable(_, outcome) => outcome.resolve(Err(P2pError::Cancelled)),
				Entry::DrainEchoes(_) | Entry::DrainBracha { .. } => {},
			}
		}
	}

	pub fn open_transactions(&self) -> usize {
		self.inner
			.lock()
			.expect("store lock cannot be poisoned")
			.transactions
			.len()
	}

	fn register(&self, seq: u32, entry: Entry) {
		let mut inner = self.inner.lock().expect("store lock cannot be poisoned");
		inner.transactions.insert(seq, entry);
	}

	fn on_ackn(&self, frame: &Frame) -> Result<(), P2pError> {
		let Payload::Ackn { error } = Payload::decode(frame)? else {
			return Err(P2pError::MalformedPayload("ackn"))
		};

		let mut inner = self.inner.lock().expect("store lock cannot be poisoned");
		let Some(Entry::Await(acks)) = inner.transactions.get_mut(&frame.seq) else {
			debug!(seq = frame.seq, "acknowledgement for unknown transaction");
			return Ok(())
		};

		let rank = frame.sender_rank;
		let outcome = if let Some(expected) = acks.exclusive.filter(|expected| *expected != rank)
		{
			Some(Err(P2pError::UnexpectedResponder { got: rank, expected }))
		} else if !acks.expected.remove(&rank) {
			Some(Err(P2pError::DuplicateResponse(rank)))
		} else if let Some(error) = error {
			Some(Err(P2pError::PeerNak(rank, error)))
		} else if acks.expected.is_empty() {
			Some(Ok(()))
		} else {
			None
		};

		if let Some(outcome) = outcome {
			acks.outcome.resolve(outcome);
			inner.transactions.remove(&frame.seq);
		}
		Ok(())
	}

	fn on_cbrc(&self, frame: &Frame) -> Result<(), P2pError> {
		let Payload::Cbrc(payload) = Payload::decode(frame)? else {
			return Err(P2pError::MalformedPayload("cbrc"))
		};
		let from = frame.sender_rank;
		let mut effects = Vec::new();

		{
			let mut inner = self.inner.lock().expect("store lock cannot be poisoned");

			// An unknown SEND synthesizes a passive receiver handle; any
			// other unknown frame is a stray and gets dropped
			if !inner.transactions.contains_key(&frame.seq) {
				if matches!(payload, CbrcPayload::Send { .. }) {
					let machine = ConsistentBroadcast::new_receiver(
						self.local.n,
						self.local.t,
						self.local.rank,
						self.local.crypt.clone(),
					);
					let (resolver, _) = promise();
					inner
						.transactions
						.insert(frame.seq, Entry::Consistent(Box::new(machine), resolver));
				} else {
					debug!(seq = frame.seq, "stray consistent-broadcast frame dropped");
					return Ok(())
				}
			}

			if let Some(Entry::DrainEchoes(remaining)) =
				inner.transactions.get_mut(&frame.seq)
			{
				if let CbrcPayload::Echo { .. } = payload {
					remaining.remove(&from);
					if remaining.is_empty() {
						inner.transactions.remove(&frame.seq);
					}
				}
				return Ok(())
			}

			// `None` while the machine is live; `Some(drain)` once it
			// delivered, with the ranks whose echoes are still expected
			let mut delivered: Option<Option<BTreeSet<u16>>> = None;

			if let Some(Entry::Consistent(machine, _)) =
				inner.transactions.get_mut(&frame.seq)
			{
				let steps = match payload {
					CbrcPayload::Send { inner } => machine.on_send(from, inner),
					CbrcPayload::Echo { signature } => machine.on_echo(from, signature),
					CbrcPayload::Final { signatures } => machine.on_final(from, signatures),
				};
				effects = self.cb_effects(frame.seq, steps);
				if machine.is_delivered() {
					// Only the sender awaits echoes; receivers have no
					// stragglers to absorb
					let drain = machine
						.is_sender()
						.then(|| {
							let mut remaining = machine.outstanding_echoes();
							remaining.remove(&self.local.rank);
							remaining
						})
						.filter(|remaining| !remaining.is_empty());
					delivered = Some(drain);
				}
			} else {
				warn!(seq = frame.seq, "consistent-broadcast frame for foreign transaction");
				return Ok(())
			}

			if let Some(drain) = delivered {
				if let Some(Entry::Consistent(_, outcome)) =
					inner.transactions.remove(&frame.seq)
				{
					outcome.resolve(Ok(()));
				}
				if let Some(remaining) = drain {
					inner.transactions.insert(frame.seq, Entry::DrainEchoes(remaining));
				}
			}
		}

		self.perform(effects);
		Ok(())
	}

	fn on_rbrc(&self, frame: &Frame) -> Result<(), P2pError> {
		let Payload::Rbrc(payload) = Payload::decode(frame)? else {
			return Err(P2pError::MalformedPayload("rbrc"))
		};
		let from = frame.sender_rank;
		let mut effects = Vec::new();

		{
			let mut inner = self.inner.lock().expect("store lock cannot be poisoned");

			// Bracha state can be created by any of its message kinds;
			// echoes and readies may precede the SEND
			if !inner.transactions.contains_key(&frame.seq) {
				let machine = ReliableBroadcast::new_receiver(
					self.local.n,
					self.local.t,
					self.local.rank,
				);
				let (resolver, _) = promise();
				inner
					.transactions
					.insert(frame.seq, Entry::Reliable(Box::new(machine), resolver));
			}

			if let Some(Entry::DrainBracha { send_pending, echoes, readies }) =
				inner.transactions.get_mut(&frame.seq)
			{
				match payload {
					RbrcPayload::Send { .. } => *send_pending = false,
					RbrcPayload::Echo { .. } => {
						echoes.remove(&from);
					},
					RbrcPayload::Ready { .. } => {
						readies.remove(&from);
					},
				}
				if !*send_pending && echoes.is_empty() && readies.is_empty() {
					inner.transactions.remove(&frame.seq);
				}
				return Ok(())
			}

			let mut delivered: Option<(bool, BTreeSet<u16>, BTreeSet<u16>)> = None;

			if let Some(Entry::Reliable(machine, _)) = inner.transactions.get_mut(&frame.seq)
			{
				let steps = match payload {
					RbrcPayload::Send { inner } => machine.on_send(inner),
					RbrcPayload::Echo { inner } => machine.on_echo(from, inner),
					RbrcPayload::Ready { inner } => machine.on_ready(from, inner),
				};
				effects = self.rb_effects(frame.seq, steps);
				if machine.is_delivered() {
					let (mut echoes, mut readies) = machine.outstanding();
					echoes.remove(&self.local.rank);
					readies.remove(&self.local.rank);
					delivered = Some((!machine.send_received(), echoes, readies));
				}
			} else {
				warn!(seq = frame.seq, "reliable-broadcast frame for foreign transaction");
				return Ok(())
			}

			if let Some((send_pending, echoes, readies)) = delivered {
				if let Some(Entry::Reliable(_, outcome)) =
					inner.transactions.remove(&frame.seq)
				{
					outcome.resolve(Ok(()));
				}
				if send_pending || !echoes.is_empty() || !readies.is_empty() {
					inner.transactions.insert(
						frame.seq,
						Entry::DrainBracha { send_pending, echoes, readies },
					);
				}
			}
		}

		self.perform(effects);
		Ok(())
	}

	fn cb_effects(&self, seq: u32, steps: Vec<CbStep>) -> Vec<Effect> {
		steps
			.into_iter()
			.map(|step| match step {
				CbStep::SendTo(rank, payload) => Effect::Send(
					rank,
					encode_frame(
						MessageType::Cbrc,
						self.local.rank,
						seq,
						&Payload::Cbrc(payload).encode(),
						&self.local.crypt.secret,
					),
				),
				CbStep::Broadcast(payload) => Effect::SendAll(encode_frame(
					MessageType::Cbrc,
					self.local.rank,
					seq,
					&Payload::Cbrc(payload).encode(),
					&self.local.crypt.secret,
				)),
				CbStep::Deliver { inner, .. } => Effect::Deliver(inner),
			})
			.collect()
	}

	fn rb_effects(&self, seq: u32, steps: Vec<RbStep>) -> Vec<Effect> {
		steps
			.into_iter()
			.map(|step| match step {
				RbStep::Broadcast(payload) => Effect::SendAll(encode_frame(
					MessageType::Rbrc,
					self.local.rank,
					seq,
					&Payload::Rbrc(payload).encode(),
					&self.local.crypt.secret,
				)),
				RbStep::Deliver { inner } => Effect::Deliver(inner),
			})
			.collect()
	}

	fn perform(&self, effects: Vec<Effect>) {
		for effect in effects {
			match effect {
				Effect::Send(rank, frame) => self.outbound.send_to(rank, frame),
				Effect::SendAll(frame) => {
					for rank in self.outbound.connected_ranks() {
						self.outbound.send_to(rank, frame.clone());
					}
				},
				Effect::Deliver(inner) => self.deliver_inner(&inner),
			}
		}
	}

	/// A broadcast primitive delivered an encapsulated frame; verify its
	/// own signature and hand it to the logical handler.
	fn deliver_inner(&self, raw: &[u8]) {
		let frame = match decode_frame(raw) {
			Ok(frame) => frame,
			Err(error) => {
				warn!(%error, "undecodable encapsulated message");
				return
			},
		};
		if frame.sender_rank >= self.local.n {
			warn!(rank = frame.sender_rank, "encapsulated message from unknown rank");
			return
		}
		if !self.local.crypt.verify_frame_for(frame.sender_rank, raw) {
			warn!(rank = frame.sender_rank, "encapsulated message signature invalid");
			return
		}
		match frame.message_type {
			MessageType::Cbrc | MessageType::Rbrc => {
				warn!("nested broadcast wrappers are not allowed");
			},
			_ => match Payload::decode(&frame) {
				Ok(payload) => {
					if let Err(error) = (self.deliver)(frame.sender_rank, payload) {
						debug!(%error, "delivered message rejected by handler");
					}
				},
				Err(error) => warn!(%error, "undecodable encapsulated payload"),
			},
		}
	}
}

impl PeerCrypt {
	/// Frame-level signature check for a claimed rank.
	pub fn verify_frame_for(&self, rank: u16, raw: &[u8]) -> bool {
		match self.publics.get(rank as usize) {
			Some(key) => verify_frame(raw, key),
			None => false,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use secp256k1::{rand::thread_rng, PublicKey, SECP256K1};
	use smpc::{Algorithm, SlotId, SmpcData};
	use std::{
		collections::VecDeque,
		sync::Mutex as StdMutex,
	};

	/// Frames in flight: (from, to, bytes). Pumped manually so tests fully
	/// control the interleaving.
	struct Mesh {
		queue: StdMutex<VecDeque<(u16, u16, Vec<u8>)>>,
		/// Returns false to drop a frame (e.g. to silence a peer).
		filter: Box<dyn Fn(u16, u16, &[u8]) -> bool + Send + Sync>,
	}

	struct MeshPort {
		mesh: Arc<Mesh>,
		rank: u16,
		n: u16,
	}

	impl Outbound for MeshPort {
		fn send_to(&self, rank: u16, frame: Vec<u8>) {
			if (self.mesh.filter)(self.rank, rank, &frame) {
				self.mesh
					.queue
					.lock()
					.unwrap()
					.push_back((self.rank, rank, frame));
			}
		}

		fn connected_ranks(&self) -> Vec<u16> {
			(0..self.n).filter(|rank| *rank != self.rank).collect()
		}
	}

	struct Cluster {
		stores: Vec<Arc<TransactionStore>>,
		mesh: Arc<Mesh>,
		delivered: Arc<StdMutex<Vec<(u16, u16, Payload)>>>,
	}

	fn make_cluster(
		n: u16,
		t: u16,
		filter: Box<dyn Fn(u16, u16, &[u8]) -> bool + Send + Sync>,
	) -> Cluster {
		let keypairs: Vec<_> =
			(0..n).map(|_| SECP256K1.generate_keypair(&mut thread_rng())).collect();
		let publics: Vec<PublicKey> = keypairs.iter().map(|(_, pk)| *pk).collect();
		let mesh = Arc::new(Mesh { queue: StdMutex::new(VecDeque::new()), filter });
		let delivered = Arc::new(StdMutex::new(Vec::new()));

		let stores = keypairs
			.into_iter()
			.enumerate()
			.map(|(rank, (secret, _))| {
				let rank = rank as u16;
				let crypt = Arc::new(PeerCrypt { secret, publics: publics.clone() });
				let delivered = delivered.clone();
				let deliver: DeliverFn = Arc::new(move |from, payload| {
					delivered.lock().unwrap().push((rank, from, payload));
					Ok(())
				});
				TransactionStore::new(
					LocalPeer { rank, n, t, crypt },
					Arc::new(MeshPort { mesh: mesh.clone(), rank, n }),
					deliver,
				)
			})
			.collect();

		Cluster { stores, mesh, delivered }
	}

	impl Cluster {
		/// Deliver queued frames until the mesh is quiet. ACKN replies are
		/// fed back into the mesh.
		fn pump(&self) {
			loop {
				let next = self.mesh.queue.lock().unwrap().pop_front();
				let Some((from, to, frame)) = next else { break };
				match self.stores[to as usize].handle_frame(&frame) {
					Ok(Some(reply)) => {
						if (self.mesh.filter)(to, from, &reply) {
							self.mesh
								.queue
								.lock()
								.unwrap()
								.push_back((to, from, reply));
						}
					},
					Ok(None) => {},
					Err(error) => panic!("frame from {from} to {to} rejected: {error}"),
				}
			}
		}
	}

	fn pass_all(_: u16, _: u16, _: &[u8]) -> bool {
		true
	}

	fn smpc_payload() -> Payload {
		Payload::Smpc {
			slot: SlotId::new(Algorithm::Jfdkg, b"H", 0),
			data: SmpcData::PublicValue(vec![0xEE; 66]),
		}
	}

	#[test]
	fn broadcast_completes_after_all_acks() {
		let cluster = make_cluster(3, 1, Box::new(pass_all));
		let outcome = cluster.stores[0]
			.broadcast(MessageType::Ncmp, &smpc_payload().encode());
		assert!(outcome.try_get().is_none());

		cluster.pump();
		assert_eq!(outcome.try_get(), Some(Ok(())));
		assert_eq!(cluster.stores[0].open_transactions(), 0);

		// Both peers saw the request
		let delivered = cluster.delivered.lock().unwrap();
		assert_eq!(delivered.iter().filter(|(_, from, _)| *from == 0).count(), 2);
	}

	#[test]
	fn singlecast_rejects_foreign_responder() {
		let cluster = make_cluster(3, 1, Box::new(pass_all));
		let outcome =
			cluster.stores[0].singlecast(1, MessageType::Ncmp, &smpc_payload().encode());

		// Hand peer 1's request frame to peer 2 instead, whose ACKN then
		// comes from the wrong rank
		{
			let mut queue = cluster.mesh.queue.lock().unwrap();
			let (_, _, frame) = queue.pop_front().unwrap();
			queue.push_back((0, 2, frame));
		}
		cluster.pump();

		assert!(matches!(
			outcome.try_get(),
			Some(Err(P2pError::UnexpectedResponder { got: 2, expected: 1 }))
		));
	}

	#[test]
	fn consistent_broadcast_with_silent_peer() {
		// n = 4, t = 1; rank 3 never echoes. The sender still reaches the
		// threshold of 3 echoes (its own plus ranks 1 and 2) and everyone
		// delivers on FINL.
		let silent_echoes = |from: u16, _to: u16, frame: &[u8]| {
			if from != 3 {
				return true
			}
			// Drop rank 3's CBRC echoes, keep everything else
			!(frame[1] == 0xF1 && frame[85] == 0x01)
		};
		let cluster = make_cluster(4, 1, Box::new(silent_echoes));

		let outcome = cluster.stores[0]
			.consistent_broadcast(MessageType::Mpcp, &smpc_payload().encode());
		cluster.pump();

		assert_eq!(outcome.try_get(), Some(Ok(())));

		// Every peer, the silent one included, got the delivery; the
		// sender delivered its own message locally as well
		let delivered = cluster.delivered.lock().unwrap();
		let receiving_ranks: Vec<u16> =
			delivered.iter().map(|(at, _, _)| *at).collect();
		for rank in 0..4 {
			assert!(
				receiving_ranks.contains(&rank),
				"rank {rank} missed the consistent broadcast"
			);
		}
		for (_, from, payload) in delivered.iter() {
			assert_eq!(*from, 0);
			assert_eq!(payload, &smpc_payload());
		}
	}

	#[test]
	fn sender_drains_late_echo() {
		// Delay rank 3's echo until after delivery; the zombie handle
		// absorbs it and then disappears
		let held: Arc<StdMutex<Vec<(u16, u16, Vec<u8>)>>> =
			Arc::new(StdMutex::new(Vec::new()));
		let held_in_filter = held.clone();
		let filter = move |from: u16, to: u16, frame: &[u8]| {
			if from == 3 && frame[1] == 0xF1 && frame[85] == 0x01 {
				held_in_filter.lock().unwrap().push((from, to, frame.to_vec()));
				return false
			}
			true
		};
		let cluster = make_cluster(4, 1, Box::new(filter));

		let outcome = cluster.stores[0]
			.consistent_broadcast(MessageType::Mpcp, &smpc_payload().encode());
		cluster.pump();
		assert_eq!(outcome.try_get(), Some(Ok(())));

		// The sender still expects rank 3's echo
		assert_eq!(cluster.stores[0].open_transactions(), 1);

		// Release the held echo; the drain swallows it and removes itself
		for (from, to, frame) in held.lock().unwrap().drain(..) {
			cluster.mesh.queue.lock().unwrap().push_back((from, to, frame));
		}
		cluster.pump();
		assert_eq!(cluster.stores[0].open_transactions(), 0);
	}

	#[test]
	fn reliable_broadcast_delivers_everywhere() {
		let cluster = make_cluster(4, 1, Box::new(pass_all));
		let outcome = cluster.stores[0]
			.reliable_broadcast(MessageType::Mpcp, &smpc_payload().encode());
		cluster.pump();

		assert_eq!(outcome.try_get(), Some(Ok(())));
		let delivered = cluster.delivered.lock().unwrap();
		let receiving_ranks: Vec<u16> =
			delivered.iter().map(|(at, _, _)| *at).collect();
		for rank in 0..4 {
			assert!(receiving_ranks.contains(&rank));
		}
	}

	#[test]
	fn shutdown_cancels_open_transactions() {
		let cluster = make_cluster(3, 1, Box::new(|from, _, _| from != 0));
		let outcome = cluster.stores[0]
			.broadcast(MessageType::Ncmp, &smpc_payload().encode());
		cluster.pump();
		assert!(outcome.try_get().is_none());

		cluster.stores[0].shutdown();
		assert_eq!(outcome.try_get(), Some(Err(P2pError::Cancelled)));
		assert_eq!(cluster.stores[0].open_transactions(), 0);
	}

	#[test]
	fn bad_signature_is_rejected() {
		let cluster = make_cluster(3, 1, Box::new(pass_all));
		let (foreign_sk, _) = SECP256K1.generate_keypair(&mut thread_rng());
		let forged = encode_frame(
			MessageType::Ncmp,
			1,
			77,
			&smpc_payload().encode(),
			&foreign_sk,
		);
		assert!(matches!(
			cluster.stores[0].handle_frame(&forged),
			Err(P2pError::BadSignature(1))
		));
	}
}
