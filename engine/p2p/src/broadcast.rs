//! The two Byzantine broadcast primitives carrying VSS traffic: signature
//! based consistent broadcast (Cachin-Kursawe) and Bracha's reliable
//! broadcast. Both are pure state machines; stepping them returns the
//! actions the transport must perform, so the protocols stay deterministic
//! functions of the message interleaving and are testable without sockets.

use std::{collections::BTreeSet, sync::Arc};

use secp256k1::{PublicKey, SecretKey};

use crate::{
	frame::{sign_bytes, verify_bytes},
	messages::{CbrcPayload, RbrcPayload},
};

/// Identity keys of the whole mixnet plus our own signing key.
pub struct PeerCrypt {
	pub secret: SecretKey,
	/// Indexed by rank.
	pub publics: Vec<PublicKey>,
}

impl PeerCrypt {
	pub fn sign(&self, bytes: &[u8]) -> Vec<u8> {
		sign_bytes(bytes, &self.secret)
	}

	pub fn verify(&self, rank: u16, bytes: &[u8], signature: &[u8]) -> bool {
		match self.publics.get(rank as usize) {
			Some(key) => verify_bytes(bytes, signature, key),
			None => false,
		}
	}
}

/// `ceil((n + t + 1) / 2)` valid echoes prove that no other message can
/// gather a quorum for the same slot.
fn echo_threshold(n: u16, t: u16) -> usize {
	((n + t + 1) as usize + 1) / 2
}

pub enum CbStep {
	/// Send an echo back to the broadcast's sender.
	SendTo(u16, CbrcPayload),
	/// Broadcast the final signature list to everyone.
	Broadcast(CbrcPayload),
	/// The message is delivered; hand it to its logical handler.
	Deliver { origin: u16, inner: Vec<u8> },
}

/// One consistent-broadcast instance, sender or receiver side.
pub struct ConsistentBroadcast {
	crypt: Arc<PeerCrypt>,
	own_rank: u16,
	echo_threshold: usize,
	/// The encapsulated message; fixed by the first SEND (or at creation
	/// for the sender).
	message: Option<Vec<u8>>,
	sender_rank: Option<u16>,
	echoes: Vec<Option<Vec<u8>>>,
	final_sent: bool,
	delivered: bool,
}

impl ConsistentBroadcast {
	/// Sender side: returns the machine plus the initial SEND broadcast.
	pub fn new_sender(
		n: u16,
		t: u16,
		own_rank: u16,
		crypt: Arc<PeerCrypt>,
		message: Vec<u8>,
	) -> (Self, Vec<CbStep>) {
		let own_signature = crypt.sign(&message);
		let mut machine = ConsistentBroadcast {
			crypt,
			own_rank,
			echo_threshold: echo_threshold(n, t),
			message: Some(message.clone()),
			sender_rank: Some(own_rank),
			echoes: (0..n).map(|_| None).collect(),
			final_sent: false,
			delivered: false,
		};
		machine.echoes[own_rank as usize] = Some(own_signature);
		let steps = vec![CbStep::Broadcast(CbrcPayload::Send { inner: message })];
		(machine, steps)
	}

	/// Receiver side, usually synthesized when a SEND arrives for an
	/// unknown sequence number.
	pub fn new_receiver(n: u16, t: u16, own_rank: u16, crypt: Arc<PeerCrypt>) -> Self {
		ConsistentBroadcast {
			crypt,
			own_rank,
			echo_threshold: echo_threshold(n, t),
			message: None,
			sender_rank: None,
			echoes: (0..n).map(|_| None).collect(),
			final_sent: false,
			delivered: false,
		}
	}

	pub fn on_send(&mut self, from: u16, inner: Vec<u8>) -> Vec<CbStep> {
		if self.sender_rank.is_some() {
			// Duplicate SENDs cannot rebind the slot
			return Vec::new()
		}
		self.sender_rank = Some(from);
		let signature = self.crypt.sign(&inner);
		self.message = Some(inner);
		vec![CbStep::SendTo(from, CbrcPayload::Echo { signature })]
	}

	pub fn on_echo(&mut self, from: u16, signature: Vec<u8>) -> Vec<CbStep> {
		let Some(message) = self.message.as_ref() else { return Vec::new() };
		if self.sender_rank != Some(self.own_rank) {
			// Only the sender collects echoes
			return Vec::new()
		}
		if (from as usize) < self.echoes.len() &&
			self.echoes[from as usize].is_none() &&
			self.crypt.verify(from, message, &signature)
		{
			self.echoes[from as usize] = Some(signature);
		}

		if self.echo_count() >= self.echo_threshold && !self.final_sent {
			self.final_sent = true;
			self.delivered = true;
			let signatures = self.collected_signatures();
			return vec![
				CbStep::Broadcast(CbrcPayload::Final { signatures }),
				CbStep::Deliver {
					origin: self.own_rank,
					inner: self.message.clone().expect("message set on sender"),
				},
			]
		}
		Vec::new()
	}

	pub fn on_final(&mut self, from: u16, signatures: Vec<(u16, Vec<u8>)>) -> Vec<CbStep> {
		if self.delivered || Some(from) != self.sender_rank {
			return Vec::new()
		}
		let Some(message) = self.message.as_ref() else { return Vec::new() };
		if signatures.len() < self.echo_threshold {
			return Vec::new()
		}
		let distinct: BTreeSet<u16> = signatures.iter().map(|(rank, _)| *rank).collect();
		if distinct.len() != signatures.len() {
			return Vec::new()
		}
		if signatures
			.iter()
			.all(|(rank, signature)| self.crypt.verify(*rank, message, signature))
		{
			self.delivered = true;
			let origin = self.sender_rank.expect("checked above");
			return vec![CbStep::Deliver { origin, inner: message.clone() }]
		}
		Vec::new()
	}

	pub fn is_delivered(&self) -> bool {
		self.delivered
	}

	pub fn is_sender(&self) -> bool {
		self.sender_rank == Some(self.own_rank)
	}

	/// Ranks whose echoes may still arrive after delivery; a drain handle
	/// absorbs them.
	pub fn outstanding_echoes(&self) -> BTreeSet<u16> {
		self.echoes
			.iter()
			.enumerate()
			.filter_map(|(rank, echo)| echo.is_none().then_some(rank as u16))
			.collect()
	}

	fn echo_count(&self) -> usize {
		self.echoes.iter().filter(|echo| echo.is_some()).count()
	}

	fn collected_signatures(&self) -> Vec<(u16, Vec<u8>)> {
		self.echoes
			.iter()
			.enumerate()
			.filter_map(|(rank, echo)| {
				echo.as_ref().map(|signature| (rank as u16, signature.clone()))
			})
			.collect()
	}
}

pub enum RbStep {
	Broadcast(RbrcPayload),
	Deliver { inner: Vec<u8> },
}

/// Bracha's reliable broadcast: SEND, then echoes, then two READY
/// thresholds. Counts are monotone; correctness depends on counts alone,
/// never on arrival order.
pub struct ReliableBroadcast {
	t: u16,
	own_rank: u16,
	echo_threshold: usize,
	send_received: bool,
	message: Option<Vec<u8>>,
	echoes: Vec<Option<Vec<u8>>>,
	readies: Vec<Option<Vec<u8>>>,
	ready_sent: bool,
	delivered: bool,
}

impl ReliableBroadcast {
	pub fn new_sender(n: u16, t: u16, own_rank: u16, message: Vec<u8>) -> (Self, Vec<RbStep>) {
		let mut machine = Self::new_receiver(n, t, own_rank);
		let mut steps =
			vec![RbStep::Broadcast(RbrcPayload::Send { inner: message.clone() })];
		// Process our own SEND exactly like a receiver would
		steps.extend(machine.on_send(message));
		(machine, steps)
	}

	pub fn new_receiver(n: u16, t: u16, own_rank: u16) -> Self {
		ReliableBroadcast {
			t,
			own_rank,
			echo_threshold: echo_threshold(n, t),
			send_received: false,
			message: None,
			echoes: (0..n).map(|_| None).collect(),
			readies: (0..n).map(|_| None).collect(),
			ready_sent: false,
			delivered: false,
		}
	}

	pub fn on_send(&mut self, inner: Vec<u8>) -> Vec<RbStep> {
		if self.send_received {
			return Vec::new()
		}
		self.send_received = true;
		self.message = Some(inner.clone());
		// Echo to everyone; our own echo counts right away
		let mut steps = vec![RbStep::Broadcast(RbrcPayload::Echo { inner: inner.clone() })];
		steps.extend(self.on_echo(self.own_rank, inner));
		steps
	}

	pub fn on_echo(&mut self, from: u16, inner: Vec<u8>) -> Vec<RbStep> {
		if (from as usize) < self.echoes.len() && self.echoes[from as usize].is_none() {
			self.echoes[from as usize] = Some(inner);
		}
		let (count, majority) = histogram(&self.echoes);
		if count >= self.echo_threshold && !self.ready_sent {
			// Adopt the majority message before vouching for it
			self.message = majority;
			return self.send_ready()
		}
		Vec::new()
	}

	pub fn on_ready(&mut self, from: u16, inner: Vec<u8>) -> Vec<RbStep> {
		if (from as usize) < self.readies.len() && self.readies[from as usize].is_none() {
			self.readies[from as usize] = Some(inner);
		}
		let (count, majority) = histogram(&self.readies);

		let mut steps = Vec::new();
		if count >= (self.t as usize + 1) && !self.ready_sent {
			self.message = majority.clone();
			steps.extend(self.send_ready());
		}
		if count >= (2 * self.t as usize + 1) && !self.delivered {
			if let Some(message) = majority {
				self.delivered = true;
				steps.push(RbStep::Deliver { inner: message });
			}
		}
		steps
	}

	fn send_ready(&mut self) -> Vec<RbStep> {
		if self.ready_sent {
			return Vec::new()
		}
		let Some(message) = self.message.clone() else { return Vec::new() };
		self.ready_sent = true;
		let mut steps =
			vec![RbStep::Broadcast(RbrcPayload::Ready { inner: message.clone() })];
		steps.extend(self.on_ready(self.own_rank, message));
		steps
	}

	pub fn is_delivered(&self) -> bool {
		self.delivered
	}

	pub fn send_received(&self) -> bool {
		self.send_received
	}

	/// Ranks whose echoes and readies may still arrive after delivery.
	pub fn outstanding(&self) -> (BTreeSet<u16>, BTreeSet<u16>) {
		let missing = |slots: &[Option<Vec<u8>>]| {
			slots
				.iter()
				.enumerate()
				.filter_map(|(rank, slot)| slot.is_none().then_some(rank as u16))
				.collect()
		};
		(missing(&self.echoes), missing(&self.readies))
	}
}

/// Most frequent message among the slots, with its multiplicity.
fn histogram(slots: &[Option<Vec<u8>>]) -> (usize, Option<Vec<u8>>) {
	let mut best: (usize, Option<Vec<u8>>) = (0, None);
	let mut seen: Vec<&Vec<u8>> = Vec::new();
	for slot in slots.iter().flatten() {
		if seen.contains(&slot) {
			continue
		}
		seen.push(slot);
		let count = slots
			.iter()
			.flatten()
			.filter(|other| *other == slot)
			.count();
		if count > best.0 {
			best = (count, Some(slot.clone()));
		}
	}
	best
}

#[cfg(test)]
mod tests {
	use super::*;
	use secp256k1::{rand::thread_rng, SECP256K1};

	fn make_crypts(n: u16) -> Vec<Arc<PeerCrypt>> {
		let keypairs: Vec<_> =
			(0..n).map(|_| SECP256K1.generate_keypair(&mut thread_rng())).collect();
		let publics: Vec<PublicKey> = keypairs.iter().map(|(_, pk)| *pk).collect();
		keypairs
			.into_iter()
			.map(|(sk, _)| Arc::new(PeerCrypt { secret: sk, publics: publics.clone() }))
			.collect()
	}

	fn deliveries_cb(steps: &[CbStep]) -> Vec<(u16, Vec<u8>)> {
		steps
			.iter()
			.filter_map(|step| match step {
				CbStep::Deliver { origin, inner } => Some((*origin, inner.clone())),
				_ => None,
			})
			.collect()
	}

	#[test]
	fn echo_thresholds() {
		assert_eq!(echo_threshold(4, 1), 3);
		assert_eq!(echo_threshold(3, 1), 3);
		assert_eq!(echo_threshold(7, 2), 5);
	}

	#[test]
	fn consistent_broadcast_with_one_silent_peer() {
		// n = 4, t = 1: the sender needs 3 echoes (including its own);
		// peer 3 stays silent and the broadcast still completes
		let crypts = make_crypts(4);
		let message = b"the broadcast payload".to_vec();

		let (mut sender, steps) =
			ConsistentBroadcast::new_sender(4, 1, 0, crypts[0].clone(), message.clone());
		assert!(matches!(steps[0], CbStep::Broadcast(CbrcPayload::Send { .. })));

		let mut receivers: Vec<ConsistentBroadcast> = (1..4u16)
			.map(|rank| {
				ConsistentBroadcast::new_receiver(4, 1, rank, crypts[rank as usize].clone())
			})
			.collect();

		// Peers 1 and 2 echo; peer 3 never does
		let mut final_steps = Vec::new();
		for rank in [1u16, 2] {
			let echo_steps = receivers[rank as usize - 1].on_send(0, message.clone());
			let CbStep::SendTo(0, CbrcPayload::Echo { signature }) = &echo_steps[0] else {
				panic!("receiver must echo to the sender")
			};
			final_steps = sender.on_echo(rank, signature.clone());
		}
		receivers[2].on_send(0, message.clone());

		// With the third valid echo the sender finalizes and delivers
		let CbStep::Broadcast(CbrcPayload::Final { signatures }) = &final_steps[0] else {
			panic!("sender must broadcast FINL at the echo threshold")
		};
		assert_eq!(signatures.len(), 3);
		assert_eq!(deliveries_cb(&final_steps), vec![(0, message.clone())]);

		// Everyone delivers the same message on FINL, silent peer included
		for receiver in receivers.iter_mut() {
			let steps = receiver.on_final(0, signatures.clone());
			assert_eq!(deliveries_cb(&steps), vec![(0, message.clone())]);
		}
	}

	#[test]
	fn forged_echo_is_not_counted() {
		let crypts = make_crypts(4);
		let message = b"payload".to_vec();
		let (mut sender, _) =
			ConsistentBroadcast::new_sender(4, 1, 0, crypts[0].clone(), message.clone());

		// Signature by peer 2 presented as peer 1's echo
		let forged = crypts[2].sign(&message);
		assert!(sender.on_echo(1, forged).is_empty());
		assert_eq!(sender.outstanding_echoes(), BTreeSet::from([1, 2, 3]));
	}

	#[test]
	fn final_with_too_few_signatures_is_ignored() {
		let crypts = make_crypts(4);
		let message = b"payload".to_vec();

		let mut receiver = ConsistentBroadcast::new_receiver(4, 1, 1, crypts[1].clone());
		receiver.on_send(0, message.clone());

		let sigs = vec![(0u16, crypts[0].sign(&message))];
		assert!(receiver.on_final(0, sigs).is_empty());
		assert!(!receiver.is_delivered());
	}

	#[test]
	fn duplicate_send_does_not_rebind() {
		let crypts = make_crypts(3);
		let mut receiver = ConsistentBroadcast::new_receiver(3, 1, 1, crypts[1].clone());
		assert!(!receiver.on_send(0, b"first".to_vec()).is_empty());
		assert!(receiver.on_send(2, b"second".to_vec()).is_empty());
	}

	fn deliveries_rb(steps: &[RbStep]) -> Vec<Vec<u8>> {
		steps
			.iter()
			.filter_map(|step| match step {
				RbStep::Deliver { inner } => Some(inner.clone()),
				_ => None,
			})
			.collect()
	}

	#[test]
	fn bracha_delivers_everywhere() {
		// n = 4, t = 1, all honest: run the full exchange to completion
		let n = 4u16;
		let message = b"bracha payload".to_vec();

		let (sender, sender_steps) =
			ReliableBroadcast::new_sender(n, 1, 0, message.clone());
		let mut machines: Vec<ReliableBroadcast> = vec![sender];
		for rank in 1..n {
			machines.push(ReliableBroadcast::new_receiver(n, 1, rank));
		}

		// Queue of (from, payload) still to be processed by everyone else
		let mut queue: Vec<(u16, RbrcPayload)> = sender_steps
			.into_iter()
			.filter_map(|step| match step {
				RbStep::Broadcast(payload) => Some((0u16, payload)),
				RbStep::Deliver { .. } => None,
			})
			.collect();
		let mut delivered: Vec<Vec<u8>> = Vec::new();

		while let Some((from, payload)) = queue.pop() {
			for rank in 0..n {
				if rank == from {
					continue
				}
				let steps = match payload.clone() {
					RbrcPayload::Send { inner } => machines[rank as usize].on_send(inner),
					RbrcPayload::Echo { inner } =>
						machines[rank as usize].on_echo(from, inner),
					RbrcPayload::Ready { inner } =>
						machines[rank as usize].on_ready(from, inner),
				};
				for step in steps {
					match step {
						RbStep::Broadcast(payload) => queue.push((rank, payload)),
						RbStep::Deliver { inner } => delivered.push(inner),
					}
				}
			}
		}

		for machine in &machines {
			assert!(machine.is_delivered());
		}
		assert_eq!(delivered.len(), n as usize);
		assert!(delivered.iter().all(|inner| inner == &message));
	}

	#[test]
	fn bracha_ready_amplification() {
		// A peer that saw no echoes still sends READY after t + 1 READYs
		// and delivers after 2t + 1
		let message = b"amplified".to_vec();
		let mut machine = ReliableBroadcast::new_receiver(4, 1, 3);

		assert!(machine.on_ready(0, message.clone()).is_empty());
		let steps = machine.on_ready(1, message.clone());
		assert!(steps
			.iter()
			.any(|step| matches!(step, RbStep::Broadcast(RbrcPayload::Ready { .. }))));
		// Own ready (recorded when sending) plus ranks 0 and 1 makes
		// 2t + 1, delivering immediately
		assert_eq!(deliveries_rb(&steps), vec![message]);
		assert!(machine.is_delivered());
	}
}
