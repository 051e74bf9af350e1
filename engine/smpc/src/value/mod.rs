//! Protocol implementations behind the shared-value slots. One module per
//! algorithm kind, plus the bookkeeping they all share.

pub(crate) mod dkg;
pub(crate) mod jfdkg;
pub(crate) mod mul;
pub(crate) mod rec;


use std::collections::BTreeSet;

use num_bigint::BigUint;

use crate::{
	curve::Point,
	error::{ProtocolFailure, SmpcError},
	field::SECP256K1_ORDER,
	messages::{OutgoingSmpcMessages, SmpcData, SmpcEnvelope},
	store::ValueTaskIo,
};

/// One item per rank, accepted at most once (duplicates are ignored, which
/// keeps protocols deterministic under replays).
pub(crate) struct Collection<T> {
	items: Vec<Option<T>>,
	closed: bool,
}

impl<T> Collection<T> {
	pub fn new(n: u32) -> Self {
		Collection { items: (0..n).map(|_| None).collect(), closed: false }
	}

	/// Returns whether the item was accepted.
	pub fn accept(&mut self, rank: u32, item: T) -> bool {
		if self.closed {
			return false
		}
		match self.items.get_mut(rank as usize) {
			Some(slot @ None) => {
				*slot = Some(item);
				true
			},
			_ => false,
		}
	}

	/// Overwrite an existing entry; used when a complaint reaction
	/// supersedes a bad share.
	pub fn replace(&mut self, rank: u32, item: T) {
		if let Some(slot) = self.items.get_mut(rank as usize) {
			*slot = Some(item);
		}
	}

	pub fn close(&mut self) {
		self.closed = true;
	}

	pub fn complete(&self) -> bool {
		self.items.iter().all(|item| item.is_some())
	}

	pub fn get(&self, rank: u32) -> Option<&T> {
		self.items.get(rank as usize).and_then(|item| item.as_ref())
	}

	pub fn iter_present(&self) -> impl Iterator<Item = (u32, &T)> {
		self.items
			.iter()
			.enumerate()
			.filter_map(|(rank, item)| item.as_ref().map(|item| (rank as u32, item)))
	}
}

/// The locally-qualified peer set; shrinking below `t + 1` peers is fatal
/// for the value.
pub(crate) struct QualifiedSet {
	qualified: BTreeSet<u32>,
	t: u32,
}

impl QualifiedSet {
	pub fn new(n: u32, t: u32) -> Self {
		QualifiedSet { qualified: (0..n).collect(), t }
	}

	pub fn contains(&self, rank: u32) -> bool {
		self.qualified.contains(&rank)
	}

	pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
		self.qualified.iter().copied()
	}

	pub fn len(&self) -> usize {
		self.qualified.len()
	}

	/// Readmit a peer whose complaint was answered with a valid reaction.
	pub fn requalify(&mut self, rank: u32) {
		self.qualified.insert(rank);
	}

	pub fn disqualify_all(
		&mut self,
		ranks: impl IntoIterator<Item = u32>,
	) -> Result<(), ProtocolFailure> {
		let blamed: BTreeSet<u32> = ranks.into_iter().collect();
		for rank in &blamed {
			self.qualified.remove(rank);
		}
		if self.qualified.len() <= self.t as usize {
			return Err(ProtocolFailure::blaming(
				SmpcError::ThresholdViolated {
					remaining: self.qualified.len(),
					threshold: self.t,
				},
				blamed,
			))
		}
		Ok(())
	}
}

/// `sum_k index^k * commitments[k]` - the public polynomial evaluated at a
/// 1-based player index, as used by the Feldman and Pedersen checks.
pub(crate) fn evaluate_commitments(commitments: &[Point], index: u32) -> Point {
	let field = &*SECP256K1_ORDER;
	let index = BigUint::from(index);
	Point::sum(commitments.iter().enumerate().map(|(k, a)| {
		a.mul_scalar(&field.pow(&index, k as u32))
	}))
}

impl ValueTaskIo {
	fn send(&self, message: OutgoingSmpcMessages) {
		// The transport outliving the session is the session's concern;
		// a closed channel here means shutdown is already in progress
		let _ = self.ctx.outgoing.send(message);
	}

	pub(crate) fn broadcast(&self, data: SmpcData) {
		self.send(OutgoingSmpcMessages::Broadcast(SmpcEnvelope {
			slot: self.slot.clone(),
			data,
		}));
	}

	pub(crate) fn consistent_broadcast(&self, data: SmpcData) {
		self.send(OutgoingSmpcMessages::ConsistentBroadcast(SmpcEnvelope {
			slot: self.slot.clone(),
			data,
		}));
	}

	/// Send a distinct message to every peer but ourselves.
	pub(crate) fn eachcast(&self, mut data_for_rank: impl FnMut(u32) -> SmpcData) {
		let messages = (0..self.ctx.n)
			.filter(|rank| *rank != self.ctx.rank)
			.map(|rank| {
				(rank, SmpcEnvelope { slot: self.slot.clone(), data: data_for_rank(rank) })
			})
			.collect();
		self.send(OutgoingSmpcMessages::Eachcast(messages));
	}
}
