//! Joint-Feldman DKG. Used once per session to produce the common point H
//! that the Pedersen DKG needs as its second generator.

use std::collections::BTreeSet;

use num_bigint::BigUint;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

use crate::{
	curve::{deserialize_points, serialize_points, Point},
	error::ProtocolFailure,
	field::PrimeField,
	messages::SmpcData,
	shamir,
	store::{PublicValue, ValueTaskIo},
};

use super::{evaluate_commitments, Collection, QualifiedSet};

pub(crate) async fn run(
	io: &ValueTaskIo,
	field: &'static PrimeField,
	buffered: Vec<(u32, SmpcData)>,
	msg_rx: &mut UnboundedReceiver<(u32, SmpcData)>,
) -> Result<(), ProtocolFailure> {
	let mut state = Jfdkg::new(io, field);
	state.distribute();

	for (rank, data) in buffered {
		state.handle(rank, data);
	}

	let collect_timeout = tokio::time::sleep(io.ctx.share_timeout);
	tokio::pin!(collect_timeout);
	while !state.collection_complete() {
		tokio::select! {
			Some((rank, data)) = msg_rx.recv() => state.handle(rank, data),
			_ = &mut collect_timeout => break,
		}
	}
	state.close_collection();

	state.verify_and_complain()?;
	state.send_nak();

	let complaint_timeout = tokio::time::sleep(io.ctx.complaint_timeout);
	tokio::pin!(complaint_timeout);
	while !state.complaints_finished() {
		tokio::select! {
			Some((rank, data)) = msg_rx.recv() => state.handle(rank, data),
			_ = &mut complaint_timeout => {
				state.abort_open_complaints();
				break
			},
		}
	}

	state.finalize()
}

struct Jfdkg<'io> {
	io: &'io ValueTaskIo,
	field: &'static PrimeField,
	n: u32,
	t: u32,
	rank: u32,
	/// `f(j + 1)` for every rank j; kept around to answer complaints.
	transmitted: Vec<BigUint>,
	shares: Collection<BigUint>,
	commitments: Collection<Vec<Point>>,
	naks: Vec<bool>,
	open_complaints: BTreeSet<(u32, u32)>,
	marked: Vec<bool>,
	qualified: QualifiedSet,
}

impl<'io> Jfdkg<'io> {
	fn new(io: &'io ValueTaskIo, field: &'static PrimeField) -> Self {
		let (n, t) = (io.ctx.n, io.ctx.t);
		Jfdkg {
			io,
			field,
			n,
			t,
			rank: io.ctx.rank,
			transmitted: Vec::new(),
			shares: Collection::new(n),
			commitments: Collection::new(n),
			naks: vec![false; n as usize],
			open_complaints: BTreeSet::new(),
			marked: vec![false; n as usize],
			qualified: QualifiedSet::new(n, t),
		}
	}

	/// Sample our random contribution and send out shares plus Feldman
	/// commitments.
	fn distribute(&mut self) {
		let (shares, coefficients) =
			shamir::share(&self.field.random(), self.n, self.t, self.field);
		self.transmitted = shares.into_iter().map(|(_, s)| s).collect();

		let commitments: Vec<Point> =
			coefficients.iter().map(Point::from_scalar).collect();

		let field = self.field;
		let transmitted = self.transmitted.clone();
		self.io.eachcast(move |rank| {
			SmpcData::SecretShare(field.to_bytes(&transmitted[rank as usize]))
		});
		self.io.consistent_broadcast(SmpcData::PublicValue(
			serialize_points(&commitments)
				.expect("freshly sampled commitments cannot be at infinity"),
		));

		// Our own contributions count like everyone else's
		self.shares.accept(self.rank, self.transmitted[self.rank as usize].clone());
		self.commitments.accept(self.rank, commitments);
	}

	fn handle(&mut self, rank: u32, data: SmpcData) {
		match data {
			SmpcData::SecretShare(bytes) => match self.field.from_bytes(&bytes) {
				Ok(share) => {
					self.shares.accept(rank, share);
				},
				Err(_) => {
					warn!(slot = %self.io.slot, rank, "unparseable share");
				},
			},
			SmpcData::PublicValue(bytes) => match deserialize_points(&bytes) {
				Ok(points) => {
					self.commitments.accept(rank, points);
				},
				Err(_) => {
					warn!(slot = %self.io.slot, rank, "unparseable commitments");
				},
			},
			SmpcData::Complaint { accused } => self.on_complaint(rank, accused as u32),
			SmpcData::ComplaintReaction { accuser, share } =>
				self.on_reaction(rank, accuser as u32, &share),
			SmpcData::NoComplaint => self.on_nak(rank),
		}
	}

	fn collection_complete(&self) -> bool {
		self.shares.complete() && self.commitments.complete()
	}

	fn close_collection(&mut self) {
		self.shares.close();
		self.commitments.close();
	}

	/// Check `s * G == sum_k (j+1)^k * A_k` for the share peer `sender`
	/// addressed to rank `holder`.
	fn verify_share(&self, share: &BigUint, sender: u32, holder: u32) -> bool {
		let Some(commitments) = self.commitments.get(sender) else { return false };
		if commitments.len() != self.t as usize + 1 {
			return false
		}
		Point::from_scalar(share) == evaluate_commitments(commitments, holder + 1)
	}

	/// Blame peers with missing or inconsistent contributions; locally
	/// disqualify them and broadcast complaints.
	fn verify_and_complain(&mut self) -> Result<(), ProtocolFailure> {
		let to_blame: Vec<u32> = (0..self.n)
			.filter(|i| {
				match (self.shares.get(*i), self.commitments.get(*i)) {
					(Some(share), Some(_)) =>
						!self.verify_share(share, *i, self.rank),
					_ => {
						debug!(slot = %self.io.slot, rank = i, "missing contribution");
						true
					},
				}
			})
			.collect();

		if to_blame.is_empty() {
			return Ok(())
		}

		for accused in &to_blame {
			self.open_complaints.insert((self.rank, *accused));
			self.io.consistent_broadcast(SmpcData::Complaint { accused: *accused as u16 });
		}
		self.qualified.disqualify_all(to_blame)
	}

	fn send_nak(&mut self) {
		self.io.broadcast(SmpcData::NoComplaint);
		self.on_nak(self.rank);
	}

	fn on_complaint(&mut self, accuser: u32, accused: u32) {
		if accused >= self.n {
			warn!(slot = %self.io.slot, accuser, accused, "complaint against unknown rank");
			return
		}
		self.open_complaints.insert((accuser, accused));
		if accused == self.rank {
			// Defend ourselves by opening the share we actually sent
			let share = self.transmitted.get(accuser as usize).cloned();
			if let Some(share) = share {
				self.io.consistent_broadcast(SmpcData::ComplaintReaction {
					accuser: accuser as u16,
					share: self.field.to_bytes(&share),
				});
			}
			self.open_complaints.remove(&(accuser, self.rank));
		} else {
			self.marked[accused as usize] = true;
		}
	}

	fn on_reaction(&mut self, reactor: u32, accuser: u32, share_bytes: &[u8]) {
		if let Ok(share) = self.field.from_bytes(share_bytes) {
			if self.verify_share(&share, reactor, accuser) {
				self.marked[reactor as usize] = false;
				if accuser == self.rank {
					// The opened share is ours; adopt it over whatever
					// (if anything) we received point-to-point, and
					// readmit the peer we had blamed
					self.shares.replace(reactor, share);
					self.qualified.requalify(reactor);
				}
			}
		}
		self.open_complaints.remove(&(accuser, reactor));
	}

	fn on_nak(&mut self, rank: u32) {
		if let Some(nak) = self.naks.get_mut(rank as usize) {
			*nak = true;
		}
	}

	fn complaints_finished(&self) -> bool {
		self.open_complaints.is_empty() &&
			self.qualified.iter().all(|rank| self.naks[rank as usize])
	}

	fn abort_open_complaints(&mut self) {
		self.open_complaints.clear();
	}

	fn finalize(mut self) -> Result<(), ProtocolFailure> {
		let marked: Vec<u32> = self
			.qualified
			.iter()
			.filter(|rank| self.marked[*rank as usize])
			.collect();
		self.qualified.disqualify_all(marked)?;

		let secret_share = self
			.qualified
			.iter()
			.filter_map(|rank| self.shares.get(rank))
			.fold(BigUint::from(0u32), |acc, s| self.field.add(&acc, s));

		let public_value = Point::sum(
			self.qualified
				.iter()
				.filter_map(|rank| self.commitments.get(rank))
				.map(|commitments| commitments[0]),
		);

		debug!(
			slot = %self.io.slot,
			qualified = self.qualified.len(),
			"joint-feldman value resolved"
		);

		self.io.secret.resolve(secret_share);
		self.io.public.resolve(PublicValue::Point(public_value));
		Ok(())
	}
}
