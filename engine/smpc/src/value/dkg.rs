//! Pedersen DKG, secure against a 1/2-adversary. Round 0 establishes an
//! unconditionally hiding sharing under commitments `C_k = a_k G + b_k H`
//! and fixes the qualified set and the secret share. Round 1, run only when
//! a public key is needed, opens the Feldman projection `A_k = a_k G`;
//! justified round-1 complaints make the qualified peers expose the
//! offender's round-0 shares so its contribution can be reconstructed.

use std::collections::{BTreeMap, BTreeSet};

use num_bigint::BigUint;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

use crate::{
	curve::{deserialize_points, serialize_points, Point},
	error::{ProtocolFailure, SmpcError},
	field::PrimeField,
	messages::{SmpcData, DKG_PUBLIC_COMMITMENT, DKG_PUBLIC_FELDMAN},
	shamir,
	store::{PublicValue, ValueTaskIo},
};

use super::{evaluate_commitments, Collection, QualifiedSet};

pub(crate) async fn run(
	io: &ValueTaskIo,
	field: &'static PrimeField,
	h: Point,
	with_public: bool,
	buffered: Vec<(u32, SmpcData)>,
	msg_rx: &mut UnboundedReceiver<(u32, SmpcData)>,
) -> Result<(), ProtocolFailure> {
	let mut state = PedersenDkg::new(io, field, h);
	state.distribute_round0();

	for (rank, data) in buffered {
		state.handle(rank, data);
	}

	// Round 0 collection
	let collect_timeout = tokio::time::sleep(io.ctx.share_timeout);
	tokio::pin!(collect_timeout);
	while !state.round0_collection_complete() {
		tokio::select! {
			Some((rank, data)) = msg_rx.recv() => state.handle(rank, data),
			_ = &mut collect_timeout => break,
		}
	}
	state.close_round0_collection();

	state.verify_round0_and_complain()?;
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

	state.finalize_round0()?;

	if !with_public {
		return Ok(())
	}

	// Round 1: open the Feldman projection
	state.enter_round1();
	state.distribute_round1();

	let collect_timeout = tokio::time::sleep(io.ctx.share_timeout);
	tokio::pin!(collect_timeout);
	while !state.round1_collection_complete() {
		tokio::select! {
			Some((rank, data)) = msg_rx.recv() => state.handle(rank, data),
			_ = &mut collect_timeout => break,
		}
	}
	state.close_round1_collection();

	state.verify_round1_and_complain();
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

	state.finalize_round1()
}

struct PedersenDkg<'io> {
	io: &'io ValueTaskIo,
	field: &'static PrimeField,
	h: Point,
	n: u32,
	t: u32,
	rank: u32,
	round: u8,

	secret_coeffs: Vec<BigUint>,
	transmitted: Vec<(BigUint, BigUint)>,

	share_pairs: Collection<(BigUint, BigUint)>,
	commitments: Collection<Vec<Point>>,

	feldman: Collection<Vec<Point>>,
	/// Round-0 shares of accused peers, opened for reconstruction:
	/// accused rank -> (exposer rank -> share).
	exposures: BTreeMap<u32, BTreeMap<u32, BigUint>>,
	round1_accused: BTreeSet<u32>,
	exposed_for: BTreeSet<u32>,

	naks: Vec<bool>,
	open_complaints: BTreeSet<(u32, u32)>,
	marked: Vec<bool>,
	complaint_counters: Vec<u32>,
	counted_complaints: BTreeSet<(u32, u32)>,
	qualified: QualifiedSet,
}

impl<'io> PedersenDkg<'io> {
	fn new(io: &'io ValueTaskIo, field: &'static PrimeField, h: Point) -> Self {
		let (n, t) = (io.ctx.n, io.ctx.t);
		PedersenDkg {
			io,
			field,
			h,
			n,
			t,
			rank: io.ctx.rank,
			round: 0,
			secret_coeffs: Vec::new(),
			transmitted: Vec::new(),
			share_pairs: Collection::new(n),
			commitments: Collection::new(n),
			feldman: Collection::new(n),
			exposures: BTreeMap::new(),
			round1_accused: BTreeSet::new(),
			exposed_for: BTreeSet::new(),
			naks: vec![false; n as usize],
			open_complaints: BTreeSet::new(),
			marked: vec![false; n as usize],
			complaint_counters: vec![0; n as usize],
			counted_complaints: BTreeSet::new(),
			qualified: QualifiedSet::new(n, t),
		}
	}

	fn distribute_round0(&mut self) {
		let (shares, secret_coeffs) =
			shamir::share(&self.field.random(), self.n, self.t, self.field);
		let (blindings, blinding_coeffs) =
			shamir::share(&self.field.random(), self.n, self.t, self.field);

		self.transmitted = shares
			.into_iter()
			.zip(blindings)
			.map(|((_, s), (_, s_prime))| (s, s_prime))
			.collect();

		// C_k = a_k * G + b_k * H
		let pedersen_commitments: Vec<Point> = secret_coeffs
			.iter()
			.zip(&blinding_coeffs)
			.map(|(a, b)| Point::from_scalar(a).add(&self.h.mul_scalar(b)))
			.collect();
		self.secret_coeffs = secret_coeffs;

		let field = self.field;
		let transmitted = self.transmitted.clone();
		self.io.eachcast(move |rank| {
			SmpcData::SecretShare(encode_pair(field, &transmitted[rank as usize]))
		});

		let mut payload = vec![DKG_PUBLIC_COMMITMENT];
		payload.extend(
			serialize_points(&pedersen_commitments)
				.expect("pedersen commitments cannot be at infinity"),
		);
		self.io.consistent_broadcast(SmpcData::PublicValue(payload));

		self.share_pairs
			.accept(self.rank, self.transmitted[self.rank as usize].clone());
		self.commitments.accept(self.rank, pedersen_commitments);
	}

	fn distribute_round1(&mut self) {
		let feldman: Vec<Point> =
			self.secret_coeffs.iter().map(Point::from_scalar).collect();

		let mut payload = vec![DKG_PUBLIC_FELDMAN];
		payload.extend(
			serialize_points(&feldman).expect("feldman commitments cannot be at infinity"),
		);
		self.io.consistent_broadcast(SmpcData::PublicValue(payload));

		self.feldman.accept(self.rank, feldman);
	}

	fn handle(&mut self, rank: u32, data: SmpcData) {
		match data {
			SmpcData::SecretShare(bytes) => match decode_pair(self.field, &bytes) {
				Ok(pair) => {
					self.share_pairs.accept(rank, pair);
				},
				Err(_) => warn!(slot = %self.io.slot, rank, "unparseable share pair"),
			},
			SmpcData::PublicValue(bytes) => self.on_public_value(rank, &bytes),
			SmpcData::Complaint { accused } => self.on_complaint(rank, accused as u32),
			SmpcData::ComplaintReaction { accuser, share } =>
				self.on_reaction(rank, accuser as u32, &share),
			SmpcData::NoComplaint => self.on_nak(rank),
		}
	}

	fn on_public_value(&mut self, rank: u32, bytes: &[u8]) {
		let Some((kind, points)) = bytes.split_first() else {
			warn!(slot = %self.io.slot, rank, "empty public value");
			return
		};
		let Ok(points) = deserialize_points(points) else {
			warn!(slot = %self.io.slot, rank, "unparseable public value");
			return
		};
		match *kind {
			DKG_PUBLIC_COMMITMENT => {
				self.commitments.accept(rank, points);
			},
			DKG_PUBLIC_FELDMAN => {
				self.feldman.accept(rank, points);
			},
			other => {
				warn!(slot = %self.io.slot, rank, kind = other, "unknown public value kind");
			},
		}
	}

	fn round0_collection_complete(&self) -> bool {
		self.share_pairs.complete() && self.commitments.complete()
	}

	fn close_round0_collection(&mut self) {
		self.share_pairs.close();
		self.commitments.close();
	}

	fn round1_collection_complete(&self) -> bool {
		self.qualified.iter().all(|rank| self.feldman.get(rank).is_some())
	}

	fn close_round1_collection(&mut self) {
		self.feldman.close();
	}

	fn enter_round1(&mut self) {
		self.round = 1;
		self.naks = vec![false; self.n as usize];
		self.open_complaints.clear();
		self.marked = vec![false; self.n as usize];
	}

	/// `s G + s' H == sum_k (j+1)^k C_k` for the pair peer `sender` sent
	/// to rank `holder`.
	fn verify_pair(&self, pair: &(BigUint, BigUint), sender: u32, holder: u32) -> bool {
		let Some(commitments) = self.commitments.get(sender) else { return false };
		if commitments.len() != self.t as usize + 1 {
			return false
		}
		let lhs = Point::from_scalar(&pair.0).add(&self.h.mul_scalar(&pair.1));
		lhs == evaluate_commitments(commitments, holder + 1)
	}

	/// `s G == sum_k (j+1)^k A_k` against `sender`'s opened Feldman
	/// projection.
	fn verify_feldman(&self, share: &BigUint, sender: u32, holder: u32) -> bool {
		let Some(feldman) = self.feldman.get(sender) else { return false };
		if feldman.len() != self.t as usize + 1 {
			return false
		}
		Point::from_scalar(share) == evaluate_commitments(feldman, holder + 1)
	}

	fn verify_round0_and_complain(&mut self) -> Result<(), ProtocolFailure> {
		let to_blame: Vec<u32> = (0..self.n)
			.filter(|i| {
				match (self.share_pairs.get(*i), self.commitments.get(*i)) {
					(Some(pair), Some(_)) => !self.verify_pair(pair, *i, self.rank),
					_ => {
						debug!(slot = %self.io.slot, rank = i, "missing round-0 contribution");
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

	fn verify_round1_and_complain(&mut self) {
		let to_accuse: Vec<u32> = self
			.qualified
			.iter()
			.filter(|i| {
				let Some(pair) = self.share_pairs.get(*i) else { return true };
				!self.verify_feldman(&pair.0, *i, self.rank)
			})
			.collect();

		for accused in to_accuse {
			self.io.consistent_broadcast(SmpcData::Complaint { accused: accused as u16 });
			self.start_reconstruction(accused);
		}
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
		if self.round == 0 {
			if self.counted_complaints.insert((accuser, accused)) {
				self.complaint_counters[accused as usize] += 1;
			}
			self.open_complaints.insert((accuser, accused));
			if accused == self.rank {
				if let Some(pair) = self.transmitted.get(accuser as usize).cloned() {
					self.io.consistent_broadcast(SmpcData::ComplaintReaction {
						accuser: accuser as u16,
						share: encode_pair(self.field, &pair),
					});
				}
				self.open_complaints.remove(&(accuser, self.rank));
			} else {
				self.marked[accused as usize] = true;
			}
		} else {
			// A round-1 complaint makes everyone open the accused peer's
			// round-0 share for reconstruction, including the accused's
			// own stake in it
			self.start_reconstruction(accused);
		}
	}

	/// Expose the round-0 share we hold from `accused` so the qualified
	/// set can recombine its contribution.
	fn start_reconstruction(&mut self, accused: u32) {
		if !self.qualified.contains(accused) {
			return
		}
		self.round1_accused.insert(accused);
		if !self.exposed_for.insert(accused) {
			return
		}
		if let Some(pair) = self.share_pairs.get(accused).cloned() {
			self.exposures
				.entry(accused)
				.or_default()
				.insert(self.rank, pair.0.clone());
			self.io.consistent_broadcast(SmpcData::ComplaintReaction {
				accuser: accused as u16,
				share: self.field.to_bytes(&pair.0),
			});
		}
	}

	fn on_reaction(&mut self, reactor: u32, accuser: u32, share_bytes: &[u8]) {
		if self.round == 0 {
			if let Ok(pair) = decode_pair(self.field, share_bytes) {
				if self.verify_pair(&pair, reactor, accuser) {
					self.marked[reactor as usize] = false;
					if accuser == self.rank {
						self.share_pairs.replace(reactor, pair);
						self.qualified.requalify(reactor);
					}
				}
			}
			self.open_complaints.remove(&(accuser, reactor));
		} else {
			// Round 1: `accuser` names the accused peer whose share the
			// reactor is opening
			let accused = accuser;
			if let Ok(share) = self.field.from_bytes(share_bytes) {
				self.round1_accused.insert(accused);
				self.exposures.entry(accused).or_default().insert(reactor, share);
			}
		}
	}

	fn on_nak(&mut self, rank: u32) {
		if let Some(nak) = self.naks.get_mut(rank as usize) {
			*nak = true;
		}
	}

	fn complaints_finished(&self) -> bool {
		if !self.open_complaints.is_empty() {
			return false
		}
		if self.round == 1 {
			// Reconstructions must gather enough exposures to recombine
			let reconstructions_ready = self.round1_accused.iter().all(|accused| {
				self.exposures
					.get(accused)
					.map(|opened| opened.len() > self.t as usize)
					.unwrap_or(false)
			});
			if !reconstructions_ready {
				return false
			}
		}
		self.qualified.iter().all(|rank| self.naks[rank as usize])
	}

	fn abort_open_complaints(&mut self) {
		self.open_complaints.clear();
	}

	fn finalize_round0(&mut self) -> Result<(), ProtocolFailure> {
		let to_disqualify: Vec<u32> = self
			.qualified
			.iter()
			.filter(|rank| {
				self.marked[*rank as usize] ||
					self.complaint_counters[*rank as usize] > self.t
			})
			.collect();
		self.qualified.disqualify_all(to_disqualify)?;

		let secret_share = self
			.qualified
			.iter()
			.filter_map(|rank| self.share_pairs.get(rank))
			.fold(BigUint::from(0u32), |acc, (s, _)| self.field.add(&acc, s));

		debug!(
			slot = %self.io.slot,
			qualified = self.qualified.len(),
			"pedersen sharing fixed"
		);

		self.io.secret.resolve(secret_share);
		Ok(())
	}

	fn finalize_round1(&mut self) -> Result<(), ProtocolFailure> {
		let mut public_value = Point::infinity();

		for rank in self.qualified.iter().collect::<Vec<_>>() {
			let term = if self.round1_accused.contains(&rank) {
				self.reconstruct_contribution(rank)?
			} else {
				match self.feldman.get(rank) {
					Some(feldman) if feldman.len() == self.t as usize + 1 =>
						feldman[0],
					// Never opened its projection; recover it from the
					// shares the qualified peers hold
					_ => self.reconstruct_contribution(rank)?,
				}
			};
			public_value = public_value.add(&term);
		}

		debug!(slot = %self.io.slot, "pedersen public value resolved");
		self.io.public.resolve(PublicValue::Point(public_value));
		Ok(())
	}

	/// Robustly recombine the opened round-0 shares of `accused` and
	/// project the result onto the curve.
	fn reconstruct_contribution(&self, accused: u32) -> Result<Point, ProtocolFailure> {
		let opened = self.exposures.get(&accused);
		let shares: Vec<(u32, Option<BigUint>)> = (0..self.n)
			.map(|rank| {
				(rank + 1, opened.and_then(|opened| opened.get(&rank).cloned()))
			})
			.collect();
		let contribution = shamir::recombine(&shares, self.t, 0, self.field, true)
			.map_err(|_| {
				ProtocolFailure::blaming(
					SmpcError::RobustRecombinationFailed,
					BTreeSet::from([accused]),
				)
			})?;
		Ok(Point::from_scalar(&contribution))
	}
}

fn encode_pair(field: &PrimeField, pair: &(BigUint, BigUint)) -> Vec<u8> {
	let mut out = field.to_bytes(&pair.0);
	out.extend(field.to_bytes(&pair.1));
	out
}

fn decode_pair(field: &PrimeField, bytes: &[u8]) -> Result<(BigUint, BigUint), SmpcError> {
	let width = field.element_len();
	if bytes.len() != 2 * width {
		return Err(SmpcError::MalformedPayload)
	}
	Ok((field.from_bytes(&bytes[..width])?, field.from_bytes(&bytes[width..])?))
}
