//! The per-session store of shared values. Slots are created lazily so that
//! messages arriving before the local initiator are parked rather than
//! dropped; creating an existing slot returns it unchanged.

use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
	time::Duration,
};

use num_bigint::BigUint;
use tokio::sync::{
	mpsc::{UnboundedReceiver, UnboundedSender},
	oneshot,
};
use tracing::{debug, warn};

use crate::{
	curve::Point,
	error::{ProtocolFailure, SmpcError},
	field::PrimeField,
	messages::{Algorithm, OutgoingSmpcMessages, SlotId, SmpcData},
	promise::{promise, Promise, PromiseResolver},
	value,
};

/// Everything a protocol task needs to know about the session it runs in.
pub struct SmpcContext {
	/// Our own rank within the mixnet.
	pub rank: u32,
	/// Number of mixing peers.
	pub n: u32,
	/// Sharing threshold; `t + 1` honest peers can recombine.
	pub t: u32,
	pub outgoing: UnboundedSender<OutgoingSmpcMessages>,
	/// Protocol failures are reported here; the session decides whether
	/// they are fatal.
	pub failure_tx: UnboundedSender<(SlotId, ProtocolFailure)>,
	/// How long collection phases wait for missing contributions.
	pub share_timeout: Duration,
	/// How long complaint windows stay open.
	pub complaint_timeout: Duration,
}

/// The number of faulty peers a mixnet of `n` peers withstands.
pub fn threshold_from_peer_count(n: u32) -> u32 {
	n.saturating_sub(1) / 2
}

/// The publicly known projection of a resolved value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublicValue {
	Point(Point),
	Scalar(BigUint),
}

impl PublicValue {
	pub fn into_point(self) -> Result<Point, SmpcError> {
		match self {
			PublicValue::Point(p) => Ok(p),
			PublicValue::Scalar(_) => Err(SmpcError::MalformedPayload),
		}
	}

	pub fn into_scalar(self) -> Result<BigUint, SmpcError> {
		match self {
			PublicValue::Scalar(s) => Ok(s),
			PublicValue::Point(_) => Err(SmpcError::MalformedPayload),
		}
	}
}

/// A clone-able handle to a shared value: the pair of promises consumers
/// await, plus the sharing threshold for composition checks.
#[derive(Clone)]
pub struct ValueHandle {
	pub threshold: u32,
	secret: Promise<BigUint>,
	public: Promise<PublicValue>,
}

impl ValueHandle {
	pub async fn secret_share(&self) -> Result<BigUint, SmpcError> {
		self.secret.wait().await.ok_or(SmpcError::ValueAbandoned)
	}

	pub async fn public_value(&self) -> Result<PublicValue, SmpcError> {
		self.public.wait().await.ok_or(SmpcError::ValueAbandoned)
	}

	pub fn try_secret_share(&self) -> Option<BigUint> {
		self.secret.try_get()
	}

	pub fn try_public_value(&self) -> Option<PublicValue> {
		self.public.try_get()
	}
}

/// Parameters handed to a parked slot when its local initiator attaches.
pub enum InitRequest {
	Jfdkg {
		field: &'static PrimeField,
	},
	Dkg {
		field: &'static PrimeField,
		/// The common point produced by the session's one JF-DKG run.
		h: Point,
		with_public: bool,
	},
	Mul {
		factor1: ValueHandle,
		factor2: ValueHandle,
	},
	Rec {
		value: ValueHandle,
		field: &'static PrimeField,
	},
}

impl InitRequest {
	fn algorithm(&self) -> Algorithm {
		match self {
			InitRequest::Jfdkg { .. } => Algorithm::Jfdkg,
			InitRequest::Dkg { .. } => Algorithm::Dkg,
			InitRequest::Mul { .. } => Algorithm::Mul,
			InitRequest::Rec { .. } => Algorithm::Rec,
		}
	}
}

struct ActiveSlot {
	msg_tx: UnboundedSender<(u32, SmpcData)>,
	/// Taken by the first initiator; `None` afterwards (idempotence).
	init_tx: Option<oneshot::Sender<InitRequest>>,
	handle: ValueHandle,
}

pub struct SmpcStore {
	ctx: Arc<SmpcContext>,
	values: Mutex<HashMap<SlotId, ActiveSlot>>,
}

impl SmpcStore {
	pub fn new(ctx: Arc<SmpcContext>) -> Arc<Self> {
		Arc::new(SmpcStore { ctx, values: Mutex::new(HashMap::new()) })
	}

	pub fn context(&self) -> &Arc<SmpcContext> {
		&self.ctx
	}

	/// Start the protocol behind `slot`, creating the slot if no message
	/// has pre-created it yet. Calling this twice for the same slot is a
	/// no-op returning the existing handle.
	pub fn initiate(&self, slot: SlotId, request: InitRequest) -> ValueHandle {
		assert_eq!(slot.algorithm, request.algorithm(), "slot/request algorithm mismatch");

		let mut values = self.values.lock().expect("store lock cannot be poisoned");
		let entry = values
			.entry(slot.clone())
			.or_insert_with(|| self.spawn_slot(slot.clone()));

		if let Some(init_tx) = entry.init_tx.take() {
			// The task only disappears if the session is shutting down
			let _ = init_tx.send(request);
		} else {
			debug!(slot = %slot, "slot already initiated");
		}
		entry.handle.clone()
	}

	/// Route an incoming protocol message to its slot, pre-creating the
	/// slot when the local initiator has not shown up yet.
	pub fn deliver(&self, slot: SlotId, sender_rank: u32, data: SmpcData) {
		if sender_rank >= self.ctx.n {
			warn!(slot = %slot, sender_rank, "dropping message from out-of-range rank");
			return
		}
		let mut values = self.values.lock().expect("store lock cannot be poisoned");
		let entry = values
			.entry(slot.clone())
			.or_insert_with(|| self.spawn_slot(slot.clone()));
		if entry.msg_tx.send((sender_rank, data)).is_err() {
			debug!(slot = %slot, "slot task gone; late message absorbed");
		}
	}

	/// Look up the handle of an existing slot.
	pub fn handle(&self, slot: &SlotId) -> Option<ValueHandle> {
		self.values
			.lock()
			.expect("store lock cannot be poisoned")
			.get(slot)
			.map(|entry| entry.handle.clone())
	}

	/// Wrap a locally known share so it composes with other values.
	pub fn wrap(&self, share: BigUint) -> ValueHandle {
		let (secret_tx, secret) = promise();
		let (_public_tx, public) = promise();
		secret_tx.resolve(share);
		ValueHandle { threshold: self.ctx.t, secret, public }
	}

	/// `constant * value`, computed locally on the share.
	pub fn cmul(
		&self,
		constant: BigUint,
		value: &ValueHandle,
		field: &'static PrimeField,
	) -> ValueHandle {
		let (secret_tx, secret) = promise();
		let (_public_tx, public) = promise();
		let input = value.clone();
		tokio::spawn(async move {
			if let Some(share) = input.secret.wait().await {
				secret_tx.resolve(field.mul(&constant, &share));
			}
		});
		ValueHandle { threshold: value.threshold, secret, public }
	}

	/// `value1 + value2`, computed locally on the shares.
	pub fn add(
		&self,
		value1: &ValueHandle,
		value2: &ValueHandle,
		field: &'static PrimeField,
	) -> ValueHandle {
		let (secret_tx, secret) = promise();
		let (_public_tx, public) = promise();
		let (input1, input2) = (value1.clone(), value2.clone());
		tokio::spawn(async move {
			match (input1.secret.wait().await, input2.secret.wait().await) {
				(Some(share1), Some(share2)) =>
					secret_tx.resolve(field.add(&share1, &share2)),
				_ => {},
			}
		});
		ValueHandle { threshold: value1.threshold, secret, public }
	}

	fn spawn_slot(&self, slot: SlotId) -> ActiveSlot {
		let (msg_tx, msg_rx) = tokio::sync::mpsc::unbounded_channel();
		let (init_tx, init_rx) = oneshot::channel();
		let (secret_tx, secret) = promise();
		let (public_tx, public) = promise();

		let handle = ValueHandle { threshold: self.ctx.t, secret, public };

		let io = ValueTaskIo {
			ctx: self.ctx.clone(),
			slot: slot.clone(),
			secret: secret_tx,
			public: public_tx,
		};
		tokio::spawn(run_slot(io, msg_rx, init_rx));

		ActiveSlot { msg_tx, init_tx: Some(init_tx), handle }
	}
}

/// Plumbing handed to a protocol task.
pub(crate) struct ValueTaskIo {
	pub ctx: Arc<SmpcContext>,
	pub slot: SlotId,
	pub secret: PromiseResolver<BigUint>,
	pub public: PromiseResolver<PublicValue>,
}

async fn run_slot(
	io: ValueTaskIo,
	mut msg_rx: UnboundedReceiver<(u32, SmpcData)>,
	mut init_rx: oneshot::Receiver<InitRequest>,
) {
	// Park until the initiator attaches; messages arriving early are kept
	// in arrival order.
	let mut buffered = Vec::new();
	let init = loop {
		tokio::select! {
			Some(msg) = msg_rx.recv() => buffered.push(msg),
			res = &mut init_rx => match res {
				Ok(init) => break init,
				// Session shut down before the slot was ever initiated
				Err(_) => return,
			},
		}
	};

	let result = match init {
		InitRequest::Jfdkg { field } =>
			value::jfdkg::run(&io, field, buffered, &mut msg_rx).await,
		InitRequest::Dkg { field, h, with_public } =>
			value::dkg::run(&io, field, h, with_public, buffered, &mut msg_rx).await,
		InitRequest::Mul { factor1, factor2 } =>
			value::mul::run(&io, factor1, factor2, buffered, &mut msg_rx).await,
		InitRequest::Rec { value, field } =>
			value::rec::run(&io, value, field, buffered, &mut msg_rx).await,
	};

	if let Err(failure) = result {
		warn!(slot = %io.slot, error = %failure.error, "smpc value failed");
		let _ = io.ctx.failure_tx.send((io.slot.clone(), failure));
	}
}
