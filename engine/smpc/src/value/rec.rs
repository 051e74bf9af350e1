//! Decoupled recombination: publish every peer's share of a value and
//! robustly reconstruct it, making the value public.
//!
//! Recombination cannot use complaints; the shares may be outputs of local
//! computation with nothing to verify them against. Robust recombination
//! tolerates up to t corrupted or missing shares instead.

use num_bigint::BigUint;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

use crate::{
	error::ProtocolFailure,
	field::PrimeField,
	messages::SmpcData,
	shamir,
	store::{PublicValue, ValueHandle, ValueTaskIo},
};

use super::Collection;

pub(crate) async fn run(
	io: &ValueTaskIo,
	value: ValueHandle,
	field: &'static PrimeField,
	buffered: Vec<(u32, SmpcData)>,
	msg_rx: &mut UnboundedReceiver<(u32, SmpcData)>,
) -> Result<(), ProtocolFailure> {
	let (n, t) = (io.ctx.n, io.ctx.t);

	let own_share = value
		.secret_share()
		.await
		.map_err(ProtocolFailure::new)?;

	// The "secret" of a recombination is just the input share
	io.secret.resolve(own_share.clone());

	let mut received = Collection::new(n);
	received.accept(io.ctx.rank, own_share.clone());
	io.broadcast(SmpcData::PublicValue(field.to_bytes(&own_share)));

	let mut handle = |rank: u32, data: SmpcData, received: &mut Collection<BigUint>| {
		match data {
			SmpcData::PublicValue(bytes) => match field.from_bytes(&bytes) {
				Ok(share) => {
					received.accept(rank, share);
				},
				Err(_) => warn!(slot = %io.slot, rank, "unparseable opened share"),
			},
			other => warn!(
				slot = %io.slot,
				rank,
				kind = other.kind(),
				"unexpected message for recombination value"
			),
		}
	};

	for (rank, data) in buffered {
		handle(rank, data, &mut received);
	}

	let collect_timeout = tokio::time::sleep(io.ctx.share_timeout);
	tokio::pin!(collect_timeout);
	while !received.complete() {
		tokio::select! {
			Some((rank, data)) = msg_rx.recv() => handle(rank, data, &mut received),
			_ = &mut collect_timeout => break,
		}
	}
	received.close();

	let shares: Vec<(u32, Option<BigUint>)> =
		(0..n).map(|rank| (rank + 1, received.get(rank).cloned())).collect();
	let public_value = shamir::recombine(&shares, t, 0, field, true)
		.map_err(ProtocolFailure::new)?;

	debug!(slot = %io.slot, "recombined public value");
	io.public.resolve(PublicValue::Scalar(public_value));
	Ok(())
}
