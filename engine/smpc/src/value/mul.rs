//! Share multiplication by degree reduction: multiply locally (degree 2t),
//! re-share the product with degree t, and interpolate the received
//! subshares at zero.
//!
//! This construction assumes the peers follow the protocol; it does not
//! withstand actively malicious subshares. Restrict deployments to an
//! honest-but-curious committee or replace this module with a verifiable
//! resharing.

use num_bigint::BigUint;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::warn;

use crate::{
	error::{ProtocolFailure, SmpcError},
	messages::SmpcData,
	shamir,
	store::{ValueHandle, ValueTaskIo},
};

use super::Collection;

pub(crate) async fn run(
	io: &ValueTaskIo,
	factor1: ValueHandle,
	factor2: ValueHandle,
	buffered: Vec<(u32, SmpcData)>,
	msg_rx: &mut UnboundedReceiver<(u32, SmpcData)>,
) -> Result<(), ProtocolFailure> {
	if factor1.threshold != factor2.threshold {
		return Err(ProtocolFailure::new(SmpcError::MismatchedThresholds))
	}
	// The local product is a share of a degree-2t polynomial
	let subshare_t = 2 * factor1.threshold;

	let field = crate::curve::scalar_field();
	let (n, t) = (io.ctx.n, io.ctx.t);

	let share1 = factor1
		.secret_share()
		.await
		.map_err(ProtocolFailure::new)?;
	let share2 = factor2
		.secret_share()
		.await
		.map_err(ProtocolFailure::new)?;
	let product = field.mul(&share1, &share2);

	// Degree reduction: re-share the product with a fresh degree-t
	// polynomial and hand subshare j to peer j
	let (subshares, _) = shamir::share(&product, n, t, field);
	let subshares: Vec<BigUint> = subshares.into_iter().map(|(_, s)| s).collect();

	let mut received = Collection::new(n);
	received.accept(io.ctx.rank, subshares[io.ctx.rank as usize].clone());

	{
		let subshares = subshares.clone();
		io.eachcast(move |rank| {
			SmpcData::SecretShare(field.to_bytes(&subshares[rank as usize]))
		});
	}

	let mut handle = |rank: u32, data: SmpcData, received: &mut Collection<BigUint>| {
		match data {
			SmpcData::SecretShare(bytes) => match field.from_bytes(&bytes) {
				Ok(share) => {
					received.accept(rank, share);
				},
				Err(_) => warn!(slot = %io.slot, rank, "unparseable subshare"),
			},
			other => warn!(
				slot = %io.slot,
				rank,
				kind = other.kind(),
				"unexpected message for multiplication value"
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

	// Interpolate the original degree-2t polynomial at zero; the result
	// is this peer's degree-t share of the product
	let shares: Vec<(u32, Option<BigUint>)> =
		(0..n).map(|rank| (rank + 1, received.get(rank).cloned())).collect();
	let secret_share = shamir::recombine(&shares, subshare_t, 0, field, false)
		.map_err(ProtocolFailure::new)?;

	io.secret.resolve(secret_share);
	Ok(())
}
