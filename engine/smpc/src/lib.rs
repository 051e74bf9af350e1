//! Threshold SMPC engine of the CoinParty mixing peer: Shamir sharing over
//! the secp256k1 scalar field (and over the larger prime used for hash
//! shares), verifiable distributed key generation, share multiplication and
//! recombination, composed through a per-session store of shared values.

pub mod address;
pub mod curve;
pub mod error;
pub mod field;
pub mod messages;
pub mod promise;
pub mod shamir;
pub mod store;
mod value;

pub use error::{ProtocolFailure, SmpcError};
pub use messages::{
	Algorithm, OutgoingSmpcMessages, SlotId, SmpcData, SmpcEnvelope,
};
pub use store::{
	threshold_from_peer_count, InitRequest, PublicValue, SmpcContext, SmpcStore, ValueHandle,
};

use num_bigint::BigUint;
use num_traits::Zero;
use zeroize::Zeroize;

/// A scalar that is wiped when it leaves scope. Escrow key material is held
/// in these so consuming an escrow (or tearing a session down) destroys the
/// shares.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretScalar(BigUint);

impl SecretScalar {
	pub fn new(value: BigUint) -> Self {
		SecretScalar(value)
	}

	pub fn expose(&self) -> &BigUint {
		&self.0
	}

	pub fn take(mut self) -> BigUint {
		std::mem::take(&mut self.0)
	}
}

impl Zeroize for SecretScalar {
	fn zeroize(&mut self) {
		self.0.set_zero();
	}
}

impl Drop for SecretScalar {
	fn drop(&mut self) {
		self.zeroize();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use num_traits::One;

	#[test]
	fn secret_scalar_zeroizes() {
		let mut s = SecretScalar::new(BigUint::one());
		s.zeroize();
		assert!(s.expose().is_zero());
	}
}
