use lazy_static::lazy_static;
use num_bigint::{BigUint, RandBigInt};
use num_traits::{One, Zero};
use secp256k1::constants::CURVE_ORDER;

use crate::error::SmpcError;

lazy_static! {
	/// Order of the secp256k1 group; the field all key material lives in.
	pub static ref SECP256K1_ORDER: PrimeField =
		PrimeField::new(BigUint::from_bytes_be(&CURVE_ORDER));

	/// Prime used when secret-sharing SHA-256 digests. The digest domain
	/// exceeds the group order, so sharing happens over 2^265 - 49 instead.
	pub static ref HASH_SHARING_PRIME: PrimeField =
		PrimeField::new((BigUint::one() << 265u32) - BigUint::from(49u32));

	/// Checksums are reduced to 256 bits before being rendered or used
	/// as a permutation seed.
	pub static ref HASH_CHECKSUM_MODULUS: BigUint = BigUint::one() << 256u32;
}

/// A prime field given by its modulus. Elements are plain `BigUint`s reduced
/// modulo the field order; all arithmetic goes through these methods so the
/// reduction cannot be forgotten.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrimeField {
	modulus: BigUint,
}

impl PrimeField {
	pub fn new(modulus: BigUint) -> Self {
		assert!(modulus > BigUint::one());
		PrimeField { modulus }
	}

	pub fn modulus(&self) -> &BigUint {
		&self.modulus
	}

	/// Width of a serialized element in bytes.
	pub fn element_len(&self) -> usize {
		((self.modulus.bits() as usize) + 7) / 8
	}

	pub fn reduce(&self, x: BigUint) -> BigUint {
		x % &self.modulus
	}

	pub fn add(&self, a: &BigUint, b: &BigUint) -> BigUint {
		(a + b) % &self.modulus
	}

	pub fn sub(&self, a: &BigUint, b: &BigUint) -> BigUint {
		((a % &self.modulus) + &self.modulus - (b % &self.modulus)) % &self.modulus
	}

	pub fn mul(&self, a: &BigUint, b: &BigUint) -> BigUint {
		(a * b) % &self.modulus
	}

	pub fn neg(&self, a: &BigUint) -> BigUint {
		if a.is_zero() {
			BigUint::zero()
		} else {
			&self.modulus - (a % &self.modulus)
		}
	}

	/// Modular multiplicative inverse, by raising to `modulus - 2`
	/// (the modulus is prime).
	pub fn invert(&self, a: &BigUint) -> Result<BigUint, SmpcError> {
		if (a % &self.modulus).is_zero() {
			return Err(SmpcError::ZeroInversion)
		}
		Ok(a.modpow(&(&self.modulus - 2u32), &self.modulus))
	}

	pub fn div(&self, a: &BigUint, b: &BigUint) -> Result<BigUint, SmpcError> {
		Ok(self.mul(a, &self.invert(b)?))
	}

	pub fn pow(&self, base: &BigUint, exp: u32) -> BigUint {
		base.modpow(&BigUint::from(exp), &self.modulus)
	}

	/// Uniformly random element of the field.
	pub fn random(&self) -> BigUint {
		let mut rng = rand::thread_rng();
		rng.gen_biguint_below(&self.modulus)
	}

	/// Fixed-width big-endian serialization of an element.
	pub fn to_bytes(&self, x: &BigUint) -> Vec<u8> {
		let raw = x.to_bytes_be();
		let width = self.element_len();
		let mut out = vec![0u8; width - raw.len()];
		out.extend_from_slice(&raw);
		out
	}

	/// Parse a big-endian element; values outside the field are rejected
	/// rather than silently reduced.
	pub fn from_bytes(&self, bytes: &[u8]) -> Result<BigUint, SmpcError> {
		let x = BigUint::from_bytes_be(bytes);
		if x >= self.modulus {
			return Err(SmpcError::ElementOutOfRange)
		}
		Ok(x)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn inversion_round_trips() {
		let f = &*SECP256K1_ORDER;
		for _ in 0..16 {
			let x = f.random();
			if x.is_zero() {
				continue
			}
			let inv = f.invert(&x).unwrap();
			assert_eq!(f.mul(&x, &inv), BigUint::one());
		}
	}

	#[test]
	fn zero_has_no_inverse() {
		assert!(matches!(
			SECP256K1_ORDER.invert(&BigUint::zero()),
			Err(SmpcError::ZeroInversion)
		));
	}

	#[test]
	fn subtraction_wraps() {
		let f = &*SECP256K1_ORDER;
		let a = BigUint::from(1u32);
		let b = BigUint::from(2u32);
		let diff = f.sub(&a, &b);
		assert_eq!(f.add(&diff, &b), a);
	}

	#[test]
	fn element_widths() {
		// 256-bit group order and the 265-bit hash prime
		assert_eq!(SECP256K1_ORDER.element_len(), 32);
		assert_eq!(HASH_SHARING_PRIME.element_len(), 34);
	}

	#[test]
	fn hash_prime_value() {
		// 2^265 - 49
		assert_eq!(
			hex::encode(HASH_SHARING_PRIME.modulus().to_bytes_be()),
			"01ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffcf"
		);
	}

	#[test]
	fn serialization_is_fixed_width() {
		let f = &*SECP256K1_ORDER;
		let one = BigUint::one();
		let bytes = f.to_bytes(&one);
		assert_eq!(bytes.len(), 32);
		assert_eq!(f.from_bytes(&bytes).unwrap(), one);
	}

	#[test]
	fn out_of_range_element_rejected() {
		let f = &*SECP256K1_ORDER;
		let too_big = f.modulus().clone();
		assert!(f.from_bytes(&f.to_bytes(&too_big)).is_err());
	}
}
