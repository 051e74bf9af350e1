use lazy_static::lazy_static;
use num_bigint::BigUint;
use num_traits::Zero;
use secp256k1::{PublicKey, Secp256k1};

use crate::{
	error::SmpcError,
	field::{PrimeField, SECP256K1_ORDER},
};

pub const COMPRESSED_POINT_LEN: usize = 33;
pub const UNCOMPRESSED_POINT_LEN: usize = 65;

const GENERATOR_COMPRESSED: [u8; 33] = [
	0x02, 0x79, 0xBE, 0x66, 0x7E, 0xF9, 0xDC, 0xBB, 0xAC, 0x55, 0xA0, 0x62, 0x95, 0xCE, 0x87, 0x0B,
	0x07, 0x02, 0x9B, 0xFC, 0xDB, 0x2D, 0xCE, 0x28, 0xD9, 0x59, 0xF2, 0x81, 0x5B, 0x16, 0xF8, 0x17,
	0x98,
];

lazy_static! {
	static ref GENERATOR: Point = Point(Some(
		PublicKey::from_slice(&GENERATOR_COMPRESSED).expect("generator constant must be valid")
	));
}

/// A point on secp256k1. `None` encodes the point at infinity, which
/// libsecp cannot represent directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Point(Option<PublicKey>);

impl Point {
	pub fn generator() -> Point {
		*GENERATOR
	}

	pub fn infinity() -> Point {
		Point(None)
	}

	pub fn is_infinity(&self) -> bool {
		self.0.is_none()
	}

	/// `scalar * G`.
	pub fn from_scalar(scalar: &BigUint) -> Point {
		Point::generator().mul_scalar(scalar)
	}

	/// Scalar multiplication; the scalar is reduced into the group first.
	pub fn mul_scalar(&self, scalar: &BigUint) -> Point {
		let scalar = SECP256K1_ORDER.reduce(scalar.clone());
		let inner = match (self.0, scalar.is_zero()) {
			(None, _) | (_, true) => None,
			(Some(point), false) => {
				let tweak = secp256k1::Scalar::from_be_bytes(
					scalar_bytes(&scalar),
				)
				.expect("scalar is reduced and non-zero");
				Some(
					point
						.mul_tweak(secp256k1::SECP256K1, &tweak)
						.expect("scalar must be valid and non-zero"),
				)
			},
		};
		Point(inner)
	}

	pub fn add(&self, rhs: &Point) -> Point {
		let inner = match (self.0, rhs.0) {
			(None, rhs) => rhs,
			(lhs, None) => lhs,
			// `combine` only fails when the result is the point at
			// infinity, which we represent with `None`
			(Some(lhs), Some(rhs)) => lhs.combine(&rhs).ok(),
		};
		Point(inner)
	}

	pub fn negate(&self) -> Point {
		Point(self.0.map(|p| p.negate(&Secp256k1::new())))
	}

	pub fn sum<I: IntoIterator<Item = Point>>(points: I) -> Point {
		points.into_iter().fold(Point::infinity(), |acc, p| acc.add(&p))
	}

	pub fn serialize_compressed(&self) -> Result<[u8; COMPRESSED_POINT_LEN], SmpcError> {
		self.0.map(|p| p.serialize()).ok_or(SmpcError::PointAtInfinity)
	}

	/// `0x04 || X || Y`; the form Bitcoin addresses are derived from.
	pub fn serialize_uncompressed(&self) -> Result<[u8; UNCOMPRESSED_POINT_LEN], SmpcError> {
		self.0.map(|p| p.serialize_uncompressed()).ok_or(SmpcError::PointAtInfinity)
	}

	pub fn deserialize(bytes: &[u8]) -> Result<Point, SmpcError> {
		if bytes.len() != COMPRESSED_POINT_LEN && bytes.len() != UNCOMPRESSED_POINT_LEN {
			return Err(SmpcError::MalformedPoint)
		}
		PublicKey::from_slice(bytes)
			.map(|p| Point(Some(p)))
			.map_err(|_| SmpcError::MalformedPoint)
	}

	/// The affine x coordinate reduced into the scalar field; this is the
	/// `r` of an ECDSA signature when applied to `k * G`.
	pub fn x_scalar(&self) -> Result<BigUint, SmpcError> {
		let bytes = self.serialize_uncompressed()?;
		Ok(SECP256K1_ORDER.reduce(BigUint::from_bytes_be(&bytes[1..33])))
	}
}

fn scalar_bytes(scalar: &BigUint) -> [u8; 32] {
	let raw = scalar.to_bytes_be();
	let mut out = [0u8; 32];
	out[32 - raw.len()..].copy_from_slice(&raw);
	out
}

/// Wire form of a commitment vector: `u8 count | count * 65-byte points`.
pub fn serialize_points(points: &[Point]) -> Result<Vec<u8>, SmpcError> {
	let mut out = Vec::with_capacity(1 + points.len() * UNCOMPRESSED_POINT_LEN);
	out.push(u8::try_from(points.len()).map_err(|_| SmpcError::MalformedPoint)?);
	for point in points {
		out.extend_from_slice(&point.serialize_uncompressed()?);
	}
	Ok(out)
}

pub fn deserialize_points(bytes: &[u8]) -> Result<Vec<Point>, SmpcError> {
	let count = *bytes.first().ok_or(SmpcError::MalformedPoint)? as usize;
	if bytes.len() != 1 + count * UNCOMPRESSED_POINT_LEN {
		return Err(SmpcError::MalformedPoint)
	}
	(0..count)
		.map(|i| {
			let offset = 1 + i * UNCOMPRESSED_POINT_LEN;
			Point::deserialize(&bytes[offset..offset + UNCOMPRESSED_POINT_LEN])
		})
		.collect()
}

/// Access to the field the curve's scalars live in.
pub fn scalar_field() -> &'static PrimeField {
	&SECP256K1_ORDER
}

#[cfg(test)]
mod tests {
	use super::*;
	use num_traits::One;

	#[test]
	fn generator_times_one() {
		let p = Point::from_scalar(&BigUint::one());
		assert_eq!(p, Point::generator());
	}

	#[test]
	fn known_generator_coordinates() {
		// Uncompressed form of G, as listed for secp256k1
		let bytes = Point::generator().serialize_uncompressed().unwrap();
		assert_eq!(
			hex::encode(bytes),
			"0479be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798\
			483ada7726a3c4655da4fbfc0e1108a8fd17b448a68554199c47d08ffb10d4b8"
		);
	}

	#[test]
	fn serde_round_trip() {
		let scalar = SECP256K1_ORDER.random();
		let p = Point::from_scalar(&scalar);
		assert_eq!(Point::deserialize(&p.serialize_compressed().unwrap()).unwrap(), p);
		assert_eq!(Point::deserialize(&p.serialize_uncompressed().unwrap()).unwrap(), p);
	}

	#[test]
	fn scalar_mul_distributes_over_add() {
		// (a + b) * G == a * G + b * G
		let f = scalar_field();
		let a = f.random();
		let b = f.random();
		let lhs = Point::from_scalar(&f.add(&a, &b));
		let rhs = Point::from_scalar(&a).add(&Point::from_scalar(&b));
		assert_eq!(lhs, rhs);
	}

	#[test]
	fn zero_scalar_gives_infinity() {
		use num_traits::Zero;
		let p = Point::from_scalar(&BigUint::zero());
		assert!(p.is_infinity());
		assert!(p.serialize_compressed().is_err());
	}

	#[test]
	fn point_vector_round_trip() {
		let points: Vec<Point> =
			(1u32..=4).map(|i| Point::from_scalar(&BigUint::from(i))).collect();
		let bytes = serialize_points(&points).unwrap();
		assert_eq!(bytes.len(), 1 + 4 * UNCOMPRESSED_POINT_LEN);
		assert_eq!(deserialize_points(&bytes).unwrap(), points);
	}
}
