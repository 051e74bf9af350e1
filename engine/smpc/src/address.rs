use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// P2PKH version bytes.
const VERSION_MAINNET: u8 = 0x00;
const VERSION_TESTNET: u8 = 0x6F;

pub fn version_byte(testnet: bool) -> u8 {
	if testnet {
		VERSION_TESTNET
	} else {
		VERSION_MAINNET
	}
}

pub fn hash160(data: &[u8]) -> [u8; 20] {
	Ripemd160::digest(Sha256::digest(data)).into()
}

/// Base58check P2PKH address of a serialized public key
/// (`version || ripemd160(sha256(pubkey))` plus checksum).
pub fn pubkey_to_bitcoin_address(pubkey: &[u8], testnet: bool) -> String {
	let mut payload = Vec::with_capacity(21);
	payload.push(version_byte(testnet));
	payload.extend_from_slice(&hash160(pubkey));
	bs58::encode(payload).with_check().into_string()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::curve::Point;
	use num_bigint::BigUint;
	use num_traits::One;

	#[test]
	fn address_for_private_key_one() {
		// d = 1 makes the public key the generator itself; the resulting
		// addresses are well-known fixtures.
		let pubkey = Point::from_scalar(&BigUint::one()).serialize_uncompressed().unwrap();
		assert_eq!(
			pubkey_to_bitcoin_address(&pubkey, true),
			"mrCDrCybB6J1vRfbwM5hemdJz73FwDBC8r"
		);
		assert_eq!(
			pubkey_to_bitcoin_address(&pubkey, false),
			"1EHNa6Q4Jz2uvNExL497mE43ikXhwF6kZm"
		);
	}

	#[test]
	fn testnet_and_mainnet_differ() {
		let pubkey = Point::from_scalar(&BigUint::from(42u32))
			.serialize_uncompressed()
			.unwrap();
		assert_ne!(
			pubkey_to_bitcoin_address(&pubkey, true),
			pubkey_to_bitcoin_address(&pubkey, false)
		);
	}
}
