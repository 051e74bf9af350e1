//! Static configuration of a mixing peer: the peer directory, the mixnet
//! memberships, the Bitcoin node, and the mixing parameters.

use std::collections::HashMap;

use config::{Config, ConfigError, File};
use secp256k1::{PublicKey, SecretKey};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Global {
	pub testnet: bool,
}

/// One entry of the peer directory. The private key is present only in the
/// peer's own entry of its local configuration file.
#[derive(Debug, Deserialize, Clone)]
pub struct MixingPeer {
	pub web_addr: String,
	pub pubkey_hex: String,
	pub prvkey_hex: Option<String>,
}

/// Membership of one peer in one mixnet.
#[derive(Debug, Deserialize, Clone)]
pub struct MixnetMember {
	pub rank: u32,
	pub p2p_addr: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Btc {
	pub rpc_endpoint: String,
	pub rpc_user: String,
	pub rpc_password: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Mixing {
	/// Escrow addresses precomputed per session; bounds the number of
	/// input users.
	#[serde(default = "default_escrow_count")]
	pub escrow_count: u32,
	#[serde(default = "default_min_input_peers")]
	pub min_input_peers: u32,
	#[serde(default = "default_commitment_window_secs")]
	pub commitment_window_secs: u64,
	#[serde(default = "default_mixing_window_mins")]
	pub mixing_window_mins: u64,
	/// Fixed per-user denomination, in BTC.
	#[serde(default = "default_bitcoin_value")]
	pub bitcoin_value_btc: f64,
	#[serde(default = "default_transaction_fee")]
	pub transaction_fee_btc: f64,
}

fn default_escrow_count() -> u32 {
	3
}
fn default_min_input_peers() -> u32 {
	3
}
fn default_commitment_window_secs() -> u64 {
	1800
}
fn default_mixing_window_mins() -> u64 {
	60
}
fn default_bitcoin_value() -> f64 {
	0.1
}
fn default_transaction_fee() -> f64 {
	0.0001
}

impl Default for Mixing {
	fn default() -> Self {
		Mixing {
			escrow_count: default_escrow_count(),
			min_input_peers: default_min_input_peers(),
			commitment_window_secs: default_commitment_window_secs(),
			mixing_window_mins: default_mixing_window_mins(),
			bitcoin_value_btc: default_bitcoin_value(),
			transaction_fee_btc: default_transaction_fee(),
		}
	}
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
	pub global: Global,
	/// peer id -> identity
	pub mixing_peers: HashMap<String, MixingPeer>,
	/// mixnet id -> (peer id -> membership)
	pub mixing_networks: HashMap<String, HashMap<String, MixnetMember>>,
	pub btc: Btc,
	#[serde(default)]
	pub mixing: Mixing,
}

impl Settings {
	pub fn from_file(path: &str) -> Result<Self, ConfigError> {
		let settings: Settings = Config::builder()
			.add_source(File::with_name(path))
			.build()?
			.try_deserialize()?;
		settings.validate()?;
		Ok(settings)
	}

	fn validate(&self) -> Result<(), ConfigError> {
		for (mixnet_id, members) in &self.mixing_networks {
			let mut ranks: Vec<u32> = Vec::new();
			for (peer_id, member) in members {
				if !self.mixing_peers.contains_key(peer_id) {
					return Err(ConfigError::Message(format!(
						"mixnet {mixnet_id} references unknown peer {peer_id}"
					)))
				}
				ranks.push(member.rank);
			}
			ranks.sort_unstable();
			if ranks != (0..members.len() as u32).collect::<Vec<_>>() {
				return Err(ConfigError::Message(format!(
					"mixnet {mixnet_id} ranks must be exactly 0..{}",
					members.len()
				)))
			}
		}
		Ok(())
	}

	/// The identity keys of this peer, required to run.
	pub fn local_keys(&self, peer_id: &str) -> anyhow::Result<(SecretKey, PublicKey)> {
		let peer = self
			.mixing_peers
			.get(peer_id)
			.ok_or_else(|| anyhow::anyhow!("peer {peer_id} not in configuration"))?;
		let prvkey_hex = peer
			.prvkey_hex
			.as_ref()
			.ok_or_else(|| anyhow::anyhow!("no private key configured for {peer_id}"))?;
		let secret = SecretKey::from_slice(&hex::decode(prvkey_hex)?)?;
		let public = PublicKey::from_slice(&hex::decode(&peer.pubkey_hex)?)?;
		anyhow::ensure!(
			public == secret.public_key(secp256k1::SECP256K1),
			"configured public key does not match the private key"
		);
		Ok((secret, public))
	}

	pub fn peer_pubkey(&self, peer_id: &str) -> anyhow::Result<PublicKey> {
		let peer = self
			.mixing_peers
			.get(peer_id)
			.ok_or_else(|| anyhow::anyhow!("peer {peer_id} not in configuration"))?;
		Ok(PublicKey::from_slice(&hex::decode(&peer.pubkey_hex)?)?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn settings_from_str(toml: &str) -> Result<Settings, ConfigError> {
		let settings: Settings = Config::builder()
			.add_source(File::from_str(toml, config::FileFormat::Toml))
			.build()?
			.try_deserialize()?;
		settings.validate()?;
		Ok(settings)
	}

	const EXAMPLE: &str = r#"
		[global]
		testnet = true

		[btc]
		rpc_endpoint = "http://127.0.0.1:18332"
		rpc_user = "user"
		rpc_password = "password"

		[mixing_peers.alpha]
		web_addr = "127.0.0.1:8081"
		pubkey_hex = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798"
		prvkey_hex = "0000000000000000000000000000000000000000000000000000000000000001"

		[mixing_peers.beta]
		web_addr = "127.0.0.1:8082"
		pubkey_hex = "02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5"

		[mixing_networks.testnet-1.alpha]
		rank = 0
		p2p_addr = "127.0.0.1:9091"

		[mixing_networks.testnet-1.beta]
		rank = 1
		p2p_addr = "127.0.0.1:9092"
	"#;

	#[test]
	fn parses_example_configuration() {
		let settings = settings_from_str(EXAMPLE).unwrap();
		assert!(settings.global.testnet);
		assert_eq!(settings.mixing_networks["testnet-1"]["beta"].rank, 1);
		assert_eq!(settings.mixing.escrow_count, 3);

		let (secret, public) = settings.local_keys("alpha").unwrap();
		assert_eq!(public, secret.public_key(secp256k1::SECP256K1));
		assert!(settings.local_keys("beta").is_err());
	}

	#[test]
	fn rejects_gapped_ranks() {
		let broken = EXAMPLE.replace("rank = 1", "rank = 2");
		assert!(settings_from_str(&broken).is_err());
	}

	#[test]
	fn rejects_unknown_peer_reference() {
		let broken = EXAMPLE.replace("mixing_networks.testnet-1.beta", "mixing_networks.testnet-1.gamma");
		assert!(settings_from_str(&broken).is_err());
	}
}
