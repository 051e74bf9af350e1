//! JSON-RPC client for bitcoind, narrowed to the calls the commitment
//! poller and the transaction signer need. The trait exists so both can be
//! exercised against fixture chains in tests.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::errors::RpcError;
use crate::settings;

#[derive(Debug, Clone, Deserialize)]
pub struct Block {
	pub hash: String,
	pub tx: Vec<String>,
	#[serde(rename = "nextblockhash")]
	pub next_block_hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptPubKey {
	#[serde(default)]
	pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxOut {
	pub n: u32,
	/// Value in BTC, as bitcoind reports it.
	pub value: f64,
	#[serde(rename = "scriptPubKey")]
	pub script_pub_key: ScriptPubKey,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawTransaction {
	pub txid: String,
	pub vout: Vec<TxOut>,
	#[serde(default)]
	pub blockhash: Option<String>,
	#[serde(default)]
	pub confirmations: Option<u64>,
}

#[async_trait]
pub trait BtcRpcApi: Send + Sync {
	async fn best_block_hash(&self) -> Result<String, RpcError>;

	async fn block(&self, hash: &str) -> Result<Block, RpcError>;

	async fn raw_transaction(&self, txid: &str) -> Result<RawTransaction, RpcError>;

	async fn send_raw_transaction(&self, tx_hex: &str) -> Result<String, RpcError>;
}

pub struct BtcRpcClient {
	client: reqwest::Client,
	endpoint: String,
	user: String,
	password: String,
}

#[derive(Deserialize)]
struct JsonRpcError {
	code: i64,
	message: String,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
	result: Option<serde_json::Value>,
	error: Option<JsonRpcError>,
}

impl BtcRpcClient {
	pub fn new(btc_settings: &settings::Btc) -> Self {
		BtcRpcClient {
			client: reqwest::Client::new(),
			endpoint: btc_settings.rpc_endpoint.clone(),
			user: btc_settings.rpc_user.clone(),
			password: btc_settings.rpc_password.clone(),
		}
	}

	async fn call(
		&self,
		method: &str,
		params: serde_json::Value,
	) -> Result<serde_json::Value, RpcError> {
		let body = json!({
			"jsonrpc": "1.0",
			"id": "coinparty",
			"method": method,
			"params": params,
		});
		let response = self
			.client
			.post(&self.endpoint)
			.basic_auth(&self.user, Some(&self.password))
			.json(&body)
			.send()
			.await
			.map_err(|error| RpcError::Transport(error.to_string()))?;

		let response: JsonRpcResponse = response
			.json()
			.await
			.map_err(|error| RpcError::Malformed(error.to_string()))?;

		if let Some(error) = response.error {
			return Err(RpcError::Rpc { code: error.code, message: error.message })
		}
		response
			.result
			.ok_or_else(|| RpcError::Malformed("response carries neither result nor error".into()))
	}

	fn parse<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, RpcError> {
		serde_json::from_value(value).map_err(|error| RpcError::Malformed(error.to_string()))
	}
}

#[async_trait]
impl BtcRpcApi for BtcRpcClient {
	async fn best_block_hash(&self) -> Result<String, RpcError> {
		Self::parse(self.call("getbestblockhash", json!([])).await?)
	}

	async fn block(&self, hash: &str) -> Result<Block, RpcError> {
		Self::parse(self.call("getblock", json!([hash, true])).await?)
	}

	async fn raw_transaction(&self, txid: &str) -> Result<RawTransaction, RpcError> {
		Self::parse(self.call("getrawtransaction", json!([txid, true])).await?)
	}

	async fn send_raw_transaction(&self, tx_hex: &str) -> Result<String, RpcError> {
		Self::parse(self.call("sendrawtransaction", json!([tx_hex])).await?)
	}
}

#[async_trait]
impl<T: BtcRpcApi + Sync> BtcRpcApi for &T {
	async fn best_block_hash(&self) -> Result<String, RpcError> {
		(**self).best_block_hash().await
	}

	async fn block(&self, hash: &str) -> Result<Block, RpcError> {
		(**self).block(hash).await
	}

	async fn raw_transaction(&self, txid: &str) -> Result<RawTransaction, RpcError> {
		(**self).raw_transaction(txid).await
	}

	async fn send_raw_transaction(&self, tx_hex: &str) -> Result<String, RpcError> {
		(**self).send_raw_transaction(tx_hex).await
	}
}
