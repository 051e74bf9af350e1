//! The user-facing HTTP surface. Informational only, apart from the three
//! inbound operations the core consumes: register, deposit-hash-share and
//! verify. Everything else about mixing happens peer-to-peer.

use std::{collections::HashMap, sync::Arc};

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use smpc::field::HASH_SHARING_PRIME;
use tracing::{debug, info};
use warp::{http::StatusCode, Filter};

use crate::mixing::session::MixingSession;

pub type SessionMap = Arc<HashMap<String, Arc<MixingSession>>>;

#[derive(Deserialize)]
pub struct RegisterRequest {
	/// Onion-encrypted output address, hex encoded.
	pub encrypted_output_hex: String,
}

#[derive(Serialize)]
pub struct RegisterResponse {
	pub session_id_hex: String,
	pub escrow_address: String,
	pub escrow_pubkey_hex: String,
	pub pin: u32,
}

#[derive(Deserialize)]
pub struct HashShareRequest {
	pub session_id_hex: String,
	/// One share per decryption layer, hex encoded.
	pub shares_hex: Vec<String>,
	/// Binds the submission to the registration; currently only logged.
	pub hmac_nonce_hex: String,
}

#[derive(Deserialize)]
pub struct VerifyQuery {
	pub session_id_hex: String,
	pub escrow: String,
	pub value: f64,
}

#[derive(Serialize)]
pub struct SessionInfo {
	pub phase: char,
	pub escrow_address: Option<String>,
	pub value_btc: f64,
}

#[derive(Serialize)]
struct ErrorBody {
	error: String,
}

#[derive(Serialize)]
struct AckBody {
	ack: bool,
}

/// A short confirmation code users can quote; derived from the session id.
fn pin_from_session_id(session_id: &[u8; 32]) -> u32 {
	u32::from_be_bytes(session_id[..4].try_into().expect("4 bytes")) % 1_000_000
}

pub async fn run_web_server(
	listen_addr: std::net::SocketAddr,
	sessions: SessionMap,
	peer_web_addrs: Vec<String>,
) {
	let origins: Vec<String> =
		peer_web_addrs.iter().map(|addr| format!("http://{addr}")).collect();
	let cors = warp::cors()
		.allow_origins(origins.iter().map(String::as_str))
		.allow_methods(vec!["GET", "POST"])
		.allow_header("content-type");

	let with_sessions = {
		let sessions = sessions.clone();
		warp::any().map(move || sessions.clone())
	};

	let register = warp::path!("mixnet" / String / "register")
		.and(warp::post())
		.and(warp::body::json())
		.and(with_sessions.clone())
		.map(handle_register);

	let hash_share = warp::path!("mixnet" / String / "hash-share")
		.and(warp::post())
		.and(warp::body::json())
		.and(with_sessions.clone())
		.map(handle_hash_share);

	let session_info = warp::path!("mixnet" / String / "session" / String)
		.and(warp::get())
		.and(with_sessions.clone())
		.map(handle_session_info);

	let verify = warp::path!("mixnet" / String / "verify")
		.and(warp::get())
		.and(warp::query::<VerifyQuery>())
		.and(with_sessions)
		.map(handle_verify);

	info!(%listen_addr, "web server listening");
	warp::serve(register.or(hash_share).or(session_info).or(verify).with(cors))
		.run(listen_addr)
		.await;
}

fn error_reply(status: StatusCode, error: &str) -> warp::reply::WithStatus<warp::reply::Json> {
	warp::reply::with_status(
		warp::reply::json(&ErrorBody { error: error.to_string() }),
		status,
	)
}

fn handle_register(
	mixnet_id: String,
	request: RegisterRequest,
	sessions: SessionMap,
) -> warp::reply::WithStatus<warp::reply::Json> {
	let Some(session) = sessions.get(&mixnet_id) else {
		return error_reply(StatusCode::NOT_FOUND, "mixnet_not_found")
	};
	let Ok(encrypted_output) = hex::decode(&request.encrypted_output_hex) else {
		return error_reply(StatusCode::BAD_REQUEST, "bad_output_encoding")
	};
	match session.register_input_peer(encrypted_output) {
		Ok((session_id, _index, escrow_address, escrow_pubkey)) => warp::reply::with_status(
			warp::reply::json(&RegisterResponse {
				session_id_hex: hex::encode(session_id),
				escrow_address,
				escrow_pubkey_hex: hex::encode(escrow_pubkey),
				pin: pin_from_session_id(&session_id),
			}),
			StatusCode::OK,
		),
		Err(error) => error_reply(StatusCode::CONFLICT, &error),
	}
}

fn handle_hash_share(
	mixnet_id: String,
	request: HashShareRequest,
	sessions: SessionMap,
) -> warp::reply::WithStatus<warp::reply::Json> {
	let Some(session) = sessions.get(&mixnet_id) else {
		return error_reply(StatusCode::NOT_FOUND, "mixnet_not_found")
	};
	let Some(session_id) = decode_session_id(&request.session_id_hex) else {
		return error_reply(StatusCode::BAD_REQUEST, "bad_session_id")
	};

	let field = &*HASH_SHARING_PRIME;
	let mut shares = Vec::with_capacity(request.shares_hex.len());
	for share_hex in &request.shares_hex {
		let Ok(bytes) = hex::decode(share_hex) else {
			return error_reply(StatusCode::BAD_REQUEST, "bad_share_encoding")
		};
		let share = BigUint::from_bytes_be(&bytes);
		if &share >= field.modulus() {
			return error_reply(StatusCode::BAD_REQUEST, "share_out_of_range")
		}
		shares.push(share);
	}

	debug!(hmac_nonce = request.hmac_nonce_hex, "hash share submission");
	match session.input_peers.deposit_hash_share(&session_id, shares) {
		Ok(()) => warp::reply::with_status(
			warp::reply::json(&AckBody { ack: true }),
			StatusCode::OK,
		),
		Err(error) => error_reply(StatusCode::CONFLICT, &error),
	}
}

fn handle_session_info(
	mixnet_id: String,
	session_id_hex: String,
	sessions: SessionMap,
) -> warp::reply::WithStatus<warp::reply::Json> {
	let Some(session) = sessions.get(&mixnet_id) else {
		return error_reply(StatusCode::NOT_FOUND, "mixnet_not_found")
	};
	let Some(session_id) = decode_session_id(&session_id_hex) else {
		return error_reply(StatusCode::BAD_REQUEST, "bad_session_id")
	};
	let escrow_address = session
		.input_peers
		.slot_by_session(&session_id)
		.map(|slot| slot.address);
	warp::reply::with_status(
		warp::reply::json(&SessionInfo {
			phase: session.phase().as_char(),
			escrow_address,
			value_btc: session.mixing.bitcoin_value_btc,
		}),
		StatusCode::OK,
	)
}

fn handle_verify(
	mixnet_id: String,
	query: VerifyQuery,
	sessions: SessionMap,
) -> warp::reply::WithStatus<warp::reply::Json> {
	let Some(session) = sessions.get(&mixnet_id) else {
		return error_reply(StatusCode::NOT_FOUND, "mixnet_not_found")
	};
	let Some(session_id) = decode_session_id(&query.session_id_hex) else {
		return error_reply(StatusCode::BAD_REQUEST, "bad_session_id")
	};
	let ack = session
		.input_peers
		.slot_by_session(&session_id)
		.map(|slot| {
			slot.address == query.escrow &&
				(query.value - session.mixing.bitcoin_value_btc).abs() < f64::EPSILON
		})
		.unwrap_or(false);
	warp::reply::with_status(warp::reply::json(&AckBody { ack }), StatusCode::OK)
}

fn decode_session_id(session_id_hex: &str) -> Option<[u8; 32]> {
	hex::decode(session_id_hex).ok()?.try_into().ok()
}
