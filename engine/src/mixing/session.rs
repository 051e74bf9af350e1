//! One mixing session: the composition root tying the transport, the
//! shared-value engine, the input-peer table and the phase pipeline
//! together, under a single error promise whose resolution shuts this
//! session down without touching any other.

use std::sync::{Arc, Mutex};

use bitcoin::Amount;
use engine_p2p::{
	DeliverFn, LocalPeer, MessageType, Outbound, Payload, PeerCrypt, PeerEndpoint,
	TransactionStore,
};
use rand::RngCore;
use secp256k1::{PublicKey, SecretKey};
use smpc::{
	curve::scalar_field,
	promise::{promise, Promise, PromiseResolver},
	Algorithm, InitRequest, OutgoingSmpcMessages, SlotId, SmpcContext, SmpcStore,
};
use tokio::sync::{
	mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
	watch,
};
use tracing::{error, info, warn};

use crate::{
	btc::{poller::DepositPoller, rpc::BtcRpcApi},
	errors::SessionError,
	mixing::{
		escrow::{self, Escrow},
		input_peers::InputPeerTable,
		shuffle::{ShuffleDriver, ShuffleResult},
		signing,
	},
	settings,
};

/// The protocol flow positions shown to users.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
	Null,
	NewInputPeer,
	EscrowConfirmation,
	Waiting,
	Initializing,
	Streaming,
	Halted,
}

impl Phase {
	pub fn as_char(&self) -> char {
		match self {
			Phase::Null => '0',
			Phase::NewInputPeer => 'N',
			Phase::EscrowConfirmation => 'E',
			Phase::Waiting => 'W',
			Phase::Initializing => 'I',
			Phase::Streaming => 'S',
			Phase::Halted => 'H',
		}
	}
}

pub struct SessionParams {
	pub mixnet_id: String,
	pub rank: u32,
	/// (rank, p2p address) of every other member.
	pub peers: Vec<(u16, String)>,
	/// Identity keys of all members, indexed by rank.
	pub peer_pubkeys: Vec<PublicKey>,
	pub identity: SecretKey,
	pub listen_addr: String,
	pub testnet: bool,
	pub mixing: settings::Mixing,
}

pub struct MixingSession {
	pub mixnet_id: String,
	pub rank: u32,
	pub n: u32,
	pub t: u32,
	pub testnet: bool,
	pub mixing: settings::Mixing,
	pub smpc: Arc<SmpcStore>,
	pub transactions: Arc<TransactionStore>,
	pub input_peers: Arc<InputPeerTable>,
	identity: SecretKey,
	endpoint: Arc<PeerEndpoint>,
	listen_addr: String,
	peers: Vec<(u16, String)>,
	phase_tx: watch::Sender<Phase>,
	phase_rx: watch::Receiver<Phase>,
	error_tx: PromiseResolver<SessionError>,
	error_rx: Promise<SessionError>,
	/// ADDR lists from other peers, consumed by the shuffle driver.
	addr_rx: Mutex<Option<UnboundedReceiver<(u32, Vec<Vec<u8>>)>>>,
}

impl MixingSession {
	pub fn create(params: SessionParams) -> Arc<Self> {
		let n = params.peers.len() as u32 + 1;
		let t = smpc::threshold_from_peer_count(n);
		let crypt = Arc::new(PeerCrypt {
			secret: params.identity,
			publics: params.peer_pubkeys.clone(),
		});

		let endpoint = PeerEndpoint::new();
		let input_peers = Arc::new(InputPeerTable::new(
			n,
			params.mixing.min_input_peers,
			params.mixing.escrow_count,
		));

		let (addr_tx, addr_rx) = unbounded_channel();
		let (outgoing_tx, outgoing_rx) = unbounded_channel();
		let (failure_tx, failure_rx) = unbounded_channel();
		let (error_tx, error_rx) = promise();

		let smpc = SmpcStore::new(Arc::new(SmpcContext {
			rank: params.rank,
			n,
			t,
			outgoing: outgoing_tx,
			failure_tx,
			share_timeout: std::time::Duration::from_secs(60),
			complaint_timeout: std::time::Duration::from_secs(60),
		}));

		let outbound: Arc<dyn Outbound> = endpoint.clone();
		let transactions = TransactionStore::new(
			LocalPeer { rank: params.rank as u16, n: n as u16, t: t as u16, crypt },
			outbound,
			Self::deliver_fn(smpc.clone(), input_peers.clone(), addr_tx),
		);

		// Outgoing SMPC traffic maps onto the transaction kinds
		tokio::spawn(run_smpc_bridge(outgoing_rx, transactions.clone()));

		// Any protocol failure is fatal to this session
		{
			let error_tx = error_tx.clone();
			let mixnet_id = params.mixnet_id.clone();
			let mut failure_rx = failure_rx;
			tokio::spawn(async move {
				if let Some((slot, failure)) = failure_rx.recv().await {
					error!(mixnet_id, %slot, error = %failure.error, "smpc failure");
					error_tx.resolve(SessionError::SmpcFailure {
						slot,
						reason: failure.error.to_string(),
					});
				}
			});
		}

		let (phase_tx, phase_rx) = watch::channel(Phase::Null);

		Arc::new(MixingSession {
			mixnet_id: params.mixnet_id,
			rank: params.rank,
			n,
			t,
			testnet: params.testnet,
			mixing: params.mixing,
			smpc,
			transactions,
			input_peers,
			identity: params.identity,
			endpoint,
			listen_addr: params.listen_addr,
			peers: params.peers,
			phase_tx,
			phase_rx,
			error_tx,
			error_rx,
			addr_rx: Mutex::new(Some(addr_rx)),
		})
	}

	fn deliver_fn(
		smpc: Arc<SmpcStore>,
		input_peers: Arc<InputPeerTable>,
		addr_tx: UnboundedSender<(u32, Vec<Vec<u8>>)>,
	) -> DeliverFn {
		Arc::new(move |from, payload| match payload {
			Payload::Smpc { slot, data } => {
				smpc.deliver(slot, from as u32, data);
				Ok(())
			},
			Payload::Helo { session_id, escrow_address, encrypted_output } =>
				input_peers.flag_input_peer(&escrow_address, session_id, encrypted_output),
			Payload::Addr { outputs } => {
				let _ = addr_tx.send((from as u32, outputs));
				Ok(())
			},
			Payload::Ackn { .. } | Payload::Cbrc(_) | Payload::Rbrc(_) =>
				Err("unexpected_message".to_string()),
		})
	}

	pub async fn start_network(self: &Arc<Self>) -> anyhow::Result<()> {
		self.endpoint
			.start(self.listen_addr.clone(), self.peers.clone(), self.transactions.clone())
			.await
	}

	pub fn phase(&self) -> Phase {
		*self.phase_rx.borrow()
	}

	fn set_phase(&self, phase: Phase) {
		info!(mixnet_id = self.mixnet_id, phase = %phase.as_char(), "phase transition");
		let _ = self.phase_tx.send(phase);
	}

	pub fn fail(&self, error: SessionError) {
		self.error_tx.resolve(error);
	}

	/// Register a user at this peer: bind a free escrow from our
	/// partition, then announce it to the other peers.
	pub fn register_input_peer(
		&self,
		encrypted_output: Vec<u8>,
	) -> Result<([u8; 32], u32, String, Vec<u8>), String> {
		let (index, pubkey, address) = self
			.input_peers
			.assign_escrow(self.rank, self.n)
			.ok_or_else(|| "no_free_escrow".to_string())?;

		let mut session_id = [0u8; 32];
		rand::thread_rng().fill_bytes(&mut session_id);

		self.input_peers
			.flag_input_peer(&address, session_id, encrypted_output.clone())?;

		let payload = Payload::Helo {
			session_id,
			escrow_address: address.clone(),
			encrypted_output,
		};
		// Stragglers and rejections are the peers' problem; registration
		// succeeded locally
		let _ = self.transactions.broadcast(MessageType::Helo, &payload.encode());

		Ok((session_id, index, address, pubkey))
	}

	/// Drive the whole mixing round. Resolving the error promise aborts
	/// the run and tears down this session only.
	pub async fn run<C: BtcRpcApi>(self: Arc<Self>, rpc: C) -> Result<(), SessionError> {
		let error_rx = self.error_rx.clone();
		let result = tokio::select! {
			result = self.run_phases(&rpc) => result,
			Some(error) = error_rx.wait() => Err(error),
		};

		if let Err(error) = &result {
			error!(mixnet_id = self.mixnet_id, %error, "session failed; shutting down");
		}
		self.transactions.shutdown();
		self.set_phase(Phase::Halted);
		result
	}

	async fn run_phases<C: BtcRpcApi>(self: &Arc<Self>, rpc: &C) -> Result<(), SessionError> {
		self.set_phase(Phase::NewInputPeer);

		// One-time initialization: the common point H for the Pedersen
		// commitments
		let h = self
			.smpc
			.initiate(
				SlotId::new(Algorithm::Jfdkg, b"H", 0),
				InitRequest::Jfdkg { field: scalar_field() },
			)
			.public_value()
			.await
			.and_then(|public| public.into_point())
			.map_err(|e| SessionError::EscrowFailure(e.to_string()))?;

		let escrows = escrow::generate_escrows(
			&self.smpc,
			&self.input_peers,
			h,
			self.mixing.escrow_count,
			self.testnet,
		)
		.await?;

		self.set_phase(Phase::EscrowConfirmation);
		self.spawn_commitment_window();

		let expected_deposit = self.expected_deposit()?;
		let poller =
			DepositPoller::new(rpc, self.input_peers.clone(), expected_deposit)
				.await
				.map_err(|error| SessionError::Rpc(error.to_string()))?;
		poller.run().await.map_err(|error| SessionError::Rpc(error.to_string()))?;

		self.set_phase(Phase::Waiting);
		while !self.input_peers.hash_shares_complete() {
			tokio::time::sleep(std::time::Duration::from_secs(1)).await;
		}

		self.set_phase(Phase::Initializing);
		let ShuffleResult { final_checksum_hex, .. } = self.run_shuffle().await?;

		self.set_phase(Phase::Streaming);
		signing::run_streaming(
			&self.smpc,
			rpc,
			&self.input_peers,
			&escrows,
			&final_checksum_hex,
			self.payout_value()?,
			self.mixing.mixing_window_mins,
			self.testnet,
		)
		.await?;

		self.zeroize_escrows(escrows);
		info!(mixnet_id = self.mixnet_id, "mixing concluded");
		Ok(())
	}

	async fn run_shuffle(self: &Arc<Self>) -> Result<ShuffleResult, SessionError> {
		let incoming = self
			.addr_rx
			.lock()
			.expect("addr receiver lock cannot be poisoned")
			.take()
			.expect("the shuffle runs once per session");

		let transactions = self.transactions.clone();
		let driver = ShuffleDriver {
			rank: self.rank,
			n: self.n,
			smpc: self.smpc.clone(),
			input_peers: self.input_peers.clone(),
			identity: self.identity,
			incoming,
			broadcast: Box::new(move |outputs| {
				let payload = Payload::Addr { outputs };
				let _ = transactions.broadcast(MessageType::Addr, &payload.encode());
			}),
		};
		driver.run().await
	}

	/// Once the commitment window has elapsed, freeze as soon as the
	/// minimum participation is reached. The timer drains when the session
	/// errors out.
	fn spawn_commitment_window(self: &Arc<Self>) {
		let input_peers = self.input_peers.clone();
		let error_rx = self.error_rx.clone();
		let window = std::time::Duration::from_secs(self.mixing.commitment_window_secs);
		tokio::spawn(async move {
			let freeze = async {
				tokio::time::sleep(window).await;
				while !input_peers.freeze_if_minimum_reached() {
					tokio::time::sleep(std::time::Duration::from_secs(10)).await;
				}
			};
			tokio::select! {
				() = freeze => {},
				_ = error_rx.wait() => {},
			}
		});
	}

	fn expected_deposit(&self) -> Result<Amount, SessionError> {
		let total = self.mixing.bitcoin_value_btc + self.mixing.transaction_fee_btc;
		Amount::from_btc(total).map_err(|error| SessionError::Rpc(error.to_string()))
	}

	fn payout_value(&self) -> Result<Amount, SessionError> {
		Amount::from_btc(self.mixing.bitcoin_value_btc)
			.map_err(|error| SessionError::Rpc(error.to_string()))
	}

	/// Escrow key material does not outlive its use.
	fn zeroize_escrows(&self, escrows: Vec<Escrow>) {
		// The ValueHandles drop here; the signer wiped its local share
		// copies after each use
		drop(escrows);
	}
}

/// Map engine-internal SMPC traffic onto transport transactions.
async fn run_smpc_bridge(
	mut outgoing_rx: UnboundedReceiver<OutgoingSmpcMessages>,
	transactions: Arc<TransactionStore>,
) {
	while let Some(message) = outgoing_rx.recv().await {
		match message {
			OutgoingSmpcMessages::Broadcast(envelope) => {
				let payload =
					Payload::Smpc { slot: envelope.slot, data: envelope.data };
				let _ = transactions.broadcast(payload.message_type(), &payload.encode());
			},
			OutgoingSmpcMessages::ConsistentBroadcast(envelope) => {
				let payload =
					Payload::Smpc { slot: envelope.slot, data: envelope.data };
				let _ = transactions
					.consistent_broadcast(payload.message_type(), &payload.encode());
			},
			OutgoingSmpcMessages::Eachcast(messages) => {
				let messages = messages
					.into_iter()
					.map(|(rank, envelope)| {
						let payload = Payload::Smpc {
							slot: envelope.slot,
							data: envelope.data,
						};
						(rank as u16, payload.message_type(), payload.encode())
					})
					.collect();
				let _ = transactions.eachcast(messages);
			},
		}
	}
	warn!("smpc bridge stopped");
}
