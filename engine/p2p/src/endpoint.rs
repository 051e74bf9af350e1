//! TCP plumbing between mixing peers. Every peer keeps one outgoing
//! connection per remote rank (redialled on failure) and accepts inbound
//! connections on its listen address; each connection gets its own read
//! task feeding the transaction store, so all protocol state stays with the
//! store and the sockets stay dumb.

use std::{
	collections::HashMap,
	sync::{Arc, Mutex, OnceLock},
	time::Duration,
};

use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::{TcpListener, TcpStream},
	sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
};
use tracing::{debug, info, warn};

use crate::{
	frame::FrameDecoder,
	transactions::{Outbound, TransactionStore},
};

const REDIAL_DELAY: Duration = Duration::from_secs(1);

pub struct PeerEndpoint {
	senders: Mutex<HashMap<u16, UnboundedSender<Vec<u8>>>>,
	store: OnceLock<Arc<TransactionStore>>,
}

impl PeerEndpoint {
	pub fn new() -> Arc<Self> {
		Arc::new(PeerEndpoint { senders: Mutex::new(HashMap::new()), store: OnceLock::new() })
	}

	/// Wire up the transaction store and start the listener plus one
	/// dialler per peer. Called once after the store exists (the store
	/// needs the endpoint as its `Outbound`, hence the two-step setup).
	pub async fn start(
		self: &Arc<Self>,
		listen_addr: String,
		peers: Vec<(u16, String)>,
		store: Arc<TransactionStore>,
	) -> anyhow::Result<()> {
		self.store
			.set(store)
			.map_err(|_| anyhow::anyhow!("endpoint already started"))?;

		let listener = TcpListener::bind(&listen_addr).await?;
		info!(%listen_addr, "p2p endpoint listening");

		let endpoint = self.clone();
		tokio::spawn(async move {
			loop {
				match listener.accept().await {
					Ok((socket, remote)) => {
						debug!(%remote, "inbound peer connection");
						let endpoint = endpoint.clone();
						tokio::spawn(async move {
							endpoint.run_reader(socket).await;
						});
					},
					Err(error) => {
						warn!(%error, "accept failed");
					},
				}
			}
		});

		for (rank, address) in peers {
			let (tx, rx) = unbounded_channel();
			self.senders
				.lock()
				.expect("sender map lock cannot be poisoned")
				.insert(rank, tx);
			let endpoint = self.clone();
			tokio::spawn(async move {
				endpoint.run_dialler(rank, address, rx).await;
			});
		}
		Ok(())
	}

	/// Keep one outgoing connection to `rank` alive and drain queued
	/// frames into it.
	async fn run_dialler(
		self: Arc<Self>,
		rank: u16,
		address: String,
		mut outgoing: UnboundedReceiver<Vec<u8>>,
	) {
		let mut pending: Option<Vec<u8>> = None;
		loop {
			let mut socket = match TcpStream::connect(&address).await {
				Ok(socket) => {
					info!(rank, %address, "connected to peer");
					socket
				},
				Err(error) => {
					debug!(rank, %address, %error, "dial failed; retrying");
					tokio::time::sleep(REDIAL_DELAY).await;
					continue
				},
			};

			loop {
				let frame = match pending.take() {
					Some(frame) => frame,
					None => match outgoing.recv().await {
						Some(frame) => frame,
						// The endpoint is shutting down
						None => return,
					},
				};
				if let Err(error) = socket.write_all(&frame).await {
					warn!(rank, %error, "peer write failed; reconnecting");
					pending = Some(frame);
					break
				}
			}
		}
	}

	/// Read frames off an inbound connection and feed them to the store.
	async fn run_reader(self: Arc<Self>, mut socket: TcpStream) {
		let store = self
			.store
			.get()
			.expect("reader tasks only run after start()")
			.clone();
		let mut decoder = FrameDecoder::new();
		let mut buffer = [0u8; 4096];
		loop {
			let read = match socket.read(&mut buffer).await {
				Ok(0) => return,
				Ok(read) => read,
				Err(error) => {
					debug!(%error, "peer read failed");
					return
				},
			};
			let frames = match decoder.push(&buffer[..read]) {
				Ok(frames) => frames,
				Err(error) => {
					// Framing violations are hostile; cut the connection
					warn!(%error, "dropping connection after framing error");
					return
				},
			};
			for raw in frames {
				match store.handle_frame(&raw) {
					Ok(Some(reply)) => {
						// Responses travel over our own outgoing link to
						// the requester
						let to = u16::from_be_bytes(
							raw[2..4].try_into().expect("frame length checked"),
						);
						self.send_to(to, reply);
					},
					Ok(None) => {},
					Err(error) => {
						warn!(%error, "dropping bad frame");
					},
				}
			}
		}
	}
}

impl Outbound for PeerEndpoint {
	fn send_to(&self, rank: u16, frame: Vec<u8>) {
		let senders = self.senders.lock().expect("sender map lock cannot be poisoned");
		match senders.get(&rank) {
			Some(sender) => {
				if sender.send(frame).is_err() {
					warn!(rank, "peer sender task gone");
				}
			},
			None => warn!(rank, "no connection for rank"),
		}
	}

	fn connected_ranks(&self) -> Vec<u16> {
		let mut ranks: Vec<u16> = self
			.senders
			.lock()
			.expect("sender map lock cannot be poisoned")
			.keys()
			.copied()
			.collect();
		ranks.sort_unstable();
		ranks
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		broadcast::PeerCrypt,
		frame::MessageType,
		messages::Payload,
		transactions::{DeliverFn, LocalPeer},
	};
	use secp256k1::{rand::thread_rng, PublicKey, SECP256K1};
	use std::sync::Mutex as StdMutex;

	#[tokio::test]
	async fn two_peers_exchange_a_singlecast() {
		let keypairs: Vec<_> =
			(0..2).map(|_| SECP256K1.generate_keypair(&mut thread_rng())).collect();
		let publics: Vec<PublicKey> = keypairs.iter().map(|(_, pk)| *pk).collect();

		let delivered = Arc::new(StdMutex::new(Vec::new()));

		let mut endpoints = Vec::new();
		let mut addrs = Vec::new();
		for _ in 0..2 {
			// Reserve distinct loopback ports
			let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
			addrs.push(listener.local_addr().unwrap().to_string());
			drop(listener);
		}

		for rank in 0..2u16 {
			let endpoint = PeerEndpoint::new();
			let crypt = Arc::new(PeerCrypt {
				secret: keypairs[rank as usize].0,
				publics: publics.clone(),
			});
			let delivered = delivered.clone();
			let deliver: DeliverFn = Arc::new(move |from, payload| {
				delivered.lock().unwrap().push((from, payload));
				Ok(())
			});
			let outbound: Arc<dyn Outbound> = endpoint.clone();
			let store =
				TransactionStore::new(LocalPeer { rank, n: 2, t: 0, crypt }, outbound, deliver);
			let other = 1 - rank;
			endpoint
				.start(
					addrs[rank as usize].clone(),
					vec![(other, addrs[other as usize].clone())],
					store.clone(),
				)
				.await
				.unwrap();
			endpoints.push((endpoint, store));
		}

		let payload = Payload::Smpc {
			slot: smpc::SlotId::new(smpc::Algorithm::Rec, b"u", 0),
			data: smpc::SmpcData::NoComplaint,
		};
		let outcome = endpoints[0].1.singlecast(1, MessageType::Ncmp, &payload.encode());

		tokio::time::timeout(Duration::from_secs(5), async {
			while outcome.try_get().is_none() {
				tokio::time::sleep(Duration::from_millis(10)).await;
			}
		})
		.await
		.expect("singlecast should complete");

		assert_eq!(outcome.try_get(), Some(Ok(())));
		assert_eq!(delivered.lock().unwrap().as_slice(), &[(0u16, payload)]);
	}
}
