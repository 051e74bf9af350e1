//! Shared helpers for in-process multi-peer tests: an SMPC store cluster
//! wired over loopback routers, standing in for the real transport.

use std::{sync::Arc, time::Duration};

use smpc::{OutgoingSmpcMessages, SmpcContext, SmpcStore};
use tokio::sync::mpsc::unbounded_channel;

pub struct SmpcCluster {
	stores: Vec<Arc<SmpcStore>>,
}

impl SmpcCluster {
	/// N stores delivering every message faithfully.
	pub fn honest(n: u32, t: u32) -> Self {
		let mut stores = Vec::new();
		let mut outgoing_rxs = Vec::new();

		for rank in 0..n {
			let (outgoing_tx, outgoing_rx) = unbounded_channel();
			let (failure_tx, _failure_rx) = unbounded_channel();
			let ctx = Arc::new(SmpcContext {
				rank,
				n,
				t,
				outgoing: outgoing_tx,
				failure_tx,
				share_timeout: Duration::from_millis(500),
				complaint_timeout: Duration::from_millis(300),
			});
			stores.push(SmpcStore::new(ctx));
			outgoing_rxs.push(outgoing_rx);
		}

		for (rank, mut outgoing_rx) in outgoing_rxs.into_iter().enumerate() {
			let rank = rank as u32;
			let stores = stores.clone();
			tokio::spawn(async move {
				while let Some(message) = outgoing_rx.recv().await {
					match message {
						OutgoingSmpcMessages::Broadcast(envelope) |
						OutgoingSmpcMessages::ConsistentBroadcast(envelope) => {
							for to in 0..stores.len() as u32 {
								if to != rank {
									stores[to as usize].deliver(
										envelope.slot.clone(),
										rank,
										envelope.data.clone(),
									);
								}
							}
						},
						OutgoingSmpcMessages::Eachcast(messages) => {
							for (to, envelope) in messages {
								stores[to as usize].deliver(
									envelope.slot,
									rank,
									envelope.data,
								);
							}
						},
					}
				}
			});
		}

		SmpcCluster { stores }
	}

	pub fn store(&self, rank: usize) -> &Arc<SmpcStore> {
		&self.stores[rank]
	}

	pub fn n(&self) -> u32 {
		self.stores.len() as u32
	}
}
