use std::{collections::HashMap, sync::Arc};

use clap::Parser;
use coinparty_engine::{
	btc::rpc::BtcRpcClient,
	mixing::session::{MixingSession, SessionParams},
	settings::Settings,
	web,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "mixpeer", about = "CoinParty mixing peer")]
struct Args {
	/// This peer's id in the configuration file.
	rank_id: String,

	/// Path to the mixnet configuration.
	#[arg(short = 'c', long = "config", default_value = "mixnets.conf")]
	config: String,
}

#[tokio::main]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| "info".into()),
		)
		.init();

	let args = Args::parse();

	let settings = match Settings::from_file(&args.config) {
		Ok(settings) => settings,
		Err(error) => {
			eprintln!("configuration error: {error}");
			std::process::exit(1);
		},
	};

	let (identity, _identity_public) = match settings.local_keys(&args.rank_id) {
		Ok(keys) => keys,
		Err(error) => {
			eprintln!("crypto key error: {error}");
			std::process::exit(2);
		},
	};

	let mut sessions = HashMap::new();
	let mut session_tasks = Vec::new();

	for (mixnet_id, members) in &settings.mixing_networks {
		let Some(own_membership) = members.get(&args.rank_id) else { continue };

		// Membership ordered by rank; identity keys indexed the same way
		let mut by_rank: Vec<(&String, &coinparty_engine::settings::MixnetMember)> =
			members.iter().collect();
		by_rank.sort_by_key(|(_, member)| member.rank);

		let peer_pubkeys = by_rank
			.iter()
			.map(|(peer_id, _)| settings.peer_pubkey(peer_id))
			.collect::<anyhow::Result<Vec<_>>>();
		let peer_pubkeys = match peer_pubkeys {
			Ok(peer_pubkeys) => peer_pubkeys,
			Err(error) => {
				eprintln!("crypto key error: {error}");
				std::process::exit(2);
			},
		};

		let peers = by_rank
			.iter()
			.filter(|(peer_id, _)| *peer_id != &args.rank_id)
			.map(|(_, member)| (member.rank as u16, member.p2p_addr.clone()))
			.collect();

		let session = MixingSession::create(SessionParams {
			mixnet_id: mixnet_id.clone(),
			rank: own_membership.rank,
			peers,
			peer_pubkeys,
			identity,
			listen_addr: own_membership.p2p_addr.clone(),
			testnet: settings.global.testnet,
			mixing: settings.mixing.clone(),
		});

		if let Err(err) = session.start_network().await {
			error!(mixnet_id, %err, "failed to start p2p endpoint");
			std::process::exit(1);
		}

		let rpc = BtcRpcClient::new(&settings.btc);
		let run_session = session.clone();
		session_tasks.push(tokio::spawn(async move { run_session.run(rpc).await }));

		sessions.insert(mixnet_id.clone(), session);
	}

	if sessions.is_empty() {
		eprintln!("peer {} is not a member of any configured mixnet", args.rank_id);
		std::process::exit(1);
	}

	// The informational web surface, shared by all sessions of this peer
	let web_addr = settings.mixing_peers[&args.rank_id]
		.web_addr
		.parse()
		.unwrap_or_else(|error| {
			eprintln!("configuration error: bad web address: {error}");
			std::process::exit(1);
		});
	let peer_web_addrs = settings
		.mixing_peers
		.values()
		.map(|peer| peer.web_addr.clone())
		.collect();
	tokio::spawn(web::run_web_server(web_addr, Arc::new(sessions), peer_web_addrs));

	info!("mixing peer up");
	for task in session_tasks {
		match task.await {
			Ok(Ok(())) => {},
			Ok(Err(error)) => error!(%error, "session ended with error"),
			Err(error) => error!(%error, "session task panicked"),
		}
	}
}
