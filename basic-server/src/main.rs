//! Reference relay binary.
//!
//! `concord-server HOST PORT [--persistent [DIR]] [--multiplex] [--dummy] [-v...]`
//!
//! Exits 0 on an orderly signal-driven stop, 1 on startup failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use concord::auth::{Authenticator, DummyAuth};
use concord::relay::{RelayOpts, RelayServer};
use concord_types::component::ComponentExt;
use concord_types::protocol::WireFormat;

#[derive(Parser, Debug)]
#[command(name = "concord-server", version, about = "Run a Concord relay server")]
struct Cli {
	/// Host address to listen on for new connections
	host: String,

	/// Port to listen on for new connections
	port: u16,

	/// Hold the received content in a server-side replica, in volatile
	/// memory or journaled under DIRECTORY if given. Without this flag
	/// the server simply broadcasts all incoming messages within the
	/// respective room.
	#[arg(long, value_name = "DIRECTORY", num_args = 0..=1, default_missing_value = "")]
	persistent: Option<PathBuf>,

	/// Serve the multiplexed protocol variant on / instead of one room
	/// per path
	#[arg(long)]
	multiplex: bool,

	/// Enable Basic Authentication where username equals password.
	/// DO NOT USE IN PRODUCTION
	#[arg(long)]
	dummy: bool,

	/// Increase log verbosity (-v info, -vv debug, -vvv trace)
	#[arg(short, long, action = clap::ArgAction::Count)]
	verbose: u8,
}

fn init_tracing(verbose: u8) {
	let level = match verbose {
		0 => "warn",
		1 => "info",
		2 => "debug",
		_ => "trace",
	};
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
	tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{signal, SignalKind};
		match signal(SignalKind::terminate()) {
			Ok(mut terminate) => {
				tokio::select! {
					_ = tokio::signal::ctrl_c() => {}
					_ = terminate.recv() => {}
				}
			}
			Err(_) => {
				let _ = tokio::signal::ctrl_c().await;
			}
		}
	}
	#[cfg(not(unix))]
	{
		let _ = tokio::signal::ctrl_c().await;
	}
}

#[tokio::main]
async fn main() -> ExitCode {
	let cli = Cli::parse();
	init_tracing(cli.verbose);

	let (persistent, journal_dir) = match cli.persistent {
		None => (false, None),
		Some(dir) if dir.as_os_str().is_empty() => (true, None),
		Some(dir) => (true, Some(dir)),
	};
	if let Some(dir) = &journal_dir {
		if dir.exists() && !dir.is_dir() {
			error!(path = %dir.display(), "the given path is not a directory");
			return ExitCode::from(1);
		}
	}

	let opts = RelayOpts {
		host: cli.host,
		port: cli.port,
		format: if cli.multiplex { WireFormat::Multiplexed } else { WireFormat::Plain },
		persistent,
		journal_dir,
	};
	let authenticator = cli
		.dummy
		.then(|| Arc::new(DummyAuth::dummy("concord")) as Arc<dyn Authenticator>);

	let relay = RelayServer::with_authenticator(opts, authenticator);
	if let Err(err) = relay.start().await {
		error!(error = %err, "failed to start relay");
		return ExitCode::from(1);
	}

	shutdown_signal().await;
	info!("shutting down");
	if let Err(err) = relay.stop().await {
		error!(error = %err, "shutdown failed");
		return ExitCode::from(1);
	}
	ExitCode::SUCCESS
}

// vim: ts=4
