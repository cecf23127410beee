//! Relay server: accepts WebSocket connections, authenticates them and
//! routes each to a room.
//!
//! Plain format: the last path segment selects the room; the empty
//! identifier is rejected with `403 Forbidden` before the upgrade.
//! Multiplexed format: the path must be `/` and every frame carries an
//! `ID` prefix selecting its room, so a single connection can serve any
//! number of rooms.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State as AxumState;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use concord_types::component::{Component, ComponentExt, Lifecycle, State};
use concord_types::protocol::{self, WireFormat};

use crate::auth::Authenticator;
use crate::prelude::*;
use crate::room::{Client, Room, RoomOpts};

/// Ping interval keeping idle connections alive through intermediaries.
const HEARTBEAT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct RelayOpts {
	pub host: String,
	pub port: u16,
	pub format: WireFormat,
	/// Keep server-side replicas (otherwise rooms only broadcast).
	pub persistent: bool,
	/// Journal directory for persistent rooms; `None` keeps replicas in
	/// volatile memory only.
	pub journal_dir: Option<PathBuf>,
}

impl RelayOpts {
	/// Options for a broadcast-only relay on `host:port`.
	pub fn broadcast(host: impl Into<String>, port: u16) -> Self {
		Self {
			host: host.into(),
			port,
			format: WireFormat::Plain,
			persistent: false,
			journal_dir: None,
		}
	}
}

pub struct RelayServer {
	shared: Weak<RelayServer>,
	lifecycle: Lifecycle,
	opts: RelayOpts,
	authenticator: Option<Arc<dyn Authenticator>>,
	rooms: Mutex<HashMap<String, Arc<Room>>>,
	listener: Mutex<Option<TcpListener>>,
	local_addr: watch::Sender<Option<SocketAddr>>,
	next_client_id: AtomicU64,
}

impl RelayServer {
	pub fn new(opts: RelayOpts) -> Arc<Self> {
		Self::with_authenticator(opts, None)
	}

	pub fn with_authenticator(
		opts: RelayOpts,
		authenticator: Option<Arc<dyn Authenticator>>,
	) -> Arc<Self> {
		let (local_addr, _) = watch::channel(None);
		Arc::new_cyclic(|shared| Self {
			shared: shared.clone(),
			lifecycle: Lifecycle::new(),
			opts,
			authenticator,
			rooms: Mutex::new(HashMap::new()),
			listener: Mutex::new(None),
			local_addr,
			next_client_id: AtomicU64::new(1),
		})
	}

	/// The bound address, available once the component is started.
	pub fn local_addr(&self) -> Option<SocketAddr> {
		*self.local_addr.borrow()
	}

	fn shared(&self) -> CnResult<Arc<Self>> {
		self.shared
			.upgrade()
			.ok_or_else(|| Error::Internal("relay handle dropped".into()))
	}

	fn authenticate(&self, path: &str, headers: &HeaderMap) -> Option<Response> {
		self.authenticator
			.as_ref()
			.and_then(|authenticator| authenticator.authenticate(path, headers))
	}

	/// Look up or create-and-start the room for `identifier`. A room that
	/// stopped on a fatal error is replaced by a fresh one, which replays
	/// its journal on startup.
	async fn room(&self, identifier: &str) -> CnResult<Arc<Room>> {
		let mut rooms = self.rooms.lock().await;
		if let Some(room) = rooms.get(identifier) {
			if room.lifecycle().state() != State::None {
				return Ok(room.clone());
			}
			rooms.remove(identifier);
		}
		let room = Room::new(
			identifier,
			self.opts.format,
			&RoomOpts {
				persistent: self.opts.persistent,
				journal_dir: self.opts.journal_dir.clone(),
			},
		);
		room.start().await?;
		rooms.insert(identifier.to_string(), room.clone());
		Ok(room)
	}

	/// The room for `identifier`, if it exists.
	pub async fn find_room(&self, identifier: &str) -> Option<Arc<Room>> {
		self.rooms.lock().await.get(identifier).cloned()
	}

	/// Stop a room and forget it. Used on fatal room errors.
	pub async fn stop_room(&self, identifier: &str) {
		let room = self.rooms.lock().await.remove(identifier);
		if let Some(room) = room {
			if let Err(err) = room.stop().await {
				warn!(room = %identifier, error = %err, "failed to stop room");
			}
		}
	}

	async fn handle_plain(&self, socket: WebSocket, identifier: String) {
		let room = match self.room(&identifier).await {
			Ok(room) => room,
			Err(err) => {
				warn!(room = %identifier, error = %err, "failed to open room");
				close_socket(socket, 4500, "room unavailable").await;
				return;
			}
		};

		let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
		let (client, frames) = Client::new(id);
		let closer = client.closer();
		room.add(client.clone()).await;
		info!(room = %identifier, client = id, "client connected");

		let (sink, mut stream) = socket.split();
		let writer = tokio::spawn(pump_outbound(sink, frames, closer.clone()));

		loop {
			tokio::select! {
				() = closer.cancelled() => break,
				message = stream.next() => {
					match recv_frame(message) {
						Recv::Frame(frame) => {
							if let Err(err) = room.process(&frame, &client).await {
								error!(room = %identifier, error = %err, "fatal room error");
								self.stop_room(&identifier).await;
								break;
							}
						}
						Recv::Skip => {}
						Recv::Closed => break,
					}
				}
			}
		}

		room.remove(id).await;
		info!(room = %identifier, client = id, "client disconnected");
		writer.abort();
	}

	async fn handle_multiplexed(&self, socket: WebSocket) {
		let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
		let (client, frames) = Client::new(id);
		let closer = client.closer();
		info!(client = id, "client connected");

		let (sink, mut stream) = socket.split();
		let writer = tokio::spawn(pump_outbound(sink, frames, closer.clone()));
		let mut joined: Vec<String> = Vec::new();

		loop {
			tokio::select! {
				() = closer.cancelled() => break,
				message = stream.next() => {
					match recv_frame(message) {
						Recv::Frame(frame) => {
							// the identifier rides on every frame
							let (identifier, inner) = match protocol::split_id(&frame) {
								Ok(split) => split,
								Err(err) => {
									debug!(client = id, error = %err, "frame without identifier prefix");
									continue;
								}
							};
							let room = match self.room(&identifier).await {
								Ok(room) => room,
								Err(err) => {
									warn!(room = %identifier, error = %err, "failed to open room");
									continue;
								}
							};
							room.add(client.clone()).await;
							if !joined.contains(&identifier) {
								joined.push(identifier.clone());
							}
							if let Err(err) = room.process(inner, &client).await {
								error!(room = %identifier, error = %err, "fatal room error");
								self.stop_room(&identifier).await;
							}
						}
						Recv::Skip => {}
						Recv::Closed => break,
					}
				}
			}
		}

		// best-effort removal from every room this connection touched
		let rooms: Vec<Arc<Room>> = {
			let rooms = self.rooms.lock().await;
			joined.iter().filter_map(|identifier| rooms.get(identifier).cloned()).collect()
		};
		for room in rooms {
			room.remove(id).await;
		}
		info!(client = id, "client disconnected");
		writer.abort();
	}
}

enum Recv {
	Frame(Vec<u8>),
	Skip,
	Closed,
}

fn recv_frame(message: Option<Result<Message, axum::Error>>) -> Recv {
	match message {
		Some(Ok(Message::Binary(data))) => Recv::Frame(data.to_vec()),
		Some(Ok(Message::Close(_))) | None => Recv::Closed,
		Some(Ok(_)) => Recv::Skip,
		Some(Err(err)) => {
			debug!(error = %err, "connection error");
			Recv::Closed
		}
	}
}

/// Drain a client's frame queue into its socket, interleaving keepalive
/// pings; sends a close frame when the room shuts the client down.
async fn pump_outbound(
	mut sink: SplitSink<WebSocket, Message>,
	mut frames: mpsc::Receiver<Vec<u8>>,
	closer: CancellationToken,
) {
	let mut heartbeat = tokio::time::interval(Duration::from_secs(HEARTBEAT_SECS));
	heartbeat.tick().await;
	loop {
		tokio::select! {
			() = closer.cancelled() => {
				let _ = sink
					.send(Message::Close(Some(CloseFrame { code: 1001, reason: "server shutting down".into() })))
					.await;
				break;
			}
			frame = frames.recv() => {
				match frame {
					Some(frame) => {
						if sink.send(Message::Binary(frame.into())).await.is_err() {
							break;
						}
					}
					None => break,
				}
			}
			_ = heartbeat.tick() => {
				if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
					break;
				}
			}
		}
	}
}

async fn close_socket(mut socket: WebSocket, code: u16, reason: &'static str) {
	let _ = socket
		.send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
		.await;
}

async fn upgrade_handler(
	AxumState(relay): AxumState<Arc<RelayServer>>,
	ws: WebSocketUpgrade,
	uri: Uri,
	headers: HeaderMap,
) -> Response {
	let path = uri.path().to_string();
	debug!(%path, "websocket request");

	// path discipline comes first, authentication second
	match relay.opts.format {
		WireFormat::Plain => {
			let identifier = path.rsplit('/').next().unwrap_or_default().to_string();
			if identifier.is_empty() {
				return StatusCode::FORBIDDEN.into_response();
			}
			if let Some(reject) = relay.authenticate(&path, &headers) {
				return reject;
			}
			ws.on_upgrade(move |socket| async move {
				relay.handle_plain(socket, identifier).await;
			})
		}
		WireFormat::Multiplexed => {
			if path != "/" {
				return StatusCode::FORBIDDEN.into_response();
			}
			if let Some(reject) = relay.authenticate(&path, &headers) {
				return reject;
			}
			ws.on_upgrade(move |socket| async move {
				relay.handle_multiplexed(socket).await;
			})
		}
	}
}

#[async_trait]
impl Component for RelayServer {
	fn label(&self) -> &'static str {
		"relay"
	}

	fn lifecycle(&self) -> &Lifecycle {
		&self.lifecycle
	}

	async fn before(&self) -> CnResult<()> {
		if let Some(dir) = &self.opts.journal_dir {
			tokio::fs::create_dir_all(dir).await?;
		}
		let listener = TcpListener::bind((self.opts.host.as_str(), self.opts.port)).await?;
		let addr = listener.local_addr()?;
		let _ = self.local_addr.send_replace(Some(addr));
		*self.listener.lock().await = Some(listener);
		Ok(())
	}

	async fn run(&self) -> CnResult<()> {
		let listener = self
			.listener
			.lock()
			.await
			.take()
			.ok_or_else(|| Error::Internal("relay listener not bound".into()))?;

		info!(host = %self.opts.host, port = self.opts.port, "server started");
		if self.opts.persistent {
			match &self.opts.journal_dir {
				Some(dir) => info!(path = %dir.display(), "storing content on disk"),
				None => info!("storing content in volatile memory"),
			}
		} else {
			info!("broadcast only and no content will be stored");
		}

		let app = Router::new()
			.route("/", any(upgrade_handler))
			.route("/{*path}", any(upgrade_handler))
			.with_state(self.shared()?);

		let token = self
			.lifecycle
			.token()
			.ok_or_else(|| Error::Internal("relay lifecycle token missing".into()))?;
		axum::serve(listener, app)
			.with_graceful_shutdown(async move { token.cancelled().await })
			.await?;
		Ok(())
	}

	async fn cleanup(&self) -> CnResult<()> {
		let rooms: Vec<(String, Arc<Room>)> = {
			let mut rooms = self.rooms.lock().await;
			rooms.drain().collect()
		};
		for (identifier, room) in rooms {
			if let Err(err) = room.stop().await {
				warn!(room = %identifier, error = %err, "failed to stop room");
			}
		}
		let _ = self.local_addr.send_replace(None);
		Ok(())
	}
}

// vim: ts=4
