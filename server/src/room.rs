//! Per-document server-side replica.
//!
//! A room aggregates the clients connected to one identifier. In
//! broadcast-only mode it forwards frames verbatim; in persistent mode
//! it owns a replica, applies every incoming update to it, rebroadcasts
//! the update to the other clients, and optionally journals it through a
//! [`SqliteStore`]. The two modes never mix within a room.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use concord_store_sqlite::SqliteStore;
use concord_types::component::{Component, ComponentExt, Lifecycle, State};
use concord_types::doc::SharedDoc;
use concord_types::protocol::{self, MessageTag, WireFormat, EMPTY_UPDATE};

use crate::prelude::*;

/// Per-client outbound frame queue bound.
const CLIENT_QUEUE: usize = 256;

/// A connected client as the room sees it: an identity, an outbound
/// frame queue and a close signal. Clients never hold a back-pointer to
/// their room.
#[derive(Debug, Clone)]
pub struct Client {
	id: u64,
	frames: mpsc::Sender<Vec<u8>>,
	closer: CancellationToken,
}

impl Client {
	/// Create a client handle plus the receiving end of its frame queue.
	pub fn new(id: u64) -> (Self, mpsc::Receiver<Vec<u8>>) {
		let (frames, rx) = mpsc::channel(CLIENT_QUEUE);
		(Self { id, frames, closer: CancellationToken::new() }, rx)
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	/// Token cancelled when the room asks this client to close.
	pub fn closer(&self) -> CancellationToken {
		self.closer.clone()
	}

	/// Queue a frame for this client. Returns whether the queue accepted it.
	pub async fn send(&self, frame: Vec<u8>) -> bool {
		self.frames.send(frame).await.is_ok()
	}

	pub fn close(&self) {
		self.closer.cancel();
	}
}

/// How a room treats content.
#[derive(Debug, Clone, Default)]
pub struct RoomOpts {
	/// Keep a server-side replica and dispatch sync messages.
	pub persistent: bool,
	/// Journal applied updates under this directory (persistent mode only).
	pub journal_dir: Option<PathBuf>,
}

pub struct Room {
	lifecycle: Lifecycle,
	identifier: String,
	format: WireFormat,
	doc: Option<SharedDoc>,
	store: Option<Arc<SqliteStore>>,
	clients: Mutex<HashMap<u64, Client>>,
}

impl Room {
	pub fn new(identifier: impl Into<String>, format: WireFormat, opts: &RoomOpts) -> Arc<Self> {
		let identifier = identifier.into();
		let (doc, store) = if opts.persistent {
			let doc = SharedDoc::new();
			let store = opts.journal_dir.as_ref().map(|dir| {
				SqliteStore::new(doc.clone(), Some(identifier.clone()), dir.join(&identifier))
			});
			(Some(doc), store)
		} else {
			(None, None)
		};
		Arc::new(Self {
			lifecycle: Lifecycle::new(),
			identifier,
			format,
			doc,
			store,
			clients: Mutex::new(HashMap::new()),
		})
	}

	pub fn identifier(&self) -> &str {
		&self.identifier
	}

	/// The room's replica, present in persistent mode.
	pub fn doc(&self) -> Option<&SharedDoc> {
		self.doc.as_ref()
	}

	pub async fn add(&self, client: Client) {
		let id = client.id();
		if self.clients.lock().await.insert(id, client).is_none() {
			debug!(room = %self.identifier, client = id, "added client");
		}
	}

	pub async fn remove(&self, id: u64) {
		if self.clients.lock().await.remove(&id).is_some() {
			debug!(room = %self.identifier, client = id, "removed client");
		}
	}

	pub async fn client_count(&self) -> usize {
		self.clients.lock().await.len()
	}

	/// Post a frame to every client except `exclude`. The client set is
	/// snapshotted first; individual send failures are logged and do not
	/// abort the broadcast.
	async fn broadcast(&self, frame: Vec<u8>, exclude: u64) {
		let targets: Vec<Client> = {
			let clients = self.clients.lock().await;
			clients.values().filter(|client| client.id != exclude).cloned().collect()
		};
		for client in targets {
			if !client.send(frame.clone()).await {
				warn!(room = %self.identifier, client = client.id, "failed to queue frame");
			}
		}
	}

	/// Wrap an outbound message for this room's wire format.
	fn framed(&self, message: Vec<u8>) -> Vec<u8> {
		match self.format {
			WireFormat::Plain => message,
			WireFormat::Multiplexed => protocol::encode_with_id(&self.identifier, &message),
		}
	}

	async fn reply(&self, client: &Client, message: Vec<u8>) {
		if !client.send(self.framed(message)).await {
			warn!(room = %self.identifier, client = client.id, "failed to queue reply");
		}
	}

	/// Dispatch one inbound frame (already stripped of any `ID` prefix).
	///
	/// Protocol-level problems are logged and dropped. An `Err` from
	/// here means the replica failed to integrate an update and is fatal
	/// for the room.
	pub async fn process(&self, frame: &[u8], sender: &Client) -> CnResult<()> {
		let Some(doc) = &self.doc else {
			// broadcast-only: no parsing, no state change
			self.broadcast(self.framed(frame.to_vec()), sender.id()).await;
			return Ok(());
		};

		let (tag, payload, _) = match protocol::infer_and_decode(self.format, frame) {
			Ok(decoded) => decoded,
			Err(err) => {
				debug!(room = %self.identifier, error = %err, "dropping undecodable frame");
				return Ok(());
			}
		};

		match tag {
			MessageTag::SyncStep1 => match doc.diff(&payload) {
				Ok(update) => {
					self.reply(sender, protocol::encode(MessageTag::SyncStep2, &update)).await;
					// reactive cross sync: ask the sender for its updates too
					let state = doc.state()?;
					self.reply(sender, protocol::encode(MessageTag::SyncStep1, &state)).await;
				}
				Err(err) => {
					debug!(room = %self.identifier, error = %err, "dropping step1 with invalid state vector");
				}
			},
			MessageTag::SyncStep2 | MessageTag::SyncUpdate => {
				if payload == EMPTY_UPDATE {
					return Ok(());
				}
				doc.apply(&payload)?;
				let message = self.framed(protocol::encode(MessageTag::SyncUpdate, &payload));
				self.broadcast(message, sender.id()).await;
			}
			MessageTag::Awareness => {
				debug!(room = %self.identifier, client = sender.id(), "dropping awareness state");
			}
			other => {
				debug!(room = %self.identifier, tag = ?other, "ignoring message");
			}
		}
		Ok(())
	}
}

#[async_trait]
impl Component for Room {
	fn label(&self) -> &'static str {
		"room"
	}

	fn lifecycle(&self) -> &Lifecycle {
		&self.lifecycle
	}

	async fn before(&self) -> CnResult<()> {
		if let Some(store) = &self.store {
			// the store replays the journal during its own startup, so
			// the replica is current before the first client frame
			store.start().await?;
		}
		Ok(())
	}

	async fn run(&self) -> CnResult<()> {
		// the room itself is driven by process()/add()/remove(); all it
		// watches is its store going away underneath it
		match &self.store {
			Some(store) => {
				let mut state = store.lifecycle().subscribe();
				loop {
					if *state.borrow_and_update() == State::None {
						return Err(Error::Internal("store stopped unexpectedly".into()));
					}
					if state.changed().await.is_err() {
						return Ok(());
					}
				}
			}
			None => {
				self.lifecycle.cancelled().await;
				Ok(())
			}
		}
	}

	async fn cleanup(&self) -> CnResult<()> {
		let clients: Vec<Client> = {
			let mut clients = self.clients.lock().await;
			clients.drain().map(|(_, client)| client).collect()
		};
		for client in &clients {
			client.close();
		}
		debug!(room = %self.identifier, count = clients.len(), "all clients closed");

		if let Some(store) = &self.store {
			if let Err(err) = store.stop().await {
				debug!(room = %self.identifier, error = %err, "store already stopped");
			}
		}
		Ok(())
	}
}

// vim: ts=4
