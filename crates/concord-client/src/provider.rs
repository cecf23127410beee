//! Sync provider: keeps a local document in sync with one room.
//!
//! On every (re)connect the provider sends `SYNC_STEP1` with its state
//! vector and proactively follows up with `SYNC_STEP2` carrying its
//! whole history ("proactive cross sync"), so peers converge without
//! having to ask. Incoming updates are applied under a local origin tag;
//! the document observer skips that tag so the provider never echoes a
//! remote update back.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use concord_types::component::{Component, ComponentExt, Lifecycle, State};
use concord_types::doc::{DocUpdate, SharedDoc, Subscription};
use concord_types::protocol::{self, MessageTag, WireFormat, EMPTY_UPDATE};

use crate::connection::{ConnectOptions, Connection, FrameHandler, Link};
use crate::prelude::*;

/// Origin tag of transactions applying remote updates.
pub const LOCAL_ORIGIN: &str = "concord-provider";

/// Message dispatch shared between the provider and its connection.
struct SyncCore {
	doc: SharedDoc,
	identifier: String,
	format: WireFormat,
	awareness_sink: Option<mpsc::Sender<Vec<u8>>>,
}

impl SyncCore {
	/// Wrap an outbound message for the wire format.
	fn framed(&self, message: Vec<u8>) -> Vec<u8> {
		match self.format {
			WireFormat::Plain => message,
			WireFormat::Multiplexed => protocol::encode_with_id(&self.identifier, &message),
		}
	}

	async fn send(&self, link: &Link, message: Vec<u8>) {
		link.send(self.framed(message)).await;
	}
}

#[async_trait]
impl FrameHandler for SyncCore {
	async fn on_connect(&self, link: &Link) -> CnResult<()> {
		// init sync
		let state = self.doc.state()?;
		self.send(link, protocol::encode(MessageTag::SyncStep1, &state)).await;

		// proactive cross sync
		let update = self.doc.diff_all()?;
		self.send(link, protocol::encode(MessageTag::SyncStep2, &update)).await;
		Ok(())
	}

	async fn on_recv(&self, frame: Vec<u8>, link: &Link) -> CnResult<()> {
		let inner: &[u8] = match self.format {
			WireFormat::Plain => &frame,
			WireFormat::Multiplexed => match protocol::split_id(&frame) {
				Ok((identifier, inner)) => {
					if identifier != self.identifier {
						debug!(got = %identifier, expected = %self.identifier, "identifier mismatch");
						return Ok(());
					}
					inner
				}
				Err(err) => {
					debug!(error = %err, "expected identifier prefix");
					return Ok(());
				}
			},
		};

		let (tag, payload, _) = match protocol::infer_and_decode(self.format, inner) {
			Ok(decoded) => decoded,
			Err(err) => {
				debug!(error = %err, "failed to infer message");
				return Ok(());
			}
		};

		match tag {
			MessageTag::SyncStep1 => match self.doc.diff(&payload) {
				Ok(update) => {
					self.send(link, protocol::encode(MessageTag::SyncStep2, &update)).await;
				}
				Err(err) => debug!(error = %err, "dropping step1 with invalid state vector"),
			},
			MessageTag::SyncStep2 | MessageTag::SyncUpdate => {
				if payload != EMPTY_UPDATE {
					self.doc.apply_with_origin(&payload, LOCAL_ORIGIN)?;
				}
			}
			MessageTag::SyncCross => match protocol::decode_cross(&payload) {
				Ok((update, state)) => {
					if update != EMPTY_UPDATE {
						self.doc.apply_with_origin(&update, LOCAL_ORIGIN)?;
					}
					match self.doc.diff(&state) {
						Ok(reply) => {
							self.send(link, protocol::encode(MessageTag::SyncStep2, &reply)).await;
						}
						Err(err) => debug!(error = %err, "dropping cross sync with invalid state vector"),
					}
				}
				Err(err) => debug!(error = %err, "malformed cross sync payload"),
			},
			MessageTag::Awareness => {
				if let Some(sink) = &self.awareness_sink {
					if sink.try_send(payload).is_err() {
						debug!("awareness sink full, dropping state");
					}
				}
			}
			other => debug!(tag = ?other, "unhandled message"),
		}
		Ok(())
	}
}

/// Client-side sync driver binding `(doc, identifier, server_uri)`.
pub struct Provider {
	lifecycle: Lifecycle,
	doc: SharedDoc,
	core: Arc<SyncCore>,
	connection: Arc<Connection>,
	observer: StdMutex<Option<Subscription>>,
	updates: Mutex<Option<mpsc::Receiver<DocUpdate>>>,
}

impl Provider {
	pub fn new(
		doc: SharedDoc,
		identifier: impl Into<String>,
		server_uri: &str,
		format: WireFormat,
	) -> Arc<Self> {
		Self::with_options(doc, identifier, server_uri, format, ConnectOptions::default(), None)
	}

	pub fn with_options(
		doc: SharedDoc,
		identifier: impl Into<String>,
		server_uri: &str,
		format: WireFormat,
		options: ConnectOptions,
		awareness_sink: Option<mpsc::Sender<Vec<u8>>>,
	) -> Arc<Self> {
		let identifier = identifier.into();
		let uri = match format {
			WireFormat::Plain => join_uri(server_uri, &identifier),
			WireFormat::Multiplexed => server_uri.to_string(),
		};
		let core = Arc::new(SyncCore { doc: doc.clone(), identifier, format, awareness_sink });
		let connection = Connection::new(uri, options, core.clone());
		Arc::new(Self {
			lifecycle: Lifecycle::new(),
			doc,
			core,
			connection,
			observer: StdMutex::new(None),
			updates: Mutex::new(None),
		})
	}

	pub fn identifier(&self) -> &str {
		&self.core.identifier
	}

	pub fn connection(&self) -> &Arc<Connection> {
		&self.connection
	}

	fn mirror(&self, state: State) {
		match state {
			State::Connected => self.lifecycle.set(State::Connected),
			State::Running => self.lifecycle.set(State::Running),
			_ => {}
		}
	}
}

fn join_uri(server: &str, identifier: &str) -> String {
	format!("{}/{}", server.trim_end_matches('/'), identifier)
}

#[async_trait]
impl Component for Provider {
	fn label(&self) -> &'static str {
		"provider"
	}

	fn lifecycle(&self) -> &Lifecycle {
		&self.lifecycle
	}

	async fn before(&self) -> CnResult<()> {
		let (subscription, updates) = self.doc.observe_updates()?;
		if let Ok(mut observer) = self.observer.lock() {
			*observer = Some(subscription);
		}
		*self.updates.lock().await = Some(updates);
		self.connection.start().await?;
		Ok(())
	}

	async fn run(&self) -> CnResult<()> {
		let mut updates = self
			.updates
			.lock()
			.await
			.take()
			.ok_or_else(|| Error::Internal("provider observer queue missing".into()))?;
		let mut connection_state = self.connection.lifecycle().subscribe();
		self.mirror(*connection_state.borrow_and_update());

		loop {
			tokio::select! {
				update = updates.recv() => {
					let Some(DocUpdate { update, origin }) = update else {
						return Ok(());
					};
					if update == EMPTY_UPDATE {
						continue;
					}
					if origin.as_deref() == Some(LOCAL_ORIGIN.as_bytes()) {
						continue;
					}
					debug!("forwarding local update");
					self.connection
						.send(self.core.framed(protocol::encode(MessageTag::SyncUpdate, &update)))
						.await;
				}
				changed = connection_state.changed() => {
					if changed.is_err() {
						return Ok(());
					}
					let state = *connection_state.borrow_and_update();
					if state == State::None {
						return Err(Error::NetworkError("connection stopped".into()));
					}
					self.mirror(state);
				}
			}
		}
	}

	async fn cleanup(&self) -> CnResult<()> {
		if let Ok(mut observer) = self.observer.lock() {
			observer.take();
		}
		if let Err(err) = self.connection.stop().await {
			debug!(error = %err, "connection already stopped");
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn plain_uri_appends_the_identifier() {
		assert_eq!(join_uri("ws://localhost:8000", "doc1"), "ws://localhost:8000/doc1");
		assert_eq!(join_uri("ws://localhost:8000/", "doc1"), "ws://localhost:8000/doc1");
	}
}

// vim: ts=4
