//! Transient per-client presence state.
//!
//! Each client owns a field map (`{user: {...}}` and the like) stamped
//! with a monotonically increasing clock. Remote states merge
//! last-writer-wins per client: a state only applies when its clock is
//! newer than what is already known. Awareness is propagated best-effort
//! and never persisted.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::watch;

use crate::prelude::*;

/// One client's presence entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerState {
	pub clock: u32,
	pub fields: HashMap<String, Value>,
}

/// Presence registry of one client plus everything it has heard about
/// its peers.
#[derive(Debug)]
pub struct Awareness {
	client_id: u64,
	peers: Mutex<HashMap<u64, PeerState>>,
	version: watch::Sender<u64>,
}

impl Awareness {
	pub fn new(client_id: u64) -> Self {
		let (version, _) = watch::channel(0);
		Self { client_id, peers: Mutex::new(HashMap::new()), version }
	}

	pub fn client_id(&self) -> u64 {
		self.client_id
	}

	/// Set a field of the local state, bumping the local clock.
	pub fn set_local_field(&self, field: impl Into<String>, value: Value) -> CnResult<()> {
		let mut peers = self
			.peers
			.lock()
			.map_err(|_| Error::Internal("awareness mutex poisoned".into()))?;
		let entry = peers.entry(self.client_id).or_default();
		entry.clock += 1;
		entry.fields.insert(field.into(), value);
		drop(peers);
		self.bump();
		Ok(())
	}

	/// Merge a remote client's state. Returns whether anything changed.
	pub fn apply_remote(
		&self,
		client_id: u64,
		clock: u32,
		fields: HashMap<String, Value>,
	) -> CnResult<bool> {
		let mut peers = self
			.peers
			.lock()
			.map_err(|_| Error::Internal("awareness mutex poisoned".into()))?;
		let entry = peers.entry(client_id).or_default();
		if clock <= entry.clock {
			debug!(client = client_id, clock, "dropping stale awareness state");
			return Ok(false);
		}
		entry.clock = clock;
		for (field, value) in fields {
			entry.fields.insert(field, value);
		}
		drop(peers);
		self.bump();
		Ok(true)
	}

	/// Forget a client, e.g. when it disconnects.
	pub fn remove(&self, client_id: u64) -> CnResult<()> {
		let mut peers = self
			.peers
			.lock()
			.map_err(|_| Error::Internal("awareness mutex poisoned".into()))?;
		let removed = peers.remove(&client_id).is_some();
		drop(peers);
		if removed {
			self.bump();
		}
		Ok(())
	}

	pub fn peer(&self, client_id: u64) -> Option<PeerState> {
		self.peers.lock().ok()?.get(&client_id).cloned()
	}

	pub fn local_state(&self) -> Option<PeerState> {
		self.peer(self.client_id)
	}

	/// Observe changes: the watched value increments on every mutation.
	pub fn subscribe(&self) -> watch::Receiver<u64> {
		self.version.subscribe()
	}

	fn bump(&self) {
		self.version.send_modify(|version| *version += 1);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn local_fields_bump_the_clock() {
		let awareness = Awareness::new(7);
		awareness.set_local_field("user", json!({"name": "alice"})).unwrap();
		awareness.set_local_field("cursor", json!(3)).unwrap();

		let local = awareness.local_state().unwrap();
		assert_eq!(local.clock, 2);
		assert_eq!(local.fields.get("user"), Some(&json!({"name": "alice"})));
	}

	#[test]
	fn remote_states_merge_last_writer_wins() {
		let awareness = Awareness::new(7);
		let mut fields = HashMap::new();
		fields.insert("user".to_string(), json!({"name": "bob"}));
		assert!(awareness.apply_remote(9, 3, fields).unwrap());

		// stale clock is ignored
		let mut stale = HashMap::new();
		stale.insert("user".to_string(), json!({"name": "mallory"}));
		assert!(!awareness.apply_remote(9, 2, stale).unwrap());
		assert_eq!(awareness.peer(9).unwrap().fields.get("user"), Some(&json!({"name": "bob"})));

		// newer clock wins per field
		let mut newer = HashMap::new();
		newer.insert("user".to_string(), json!({"name": "robert"}));
		assert!(awareness.apply_remote(9, 4, newer).unwrap());
		assert_eq!(
			awareness.peer(9).unwrap().fields.get("user"),
			Some(&json!({"name": "robert"}))
		);
	}

	#[test]
	fn observers_see_every_change() {
		let awareness = Awareness::new(7);
		let rx = awareness.subscribe();
		assert_eq!(*rx.borrow(), 0);

		awareness.set_local_field("user", json!("alice")).unwrap();
		assert_eq!(*rx.borrow(), 1);

		awareness.remove(7).unwrap();
		assert_eq!(*rx.borrow(), 2);
	}
}

// vim: ts=4
