//! Handle over a shared CRDT document.
//!
//! `SharedDoc` is the only coupling to the underlying CRDT library. It
//! exposes the narrow contract the rest of the stack relies on: state
//! vectors, diffs, update application and transaction observation, all
//! in the v1 binary encoding. Every operation is synchronous and must
//! not suspend; observers are synchronous callbacks that push onto
//! bounded channels so no async work ever runs inside a transaction.

use std::sync::Arc;

use tokio::sync::mpsc;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

pub use yrs::{Subscription, TextRef, TransactionMut};

use crate::prelude::*;
use crate::protocol::EMPTY_UPDATE;

/// Capacity of observer channels. Matches the store's write queue bound.
pub const UPDATE_QUEUE: usize = 65_543;

/// One committed transaction as seen by an observer.
#[derive(Debug, Clone)]
pub struct DocUpdate {
	/// Binary diff of the transaction (v1 encoding).
	pub update: Vec<u8>,
	/// Origin tag of the transaction, if any.
	pub origin: Option<Vec<u8>>,
}

/// Cheaply cloneable handle over a replicated document. Clones share the
/// same underlying replica.
#[derive(Debug, Clone)]
pub struct SharedDoc {
	doc: Arc<Doc>,
}

impl SharedDoc {
	pub fn new() -> Self {
		Self { doc: Arc::new(Doc::new()) }
	}

	/// Current state vector: a compact summary of the updates this
	/// replica has seen.
	pub fn state(&self) -> CnResult<Vec<u8>> {
		let txn = self
			.doc
			.try_transact()
			.map_err(|err| Error::Doc(format!("transaction failed: {}", err)))?;
		Ok(txn.state_vector().encode_v1())
	}

	/// Update bringing a peer at `peer_state` up to this replica's state.
	pub fn diff(&self, peer_state: &[u8]) -> CnResult<Vec<u8>> {
		let state = StateVector::decode_v1(peer_state)
			.map_err(|err| Error::Doc(format!("invalid state vector: {}", err)))?;
		let txn = self
			.doc
			.try_transact()
			.map_err(|err| Error::Doc(format!("transaction failed: {}", err)))?;
		Ok(txn.encode_diff_v1(&state))
	}

	/// The full document as one update (diff against the empty state).
	pub fn diff_all(&self) -> CnResult<Vec<u8>> {
		self.diff(&[0x00])
	}

	/// Integrate a remote update. The `0x00 0x00` sentinel is a no-op;
	/// application is idempotent.
	pub fn apply(&self, update: &[u8]) -> CnResult<()> {
		self.integrate(update, None)
	}

	/// Integrate a remote update inside a transaction tagged `origin`,
	/// so observers can tell it apart from local edits.
	pub fn apply_with_origin(&self, update: &[u8], origin: &str) -> CnResult<()> {
		self.integrate(update, Some(origin))
	}

	fn integrate(&self, update: &[u8], origin: Option<&str>) -> CnResult<()> {
		if update == EMPTY_UPDATE {
			return Ok(());
		}
		let decoded = Update::decode_v1(update)
			.map_err(|err| Error::Doc(format!("invalid update: {}", err)))?;
		let mut txn = match origin {
			Some(origin) => self.doc.try_transact_mut_with(origin),
			None => self.doc.try_transact_mut(),
		}
		.map_err(|err| Error::Doc(format!("transaction failed: {}", err)))?;
		txn.apply_update(decoded)
			.map_err(|err| Error::Doc(format!("update application failed: {}", err)))?;
		Ok(())
	}

	/// Observe committed transactions. Returns the subscription handle
	/// (dropping it unsubscribes) and a bounded receiver of updates with
	/// their origins. Overflow drops the update with a warning.
	pub fn observe_updates(&self) -> CnResult<(Subscription, mpsc::Receiver<DocUpdate>)> {
		let (tx, rx) = mpsc::channel(UPDATE_QUEUE);
		let subscription = self
			.doc
			.observe_update_v1(move |txn, event| {
				let doc_update = DocUpdate {
					update: event.update.clone(),
					origin: txn.origin().map(|origin| origin.as_ref().to_vec()),
				};
				if tx.try_send(doc_update).is_err() {
					warn!("observer queue full or closed, dropping update");
				}
			})
			.map_err(|err| Error::Doc(format!("observe failed: {}", err)))?;
		Ok((subscription, rx))
	}

	/// Observe committed transactions, feeding the raw update bytes into
	/// an existing queue. Sentinel updates are skipped.
	pub fn observe_into(&self, queue: mpsc::Sender<Vec<u8>>) -> CnResult<Subscription> {
		let subscription = self
			.doc
			.observe_update_v1(move |_txn, event| {
				if event.update.as_slice() == EMPTY_UPDATE {
					return;
				}
				if queue.try_send(event.update.clone()).is_err() {
					warn!("update queue full or closed, dropping update");
				}
			})
			.map_err(|err| Error::Doc(format!("observe failed: {}", err)))?;
		Ok(subscription)
	}

	/// Run several mutations inside one transaction tagged `origin`, so
	/// they commit as a single observed update.
	pub fn with_transaction<F, T>(&self, origin: &str, mutate: F) -> CnResult<T>
	where
		F: FnOnce(&mut TransactionMut) -> T,
	{
		let mut txn = self
			.doc
			.try_transact_mut_with(origin)
			.map_err(|err| Error::Doc(format!("transaction failed: {}", err)))?;
		Ok(mutate(&mut txn))
	}

	/// Handle to the named shared text object.
	pub fn text(&self, name: &str) -> TextRef {
		self.doc.get_or_insert_text(name)
	}

	/// Materialised contents of the named text object.
	pub fn text_content(&self, name: &str) -> CnResult<String> {
		let text = self.doc.get_or_insert_text(name);
		let txn = self
			.doc
			.try_transact()
			.map_err(|err| Error::Doc(format!("transaction failed: {}", err)))?;
		Ok(text.get_string(&txn))
	}

	/// Insert `chunk` into the named text object at `index`.
	pub fn insert_text(&self, name: &str, index: u32, chunk: &str) -> CnResult<()> {
		let text = self.doc.get_or_insert_text(name);
		let mut txn = self
			.doc
			.try_transact_mut()
			.map_err(|err| Error::Doc(format!("transaction failed: {}", err)))?;
		text.insert(&mut txn, index, chunk);
		Ok(())
	}

	/// Append `chunk` to the named text object.
	pub fn push_text(&self, name: &str, chunk: &str) -> CnResult<()> {
		let text = self.doc.get_or_insert_text(name);
		let mut txn = self
			.doc
			.try_transact_mut()
			.map_err(|err| Error::Doc(format!("transaction failed: {}", err)))?;
		text.push(&mut txn, chunk);
		Ok(())
	}
}

impl Default for SharedDoc {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn replicas_converge_via_diff_and_apply() {
		let left = SharedDoc::new();
		let right = SharedDoc::new();

		left.push_text("content", "hello").unwrap();
		let update = left.diff(&right.state().unwrap()).unwrap();
		right.apply(&update).unwrap();

		assert_eq!(right.text_content("content").unwrap(), "hello");
		assert_eq!(left.state().unwrap(), right.state().unwrap());
	}

	#[test]
	fn applying_the_same_update_twice_is_idempotent() {
		let left = SharedDoc::new();
		let right = SharedDoc::new();

		left.push_text("content", "abc").unwrap();
		let update = left.diff_all().unwrap();
		right.apply(&update).unwrap();
		right.apply(&update).unwrap();

		assert_eq!(right.text_content("content").unwrap(), "abc");
	}

	#[test]
	fn sentinel_update_is_a_no_op() {
		let doc = SharedDoc::new();
		doc.apply(EMPTY_UPDATE).unwrap();
		assert_eq!(doc.text_content("content").unwrap(), "");
	}

	#[test]
	fn empty_doc_diff_is_the_sentinel() {
		let doc = SharedDoc::new();
		assert_eq!(doc.diff_all().unwrap(), EMPTY_UPDATE);
	}

	#[tokio::test]
	async fn observer_reports_updates_with_origin() {
		let doc = SharedDoc::new();
		let (_subscription, mut rx) = doc.observe_updates().unwrap();

		doc.push_text("content", "local").unwrap();
		let event = rx.recv().await.unwrap();
		assert!(event.origin.is_none());
		assert_ne!(event.update.as_slice(), EMPTY_UPDATE);

		let other = SharedDoc::new();
		other.push_text("content", "remote").unwrap();
		doc.apply_with_origin(&other.diff_all().unwrap(), "peer").unwrap();
		let event = rx.recv().await.unwrap();
		assert_eq!(event.origin.as_deref(), Some(b"peer".as_slice()));

		// the observed update reproduces the change on a fresh replica
		let fresh = SharedDoc::new();
		fresh.apply(&event.update).unwrap();
		assert_eq!(fresh.text_content("content").unwrap(), "remote");
	}

	#[tokio::test]
	async fn transaction_commits_several_mutations_as_one_update() {
		let doc = SharedDoc::new();
		let (_subscription, mut rx) = doc.observe_updates().unwrap();

		let text = doc.text("content");
		doc.with_transaction("editor", |txn| {
			text.push(txn, "one ");
			text.push(txn, "two");
		})
		.unwrap();

		let event = rx.recv().await.unwrap();
		assert_eq!(event.origin.as_deref(), Some(b"editor".as_slice()));
		assert!(rx.try_recv().is_err());

		let fresh = SharedDoc::new();
		fresh.apply(&event.update).unwrap();
		assert_eq!(fresh.text_content("content").unwrap(), "one two");
	}

	#[tokio::test]
	async fn observer_channel_feeds_existing_queue() {
		let doc = SharedDoc::new();
		let (tx, mut rx) = mpsc::channel(8);
		let _subscription = doc.observe_into(tx).unwrap();

		doc.push_text("content", "journal me").unwrap();
		let update = rx.recv().await.unwrap();

		let fresh = SharedDoc::new();
		fresh.apply(&update).unwrap();
		assert_eq!(fresh.text_content("content").unwrap(), "journal me");
	}
}

// vim: ts=4
