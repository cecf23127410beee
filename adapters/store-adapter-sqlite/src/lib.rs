//! SQLite-backed update journal.
//!
//! One database file per document, holding two tables:
//!
//! - `yupdates(yupdate BLOB)` — append-only; rowid order is application
//!   order.
//! - `metadata(key TEXT PRIMARY KEY, value TEXT)` — upsert; the reserved
//!   key `identifier` holds the document identifier.
//!
//! The store is a component bound to a [`SharedDoc`]: on startup it
//! replays the journal into the document and then observes every
//! committed transaction, queueing its update for a single writer task.
//! Stopping the store drains the queue before closing the database, so
//! an update observed by the store is persisted before the component
//! reaches `None`.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use concord_types::component::{Component, Lifecycle};
use concord_types::doc::{SharedDoc, Subscription};
use concord_types::prelude::*;

/// Upper bound of the in-memory write queue.
pub const WRITE_QUEUE: usize = 65_543;

/// Reserved metadata key holding the document identifier.
pub const IDENTIFIER_KEY: &str = "identifier";

fn db_err(err: &sqlx::Error) -> Error {
	warn!("DB: {:#?}", err);
	Error::DbError
}

async fn open_pool(path: &Path, create: bool) -> Result<SqlitePool, sqlx::Error> {
	let options = SqliteConnectOptions::new().filename(path).create_if_missing(create);
	SqlitePoolOptions::new().max_connections(1).connect_with(options).await
}

async fn provide_tables(pool: &SqlitePool) -> Result<(), sqlx::Error> {
	sqlx::query("CREATE TABLE IF NOT EXISTS yupdates (yupdate BLOB)")
		.execute(pool)
		.await?;
	sqlx::query("CREATE TABLE IF NOT EXISTS metadata (key TEXT PRIMARY KEY, value TEXT)")
		.execute(pool)
		.await?;
	Ok(())
}

async fn upsert_metadata(pool: &SqlitePool, key: &str, value: &str) -> Result<(), sqlx::Error> {
	sqlx::query(
		"INSERT INTO metadata (key, value) VALUES (?, ?)
		ON CONFLICT(key) DO UPDATE SET value = excluded.value",
	)
	.bind(key)
	.bind(value)
	.execute(pool)
	.await?;
	Ok(())
}

/// Append-only journal of document updates plus a metadata table,
/// persisted in a single SQLite file.
pub struct SqliteStore {
	lifecycle: Lifecycle,
	doc: SharedDoc,
	path: PathBuf,
	identifier: Mutex<Option<String>>,
	db: Mutex<Option<SqlitePool>>,
	queue_tx: mpsc::Sender<Vec<u8>>,
	queue_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
	observer: std::sync::Mutex<Option<Subscription>>,
}

impl SqliteStore {
	/// Bind a store to `doc`, journaling into the file at `path`. When
	/// `identifier` is `None` it is read back from the file's metadata,
	/// or freshly generated.
	pub fn new(doc: SharedDoc, identifier: Option<String>, path: impl Into<PathBuf>) -> Arc<Self> {
		let (queue_tx, queue_rx) = mpsc::channel(WRITE_QUEUE);
		Arc::new(Self {
			lifecycle: Lifecycle::new(),
			doc,
			path: path.into(),
			identifier: Mutex::new(identifier),
			db: Mutex::new(None),
			queue_tx,
			queue_rx: Mutex::new(queue_rx),
			observer: std::sync::Mutex::new(None),
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// The document identifier, once resolved during startup.
	pub async fn identifier(&self) -> Option<String> {
		self.identifier.lock().await.clone()
	}

	/// Enqueue an update for the writer task.
	pub async fn write(&self, update: Vec<u8>) -> CnResult<()> {
		self.queue_tx
			.send(update)
			.await
			.map_err(|_| Error::Internal("store write queue closed".into()))
	}

	/// Replay the journal into the attached document, in insertion order.
	pub async fn read(&self) -> CnResult<()> {
		let db = self.db.lock().await;
		let pool = db
			.as_ref()
			.ok_or_else(|| Error::Internal("store database not open".into()))?;
		let rows = sqlx::query("SELECT yupdate FROM yupdates ORDER BY rowid")
			.fetch_all(pool)
			.await
			.map_err(|err| db_err(&err))?;
		let count = rows.len();
		for row in rows {
			let update: Vec<u8> = row.get("yupdate");
			self.doc.apply(&update)?;
		}
		debug!(path = %self.path.display(), count, "replayed journal");
		Ok(())
	}

	async fn write_row(&self, update: &[u8]) -> CnResult<()> {
		let db = self.db.lock().await;
		let pool = db
			.as_ref()
			.ok_or_else(|| Error::Internal("store database not open".into()))?;
		sqlx::query("INSERT INTO yupdates (yupdate) VALUES (?)")
			.bind(update)
			.execute(pool)
			.await
			.map_err(|err| db_err(&err))?;
		Ok(())
	}

	async fn ensure_identifier(&self) -> CnResult<()> {
		let mut identifier = self.identifier.lock().await;
		let db = self.db.lock().await;
		let pool = db
			.as_ref()
			.ok_or_else(|| Error::Internal("store database not open".into()))?;

		match identifier.as_deref() {
			Some(id) => {
				upsert_metadata(pool, IDENTIFIER_KEY, id)
					.await
					.map_err(|err| db_err(&err))?;
			}
			None => {
				let row = sqlx::query("SELECT value FROM metadata WHERE key = ?")
					.bind(IDENTIFIER_KEY)
					.fetch_optional(pool)
					.await
					.map_err(|err| db_err(&err))?;
				let id = match row {
					Some(row) => row.get::<String, _>("value"),
					None => {
						let fresh = Uuid::new_v4().to_string();
						upsert_metadata(pool, IDENTIFIER_KEY, &fresh)
							.await
							.map_err(|err| db_err(&err))?;
						fresh
					}
				};
				*identifier = Some(id);
			}
		}
		Ok(())
	}

	/// Read the metadata table of a closed journal file. A missing file
	/// or table reads as an empty map.
	pub async fn get_metadata(path: &Path) -> CnResult<HashMap<String, String>> {
		let Ok(pool) = open_pool(path, false).await else {
			return Ok(HashMap::new());
		};
		let rows = sqlx::query("SELECT key, value FROM metadata").fetch_all(&pool).await;
		let metadata = match rows {
			Ok(rows) => rows
				.into_iter()
				.map(|row| (row.get::<String, _>("key"), row.get::<String, _>("value")))
				.collect(),
			Err(_) => HashMap::new(),
		};
		pool.close().await;
		Ok(metadata)
	}

	/// Upsert metadata on a closed journal file. With `replace`, keys
	/// absent from `metadata` are removed.
	pub async fn set_metadata(
		path: &Path,
		metadata: &HashMap<String, String>,
		replace: bool,
	) -> CnResult<()> {
		let pool = open_pool(path, true).await.map_err(|err| db_err(&err))?;
		provide_tables(&pool).await.map_err(|err| db_err(&err))?;

		for (key, value) in metadata {
			upsert_metadata(&pool, key, value)
				.await
				.map_err(|err| db_err(&err))?;
		}

		if replace {
			if metadata.is_empty() {
				sqlx::query("DELETE FROM metadata")
					.execute(&pool)
					.await
					.map_err(|err| db_err(&err))?;
			} else {
				let mut query =
					sqlx::QueryBuilder::<sqlx::Sqlite>::new("DELETE FROM metadata WHERE key NOT IN (");
				let mut separated = query.separated(", ");
				for key in metadata.keys() {
					separated.push_bind(key);
				}
				query.push(")");
				query
					.build()
					.execute(&pool)
					.await
					.map_err(|err| db_err(&err))?;
			}
		}

		pool.close().await;
		Ok(())
	}
}

#[async_trait]
impl Component for SqliteStore {
	fn label(&self) -> &'static str {
		"store"
	}

	fn lifecycle(&self) -> &Lifecycle {
		&self.lifecycle
	}

	async fn before(&self) -> CnResult<()> {
		let pool = open_pool(&self.path, true).await.map_err(|err| db_err(&err))?;
		provide_tables(&pool).await.map_err(|err| db_err(&err))?;
		*self.db.lock().await = Some(pool);
		debug!(path = %self.path.display(), "database initialized");

		self.ensure_identifier().await?;
		self.read().await?;

		// attach the observer only after replay so startup updates are
		// not journaled twice
		let subscription = self.doc.observe_into(self.queue_tx.clone())?;
		if let Ok(mut observer) = self.observer.lock() {
			*observer = Some(subscription);
		}
		Ok(())
	}

	async fn run(&self) -> CnResult<()> {
		let mut queue = self.queue_rx.lock().await;
		while let Some(update) = queue.recv().await {
			self.write_row(&update).await?;
		}
		Ok(())
	}

	async fn cleanup(&self) -> CnResult<()> {
		if let Ok(mut observer) = self.observer.lock() {
			observer.take();
		}

		// drain whatever the writer task did not get to
		let mut drained = 0usize;
		{
			let mut queue = self.queue_rx.lock().await;
			while let Ok(update) = queue.try_recv() {
				if let Err(err) = self.write_row(&update).await {
					warn!(error = %err, "failed to flush queued update");
					break;
				}
				drained += 1;
			}
		}
		if drained > 0 {
			debug!(count = drained, "flushed queued updates");
		}

		let pool = self.db.lock().await.take();
		if let Some(pool) = pool {
			pool.close().await;
			debug!(path = %self.path.display(), "closed database");
		}
		Ok(())
	}
}

// vim: ts=4
