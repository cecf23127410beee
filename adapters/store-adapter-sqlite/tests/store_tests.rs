//! Store integration tests: metadata round-trips, journal durability and
//! replay on reopen.

use std::collections::HashMap;

use concord_store_sqlite::{SqliteStore, IDENTIFIER_KEY};
use concord_types::component::ComponentExt;
use concord_types::doc::SharedDoc;
use tempfile::TempDir;

fn metadata(pairs: &[(&str, &str)]) -> HashMap<String, String> {
	pairs
		.iter()
		.map(|(key, value)| ((*key).to_string(), (*value).to_string()))
		.collect()
}

#[tokio::test]
async fn metadata_round_trip() {
	let dir = TempDir::new().expect("Failed to create temp directory");
	let path = dir.path().join("doc.sqlite");

	let map = metadata(&[("identifier", "doc-1"), ("name", "notes"), ("render", "notes.txt")]);
	SqliteStore::set_metadata(&path, &map, false).await.unwrap();

	let read = SqliteStore::get_metadata(&path).await.unwrap();
	assert_eq!(read, map);
}

#[tokio::test]
async fn metadata_on_missing_file_is_empty() {
	let dir = TempDir::new().expect("Failed to create temp directory");
	let path = dir.path().join("nonexistent.sqlite");

	let read = SqliteStore::get_metadata(&path).await.unwrap();
	assert!(read.is_empty());
}

#[tokio::test]
async fn replace_removes_absent_keys() {
	let dir = TempDir::new().expect("Failed to create temp directory");
	let path = dir.path().join("doc.sqlite");

	SqliteStore::set_metadata(&path, &metadata(&[("a", "1"), ("b", "2"), ("c", "3")]), false)
		.await
		.unwrap();
	SqliteStore::set_metadata(&path, &metadata(&[("a", "10"), ("c", "3")]), true)
		.await
		.unwrap();

	let read = SqliteStore::get_metadata(&path).await.unwrap();
	assert_eq!(read, metadata(&[("a", "10"), ("c", "3")]));
}

#[tokio::test]
async fn identifier_given_at_construction_is_persisted() {
	let dir = TempDir::new().expect("Failed to create temp directory");
	let path = dir.path().join("doc.sqlite");

	let doc = SharedDoc::new();
	let store = SqliteStore::new(doc, Some("doc-42".to_string()), &path);
	store.start().await.unwrap();
	store.stop().await.unwrap();

	let read = SqliteStore::get_metadata(&path).await.unwrap();
	assert_eq!(read.get(IDENTIFIER_KEY).map(String::as_str), Some("doc-42"));
}

#[tokio::test]
async fn missing_identifier_is_generated_and_stable() {
	let dir = TempDir::new().expect("Failed to create temp directory");
	let path = dir.path().join("doc.sqlite");

	let store = SqliteStore::new(SharedDoc::new(), None, &path);
	store.start().await.unwrap();
	let generated = store.identifier().await.unwrap();
	assert!(!generated.is_empty());
	store.stop().await.unwrap();

	// a second store on the same file reads the identifier back
	let reopened = SqliteStore::new(SharedDoc::new(), None, &path);
	reopened.start().await.unwrap();
	assert_eq!(reopened.identifier().await.unwrap(), generated);
	reopened.stop().await.unwrap();
}

#[tokio::test]
async fn updates_enqueued_before_stop_are_persisted() {
	let dir = TempDir::new().expect("Failed to create temp directory");
	let path = dir.path().join("doc.sqlite");

	let doc = SharedDoc::new();
	let store = SqliteStore::new(doc.clone(), Some("doc-1".to_string()), &path);
	store.start().await.unwrap();

	// observed through the doc
	doc.push_text("content", "hello").unwrap();

	// enqueued directly, without touching the doc
	let side = SharedDoc::new();
	side.push_text("aside", "manual").unwrap();
	store.write(side.diff_all().unwrap()).await.unwrap();

	store.stop().await.unwrap();

	let replayed = SharedDoc::new();
	let reopened = SqliteStore::new(replayed.clone(), None, &path);
	reopened.start().await.unwrap();
	assert_eq!(replayed.text_content("content").unwrap(), "hello");
	assert_eq!(replayed.text_content("aside").unwrap(), "manual");
	reopened.stop().await.unwrap();
}

#[tokio::test]
async fn reopening_reconstructs_the_state_vector() {
	let dir = TempDir::new().expect("Failed to create temp directory");
	let path = dir.path().join("doc.sqlite");

	let doc = SharedDoc::new();
	let store = SqliteStore::new(doc.clone(), Some("doc-1".to_string()), &path);
	store.start().await.unwrap();
	doc.push_text("content", "hello").unwrap();
	doc.push_text("content", " world").unwrap();
	store.stop().await.unwrap();

	let replayed = SharedDoc::new();
	let reopened = SqliteStore::new(replayed.clone(), None, &path);
	reopened.start().await.unwrap();
	assert_eq!(replayed.state().unwrap(), doc.state().unwrap());
	assert_eq!(replayed.text_content("content").unwrap(), "hello world");
	reopened.stop().await.unwrap();
}
