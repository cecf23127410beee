//! Provider ↔ relay integration tests: initial sync in both directions,
//! convergence of divergent histories, journaling, and reconnects.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};

use concord::relay::{RelayOpts, RelayServer};
use concord_client::provider::Provider;
use concord_store_sqlite::SqliteStore;
use concord_types::component::{Component, ComponentExt, State};
use concord_types::doc::SharedDoc;
use concord_types::protocol::WireFormat;
use tempfile::TempDir;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll an async condition until it holds or the deadline passes.
macro_rules! eventually {
	($what:expr, $cond:expr) => {{
		let deadline = Instant::now() + Duration::from_secs(10);
		loop {
			if $cond {
				break;
			}
			assert!(Instant::now() < deadline, "timed out waiting for {}", $what);
			sleep(Duration::from_millis(50)).await;
		}
	}};
}

fn relay_opts(port: u16, format: WireFormat, journal_dir: Option<PathBuf>) -> RelayOpts {
	RelayOpts { host: "127.0.0.1".to_string(), port, format, persistent: true, journal_dir }
}

async fn start_relay(format: WireFormat, journal_dir: Option<PathBuf>) -> (Arc<RelayServer>, String) {
	let relay = RelayServer::new(relay_opts(0, format, journal_dir));
	relay.start().await.unwrap();
	let addr = relay.local_addr().unwrap();
	(relay, format!("ws://{}", addr))
}

async fn wait_connected(provider: &Arc<Provider>) {
	timeout(CONNECT_TIMEOUT, provider.wait_for(State::Connected.bit()))
		.await
		.expect("provider did not reach Connected");
}

/// Whether the room's replica state matches the given doc's state.
async fn room_matches(relay: &Arc<RelayServer>, identifier: &str, doc: &SharedDoc) -> bool {
	match relay.find_room(identifier).await {
		Some(room) => match room.doc() {
			Some(room_doc) => room_doc.state().ok() == doc.state().ok(),
			None => false,
		},
		None => false,
	}
}

#[tokio::test]
async fn empty_docs_converge_after_one_mutates() {
	let (relay, uri) = start_relay(WireFormat::Plain, None).await;

	let doc_a = SharedDoc::new();
	let doc_b = SharedDoc::new();
	let provider_a = Provider::new(doc_a.clone(), "doc1", &uri, WireFormat::Plain);
	let provider_b = Provider::new(doc_b.clone(), "doc1", &uri, WireFormat::Plain);
	provider_a.start().await.unwrap();
	provider_b.start().await.unwrap();
	wait_connected(&provider_a).await;
	wait_connected(&provider_b).await;

	doc_a.push_text("content", "hello").unwrap();

	eventually!(
		"both docs to contain the edit",
		doc_b.text_content("content").unwrap_or_default() == "hello"
			&& doc_a.state().unwrap() == doc_b.state().unwrap()
	);

	provider_a.stop().await.unwrap();
	provider_b.stop().await.unwrap();
	relay.stop().await.unwrap();
}

#[tokio::test]
async fn divergent_histories_converge_to_the_union() {
	let (relay, uri) = start_relay(WireFormat::Plain, None).await;

	let doc_a = SharedDoc::new();
	let doc_b = SharedDoc::new();
	doc_a.push_text("content", "AB").unwrap();
	doc_b.push_text("content", "CD").unwrap();

	let provider_a = Provider::new(doc_a.clone(), "doc1", &uri, WireFormat::Plain);
	let provider_b = Provider::new(doc_b.clone(), "doc1", &uri, WireFormat::Plain);
	provider_a.start().await.unwrap();
	provider_b.start().await.unwrap();

	eventually!("both docs to hold the union", {
		let a = doc_a.text_content("content").unwrap_or_default();
		let b = doc_b.text_content("content").unwrap_or_default();
		a.len() == 4
			&& a == b
			&& (a == "ABCD" || a == "CDAB")
			&& doc_a.state().unwrap() == doc_b.state().unwrap()
	});

	provider_a.stop().await.unwrap();
	provider_b.stop().await.unwrap();
	relay.stop().await.unwrap();
}

#[tokio::test]
async fn late_joiner_receives_server_content() {
	let (relay, uri) = start_relay(WireFormat::Plain, None).await;

	// seed the room through a first provider, then leave
	let doc_a = SharedDoc::new();
	let provider_a = Provider::new(doc_a.clone(), "doc1", &uri, WireFormat::Plain);
	provider_a.start().await.unwrap();
	wait_connected(&provider_a).await;
	doc_a.push_text("content", "hello").unwrap();
	eventually!("the room to apply the edit", room_matches(&relay, "doc1", &doc_a).await);
	provider_a.stop().await.unwrap();

	// a fresh provider with an empty doc catches up from the room
	let doc_b = SharedDoc::new();
	let provider_b = Provider::new(doc_b.clone(), "doc1", &uri, WireFormat::Plain);
	provider_b.start().await.unwrap();

	eventually!(
		"the late joiner to catch up",
		doc_b.text_content("content").unwrap_or_default() == "hello"
	);

	let room = relay.find_room("doc1").await.unwrap();
	assert_eq!(room.doc().unwrap().state().unwrap(), doc_b.state().unwrap());

	provider_b.stop().await.unwrap();
	relay.stop().await.unwrap();
}

#[tokio::test]
async fn client_content_reaches_the_room_and_its_journal() {
	let dir = TempDir::new().unwrap();
	let journal_dir = dir.path().join("docs");
	let (relay, uri) = start_relay(WireFormat::Plain, Some(journal_dir.clone())).await;

	let doc = SharedDoc::new();
	doc.push_text("content", "journal me").unwrap();
	let provider = Provider::new(doc.clone(), "doc1", &uri, WireFormat::Plain);
	provider.start().await.unwrap();

	eventually!("the room to match the provider", room_matches(&relay, "doc1", &doc).await);

	provider.stop().await.unwrap();
	relay.stop().await.unwrap();

	// the journal on disk reconstructs the document
	let journal = journal_dir.join("doc1");
	assert!(journal.exists());
	let metadata = SqliteStore::get_metadata(&journal).await.unwrap();
	assert_eq!(metadata.get("identifier").map(String::as_str), Some("doc1"));

	let replayed = SharedDoc::new();
	let store = SqliteStore::new(replayed.clone(), None, &journal);
	store.start().await.unwrap();
	assert_eq!(replayed.text_content("content").unwrap(), "journal me");
	store.stop().await.unwrap();
}

#[tokio::test]
async fn repeated_restarts_leave_state_consistent() {
	let (relay, uri) = start_relay(WireFormat::Plain, None).await;

	let doc = SharedDoc::new();
	let provider = Provider::new(doc.clone(), "doc1", &uri, WireFormat::Plain);

	for round in 0..3u32 {
		provider.start().await.unwrap();
		wait_connected(&provider).await;
		doc.push_text("content", &round.to_string()).unwrap();
		eventually!("the room to catch up", room_matches(&relay, "doc1", &doc).await);
		provider.stop().await.unwrap();
	}

	// with every provider gone the room eventually holds no connections
	let room = relay.find_room("doc1").await.unwrap();
	eventually!("the client set to drain", room.client_count().await == 0);
	assert_eq!(room.doc().unwrap().text_content("content").unwrap(), "012");

	relay.stop().await.unwrap();
}

#[tokio::test]
async fn provider_rejoins_after_relay_restart() {
	let (relay, uri) = start_relay(WireFormat::Plain, None).await;
	let port = relay.local_addr().unwrap().port();

	let doc = SharedDoc::new();
	let provider = Provider::new(doc.clone(), "doc1", &uri, WireFormat::Plain);
	provider.start().await.unwrap();
	wait_connected(&provider).await;

	relay.stop().await.unwrap();
	eventually!(
		"the provider to notice the loss",
		provider.lifecycle().state() != State::Connected
	);

	// a new relay on the same port; the provider rejoins on its own
	let restarted = RelayServer::new(relay_opts(port, WireFormat::Plain, None));
	restarted.start().await.unwrap();
	timeout(Duration::from_secs(20), provider.wait_for(State::Connected.bit()))
		.await
		.expect("provider did not reconnect");

	provider.stop().await.unwrap();
	restarted.stop().await.unwrap();
}

#[tokio::test]
async fn multiplexed_providers_share_one_endpoint() {
	let (relay, uri) = start_relay(WireFormat::Multiplexed, None).await;

	let doc_a = SharedDoc::new();
	let doc_b = SharedDoc::new();
	let provider_a = Provider::new(doc_a.clone(), "doc1", &uri, WireFormat::Multiplexed);
	let provider_b = Provider::new(doc_b.clone(), "doc1", &uri, WireFormat::Multiplexed);
	provider_a.start().await.unwrap();
	provider_b.start().await.unwrap();
	wait_connected(&provider_a).await;
	wait_connected(&provider_b).await;

	doc_a.push_text("content", "over one wire").unwrap();

	eventually!(
		"the multiplexed docs to converge",
		doc_b.text_content("content").unwrap_or_default() == "over one wire"
			&& doc_a.state().unwrap() == doc_b.state().unwrap()
	);

	provider_a.stop().await.unwrap();
	provider_b.stop().await.unwrap();
	relay.stop().await.unwrap();
}
