//! Reconnecting framed transport.
//!
//! An explicit connect state machine: `Disconnected → Connecting →
//! Connected → Closing`, with exponential backoff between attempts.
//! While connected, the component publishes the `Connected` state bit,
//! feeds incoming binary frames to its [`FrameHandler`] and drains an
//! outbound queue into the socket. Connection loss drops back to
//! `Running` and reconnects transparently; HTTP-level handshake failures
//! are offered to `on_exception`, which may supply replacement options
//! (for example a fresh Authorization header) for the next attempt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, WebSocketStream};

use concord_types::component::{Component, Lifecycle, State};

use crate::prelude::*;

/// Outbound frame queue bound per connection.
const OUTBOUND_QUEUE: usize = 1024;

/// Transport options merged into every connection attempt.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
	/// Extra request headers, e.g. `("Authorization", "Basic …")`.
	pub headers: Vec<(String, String)>,
}

impl ConnectOptions {
	/// Options carrying an HTTP Basic Authorization header.
	pub fn with_basic_auth(username: &str, password: &str) -> Self {
		Self { headers: vec![("Authorization".to_string(), basic_authorization(username, password))] }
	}

	fn merge(&mut self, other: ConnectOptions) {
		for (name, value) in other.headers {
			match self.headers.iter_mut().find(|(existing, _)| *existing == name) {
				Some(entry) => entry.1 = value,
				None => self.headers.push((name, value)),
			}
		}
	}
}

/// The value of a Basic Authorization header for the given credentials.
pub fn basic_authorization(username: &str, password: &str) -> String {
	format!("Basic {}", BASE64.encode(format!("{}:{}", username, password)))
}

/// Exponential reconnect backoff with a cap.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
	pub initial: Duration,
	pub max: Duration,
}

impl Default for Backoff {
	fn default() -> Self {
		Self { initial: Duration::from_millis(500), max: Duration::from_secs(30) }
	}
}

impl Backoff {
	fn delay(&self, attempt: u32) -> Duration {
		self.initial.saturating_mul(1u32 << attempt.min(16)).min(self.max)
	}
}

/// Handshake-level failures offered to `on_exception`.
#[derive(Debug)]
pub enum ConnectFailure {
	/// The server answered the upgrade with a non-success HTTP status.
	InvalidStatus(u16),
	/// The configured URI or options could not form a request.
	InvalidUri(String),
}

impl std::fmt::Display for ConnectFailure {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			Self::InvalidStatus(status) => write!(f, "handshake rejected with status {}", status),
			Self::InvalidUri(reason) => write!(f, "invalid connection uri: {}", reason),
		}
	}
}

/// Send half handed to [`FrameHandler`] callbacks.
#[derive(Debug, Clone)]
pub struct Link {
	outbound: mpsc::Sender<Vec<u8>>,
}

impl Link {
	/// Queue a frame. Dropped with a debug log once the connection is gone.
	pub async fn send(&self, frame: Vec<u8>) {
		if self.outbound.send(frame).await.is_err() {
			debug!("dropping frame, connection closed");
		}
	}
}

/// Callbacks driving a [`Connection`].
#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
	/// Invoked once per successful connect, before the receive loop.
	async fn on_connect(&self, link: &Link) -> CnResult<()> {
		let _ = link;
		Ok(())
	}

	/// Invoked for every received binary frame. An `Err` is fatal for
	/// the connection component.
	async fn on_recv(&self, frame: Vec<u8>, link: &Link) -> CnResult<()>;

	/// Invoked on handshake-level failures. Return replacement options
	/// to retry with, `None` to retry unchanged, or an `Err` to stop the
	/// connection permanently. The default re-raises.
	async fn on_exception(&self, failure: &ConnectFailure) -> CnResult<Option<ConnectOptions>> {
		Err(Error::NetworkError(failure.to_string()))
	}
}

pub struct Connection {
	lifecycle: Lifecycle,
	uri: String,
	options: Mutex<ConnectOptions>,
	backoff: Backoff,
	handler: Arc<dyn FrameHandler>,
	current: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl Connection {
	pub fn new(
		uri: impl Into<String>,
		options: ConnectOptions,
		handler: Arc<dyn FrameHandler>,
	) -> Arc<Self> {
		Arc::new(Self {
			lifecycle: Lifecycle::new(),
			uri: uri.into(),
			options: Mutex::new(options),
			backoff: Backoff::default(),
			handler,
			current: Mutex::new(None),
		})
	}

	pub fn uri(&self) -> &str {
		&self.uri
	}

	/// Queue a frame on the live connection; dropped with a debug log
	/// while disconnected (the next `on_connect` resynchronises).
	pub async fn send(&self, frame: Vec<u8>) {
		let outbound = { self.current.lock().await.clone() };
		match outbound {
			Some(outbound) => {
				if outbound.send(frame).await.is_err() {
					debug!("dropping frame, outbound queue closed");
				}
			}
			None => debug!("dropping frame while disconnected"),
		}
	}

	async fn request(&self) -> CnResult<tungstenite::handshake::client::Request> {
		let mut request = self
			.uri
			.as_str()
			.into_client_request()
			.map_err(|err| Error::ConfigError(format!("invalid server uri: {}", err)))?;
		let options = self.options.lock().await;
		for (name, value) in &options.headers {
			let name = tungstenite::http::HeaderName::try_from(name.as_str())
				.map_err(|err| Error::ConfigError(format!("invalid header name: {}", err)))?;
			let value = tungstenite::http::HeaderValue::from_str(value)
				.map_err(|err| Error::ConfigError(format!("invalid header value: {}", err)))?;
			request.headers_mut().insert(name, value);
		}
		Ok(request)
	}

	/// Drive one established connection until it closes. An `Err` from
	/// `on_recv` propagates and stops the component.
	async fn serve<S>(&self, stream: WebSocketStream<S>) -> CnResult<()>
	where
		S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
	{
		let (mut sink, mut stream) = stream.split();
		let (outbound, mut outbound_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);
		*self.current.lock().await = Some(outbound.clone());
		self.lifecycle.set(State::Connected);

		let writer = tokio::spawn(async move {
			while let Some(frame) = outbound_rx.recv().await {
				if sink.send(Message::Binary(frame)).await.is_err() {
					break;
				}
			}
			let _ = sink.send(Message::Close(None)).await;
		});

		let link = Link { outbound };
		let result = async {
			self.handler.on_connect(&link).await?;
			while let Some(message) = stream.next().await {
				match message {
					Ok(Message::Binary(frame)) => self.handler.on_recv(frame, &link).await?,
					Ok(Message::Close(_)) => break,
					Ok(_) => {}
					Err(err) => {
						debug!(error = %err, "receive error");
						break;
					}
				}
			}
			Ok(())
		}
		.await;

		*self.current.lock().await = None;
		self.lifecycle.set(State::Running);
		drop(link);
		let _ = writer.await;
		result
	}
}

#[async_trait]
impl Component for Connection {
	fn label(&self) -> &'static str {
		"connection"
	}

	fn lifecycle(&self) -> &Lifecycle {
		&self.lifecycle
	}

	async fn run(&self) -> CnResult<()> {
		let mut attempt: u32 = 0;
		loop {
			let request = match self.request().await {
				Ok(request) => Some(request),
				Err(err) => {
					let failure = ConnectFailure::InvalidUri(err.to_string());
					if let Some(options) = self.handler.on_exception(&failure).await? {
						self.options.lock().await.merge(options);
					}
					None
				}
			};

			if let Some(request) = request {
				match connect_async(request).await {
					Ok((stream, _response)) => {
						attempt = 0;
						info!(uri = %self.uri, "connection opened");
						self.serve(stream).await?;
						info!(uri = %self.uri, "connection closed");
					}
					Err(tungstenite::Error::Http(response)) => {
						let failure = ConnectFailure::InvalidStatus(response.status().as_u16());
						debug!(uri = %self.uri, status = response.status().as_u16(), "handshake rejected");
						if let Some(options) = self.handler.on_exception(&failure).await? {
							self.options.lock().await.merge(options);
						}
					}
					Err(err) => {
						debug!(uri = %self.uri, error = %err, "connect failed");
					}
				}
			}

			attempt = attempt.saturating_add(1);
			tokio::time::sleep(self.backoff.delay(attempt)).await;
		}
	}

	async fn cleanup(&self) -> CnResult<()> {
		// dropping the outbound sender makes the writer task send a
		// close frame and tear the socket down
		*self.current.lock().await = None;
		Ok(())
	}
}


// vim: ts=4
