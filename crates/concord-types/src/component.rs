//! Supervised component lifecycle.
//!
//! Every long-running subsystem (room, store, relay, connection,
//! provider, renderer) is a [`Component`]: a unit with `before`, `run`
//! and `cleanup` hooks driven by a single supervised task. The observable
//! state machine is `None → Active → Running → (stopping) → None`;
//! connection-like components additionally publish `Connected`.
//!
//! Cancellation is cooperative: `stop()` cancels the component's token,
//! the supervising task stops racing `run()` against it and then awaits
//! `cleanup()` outside the race, so cleanup always completes — even when
//! the whole process is shutting down on a signal.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::prelude::*;

/// Observable component state. The discriminants form a bitmask so that
/// waiters can await any of several states at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
	None = 1,
	Active = 2,
	Running = 4,
	Connected = 8,
}

impl State {
	pub const fn bit(self) -> u8 {
		self as u8
	}
}

/// Mask matching any started state.
pub const STARTED: u8 = State::Active.bit() | State::Running.bit() | State::Connected.bit();

#[derive(Debug, Default)]
struct LifecycleInner {
	token: Option<CancellationToken>,
	task: Option<JoinHandle<()>>,
}

/// Per-component lifecycle bookkeeping: the state bus, the cancellation
/// token of the current incarnation and the supervising task handle.
#[derive(Debug)]
pub struct Lifecycle {
	state: watch::Sender<State>,
	inner: Mutex<LifecycleInner>,
}

impl Lifecycle {
	pub fn new() -> Self {
		let (state, _) = watch::channel(State::None);
		Self { state, inner: Mutex::new(LifecycleInner::default()) }
	}

	/// Current state.
	pub fn state(&self) -> State {
		*self.state.borrow()
	}

	/// Subscribe to state transitions.
	pub fn subscribe(&self) -> watch::Receiver<State> {
		self.state.subscribe()
	}

	/// Publish a state transition.
	pub fn set(&self, state: State) {
		let _ = self.state.send_replace(state);
	}

	/// Wait until the state matches any bit of `mask`, returning the state.
	pub async fn wait_for(&self, mask: u8) -> State {
		let mut rx = self.state.subscribe();
		loop {
			let current = *rx.borrow_and_update();
			if current.bit() & mask != 0 {
				return current;
			}
			if rx.changed().await.is_err() {
				return current;
			}
		}
	}

	/// The cancellation token of the running incarnation, if any.
	pub fn token(&self) -> Option<CancellationToken> {
		match self.inner.lock() {
			Ok(inner) => inner.token.clone(),
			Err(_) => None,
		}
	}

	/// Resolve when the current incarnation is cancelled. Pending forever
	/// when the component is not running.
	pub async fn cancelled(&self) {
		match self.token() {
			Some(token) => token.cancelled().await,
			None => std::future::pending().await,
		}
	}

	fn begin(&self, label: &'static str) -> CnResult<CancellationToken> {
		let mut inner = self
			.inner
			.lock()
			.map_err(|_| Error::Internal("lifecycle mutex poisoned".into()))?;
		if inner.token.is_some() {
			return Err(Error::AlreadyRunning(label));
		}
		let token = CancellationToken::new();
		inner.token = Some(token.clone());
		Ok(token)
	}

	fn attach(&self, task: JoinHandle<()>) {
		if let Ok(mut inner) = self.inner.lock() {
			inner.task = Some(task);
		}
	}

	fn end(&self, label: &'static str) -> CnResult<(CancellationToken, Option<JoinHandle<()>>)> {
		let mut inner = self
			.inner
			.lock()
			.map_err(|_| Error::Internal("lifecycle mutex poisoned".into()))?;
		match inner.token.take() {
			Some(token) => Ok((token, inner.task.take())),
			None => Err(Error::NotRunning(label)),
		}
	}

	fn finish(&self) {
		if let Ok(mut inner) = self.inner.lock() {
			inner.token = None;
			inner.task = None;
		}
	}
}

impl Default for Lifecycle {
	fn default() -> Self {
		Self::new()
	}
}

/// A supervised unit with `before`/`run`/`cleanup` hooks.
///
/// All hooks default to no-ops; the default `run` parks until the
/// component is cancelled so that components driven purely by external
/// calls (rooms, stores with their own queues) need not override it.
#[async_trait]
pub trait Component: Send + Sync + 'static {
	/// Short name used in logs and lifecycle errors.
	fn label(&self) -> &'static str;

	fn lifecycle(&self) -> &Lifecycle;

	async fn before(&self) -> CnResult<()> {
		Ok(())
	}

	async fn run(&self) -> CnResult<()> {
		self.lifecycle().cancelled().await;
		Ok(())
	}

	async fn cleanup(&self) -> CnResult<()> {
		Ok(())
	}
}

/// Start/stop surface for shared components.
#[async_trait]
pub trait ComponentExt {
	/// Spawn the supervised task. Waits for `before()` to finish and
	/// propagates its error; fails with `AlreadyRunning` when the
	/// component is already started.
	async fn start(&self) -> CnResult<()>;

	/// Cancel the component and wait until its cleanup has completed.
	/// Fails with `NotRunning` when the component is not started.
	async fn stop(&self) -> CnResult<()>;

	/// Wait until the component state matches any bit of `mask`.
	async fn wait_for(&self, mask: u8) -> State;
}

#[async_trait]
impl<C: Component> ComponentExt for Arc<C> {
	async fn start(&self) -> CnResult<()> {
		let token = self.lifecycle().begin(self.label())?;
		let (ready_tx, ready_rx) = oneshot::channel::<CnResult<()>>();
		let this = Arc::clone(self);

		let task = tokio::spawn(async move {
			let lifecycle = this.lifecycle();
			debug!(component = this.label(), "starting");

			if let Err(err) = this.before().await {
				warn!(component = this.label(), error = %err, "startup failed");
				lifecycle.set(State::None);
				lifecycle.finish();
				let _ = ready_tx.send(Err(err));
				return;
			}
			lifecycle.set(State::Active);
			lifecycle.set(State::Running);
			let _ = ready_tx.send(Ok(()));
			info!(component = this.label(), "started");

			// biased so run() is polled at least once even when the stop
			// request arrives right after startup
			let outcome = tokio::select! {
				biased;
				result = this.run() => Some(result),
				() = token.cancelled() => None,
			};
			match outcome {
				Some(Err(err)) => {
					warn!(component = this.label(), error = %err, "run failed");
				}
				// run finished on its own; stay up so cleanup ordering is
				// preserved until someone calls stop()
				Some(Ok(())) => token.cancelled().await,
				None => {}
			}

			info!(component = this.label(), "stopping");
			if let Err(err) = this.cleanup().await {
				warn!(component = this.label(), error = %err, "cleanup failed");
			}
			lifecycle.set(State::None);
			lifecycle.finish();
			info!(component = this.label(), "stopped");
		});

		self.lifecycle().attach(task);
		match ready_rx.await {
			Ok(result) => result,
			Err(_) => Err(Error::Internal("component task dropped before startup".into())),
		}
	}

	async fn stop(&self) -> CnResult<()> {
		let (token, task) = self.lifecycle().end(self.label())?;
		debug!(component = self.label(), "cancelled");
		token.cancel();
		if let Some(task) = task {
			if let Err(err) = task.await {
				warn!(component = self.label(), error = %err, "component task panicked");
			}
		}
		Ok(())
	}

	async fn wait_for(&self, mask: u8) -> State {
		self.lifecycle().wait_for(mask).await
	}
}


// vim: ts=4
