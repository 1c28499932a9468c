//! Managed primitive: session lifecycle around a [`SessionExecutor`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use prim_protocol::{
	CloseSessionRequest, CloseSessionResponse, ElectionEvent, ElectionResponse, IsLockedResponse, KeepAliveRequest, KeepAliveResponse,
	LockResponse, Name, OpenSessionRequest, OpenSessionResponse, RequestHeader, ResponseHeader, UnlockResponse,
};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::executor::{ResponseSink, SessionExecutor};
use super::handle::{OperationFuture, StreamObserver};
use super::state::{ListenerId, PrimitiveState, SessionState};
use crate::error::Result;
use crate::options::SessionOptions;

/// Session management calls every primitive service exposes.
pub trait SessionService: Send + Sync + 'static {
	/// Opens a session for a primitive.
	fn open_session(&self, request: OpenSessionRequest) -> BoxFuture<'static, Result<OpenSessionResponse>>;

	/// Renews the session lease.
	fn keep_alive(&self, request: KeepAliveRequest) -> BoxFuture<'static, Result<KeepAliveResponse>>;

	/// Ends the session, optionally deleting the primitive.
	fn close_session(&self, request: CloseSessionRequest) -> BoxFuture<'static, Result<CloseSessionResponse>>;
}

/// Response message carrying a common [`ResponseHeader`].
pub trait PrimitiveResponse: Send + 'static {
	fn header(&self) -> &ResponseHeader;
}

macro_rules! impl_primitive_response {
	($($ty:ty),* $(,)?) => {
		$(
			impl PrimitiveResponse for $ty {
				fn header(&self) -> &ResponseHeader {
					&self.header
				}
			}
		)*
	};
}

impl_primitive_response!(ElectionResponse, ElectionEvent, LockResponse, UnlockResponse, IsLockedResponse);

/// A primitive bound to an open session.
///
/// Owns the session state, the executor and the keep-alive task. Dropping
/// the primitive stops the keep-alive task and fails outstanding operations
/// without notifying the server; call [`ManagedPrimitive::close`] for an
/// orderly shutdown.
pub struct ManagedPrimitive<S: SessionService> {
	service: Arc<S>,
	state: Arc<SessionState>,
	executor: SessionExecutor,
	options: SessionOptions,
	keep_alive: Mutex<Option<JoinHandle<()>>>,
}

impl<S: SessionService> fmt::Debug for ManagedPrimitive<S> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ManagedPrimitive")
			.field("state", &self.state)
			.field("options", &self.options)
			.finish_non_exhaustive()
	}
}

impl<S: SessionService> ManagedPrimitive<S> {
	/// Opens a session for `name` and starts keeping it alive.
	pub async fn connect(name: Name, service: S, options: SessionOptions) -> Result<Self> {
		let service = Arc::new(service);
		let response = service
			.open_session(OpenSessionRequest {
				name: name.clone(),
				timeout: options.timeout,
			})
			.await?;

		let session_id = response.header.session_id;
		let state = Arc::new(SessionState::new(name, session_id, options.timeout));
		let executor = SessionExecutor::new(Arc::clone(&state));
		let interval = options.keep_alive_interval();
		let keep_alive = tokio::spawn(keep_alive(Arc::clone(&service), Arc::clone(&state), executor.clone(), interval));
		info!(target = "prim.primitive", name = %state.name(), session = session_id, timeout = ?options.timeout, ?interval, "session opened");

		Ok(Self {
			service,
			state,
			executor,
			options,
			keep_alive: Mutex::new(Some(keep_alive)),
		})
	}

	pub fn name(&self) -> &Name {
		self.state.name()
	}

	pub fn session_id(&self) -> u64 {
		self.state.session_id()
	}

	/// Current lifecycle state.
	pub fn state(&self) -> PrimitiveState {
		self.state.state()
	}

	pub fn session(&self) -> &Arc<SessionState> {
		&self.state
	}

	pub fn executor(&self) -> &SessionExecutor {
		&self.executor
	}

	pub fn service(&self) -> &Arc<S> {
		&self.service
	}

	pub fn options(&self) -> &SessionOptions {
		&self.options
	}

	/// Registers a listener for session state changes.
	pub fn add_state_change_listener<F>(&self, listener: F) -> ListenerId
	where
		F: Fn(PrimitiveState) + Send + Sync + 'static,
	{
		self.state.add_state_change_listener(listener)
	}

	pub fn remove_state_change_listener(&self, id: ListenerId) -> bool {
		self.state.remove_state_change_listener(id)
	}

	/// Issues a command through the service.
	pub fn command<T, F>(&self, call: F) -> OperationFuture<T>
	where
		T: PrimitiveResponse,
		F: Fn(&S, RequestHeader, ResponseSink<T>) + Send + Sync + 'static,
	{
		let service = Arc::clone(&self.service);
		self.executor.execute_command(move |header, sink| call(&service, header, sink), header_of::<T>)
	}

	/// Issues a query through the service.
	pub fn query<T, F>(&self, call: F) -> OperationFuture<T>
	where
		T: PrimitiveResponse,
		F: Fn(&S, RequestHeader, ResponseSink<T>) + Send + Sync + 'static,
	{
		let service = Arc::clone(&self.service);
		self.executor.execute_query(move |header, sink| call(&service, header, sink), header_of::<T>)
	}

	/// Opens a command stream through the service.
	pub fn command_stream<T, F, O>(&self, call: F, observer: O) -> OperationFuture<u64>
	where
		T: PrimitiveResponse,
		F: Fn(&S, RequestHeader, ResponseSink<T>) + Send + Sync + 'static,
		O: StreamObserver<T>,
	{
		let service = Arc::clone(&self.service);
		self.executor
			.execute_command_stream(move |header, sink| call(&service, header, sink), header_of::<T>, observer)
	}

	/// Opens a query stream through the service.
	pub fn query_stream<T, F, O>(&self, call: F, observer: O) -> OperationFuture<()>
	where
		T: PrimitiveResponse,
		F: Fn(&S, RequestHeader, ResponseSink<T>) + Send + Sync + 'static,
		O: StreamObserver<T>,
	{
		let service = Arc::clone(&self.service);
		self.executor
			.execute_query_stream(move |header, sink| call(&service, header, sink), header_of::<T>, observer)
	}

	/// Closes the session, keeping the primitive's state on the server.
	pub async fn close(&self) -> Result<()> {
		self.shutdown(false).await
	}

	/// Closes the session and deletes the primitive on the server.
	pub async fn delete(&self) -> Result<()> {
		self.shutdown(true).await
	}

	async fn shutdown(&self, delete: bool) -> Result<()> {
		if let Some(task) = self.keep_alive.lock().take() {
			task.abort();
		}
		self.executor.close().await;

		let state = self.state.state();
		if state.is_terminal() {
			debug!(target = "prim.primitive", name = %self.state.name(), session = self.state.session_id(), %state, "session already ended; skipping remote close");
			return Ok(());
		}

		let request = CloseSessionRequest {
			header: self.state.query_header(),
			delete,
		};
		let result = self.service.close_session(request).await;
		self.state.set_state(PrimitiveState::Closed);
		match &result {
			Ok(_) => info!(target = "prim.primitive", name = %self.state.name(), session = self.state.session_id(), delete, "session closed"),
			Err(error) => warn!(target = "prim.primitive", name = %self.state.name(), session = self.state.session_id(), %error, "closing session failed"),
		}
		result.map(|_| ())
	}
}

impl<S: SessionService> Drop for ManagedPrimitive<S> {
	fn drop(&mut self) {
		if let Some(task) = self.keep_alive.get_mut().take() {
			task.abort();
		}
		let _ = self.executor.close();
	}
}

fn header_of<T: PrimitiveResponse>(response: &T) -> ResponseHeader {
	response.header().clone()
}

async fn keep_alive<S: SessionService>(service: Arc<S>, state: Arc<SessionState>, executor: SessionExecutor, interval: Duration) {
	let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		ticker.tick().await;
		if state.state().is_terminal() {
			break;
		}

		let request = KeepAliveRequest {
			header: state.query_header(),
		};
		match service.keep_alive(request).await {
			Ok(response) if response.alive => executor.keep_alive_succeeded(response.header.index),
			Ok(_) => {
				warn!(target = "prim.keepalive", session = state.session_id(), "server reports session dead");
				state.set_state(PrimitiveState::Expired);
			}
			Err(error) if error.is_expired() => {
				warn!(target = "prim.keepalive", session = state.session_id(), %error, "session expired");
				state.set_state(PrimitiveState::Expired);
			}
			Err(error) if error.is_conflict() => {
				warn!(target = "prim.keepalive", session = state.session_id(), %error, "session closed by server");
				state.set_state(PrimitiveState::Closed);
			}
			Err(error) => {
				debug!(target = "prim.keepalive", session = state.session_id(), %error, "keep-alive failed");
				state.set_state(PrimitiveState::Suspended);
			}
		}
	}
	debug!(target = "prim.keepalive", session = state.session_id(), state = %state.state(), "keep-alive stopped");
}
