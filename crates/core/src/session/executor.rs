//! Session executor: issues operations, classifies failures, retries.
//!
//! Every mutation of the in-flight set, the sequencer and the retry timers
//! happens as a job on the session's [`SerialContext`]. Transport callbacks
//! arrive on arbitrary threads through a [`ResponseSink`] and are funnelled
//! onto the context before they touch anything.

use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use prim_protocol::{RequestHeader, ResponseHeader, ResponseType};
use prim_runtime::SerialContext;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::attempt::{Attempt, Disposition, HeaderFn, Operation, OperationKind, RequestFn, Target, classify};
use super::handle::{OperationFuture, StreamObserver};
use super::sequencer::SessionSequencer;
use super::state::{PrimitiveState, SessionState};
use crate::error::Error;

/// State owned by a session's execution context.
pub(crate) struct ExecutorCore {
	state: Arc<SessionState>,
	sequencer: SessionSequencer,
	attempts: BTreeMap<u64, Box<dyn Operation>>,
	closed: bool,
}

impl ExecutorCore {
	fn new(state: Arc<SessionState>) -> Self {
		Self {
			sequencer: SessionSequencer::new(Arc::clone(&state)),
			state,
			attempts: BTreeMap::new(),
			closed: false,
		}
	}

	fn session(&self) -> u64 {
		self.state.session_id()
	}

	/// Sends an attempt and tracks it, or fails it if the session is gone.
	fn invoke(&mut self, ctx: &SerialContext<ExecutorCore>, operation: Box<dyn Operation>) {
		if self.closed || self.state.state().is_terminal() {
			debug!(target = "prim.executor", session = self.session(), id = operation.id(), kind = %operation.kind(), "session closed; failing operation");
			operation.fail(&mut self.sequencer, Error::session_closed());
			return;
		}

		trace!(
			target = "prim.executor",
			session = self.session(),
			id = operation.id(),
			attempt = operation.attempt(),
			sequence = operation.sequence_number(),
			kind = %operation.kind(),
			"sending"
		);
		let id = operation.id();
		operation.send(ctx);
		self.attempts.insert(id, operation);
	}

	/// Removes the typed attempt registered under `id`.
	fn take<T: Send + 'static>(&mut self, id: u64) -> Option<Box<Attempt<T>>> {
		let Some(operation) = self.attempts.remove(&id) else {
			trace!(target = "prim.executor", session = self.session(), id, "response for completed operation");
			return None;
		};
		match operation.downcast::<Attempt<T>>() {
			Ok(attempt) => Some(attempt),
			Err(operation) => {
				warn!(target = "prim.executor", session = self.session(), id, "response type does not match operation");
				self.attempts.insert(id, operation);
				None
			}
		}
	}

	fn reconnected(&self) {
		if self.state.state() == PrimitiveState::Suspended {
			self.state.set_state(PrimitiveState::Connected);
		}
	}

	fn deliver_next<T: Send + 'static>(&mut self, id: u64, attempt: u32, response: T) {
		let Some(mut operation) = self.take::<T>(id) else {
			return;
		};
		let header = operation.header_of(&response);

		if !operation.kind.is_stream() {
			// A late success from an earlier attempt still answers the request.
			if operation.attempt != attempt {
				debug!(target = "prim.executor", session = self.session(), id, attempt, current = operation.attempt, "accepting response from earlier attempt");
			}
			self.reconnected();
			operation.succeed(&mut self.sequencer, header, response);
			return;
		}

		if operation.attempt != attempt {
			trace!(target = "prim.executor", session = self.session(), id, attempt, current = operation.attempt, "dropping item from stale stream");
			self.attempts.insert(id, operation);
			return;
		}

		self.reconnected();
		if header.response_type == ResponseType::CloseStream {
			operation.finish(&mut self.sequencer);
			return;
		}
		operation.push(&mut self.sequencer, header, response);
		self.attempts.insert(id, operation);
	}

	fn deliver_completed<T: Send + 'static>(&mut self, ctx: &SerialContext<ExecutorCore>, id: u64, attempt: u32) {
		let Some(operation) = self.take::<T>(id) else {
			return;
		};
		if operation.attempt != attempt {
			trace!(target = "prim.executor", session = self.session(), id, attempt, "ignoring completion from stale attempt");
			self.attempts.insert(id, operation);
			return;
		}

		if operation.kind.is_stream() {
			debug!(target = "prim.executor", session = self.session(), id, "stream completed");
			operation.finish(&mut self.sequencer);
		} else {
			// A unary call that ends without a response lost its channel.
			self.handle_failure(ctx, operation, Error::ChannelClosed);
		}
	}

	fn deliver_error(&mut self, ctx: &SerialContext<ExecutorCore>, id: u64, attempt: u32, error: Error) {
		let Some(operation) = self.attempts.remove(&id) else {
			trace!(target = "prim.executor", session = self.session(), id, %error, "error for completed operation");
			return;
		};
		if operation.attempt() != attempt {
			trace!(target = "prim.executor", session = self.session(), id, attempt, %error, "ignoring error from stale attempt");
			self.attempts.insert(id, operation);
			return;
		}
		self.handle_failure(ctx, operation, error);
	}

	fn handle_failure(&mut self, ctx: &SerialContext<ExecutorCore>, operation: Box<dyn Operation>, error: Error) {
		let id = operation.id();
		let attempt = operation.attempt();
		let kind = operation.kind();

		match classify(kind, &error, attempt) {
			Disposition::Expired(error) => {
				warn!(target = "prim.executor", session = self.session(), id, %kind, %error, "session expired");
				operation.fail(&mut self.sequencer, error);
				self.state.set_state(PrimitiveState::Expired);
			}
			Disposition::Closed(error) => {
				warn!(target = "prim.executor", session = self.session(), id, %kind, %error, "session closed by server");
				operation.fail(&mut self.sequencer, error);
				self.state.set_state(PrimitiveState::Closed);
			}
			Disposition::Retry(delay) => {
				debug!(target = "prim.executor", session = self.session(), id, attempt, %kind, %error, ?delay, "retrying after transient failure");
				self.attempts.insert(id, operation);
				self.state.set_state(PrimitiveState::Suspended);
				ctx.schedule(delay, move |core, ctx| core.retry(ctx, id, attempt));
			}
			Disposition::Replay => {
				debug!(target = "prim.executor", session = self.session(), id, attempt, %error, "replaying commands");
				self.attempts.insert(id, operation);
				self.retry(ctx, id, attempt);
				self.resubmit(ctx, id, attempt);
			}
			Disposition::Fail(error) => {
				debug!(target = "prim.executor", session = self.session(), id, %kind, %error, "operation failed");
				operation.fail(&mut self.sequencer, error);
			}
		}
	}

	/// Re-sends attempt number `expected` of `id` as the next attempt.
	///
	/// No-op if the operation has completed or moved on to another attempt.
	fn retry(&mut self, ctx: &SerialContext<ExecutorCore>, id: u64, expected: u32) {
		let Some(operation) = self.attempts.remove(&id) else {
			return;
		};
		if operation.attempt() != expected {
			self.attempts.insert(id, operation);
			return;
		}
		let next = operation.next();
		debug!(target = "prim.executor", session = self.session(), id, attempt = next.attempt(), kind = %next.kind(), "retrying operation");
		self.invoke(ctx, next);
	}

	/// Resends the unary commands issued after `after`, in id order.
	fn resubmit(&mut self, ctx: &SerialContext<ExecutorCore>, after: u64, max_attempt: u32) {
		let pending: Vec<(u64, u32)> = self
			.attempts
			.range(after + 1..)
			.filter(|(_, op)| op.kind() == OperationKind::Command && op.attempt() <= max_attempt)
			.map(|(id, op)| (*id, op.attempt()))
			.collect();
		for (id, attempt) in pending {
			self.retry(ctx, id, attempt);
		}
	}

	fn reset(&mut self, ctx: &SerialContext<ExecutorCore>) {
		let pending: Vec<(u64, u32, OperationKind)> = self.attempts.values().map(|op| (op.id(), op.attempt(), op.kind())).collect();
		debug!(target = "prim.executor", session = self.session(), pending = pending.len(), "resetting session operations");

		for (id, attempt, kind) in pending {
			if kind == OperationKind::Query {
				if let Some(operation) = self.attempts.remove(&id) {
					operation.fail(&mut self.sequencer, Error::query_failed());
				}
			} else {
				self.retry(ctx, id, attempt);
			}
		}
	}

	/// Applies a successful keep-alive answered at log `index`.
	fn keep_alive_succeeded(&mut self, ctx: &SerialContext<ExecutorCore>, index: u64) {
		let previous = self.state.state();
		if previous.is_terminal() {
			return;
		}
		self.state.set_response_index(index);
		self.state.set_state(PrimitiveState::Connected);
		if previous == PrimitiveState::Suspended {
			debug!(target = "prim.keepalive", session = self.session(), "session recovered; resending operations");
			self.reset(ctx);
		}
	}

	fn close(&mut self) {
		self.closed = true;
		let attempts = std::mem::take(&mut self.attempts);
		debug!(target = "prim.executor", session = self.session(), outstanding = attempts.len(), "closing executor");
		for (_, operation) in attempts {
			operation.fail(&mut self.sequencer, Error::session_closed());
		}
	}
}

/// Callback surface handed to the transport for one attempt.
///
/// Calls may come from any thread; each one is queued onto the session's
/// execution context. Calls arriving after the session shut down are dropped.
pub struct ResponseSink<T> {
	id: u64,
	attempt: u32,
	context: SerialContext<ExecutorCore>,
	_response: PhantomData<fn(T)>,
}

impl<T> Clone for ResponseSink<T> {
	fn clone(&self) -> Self {
		Self {
			id: self.id,
			attempt: self.attempt,
			context: self.context.clone(),
			_response: PhantomData,
		}
	}
}

impl<T> std::fmt::Debug for ResponseSink<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ResponseSink")
			.field("id", &self.id)
			.field("attempt", &self.attempt)
			.finish_non_exhaustive()
	}
}

impl<T: Send + 'static> ResponseSink<T> {
	pub(crate) fn new(id: u64, attempt: u32, context: SerialContext<ExecutorCore>) -> Self {
		Self {
			id,
			attempt,
			context,
			_response: PhantomData,
		}
	}

	/// Client id of the operation.
	pub fn id(&self) -> u64 {
		self.id
	}

	/// Attempt number this sink reports for.
	pub fn attempt(&self) -> u32 {
		self.attempt
	}

	/// Delivers a response (unary) or the next stream item.
	pub fn on_next(&self, response: T) {
		let (id, attempt) = (self.id, self.attempt);
		if !self.context.execute(move |core, _| core.deliver_next(id, attempt, response)) {
			trace!(target = "prim.executor", id, attempt, "response after shutdown dropped");
		}
	}

	/// Reports a transport or server failure.
	pub fn on_error(&self, error: Error) {
		let (id, attempt) = (self.id, self.attempt);
		if !self.context.execute(move |core, ctx| core.deliver_error(ctx, id, attempt, error)) {
			trace!(target = "prim.executor", id, attempt, "error after shutdown dropped");
		}
	}

	/// Reports that the server ended the call.
	pub fn on_completed(&self) {
		let (id, attempt) = (self.id, self.attempt);
		if !self.context.execute(move |core, ctx| core.deliver_completed::<T>(ctx, id, attempt)) {
			trace!(target = "prim.executor", id, attempt, "completion after shutdown dropped");
		}
	}
}

/// Executes operations on one primitive session.
///
/// Cheap to clone; clones share the same execution context. Completions are
/// released in submission order regardless of the order responses arrive.
#[derive(Debug, Clone)]
pub struct SessionExecutor {
	state: Arc<SessionState>,
	context: SerialContext<ExecutorCore>,
}

impl SessionExecutor {
	/// Spawns the execution context for `state`.
	///
	/// Must be called from within a tokio runtime.
	pub fn new(state: Arc<SessionState>) -> Self {
		let core = ExecutorCore::new(Arc::clone(&state));
		let context = SerialContext::spawn(format!("session-{}", state.session_id()), core);
		Self { state, context }
	}

	/// Session state shared with the executor.
	pub fn state(&self) -> &Arc<SessionState> {
		&self.state
	}

	/// Submits a state-mutating request.
	///
	/// `request` is called once per attempt with the request header and the
	/// sink to report through. `response_header` extracts the common header
	/// from a response.
	pub fn execute_command<T, F, H>(&self, request: F, response_header: H) -> OperationFuture<T>
	where
		T: Send + 'static,
		F: Fn(RequestHeader, ResponseSink<T>) + Send + Sync + 'static,
		H: Fn(&T) -> ResponseHeader + Send + Sync + 'static,
	{
		let (tx, future) = OperationFuture::pending();
		self.submit(OperationKind::Command, Arc::new(request), Arc::new(response_header), Target::Unary(Some(tx)));
		future
	}

	/// Submits a read-only request.
	pub fn execute_query<T, F, H>(&self, request: F, response_header: H) -> OperationFuture<T>
	where
		T: Send + 'static,
		F: Fn(RequestHeader, ResponseSink<T>) + Send + Sync + 'static,
		H: Fn(&T) -> ResponseHeader + Send + Sync + 'static,
	{
		let (tx, future) = OperationFuture::pending();
		self.submit(OperationKind::Query, Arc::new(request), Arc::new(response_header), Target::Unary(Some(tx)));
		future
	}

	/// Submits a command whose response is a stream of items.
	///
	/// The handle resolves to the log index at which the stream was opened.
	/// Items are delivered to `observer` in stream order.
	pub fn execute_command_stream<T, F, H, O>(&self, request: F, response_header: H, observer: O) -> OperationFuture<u64>
	where
		T: Send + 'static,
		F: Fn(RequestHeader, ResponseSink<T>) + Send + Sync + 'static,
		H: Fn(&T) -> ResponseHeader + Send + Sync + 'static,
		O: StreamObserver<T>,
	{
		let (tx, future) = OperationFuture::pending();
		let target = Target::CommandStream {
			result: Some(tx),
			observer: Arc::new(observer),
		};
		self.submit(OperationKind::CommandStream, Arc::new(request), Arc::new(response_header), target);
		future
	}

	/// Submits a query whose response is a stream of items.
	pub fn execute_query_stream<T, F, H, O>(&self, request: F, response_header: H, observer: O) -> OperationFuture<()>
	where
		T: Send + 'static,
		F: Fn(RequestHeader, ResponseSink<T>) + Send + Sync + 'static,
		H: Fn(&T) -> ResponseHeader + Send + Sync + 'static,
		O: StreamObserver<T>,
	{
		let (tx, future) = OperationFuture::pending();
		let target = Target::QueryStream {
			result: Some(tx),
			observer: Arc::new(observer),
		};
		self.submit(OperationKind::QueryStream, Arc::new(request), Arc::new(response_header), target);
		future
	}

	fn submit<T: Send + 'static>(&self, kind: OperationKind, request: RequestFn<T>, response_header: HeaderFn<T>, target: Target<T>) {
		let state = self.state.state();
		if state.is_terminal() {
			debug!(target = "prim.executor", session = self.state.session_id(), %kind, %state, "rejecting operation on terminated session");
			target.reject(Error::session_closed());
			return;
		}

		let submitted = self.context.execute(move |core, ctx| {
			let header = if kind.is_command() {
				core.state.command_header()
			} else {
				core.state.query_header()
			};
			let id = core.sequencer.next_request();
			let attempt = Attempt::new(id, kind, header, request, response_header, target, Arc::clone(&core.state));
			core.invoke(ctx, Box::new(attempt));
		});
		if !submitted {
			debug!(target = "prim.executor", session = self.state.session_id(), %kind, "executor shut down; operation dropped");
		}
	}

	/// Resends every outstanding command and stream as a fresh attempt and
	/// fails outstanding unary queries.
	///
	/// Acknowledged streams are re-opened too; items the observer already
	/// received are dropped when the server replays them.
	///
	/// Called when a suspended session is known to be alive again.
	pub fn reset(&self) {
		self.context.execute(|core, ctx| core.reset(ctx));
	}

	/// Records a keep-alive the server answered at log `index`.
	///
	/// A suspended session reconnects and resends its outstanding operations.
	pub(crate) fn keep_alive_succeeded(&self, index: u64) {
		self.context.execute(move |core, ctx| core.keep_alive_succeeded(ctx, index));
	}

	/// Fails every outstanding operation with a session-closed conflict and
	/// stops the execution context.
	///
	/// The shutdown is queued immediately; the returned future resolves once
	/// it has run. Subsequent submissions fail fast. Closing twice is a no-op.
	pub fn close(&self) -> impl Future<Output = ()> + Send + 'static {
		let (tx, rx) = oneshot::channel();
		let submitted = self.context.execute(move |core, ctx| {
			core.close();
			let _ = tx.send(());
			ctx.shutdown();
		});
		async move {
			if submitted {
				let _ = rx.await;
			}
		}
	}

	/// Number of operations awaiting a response or still streaming.
	pub fn in_flight(&self) -> OperationFuture<usize> {
		let (tx, future) = OperationFuture::pending();
		self.context.execute(move |core, _| {
			let _ = tx.send(Ok(core.attempts.len()));
		});
		future
	}
}
