//! In-memory primitive service for testing sessions without a cluster.
//!
//! Every primitive call is handed to a [`FakeController`] as a
//! [`PendingCall`], which the test answers, fails or completes in whatever
//! order it likes. Session management calls are answered from a script.
//!
//! # Example
//!
//! ```ignore
//! let (service, mut controller) = FakeServiceBuilder::new().session_id(4).build();
//! let lock = AtomicLock::connect(Name::new("ns", "lock"), service, SessionOptions::default()).await?;
//!
//! let acquired = tokio::spawn(async move { lock.lock().await });
//! let call = controller.next_call().await.unwrap();
//! call.respond_at(5, json!({"acquired": true, "version": 5}))?;
//! assert_eq!(acquired.await??, 5);
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use prim_protocol::{
	CandidateRequest, CloseSessionRequest, CloseSessionResponse, ElectionEvent, ElectionResponse, IsLockedRequest, IsLockedResponse,
	KeepAliveRequest, KeepAliveResponse, LeadershipRequest, LockRequest, LockResponse, OpenSessionRequest, OpenSessionResponse,
	RequestHeader, ResponseHeader, UnlockRequest, UnlockResponse,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::election::ElectionService;
use crate::error::{Error, Result};
use crate::lock::LockService;
use crate::session::{ResponseSink, SessionService};

/// Builder for a fake service and its controller.
#[derive(Debug, Clone)]
pub struct FakeServiceBuilder {
	session_id: u64,
}

impl FakeServiceBuilder {
	pub fn new() -> Self {
		Self { session_id: 1 }
	}

	/// Session id handed out by `open_session`.
	pub fn session_id(mut self, session_id: u64) -> Self {
		self.session_id = session_id;
		self
	}

	pub fn build(self) -> (FakeService, FakeController) {
		let (calls_tx, calls_rx) = mpsc::unbounded_channel();
		let shared = Arc::new(Shared::default());

		let service = FakeService {
			session_id: self.session_id,
			calls: calls_tx,
			shared: Arc::clone(&shared),
		};
		let controller = FakeController {
			session_id: self.session_id,
			calls: calls_rx,
			shared,
		};
		(service, controller)
	}
}

impl Default for FakeServiceBuilder {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Default)]
struct Shared {
	opened: Mutex<Vec<OpenSessionRequest>>,
	keep_alives: Mutex<Vec<KeepAliveRequest>>,
	keep_alive_script: Mutex<VecDeque<Result<bool>>>,
	closed: Mutex<Vec<CloseSessionRequest>>,
	open_failure: Mutex<Option<Error>>,
}

/// Type-erased sink a pending call answers through.
trait Reply: Send + Sync {
	fn id(&self) -> u64;
	fn attempt(&self) -> u32;
	fn respond(&self, body: JsonValue) -> Result<()>;
	fn fail(&self, error: Error);
	fn complete(&self);
}

impl<T: DeserializeOwned + Send + 'static> Reply for ResponseSink<T> {
	fn id(&self) -> u64 {
		ResponseSink::id(self)
	}

	fn attempt(&self) -> u32 {
		ResponseSink::attempt(self)
	}

	fn respond(&self, body: JsonValue) -> Result<()> {
		let response: T = serde_json::from_value(body).map_err(|err| Error::Protocol(format!("invalid fake response: {err}")))?;
		self.on_next(response);
		Ok(())
	}

	fn fail(&self, error: Error) {
		self.on_error(error);
	}

	fn complete(&self) {
		self.on_completed();
	}
}

/// A primitive call waiting for the test to answer it.
pub struct PendingCall {
	/// Service method name, e.g. `"lock"` or `"events"`.
	pub method: &'static str,
	pub header: RequestHeader,
	/// Request serialized to JSON.
	pub body: JsonValue,
	/// When the call reached the service.
	pub received_at: Instant,
	session_id: u64,
	reply: Box<dyn Reply>,
}

impl std::fmt::Debug for PendingCall {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PendingCall")
			.field("method", &self.method)
			.field("id", &self.id())
			.field("attempt", &self.attempt())
			.field("sequence", &self.header.sequence_number)
			.finish_non_exhaustive()
	}
}

impl PendingCall {
	/// Client id of the operation.
	pub fn id(&self) -> u64 {
		self.reply.id()
	}

	/// Attempt number of this call.
	pub fn attempt(&self) -> u32 {
		self.reply.attempt()
	}

	/// Answers with a full JSON response, header included.
	pub fn respond(&self, response: JsonValue) -> Result<()> {
		self.reply.respond(response)
	}

	/// Answers with `body` under a plain header at `index`.
	pub fn respond_at(&self, index: u64, body: JsonValue) -> Result<()> {
		self.respond_with(ResponseHeader::at(self.session_id, index), body)
	}

	/// Answers with `body` under `header`.
	pub fn respond_with(&self, header: ResponseHeader, mut body: JsonValue) -> Result<()> {
		let header = serde_json::to_value(header).map_err(|err| Error::Protocol(err.to_string()))?;
		match &mut body {
			JsonValue::Object(fields) => {
				fields.insert("header".to_string(), header);
			}
			JsonValue::Null => body = serde_json::json!({ "header": header }),
			_ => return Err(Error::Protocol("fake response body must be an object".to_string())),
		}
		self.reply.respond(body)
	}

	/// Fails the call.
	pub fn fail(&self, error: Error) {
		self.reply.fail(error);
	}

	/// Ends the call without (further) responses.
	pub fn complete(&self) {
		self.reply.complete();
	}
}

/// Fake service implementing every primitive service trait.
#[derive(Clone)]
pub struct FakeService {
	session_id: u64,
	calls: mpsc::UnboundedSender<PendingCall>,
	shared: Arc<Shared>,
}

impl std::fmt::Debug for FakeService {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("FakeService").field("session_id", &self.session_id).finish_non_exhaustive()
	}
}

impl FakeService {
	fn dispatch<R, T>(&self, method: &'static str, header: RequestHeader, request: &R, sink: ResponseSink<T>)
	where
		R: Serialize,
		T: DeserializeOwned + Send + 'static,
	{
		let body = serde_json::to_value(request).unwrap_or(JsonValue::Null);
		let call = PendingCall {
			method,
			header,
			body,
			received_at: Instant::now(),
			session_id: self.session_id,
			reply: Box::new(sink),
		};
		if let Err(mpsc::error::SendError(call)) = self.calls.send(call) {
			call.fail(Error::ConnectionRefused("fake controller dropped".to_string()));
		}
	}
}

impl SessionService for FakeService {
	fn open_session(&self, request: OpenSessionRequest) -> BoxFuture<'static, Result<OpenSessionResponse>> {
		self.shared.opened.lock().push(request);
		let result = match self.shared.open_failure.lock().take() {
			Some(error) => Err(error),
			None => Ok(OpenSessionResponse {
				header: ResponseHeader::at(self.session_id, self.session_id),
			}),
		};
		futures_util::future::ready(result).boxed()
	}

	fn keep_alive(&self, request: KeepAliveRequest) -> BoxFuture<'static, Result<KeepAliveResponse>> {
		self.shared.keep_alives.lock().push(request);
		let outcome = self.shared.keep_alive_script.lock().pop_front().unwrap_or(Ok(true));
		let header = ResponseHeader::at(self.session_id, self.session_id);
		let result = outcome.map(|alive| KeepAliveResponse { header, alive });
		futures_util::future::ready(result).boxed()
	}

	fn close_session(&self, request: CloseSessionRequest) -> BoxFuture<'static, Result<CloseSessionResponse>> {
		let header = ResponseHeader::at(self.session_id, self.session_id);
		self.shared.closed.lock().push(request);
		futures_util::future::ready(Ok(CloseSessionResponse { header })).boxed()
	}
}

impl ElectionService for FakeService {
	fn enter(&self, request: CandidateRequest, sink: ResponseSink<ElectionResponse>) {
		self.dispatch("enter", request.header.clone(), &request, sink);
	}

	fn withdraw(&self, request: CandidateRequest, sink: ResponseSink<ElectionResponse>) {
		self.dispatch("withdraw", request.header.clone(), &request, sink);
	}

	fn anoint(&self, request: CandidateRequest, sink: ResponseSink<ElectionResponse>) {
		self.dispatch("anoint", request.header.clone(), &request, sink);
	}

	fn promote(&self, request: CandidateRequest, sink: ResponseSink<ElectionResponse>) {
		self.dispatch("promote", request.header.clone(), &request, sink);
	}

	fn evict(&self, request: CandidateRequest, sink: ResponseSink<ElectionResponse>) {
		self.dispatch("evict", request.header.clone(), &request, sink);
	}

	fn get_leadership(&self, request: LeadershipRequest, sink: ResponseSink<ElectionResponse>) {
		self.dispatch("get_leadership", request.header.clone(), &request, sink);
	}

	fn events(&self, request: LeadershipRequest, sink: ResponseSink<ElectionEvent>) {
		self.dispatch("events", request.header.clone(), &request, sink);
	}
}

impl LockService for FakeService {
	fn lock(&self, request: LockRequest, sink: ResponseSink<LockResponse>) {
		self.dispatch("lock", request.header.clone(), &request, sink);
	}

	fn unlock(&self, request: UnlockRequest, sink: ResponseSink<UnlockResponse>) {
		self.dispatch("unlock", request.header.clone(), &request, sink);
	}

	fn is_locked(&self, request: IsLockedRequest, sink: ResponseSink<IsLockedResponse>) {
		self.dispatch("is_locked", request.header.clone(), &request, sink);
	}
}

/// Test-side handle of a [`FakeService`].
pub struct FakeController {
	session_id: u64,
	calls: mpsc::UnboundedReceiver<PendingCall>,
	shared: Arc<Shared>,
}

impl std::fmt::Debug for FakeController {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("FakeController").field("session_id", &self.session_id).finish_non_exhaustive()
	}
}

impl FakeController {
	pub fn session_id(&self) -> u64 {
		self.session_id
	}

	/// Waits for the next primitive call. `None` once every service clone is gone.
	pub async fn next_call(&mut self) -> Option<PendingCall> {
		self.calls.recv().await
	}

	/// Returns the next primitive call if one is already waiting.
	pub fn try_next_call(&mut self) -> Option<PendingCall> {
		self.calls.try_recv().ok()
	}

	/// Queues the outcome of an upcoming keep-alive; unscripted keep-alives succeed.
	pub fn script_keep_alive(&self, outcome: Result<bool>) {
		self.shared.keep_alive_script.lock().push_back(outcome);
	}

	/// Fails the next `open_session`.
	pub fn fail_next_open(&self, error: Error) {
		*self.shared.open_failure.lock() = Some(error);
	}

	pub fn opened_sessions(&self) -> Vec<OpenSessionRequest> {
		self.shared.opened.lock().clone()
	}

	pub fn keep_alives(&self) -> Vec<KeepAliveRequest> {
		self.shared.keep_alives.lock().clone()
	}

	pub fn closed_sessions(&self) -> Vec<CloseSessionRequest> {
		self.shared.closed.lock().clone()
	}
}
