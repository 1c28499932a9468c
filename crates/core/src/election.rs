//! Leader election primitive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use prim_protocol::{CandidateRequest, ElectionEvent, ElectionEventType, ElectionResponse, LeadershipRequest, Name, Term};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Error, Result};
use crate::options::SessionOptions;
use crate::session::{ManagedPrimitive, OperationFuture, ResponseSink, SessionService, StreamObserver};

/// Remote calls of the leader election service.
///
/// Each call reports through `sink`: one `on_next` for unary calls, any
/// number of items followed by `on_completed` for the event stream.
pub trait ElectionService: SessionService {
	fn enter(&self, request: CandidateRequest, sink: ResponseSink<ElectionResponse>);

	fn withdraw(&self, request: CandidateRequest, sink: ResponseSink<ElectionResponse>);

	fn anoint(&self, request: CandidateRequest, sink: ResponseSink<ElectionResponse>);

	fn promote(&self, request: CandidateRequest, sink: ResponseSink<ElectionResponse>);

	fn evict(&self, request: CandidateRequest, sink: ResponseSink<ElectionResponse>);

	fn get_leadership(&self, request: LeadershipRequest, sink: ResponseSink<ElectionResponse>);

	fn events(&self, request: LeadershipRequest, sink: ResponseSink<ElectionEvent>);
}

/// Current leader of an election term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leader {
	pub id: String,
	pub term: u64,
	/// Time the term started, in milliseconds since the epoch.
	pub timestamp: u64,
}

/// Leader and candidate list at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Leadership {
	pub leader: Option<Leader>,
	/// Candidates in priority order.
	pub candidates: Vec<String>,
}

impl From<Term> for Leadership {
	fn from(term: Term) -> Self {
		let leader = (!term.leader.is_empty()).then(|| Leader {
			id: term.leader,
			term: term.term,
			timestamp: term.timestamp,
		});
		Self {
			leader,
			candidates: term.candidates,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipEventType {
	Changed,
}

/// Leadership change pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadershipEvent {
	pub kind: LeadershipEventType,
	pub leadership: Leadership,
}

impl From<ElectionEvent> for LeadershipEvent {
	fn from(event: ElectionEvent) -> Self {
		let kind = match event.kind {
			ElectionEventType::Changed => LeadershipEventType::Changed,
		};
		Self {
			kind,
			leadership: event.term.into(),
		}
	}
}

pub type LeadershipListener = Arc<dyn Fn(&LeadershipEvent) + Send + Sync>;

/// Registration token returned by [`LeaderElection::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeadershipListenerId(u64);

type StreamOpen = Shared<BoxFuture<'static, Result<u64>>>;

#[derive(Default)]
struct Listeners {
	entries: Vec<(LeadershipListenerId, LeadershipListener)>,
	/// Generation and open of the current event stream.
	stream: Option<(u64, StreamOpen)>,
	generation: u64,
}

impl Listeners {
	/// Forgets the stream of `generation` if it is still the current one.
	fn end_stream(&mut self, generation: u64) {
		if matches!(&self.stream, Some((current, _)) if *current == generation) {
			self.stream = None;
		}
	}
}

struct Inner<S: ElectionService> {
	primitive: ManagedPrimitive<S>,
	listeners: Mutex<Listeners>,
	next_listener: AtomicU64,
}

impl<S: ElectionService> Inner<S> {
	/// Returns the open of the event stream, opening one if listeners exist
	/// and none is open.
	fn listen(self: &Arc<Self>) -> Option<StreamOpen> {
		let (generation, submitted, open) = {
			let mut listeners = self.listeners.lock();
			if listeners.entries.is_empty() {
				return None;
			}
			if let Some((_, open)) = &listeners.stream {
				return Some(open.clone());
			}

			let (submitted, opened) = oneshot::channel::<OperationFuture<u64>>();
			let open = async move {
				match opened.await {
					Ok(opened) => opened.await,
					Err(_) => Err(Error::session_closed()),
				}
			}
			.boxed()
			.shared();
			listeners.generation += 1;
			listeners.stream = Some((listeners.generation, open.clone()));
			(listeners.generation, submitted, open)
		};

		// Submitted unlocked: a rejected open reports to the observer inline.
		debug!(target = "prim.election", name = %self.primitive.name(), generation, "opening leadership event stream");
		let observer = EventObserver {
			inner: Arc::downgrade(self),
			generation,
		};
		let opened = self
			.primitive
			.command_stream(|service: &S, header, sink| service.events(LeadershipRequest { header }, sink), observer);
		let _ = submitted.send(opened);
		Some(open)
	}
}

struct EventObserver<S: ElectionService> {
	inner: Weak<Inner<S>>,
	generation: u64,
}

impl<S: ElectionService> StreamObserver<ElectionEvent> for EventObserver<S> {
	fn on_next(&self, event: ElectionEvent) {
		let Some(inner) = self.inner.upgrade() else {
			return;
		};
		let event = LeadershipEvent::from(event);
		let listeners: Vec<LeadershipListener> = inner.listeners.lock().entries.iter().map(|(_, l)| Arc::clone(l)).collect();
		for listener in listeners {
			listener(&event);
		}
	}

	fn on_error(&self, error: Error) {
		if let Some(inner) = self.inner.upgrade() {
			debug!(target = "prim.election", name = %inner.primitive.name(), %error, "leadership event stream failed");
			inner.listeners.lock().end_stream(self.generation);
		}
	}

	fn on_completed(&self) {
		let Some(inner) = self.inner.upgrade() else {
			return;
		};
		inner.listeners.lock().end_stream(self.generation);
		if !inner.primitive.state().is_terminal() {
			let _ = inner.listen();
		}
	}
}

/// Distributed leader election over a managed session.
pub struct LeaderElection<S: ElectionService> {
	inner: Arc<Inner<S>>,
}

impl<S: ElectionService> LeaderElection<S> {
	/// Opens a session for the election `name`.
	pub async fn connect(name: Name, service: S, options: SessionOptions) -> Result<Self> {
		Ok(Self::new(ManagedPrimitive::connect(name, service, options).await?))
	}

	pub fn new(primitive: ManagedPrimitive<S>) -> Self {
		Self {
			inner: Arc::new(Inner {
				primitive,
				listeners: Mutex::new(Listeners::default()),
				next_listener: AtomicU64::new(0),
			}),
		}
	}

	pub fn primitive(&self) -> &ManagedPrimitive<S> {
		&self.inner.primitive
	}

	/// Enters `candidate` into the election and returns the resulting leadership.
	pub async fn run(&self, candidate: impl Into<String>) -> Result<Leadership> {
		let response = self.candidate_command(candidate.into(), S::enter).await?;
		Ok(response.term.into())
	}

	/// Removes `candidate` from the election.
	pub async fn withdraw(&self, candidate: impl Into<String>) -> Result<()> {
		self.candidate_command(candidate.into(), S::withdraw).await?;
		Ok(())
	}

	/// Makes `candidate` the leader. Returns `false` if it is not a candidate.
	pub async fn anoint(&self, candidate: impl Into<String>) -> Result<bool> {
		Ok(self.candidate_command(candidate.into(), S::anoint).await?.succeeded)
	}

	/// Moves `candidate` to the head of the candidate list.
	pub async fn promote(&self, candidate: impl Into<String>) -> Result<bool> {
		Ok(self.candidate_command(candidate.into(), S::promote).await?.succeeded)
	}

	/// Removes `candidate`, electing a new leader if it led.
	pub async fn evict(&self, candidate: impl Into<String>) -> Result<()> {
		self.candidate_command(candidate.into(), S::evict).await?;
		Ok(())
	}

	/// Reads the current leadership.
	pub async fn get_leadership(&self) -> Result<Leadership> {
		let response = self
			.inner
			.primitive
			.query(|service: &S, header, sink| service.get_leadership(LeadershipRequest { header }, sink))
			.await?;
		Ok(response.term.into())
	}

	fn candidate_command(
		&self,
		candidate_id: String,
		call: fn(&S, CandidateRequest, ResponseSink<ElectionResponse>),
	) -> OperationFuture<ElectionResponse> {
		self.inner.primitive.command(move |service: &S, header, sink| {
			let request = CandidateRequest {
				header,
				candidate_id: candidate_id.clone(),
			};
			call(service, request, sink)
		})
	}

	/// Registers a leadership change listener.
	///
	/// Resolves once the event stream is established, waiting on an open
	/// already in flight for an earlier listener. The stream is
	/// re-opened whenever the server completes it while listeners remain.
	pub async fn add_listener<F>(&self, listener: F) -> Result<LeadershipListenerId>
	where
		F: Fn(&LeadershipEvent) + Send + Sync + 'static,
	{
		let id = LeadershipListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
		self.inner.listeners.lock().entries.push((id, Arc::new(listener)));

		if let Some(opened) = self.inner.listen() {
			if let Err(error) = opened.await {
				self.remove_listener(id);
				return Err(error);
			}
		}
		Ok(id)
	}

	/// Removes a listener. The event stream stays open until the session ends.
	pub fn remove_listener(&self, id: LeadershipListenerId) -> bool {
		let mut listeners = self.inner.listeners.lock();
		let before = listeners.entries.len();
		listeners.entries.retain(|(existing, _)| *existing != id);
		listeners.entries.len() != before
	}

	pub async fn close(&self) -> Result<()> {
		self.inner.primitive.close().await
	}

	pub async fn delete(&self) -> Result<()> {
		self.inner.primitive.delete().await
	}
}
