//! Per-session identity, lifecycle state and sequence counters.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use prim_protocol::{Name, RequestHeader};
use tokio::time::Instant;
use tracing::{debug, info};

/// Lifecycle state of a primitive session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveState {
	/// Session is healthy.
	Connected,
	/// The server is unreachable but the session may still be alive.
	Suspended,
	/// The session is gone on the server. Terminal.
	Expired,
	/// The session was closed locally or replaced. Terminal.
	Closed,
}

impl PrimitiveState {
	/// Returns `true` for states no transition can leave.
	pub fn is_terminal(self) -> bool {
		matches!(self, PrimitiveState::Expired | PrimitiveState::Closed)
	}
}

impl fmt::Display for PrimitiveState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			PrimitiveState::Connected => "connected",
			PrimitiveState::Suspended => "suspended",
			PrimitiveState::Expired => "expired",
			PrimitiveState::Closed => "closed",
		})
	}
}

/// Callback invoked on every accepted state transition.
pub type StateListener = Arc<dyn Fn(PrimitiveState) + Send + Sync>;

/// Registration token returned by [`SessionState::add_state_change_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Lifecycle {
	state: PrimitiveState,
	suspended_since: Option<Instant>,
}

#[derive(Default)]
struct Counters {
	command_request: u64,
	command_response: u64,
	response_index: u64,
	event_index: u64,
}

/// Mutable record of one open session.
///
/// Counters are only advanced from the session's execution context; the
/// lifecycle state and listener set may be touched from any thread.
pub struct SessionState {
	name: Name,
	session_id: u64,
	timeout: Duration,
	lifecycle: Mutex<Lifecycle>,
	counters: Mutex<Counters>,
	listeners: Mutex<Vec<(ListenerId, StateListener)>>,
	next_listener: AtomicU64,
}

impl fmt::Debug for SessionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SessionState")
			.field("name", &self.name)
			.field("session_id", &self.session_id)
			.field("state", &self.state())
			.finish_non_exhaustive()
	}
}

impl SessionState {
	/// Creates the state for a freshly opened session.
	///
	/// The response and event indexes start at the session id, the log index
	/// at which the session was registered.
	pub fn new(name: Name, session_id: u64, timeout: Duration) -> Self {
		Self {
			name,
			session_id,
			timeout,
			lifecycle: Mutex::new(Lifecycle {
				state: PrimitiveState::Connected,
				suspended_since: None,
			}),
			counters: Mutex::new(Counters {
				response_index: session_id,
				event_index: session_id,
				..Default::default()
			}),
			listeners: Mutex::new(Vec::new()),
			next_listener: AtomicU64::new(0),
		}
	}

	/// Primitive name.
	pub fn name(&self) -> &Name {
		&self.name
	}

	/// Server-assigned session id.
	pub fn session_id(&self) -> u64 {
		self.session_id
	}

	/// Session liveness timeout.
	pub fn timeout(&self) -> Duration {
		self.timeout
	}

	/// Current lifecycle state.
	pub fn state(&self) -> PrimitiveState {
		self.lifecycle.lock().state
	}

	/// Moves the session to `next`.
	///
	/// Terminal states are never left. Re-entering [`PrimitiveState::Suspended`]
	/// keeps the original suspension clock and promotes the session to
	/// [`PrimitiveState::Expired`] once the suspension has outlasted the
	/// timeout. Listeners run after the state lock is released, so they may
	/// trigger further transitions.
	pub fn set_state(&self, next: PrimitiveState) {
		let previous = {
			let mut lifecycle = self.lifecycle.lock();
			let current = lifecycle.state;
			if current == next {
				let outlasted = next == PrimitiveState::Suspended
					&& lifecycle.suspended_since.is_some_and(|since| since.elapsed() > self.timeout);
				drop(lifecycle);
				if outlasted {
					info!(target = "prim.session", session = self.session_id, "suspension outlasted session timeout");
					self.set_state(PrimitiveState::Expired);
				}
				return;
			}
			if current.is_terminal() {
				debug!(target = "prim.session", session = self.session_id, %current, %next, "ignoring transition out of terminal state");
				return;
			}

			lifecycle.state = next;
			if next == PrimitiveState::Suspended {
				lifecycle.suspended_since.get_or_insert_with(Instant::now);
			} else {
				lifecycle.suspended_since = None;
			}
			current
		};

		info!(target = "prim.session", session = self.session_id, name = %self.name, from = %previous, to = %next, "session state changed");
		let listeners: Vec<StateListener> = self.listeners.lock().iter().map(|(_, l)| Arc::clone(l)).collect();
		for listener in listeners {
			listener(next);
		}
	}

	/// Registers a state change listener.
	pub fn add_state_change_listener<F>(&self, listener: F) -> ListenerId
	where
		F: Fn(PrimitiveState) + Send + Sync + 'static,
	{
		let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
		self.listeners.lock().push((id, Arc::new(listener)));
		id
	}

	/// Removes a previously registered listener.
	pub fn remove_state_change_listener(&self, id: ListenerId) -> bool {
		let mut listeners = self.listeners.lock();
		let before = listeners.len();
		listeners.retain(|(existing, _)| *existing != id);
		listeners.len() != before
	}

	/// Allocates the next command sequence number.
	pub fn next_command_request(&self) -> u64 {
		let mut counters = self.counters.lock();
		counters.command_request += 1;
		counters.command_request
	}

	/// Last command sequence number issued.
	pub fn command_request(&self) -> u64 {
		self.counters.lock().command_request
	}

	/// Records the terminal outcome of the command with `sequence`.
	pub fn set_command_response(&self, sequence: u64) {
		let mut counters = self.counters.lock();
		counters.command_response = counters.command_response.max(sequence).min(counters.command_request);
	}

	/// Highest command sequence number whose outcome has been applied.
	pub fn command_response(&self) -> u64 {
		self.counters.lock().command_response
	}

	/// Merges a response log index.
	pub fn set_response_index(&self, index: u64) {
		let mut counters = self.counters.lock();
		counters.response_index = counters.response_index.max(index);
	}

	/// Highest log index seen in any response.
	pub fn response_index(&self) -> u64 {
		self.counters.lock().response_index
	}

	/// Merges the log index of an event applied in order.
	pub fn set_event_index(&self, index: u64) {
		let mut counters = self.counters.lock();
		counters.event_index = counters.event_index.max(index);
	}

	/// Highest log index applied through an in-order event.
	pub fn event_index(&self) -> u64 {
		self.counters.lock().event_index
	}

	/// Header for a new command: consumes the next sequence number.
	pub fn command_header(&self) -> RequestHeader {
		RequestHeader {
			name: self.name.clone(),
			session_id: self.session_id,
			sequence_number: self.next_command_request(),
		}
	}

	/// Header for a query or keep-alive: reuses the last sequence number.
	pub fn query_header(&self) -> RequestHeader {
		RequestHeader {
			name: self.name.clone(),
			session_id: self.session_id,
			sequence_number: self.command_request(),
		}
	}
}
