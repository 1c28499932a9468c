//! Operation attempts and failure classification.
//!
//! An attempt is one try at delivering a logical request. Retries build a
//! fresh attempt with the same id, header and completion target and an
//! incremented attempt number. Commands and queries, unary and streaming,
//! share one classification skeleton; [`OperationKind`] supplies the
//! variant-specific policy.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use downcast_rs::{Downcast, impl_downcast};
use prim_protocol::{RequestHeader, ResponseHeader, ResponseType};
use prim_runtime::SerialContext;

use super::executor::{ExecutorCore, ResponseSink};
use super::handle::{Completer, StreamObserver};
use super::sequencer::SessionSequencer;
use super::state::SessionState;
use crate::error::Error;

/// Retry delays in seconds, indexed by `attempt - 1` and capped at the last entry.
pub(crate) const FIBONACCI: [u64; 5] = [1, 1, 2, 3, 5];

/// Delay before retrying after attempt number `attempt` failed.
pub(crate) fn backoff(attempt: u32) -> Duration {
	let index = (attempt.saturating_sub(1) as usize).min(FIBONACCI.len() - 1);
	Duration::from_secs(FIBONACCI[index])
}

/// Attempt variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OperationKind {
	Command,
	Query,
	CommandStream,
	QueryStream,
}

impl OperationKind {
	pub(crate) fn is_command(self) -> bool {
		matches!(self, OperationKind::Command | OperationKind::CommandStream)
	}

	pub(crate) fn is_stream(self) -> bool {
		matches!(self, OperationKind::CommandStream | OperationKind::QueryStream)
	}

	/// Unary queries resolve as a conflict instead of chasing a stale read;
	/// streams must be re-established to keep delivering.
	fn retries_on_connectivity(self) -> bool {
		self != OperationKind::Query
	}

	fn default_error(self, cause: &Error) -> Error {
		if self.is_command() {
			Error::CommandFailure(format!("failed to complete command: {cause}"))
		} else {
			Error::ConcurrentModification(format!("failed to complete query: {cause}"))
		}
	}
}

impl fmt::Display for OperationKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			OperationKind::Command => "command",
			OperationKind::Query => "query",
			OperationKind::CommandStream => "command-stream",
			OperationKind::QueryStream => "query-stream",
		})
	}
}

/// What to do with a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Disposition {
	/// Resolve with the error and expire the session.
	Expired(Error),
	/// Resolve with the error and close the session.
	Closed(Error),
	/// Retry after the delay.
	Retry(Duration),
	/// Retry now and resubmit later commands.
	Replay,
	/// Resolve with the error.
	Fail(Error),
}

/// Classifies a failure in priority order: expired, closed, connectivity,
/// replay, other.
pub(crate) fn classify(kind: OperationKind, error: &Error, attempt: u32) -> Disposition {
	if error.is_expired() {
		Disposition::Expired(error.clone())
	} else if error.is_conflict() {
		Disposition::Closed(error.clone())
	} else if error.is_connectivity() {
		if kind.retries_on_connectivity() {
			Disposition::Retry(backoff(attempt))
		} else {
			Disposition::Fail(Error::query_failed())
		}
	} else if error.requires_replay() && kind == OperationKind::Command {
		Disposition::Replay
	} else {
		Disposition::Fail(kind.default_error(error))
	}
}

/// Issues the remote call for an attempt and feeds the sink.
pub(crate) type RequestFn<T> = Arc<dyn Fn(RequestHeader, ResponseSink<T>) + Send + Sync>;

/// Extracts the common header from a response.
pub(crate) type HeaderFn<T> = Arc<dyn Fn(&T) -> ResponseHeader + Send + Sync>;

/// Caller-visible completion target, carried across retries.
pub(crate) enum Target<T> {
	Unary(Option<Completer<T>>),
	CommandStream {
		result: Option<Completer<u64>>,
		observer: Arc<dyn StreamObserver<T>>,
	},
	QueryStream {
		result: Option<Completer<()>>,
		observer: Arc<dyn StreamObserver<T>>,
	},
}

impl<T: 'static> Target<T> {
	/// Fails a target that never made it onto the session.
	pub(crate) fn reject(self, error: Error) {
		match self {
			Target::Unary(tx) => {
				if let Some(tx) = tx {
					let _ = tx.send(Err(error));
				}
			}
			Target::CommandStream { result, observer } => {
				if let Some(tx) = result {
					let _ = tx.send(Err(error.clone()));
				}
				observer.on_error(error);
			}
			Target::QueryStream { result, observer } => {
				if let Some(tx) = result {
					let _ = tx.send(Err(error.clone()));
				}
				observer.on_error(error);
			}
		}
	}
}

/// Type-erased view of an attempt held in the executor's in-flight set.
pub(crate) trait Operation: Downcast + Send {
	fn id(&self) -> u64;

	fn attempt(&self) -> u32;

	fn kind(&self) -> OperationKind;

	fn sequence_number(&self) -> u64;

	fn send(&self, context: &SerialContext<ExecutorCore>);

	/// Builds the next attempt, carrying the same id, header and target.
	fn next(self: Box<Self>) -> Box<dyn Operation>;

	/// Resolves the attempt with a terminal failure.
	fn fail(self: Box<Self>, sequencer: &mut SessionSequencer, error: Error);
}
impl_downcast!(Operation);

/// One try at a typed request.
pub(crate) struct Attempt<T> {
	pub(crate) id: u64,
	pub(crate) attempt: u32,
	pub(crate) kind: OperationKind,
	pub(crate) header: RequestHeader,
	request: RequestFn<T>,
	response_header: HeaderFn<T>,
	target: Target<T>,
	state: Arc<SessionState>,
}

impl<T: Send + 'static> Attempt<T> {
	pub(crate) fn new(
		id: u64,
		kind: OperationKind,
		header: RequestHeader,
		request: RequestFn<T>,
		response_header: HeaderFn<T>,
		target: Target<T>,
		state: Arc<SessionState>,
	) -> Self {
		Self {
			id,
			attempt: 1,
			kind,
			header,
			request,
			response_header,
			target,
			state,
		}
	}

	pub(crate) fn header_of(&self, response: &T) -> ResponseHeader {
		(self.response_header)(response)
	}

	/// Resolves a unary attempt with its response.
	pub(crate) fn succeed(self: Box<Self>, sequencer: &mut SessionSequencer, header: ResponseHeader, response: T) {
		let Target::Unary(Some(tx)) = self.target else {
			return;
		};
		let state = self.state;
		let sequence = self.header.sequence_number;
		let is_command = self.kind.is_command();
		sequencer.sequence_response(
			self.id,
			Box::new(move || {
				if is_command {
					state.set_command_response(sequence);
				}
				state.set_response_index(header.index);
				let _ = tx.send(Ok(response));
			}),
		);
	}

	/// Handles one item pushed on a stream. The first item resolves the
	/// caller's handle; `OpenStream` acknowledgements are not forwarded.
	pub(crate) fn push(&mut self, sequencer: &mut SessionSequencer, header: ResponseHeader, response: T) {
		let id = self.id;
		let sequence = self.header.sequence_number;
		let state = Arc::clone(&self.state);
		match &mut self.target {
			Target::CommandStream { result, observer } => {
				if let Some(tx) = result.take() {
					let index = header.index;
					let state = Arc::clone(&state);
					sequencer.sequence_response(
						id,
						Box::new(move || {
							state.set_command_response(sequence);
							state.set_response_index(index);
							let _ = tx.send(Ok(index));
						}),
					);
				}
				if header.response_type == ResponseType::OpenStream {
					return;
				}
				let observer = Arc::clone(observer);
				match header.stream() {
					Some(stream) => sequencer.sequence_stream(stream, Box::new(move || observer.on_next(response))),
					None => observer.on_next(response),
				}
			}
			Target::QueryStream { result, observer } => {
				if let Some(tx) = result.take() {
					let index = header.index;
					let state = Arc::clone(&state);
					sequencer.sequence_response(
						id,
						Box::new(move || {
							state.set_response_index(index);
							let _ = tx.send(Ok(()));
						}),
					);
				}
				state.set_response_index(header.index);
				if header.response_type != ResponseType::OpenStream {
					observer.on_next(response);
				}
			}
			Target::Unary(_) => {}
		}
	}

	/// Ends a stream that the server completed.
	pub(crate) fn finish(self: Box<Self>, sequencer: &mut SessionSequencer) {
		let id = self.id;
		let sequence = self.header.sequence_number;
		let state = self.state;
		match self.target {
			Target::CommandStream { result, observer } => {
				if let Some(tx) = result {
					let state = Arc::clone(&state);
					sequencer.sequence_response(
						id,
						Box::new(move || {
							state.set_command_response(sequence);
							let _ = tx.send(Ok(state.response_index()));
						}),
					);
				}
				sequencer.abort_stream(sequence, Box::new(move || observer.on_completed()));
			}
			Target::QueryStream { result, observer } => {
				if let Some(tx) = result {
					sequencer.sequence_response(
						id,
						Box::new(move || {
							let _ = tx.send(Ok(()));
						}),
					);
				}
				observer.on_completed();
			}
			Target::Unary(_) => {}
		}
	}
}

impl<T: Send + 'static> Operation for Attempt<T> {
	fn id(&self) -> u64 {
		self.id
	}

	fn attempt(&self) -> u32 {
		self.attempt
	}

	fn kind(&self) -> OperationKind {
		self.kind
	}

	fn sequence_number(&self) -> u64 {
		self.header.sequence_number
	}

	fn send(&self, context: &SerialContext<ExecutorCore>) {
		let sink = ResponseSink::new(self.id, self.attempt, context.clone());
		(self.request)(self.header.clone(), sink);
	}

	fn next(self: Box<Self>) -> Box<dyn Operation> {
		let this = *self;
		Box::new(Attempt {
			attempt: this.attempt + 1,
			..this
		})
	}

	fn fail(self: Box<Self>, sequencer: &mut SessionSequencer, error: Error) {
		let id = self.id;
		let sequence = self.header.sequence_number;
		let is_command = self.kind.is_command();
		let state = self.state;
		match self.target {
			Target::Unary(tx) => {
				let Some(tx) = tx else {
					return;
				};
				sequencer.sequence_response(
					id,
					Box::new(move || {
						if is_command {
							state.set_command_response(sequence);
						}
						let _ = tx.send(Err(error));
					}),
				);
			}
			Target::CommandStream { result, observer } => {
				if let Some(tx) = result {
					let error = error.clone();
					sequencer.sequence_response(
						id,
						Box::new(move || {
							state.set_command_response(sequence);
							let _ = tx.send(Err(error));
						}),
					);
				}
				sequencer.abort_stream(sequence, Box::new(move || observer.on_error(error)));
			}
			Target::QueryStream { result, observer } => {
				if let Some(tx) = result {
					let error = error.clone();
					sequencer.sequence_response(
						id,
						Box::new(move || {
							let _ = tx.send(Err(error));
						}),
					);
				}
				observer.on_error(error);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn backoff_follows_fibonacci_then_plateaus() {
		let delays: Vec<u64> = (1..=8).map(|attempt| backoff(attempt).as_secs()).collect();
		assert_eq!(delays, vec![1, 1, 2, 3, 5, 5, 5, 5]);
	}

	#[test]
	fn expiry_outranks_everything() {
		for kind in [OperationKind::Command, OperationKind::Query, OperationKind::CommandStream, OperationKind::QueryStream] {
			assert_eq!(classify(kind, &Error::UnknownSession, 1), Disposition::Expired(Error::UnknownSession));
			assert_eq!(classify(kind, &Error::UnknownClient, 1), Disposition::Expired(Error::UnknownClient));
			assert_eq!(classify(kind, &Error::session_closed(), 1), Disposition::Closed(Error::session_closed()));
		}
	}

	#[test]
	fn connectivity_retries_everything_but_unary_queries() {
		let refused = Error::ConnectionRefused("down".into());
		assert_eq!(classify(OperationKind::Command, &refused, 3), Disposition::Retry(Duration::from_secs(2)));
		assert_eq!(classify(OperationKind::CommandStream, &Error::ChannelClosed, 1), Disposition::Retry(Duration::from_secs(1)));
		assert_eq!(classify(OperationKind::QueryStream, &Error::RequestTimeout("slow".into()), 9), Disposition::Retry(Duration::from_secs(5)));
		assert_eq!(classify(OperationKind::Query, &refused, 1), Disposition::Fail(Error::query_failed()));
	}

	#[test]
	fn replay_applies_to_unary_commands_only() {
		let gap = Error::OutOfSequence { last_applied: 2 };
		assert_eq!(classify(OperationKind::Command, &gap, 1), Disposition::Replay);
		assert!(matches!(classify(OperationKind::Query, &gap, 1), Disposition::Fail(Error::ConcurrentModification(_))));
	}

	#[test]
	fn unclassified_failures_use_the_variant_default() {
		let odd = Error::Protocol("bad frame".into());
		assert!(matches!(
			classify(OperationKind::Command, &odd, 1),
			Disposition::Fail(Error::CommandFailure(msg)) if msg.contains("bad frame")
		));
		assert!(matches!(classify(OperationKind::QueryStream, &odd, 1), Disposition::Fail(Error::ConcurrentModification(_))));
	}
}
