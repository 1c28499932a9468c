//! Error types for session operations.

use prim_protocol::{Status, StatusCode};
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a primitive operation.
///
/// Variants fall into the buckets the session executor classifies on:
/// connectivity ([`Error::ConnectionRefused`], [`Error::RequestTimeout`],
/// [`Error::ChannelClosed`]), session expiry ([`Error::UnknownSession`],
/// [`Error::UnknownClient`]), session loss ([`Error::ConcurrentModification`])
/// and everything else.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
	/// Generic command failure.
	#[error("command failed: {0}")]
	CommandFailure(String),

	/// The server no longer knows the session.
	#[error("unknown session")]
	UnknownSession,

	/// The server no longer knows the client.
	#[error("unknown client")]
	UnknownClient,

	/// The session was closed, replaced, or a query could not be completed
	/// against it. Callers must reopen the primitive.
	#[error("concurrent modification: {0}")]
	ConcurrentModification(String),

	/// The server observed a gap in the command sequence and needs the
	/// commands after `last_applied` replayed.
	#[error("command out of sequence (last applied {last_applied})")]
	OutOfSequence { last_applied: u64 },

	/// A blocking wait exceeded its operation timeout.
	#[error("operation timed out")]
	Timeout,

	/// A blocking wait was interrupted.
	#[error("operation interrupted")]
	Interrupted,

	/// The server could not be reached.
	#[error("connection refused: {0}")]
	ConnectionRefused(String),

	/// The transport gave up waiting for a reply.
	#[error("request timed out: {0}")]
	RequestTimeout(String),

	/// The channel closed while a request was in flight.
	#[error("channel closed")]
	ChannelClosed,

	/// Malformed or unexpected response.
	#[error("protocol error: {0}")]
	Protocol(String),
}

impl Error {
	/// Session-closed condition used for fail-fast and `close()`.
	pub fn session_closed() -> Self {
		Error::ConcurrentModification("session closed".to_string())
	}

	/// Conflict returned when a query cannot be completed.
	pub fn query_failed() -> Self {
		Error::ConcurrentModification("query failed".to_string())
	}

	/// Returns `true` for transient transport failures worth retrying.
	pub fn is_connectivity(&self) -> bool {
		matches!(self, Error::ConnectionRefused(_) | Error::RequestTimeout(_) | Error::ChannelClosed)
	}

	/// Returns `true` when the server reports the session or client as gone.
	pub fn is_expired(&self) -> bool {
		matches!(self, Error::UnknownSession | Error::UnknownClient)
	}

	/// Returns `true` when the session can no longer be used.
	pub fn is_conflict(&self) -> bool {
		matches!(self, Error::ConcurrentModification(_))
	}

	/// Returns `true` when the server needs earlier commands replayed.
	pub fn requires_replay(&self) -> bool {
		matches!(self, Error::OutOfSequence { .. })
	}

	/// Returns `true` for a blocking-adapter timeout.
	pub fn is_timeout(&self) -> bool {
		matches!(self, Error::Timeout)
	}
}

impl From<Status> for Error {
	fn from(status: Status) -> Self {
		match status.code {
			StatusCode::Unavailable => Error::ConnectionRefused(status.message),
			StatusCode::DeadlineExceeded => Error::RequestTimeout(status.message),
			StatusCode::ChannelClosed => Error::ChannelClosed,
			StatusCode::UnknownSession => Error::UnknownSession,
			StatusCode::UnknownClient => Error::UnknownClient,
			StatusCode::ConcurrentModification => Error::ConcurrentModification(status.message),
			StatusCode::OutOfSequence => Error::OutOfSequence {
				last_applied: status.last_applied.unwrap_or_default(),
			},
			StatusCode::CommandFailure => Error::CommandFailure(status.message),
			StatusCode::Unknown => Error::Protocol(status.message),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_codes_map_to_classification_buckets() {
		let error = Error::from(Status::new(StatusCode::Unavailable, "refused"));
		assert!(error.is_connectivity());

		let error = Error::from(Status::new(StatusCode::DeadlineExceeded, "slow"));
		assert!(error.is_connectivity());

		let error = Error::from(Status::new(StatusCode::UnknownClient, ""));
		assert!(error.is_expired());

		let error = Error::from(Status::new(StatusCode::ConcurrentModification, "replaced"));
		assert!(error.is_conflict());
		assert_eq!(error, Error::ConcurrentModification("replaced".to_string()));

		let error = Error::from(Status::out_of_sequence(4));
		assert!(error.requires_replay());
		assert_eq!(error, Error::OutOfSequence { last_applied: 4 });

		let error = Error::from(Status::new(StatusCode::Unknown, "odd"));
		assert!(!error.is_connectivity() && !error.is_expired() && !error.is_conflict());
	}

	#[test]
	fn session_closed_is_a_conflict() {
		assert!(Error::session_closed().is_conflict());
		assert!(Error::query_failed().is_conflict());
		assert!(!Error::Timeout.is_conflict());
	}
}
