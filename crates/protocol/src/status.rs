//! Coded failure statuses reported by the transport or the primitive service.

use serde::{Deserialize, Serialize};

/// Failure code carried on an error status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
	/// The server could not be reached.
	Unavailable,
	/// The request did not complete before the transport deadline.
	DeadlineExceeded,
	/// The channel was closed while the request was in flight.
	ChannelClosed,
	/// The server does not know the session.
	UnknownSession,
	/// The server does not know the client.
	UnknownClient,
	/// The session was closed or replaced concurrently.
	ConcurrentModification,
	/// The server observed a gap in the command sequence.
	OutOfSequence,
	/// The command was applied and failed.
	CommandFailure,
	/// Anything else.
	#[serde(other)]
	Unknown,
}

/// Error status payload.
///
/// ```json
/// { "code": "UNKNOWN_SESSION", "message": "session 12 not found" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
	/// Failure code.
	pub code: StatusCode,
	/// Human readable detail.
	#[serde(default)]
	pub message: String,
	/// Last command sequence number applied by the server, sent with
	/// [`StatusCode::OutOfSequence`].
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_applied: Option<u64>,
}

impl Status {
	/// Creates a status with the given code and message.
	pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into(),
			last_applied: None,
		}
	}

	/// Creates an out-of-sequence status naming the last applied command.
	pub fn out_of_sequence(last_applied: u64) -> Self {
		Self {
			code: StatusCode::OutOfSequence,
			message: format!("commands applied through {last_applied}"),
			last_applied: Some(last_applied),
		}
	}
}
