//! Request and response headers shared by every primitive service.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Fully qualified primitive name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Name {
	/// Primitive name, unique within its namespace.
	pub name: String,
	/// Namespace the primitive lives in.
	#[serde(default)]
	pub namespace: String,
}

impl Name {
	/// Creates a name in the given namespace.
	pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			namespace: namespace.into(),
		}
	}
}

impl fmt::Display for Name {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.namespace.is_empty() {
			f.write_str(&self.name)
		} else {
			write!(f, "{}/{}", self.namespace, self.name)
		}
	}
}

/// Header stamped on every session request.
///
/// Commands carry a fresh sequence number; queries carry the sequence number
/// of the last command issued on the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestHeader {
	/// Target primitive.
	pub name: Name,
	/// Server-assigned session identifier.
	pub session_id: u64,
	/// Command sequence number.
	pub sequence_number: u64,
}

/// Kind of message carried by a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseType {
	/// Regular operation response or stream item.
	#[default]
	Response,
	/// Acknowledges that a stream has been opened; carries no payload.
	OpenStream,
	/// Signals that the server closed the stream.
	CloseStream,
}

/// Per-stream sequencing descriptor carried on streamed responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamHeader {
	/// Stream identifier: the sequence number of the command that opened it.
	pub stream_id: u64,
	/// Position of this item within the stream, starting at 1.
	pub response_id: u64,
	/// Log index at which the item was produced.
	pub index: u64,
}

/// Header returned on every session response.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseHeader {
	/// Session the response belongs to.
	pub session_id: u64,
	/// Log index at which the operation was applied or read.
	pub index: u64,
	/// Message kind.
	#[serde(default)]
	pub response_type: ResponseType,
	/// Stream descriptors; present on streamed items.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub streams: Vec<StreamHeader>,
}

impl ResponseHeader {
	/// Returns a plain response header at `index`.
	pub fn at(session_id: u64, index: u64) -> Self {
		Self {
			session_id,
			index,
			..Default::default()
		}
	}

	/// Returns the first stream descriptor, if any.
	pub fn stream(&self) -> Option<&StreamHeader> {
		self.streams.first()
	}
}
