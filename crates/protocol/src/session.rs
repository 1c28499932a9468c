//! Session lifecycle messages.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::headers::{Name, RequestHeader, ResponseHeader};

/// Opens a new session on a primitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenSessionRequest {
	/// Primitive the session binds to.
	pub name: Name,
	/// Session liveness timeout.
	pub timeout: Duration,
}

/// Reply to [`OpenSessionRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenSessionResponse {
	/// Header carrying the assigned session id.
	pub header: ResponseHeader,
}

/// Renews a session lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveRequest {
	/// Session header; the sequence number is the last command issued.
	pub header: RequestHeader,
}

/// Reply to [`KeepAliveRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveResponse {
	/// Response header.
	pub header: ResponseHeader,
	/// Whether the server still considers the session alive.
	#[serde(default = "default_alive")]
	pub alive: bool,
}

fn default_alive() -> bool {
	true
}

/// Closes a session, optionally deleting the primitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseSessionRequest {
	/// Session header.
	pub header: RequestHeader,
	/// Whether the primitive itself is deleted.
	#[serde(default)]
	pub delete: bool,
}

/// Reply to [`CloseSessionRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseSessionResponse {
	/// Response header.
	pub header: ResponseHeader,
}
