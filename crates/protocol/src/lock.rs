//! Lock service messages.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::headers::{RequestHeader, ResponseHeader};

/// Acquires the lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
	/// Session header.
	pub header: RequestHeader,
	/// How long to wait for the lock; `None` waits indefinitely and zero
	/// fails immediately when the lock is held.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub timeout: Option<Duration>,
}

/// Reply to [`LockRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockResponse {
	/// Response header.
	pub header: ResponseHeader,
	/// Whether the lock was acquired.
	pub acquired: bool,
	/// Lock version when acquired.
	#[serde(default)]
	pub version: u64,
}

/// Releases the lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockRequest {
	/// Session header.
	pub header: RequestHeader,
	/// Only release when held at this version.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub version: Option<u64>,
}

/// Reply to [`UnlockRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockResponse {
	/// Response header.
	pub header: ResponseHeader,
	/// Whether the lock was released.
	pub unlocked: bool,
}

/// Reads the lock state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsLockedRequest {
	/// Session header.
	pub header: RequestHeader,
	/// Only report locked when held at this version.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub version: Option<u64>,
}

/// Reply to [`IsLockedRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsLockedResponse {
	/// Response header.
	pub header: ResponseHeader,
	/// Whether the lock is held.
	pub locked: bool,
}
