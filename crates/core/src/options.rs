//! Session configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Default session liveness timeout.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on blocking waits.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Options applied when opening a primitive session.
///
/// Deserializes from JSON with every field optional:
///
/// ```json
/// { "timeout": { "secs": 10, "nanos": 0 }, "keepAliveInterval": { "secs": 2, "nanos": 0 } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionOptions {
	/// Session liveness timeout negotiated with the server.
	pub timeout: Duration,
	/// Interval between keep-alives; half the timeout when unset.
	pub keep_alive_interval: Option<Duration>,
	/// Bound applied by the blocking adapter.
	pub operation_timeout: Duration,
}

impl Default for SessionOptions {
	fn default() -> Self {
		Self {
			timeout: DEFAULT_SESSION_TIMEOUT,
			keep_alive_interval: None,
			operation_timeout: DEFAULT_OPERATION_TIMEOUT,
		}
	}
}

impl SessionOptions {
	/// Parses options from a JSON document.
	pub fn from_json(json: &str) -> Result<Self> {
		serde_json::from_str(json).map_err(|err| Error::Protocol(format!("invalid session options: {err}")))
	}

	/// Sets the session timeout.
	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	/// Sets an explicit keep-alive interval.
	pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
		self.keep_alive_interval = Some(interval);
		self
	}

	/// Sets the blocking operation timeout.
	pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
		self.operation_timeout = timeout;
		self
	}

	/// Effective keep-alive interval.
	pub fn keep_alive_interval(&self) -> Duration {
		self.keep_alive_interval.unwrap_or(self.timeout / 2)
	}
}
