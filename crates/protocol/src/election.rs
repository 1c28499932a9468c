//! Leader election service messages.

use serde::{Deserialize, Serialize};

use crate::headers::{RequestHeader, ResponseHeader};

/// Request naming a candidate: used by enter, withdraw, anoint, evict and
/// promote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateRequest {
	/// Session header.
	pub header: RequestHeader,
	/// Candidate identifier.
	pub candidate_id: String,
}

/// Request carrying only a header: used by get-leadership and events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadershipRequest {
	/// Session header.
	pub header: RequestHeader,
}

/// Current term of an election.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Term {
	/// Elected leader; empty when there is none.
	#[serde(default)]
	pub leader: String,
	/// Monotonic term number.
	#[serde(default)]
	pub term: u64,
	/// Time the term started, in milliseconds since the epoch.
	#[serde(default)]
	pub timestamp: u64,
	/// Candidates in priority order.
	#[serde(default)]
	pub candidates: Vec<String>,
}

/// Reply to every election request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionResponse {
	/// Response header.
	pub header: ResponseHeader,
	/// Term after the operation.
	#[serde(default)]
	pub term: Term,
	/// Outcome of anoint/promote.
	#[serde(default)]
	pub succeeded: bool,
}

/// Kind of leadership event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ElectionEventType {
	/// The leader or candidate list changed.
	Changed,
}

/// Streamed leadership event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionEvent {
	/// Response header; carries the stream descriptor.
	pub header: ResponseHeader,
	/// Event kind.
	#[serde(rename = "type")]
	pub kind: ElectionEventType,
	/// Term after the change.
	#[serde(default)]
	pub term: Term,
}
