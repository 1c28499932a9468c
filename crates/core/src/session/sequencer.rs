//! In-order release of operation completions and stream items.
//!
//! Responses can arrive in any order on the wire. The sequencer buffers each
//! completion until every completion issued before it has been released, so
//! callers observe results in the order they issued operations. Streamed
//! items are ordered by the per-stream response id the server stamps on them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use prim_protocol::StreamHeader;
use tracing::{debug, trace};

use super::state::SessionState;

/// Deferred completion.
pub(crate) type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct StreamSequence {
	/// Last response id released on the stream.
	released: u64,
	/// Items waiting for a predecessor, keyed by response id.
	pending: BTreeMap<u64, (u64, Callback)>,
}

/// Orders completions for one session.
pub(crate) struct SessionSequencer {
	state: Arc<SessionState>,
	/// Last client id handed out.
	request_sequence: u64,
	/// Last client id whose completion was released.
	response_sequence: u64,
	responses: BTreeMap<u64, Callback>,
	streams: HashMap<u64, StreamSequence>,
}

impl SessionSequencer {
	pub(crate) fn new(state: Arc<SessionState>) -> Self {
		Self {
			state,
			request_sequence: 0,
			response_sequence: 0,
			responses: BTreeMap::new(),
			streams: HashMap::new(),
		}
	}

	/// Allocates the next client id.
	pub(crate) fn next_request(&mut self) -> u64 {
		self.request_sequence += 1;
		self.request_sequence
	}

	/// Releases `callback` once every id below `id` has been released.
	///
	/// Each id must be sequenced exactly once.
	pub(crate) fn sequence_response(&mut self, id: u64, callback: Callback) {
		if id <= self.response_sequence {
			debug!(target = "prim.sequencer", session = self.state.session_id(), id, "completion for released id; running immediately");
			callback();
			return;
		}

		if id == self.response_sequence + 1 {
			self.response_sequence = id;
			callback();
		} else {
			trace!(target = "prim.sequencer", id, expected = self.response_sequence + 1, "buffering early completion");
			self.responses.insert(id, callback);
		}

		while let Some(callback) = self.responses.remove(&(self.response_sequence + 1)) {
			self.response_sequence += 1;
			callback();
		}
	}

	/// Releases a streamed item in response-id order.
	///
	/// Items at or below the last released response id are replays from a
	/// re-established stream and are dropped.
	pub(crate) fn sequence_stream(&mut self, header: &StreamHeader, callback: Callback) {
		let stream = self.streams.entry(header.stream_id).or_default();
		if header.response_id <= stream.released {
			trace!(target = "prim.sequencer", stream = header.stream_id, response = header.response_id, "dropping replayed stream item");
			return;
		}
		stream.pending.insert(header.response_id, (header.index, callback));
		self.drain_stream(header.stream_id);
	}

	/// Ends a stream and always runs its terminal callback.
	///
	/// No further items can arrive once the attempt is gone, so buffered
	/// items are released in response-id order across any gap first.
	pub(crate) fn abort_stream(&mut self, stream_id: u64, callback: Callback) {
		if let Some(stream) = self.streams.remove(&stream_id) {
			if !stream.pending.is_empty() {
				debug!(
					target = "prim.sequencer",
					session = self.state.session_id(),
					stream = stream_id,
					released = stream.released,
					buffered = stream.pending.len(),
					"ending stream with missing items"
				);
			}
			for (index, item) in stream.pending.into_values() {
				self.state.set_event_index(index);
				item();
			}
		}
		callback();
	}

	fn drain_stream(&mut self, stream_id: u64) {
		let Some(stream) = self.streams.get_mut(&stream_id) else {
			return;
		};

		while let Some((index, callback)) = stream.pending.remove(&(stream.released + 1)) {
			stream.released += 1;
			self.state.set_event_index(index);
			callback();
		}
	}

	/// Number of completions waiting on a predecessor.
	#[cfg(test)]
	pub(crate) fn buffered(&self) -> usize {
		self.responses.len()
	}
}
