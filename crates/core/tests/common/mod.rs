//! Shared helpers for session integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use prim::protocol::{Name, RequestHeader, ResponseHeader, ResponseType, StreamHeader};
use prim::{ResponseSink, SessionExecutor, SessionState};
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const SESSION_ID: u64 = 1;

/// Routes logs to the test harness; safe to call from every test.
pub fn init_tracing() {
	let _ = tracing_subscriber::fmt().with_test_writer().with_max_level(tracing::Level::DEBUG).try_init();
}

/// Response used by the closure-backed transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
	pub header: ResponseHeader,
	pub value: u64,
}

pub fn reply(index: u64, value: u64) -> Reply {
	Reply {
		header: ResponseHeader::at(SESSION_ID, index),
		value,
	}
}

pub fn stream_item(stream_id: u64, response_id: u64, index: u64, value: u64) -> Reply {
	Reply {
		header: ResponseHeader {
			streams: vec![StreamHeader {
				stream_id,
				response_id,
				index,
			}],
			..ResponseHeader::at(SESSION_ID, index)
		},
		value,
	}
}

pub fn stream_ack(index: u64) -> Reply {
	Reply {
		header: ResponseHeader {
			response_type: ResponseType::OpenStream,
			..ResponseHeader::at(SESSION_ID, index)
		},
		value: 0,
	}
}

pub fn header(reply: &Reply) -> ResponseHeader {
	reply.header.clone()
}

/// One remote call observed by the transport.
#[derive(Debug)]
pub struct Call {
	pub header: RequestHeader,
	pub sink: ResponseSink<Reply>,
	pub at: Instant,
}

impl Call {
	pub fn id(&self) -> u64 {
		self.sink.id()
	}

	pub fn attempt(&self) -> u32 {
		self.sink.attempt()
	}
}

/// Request function that records every call for the test to answer.
pub fn transport() -> (impl Fn(RequestHeader, ResponseSink<Reply>) + Clone + Send + Sync + 'static, mpsc::UnboundedReceiver<Call>) {
	let (tx, rx) = mpsc::unbounded_channel();
	let request = move |header: RequestHeader, sink: ResponseSink<Reply>| {
		let _ = tx.send(Call {
			header,
			sink,
			at: Instant::now(),
		});
	};
	(request, rx)
}

pub fn executor(timeout: Duration) -> SessionExecutor {
	let state = Arc::new(SessionState::new(Name::new("test", "primitive"), SESSION_ID, timeout));
	SessionExecutor::new(state)
}

/// Waits until every job queued on the executor so far has run.
pub async fn settle(executor: &SessionExecutor) {
	let _ = executor.in_flight().await;
}
