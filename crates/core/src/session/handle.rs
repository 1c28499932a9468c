//! Caller-facing result handles and stream observers.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};

/// Single-assignment sender half of an [`OperationFuture`].
pub(crate) type Completer<T> = oneshot::Sender<Result<T>>;

/// Handle resolving to the outcome of a session operation.
///
/// Resolves exactly once. If the session drops the operation without
/// completing it (its context shut down), the handle resolves to a
/// session-closed conflict.
#[must_use = "operations resolve asynchronously; await the handle to observe the outcome"]
#[derive(Debug)]
pub struct OperationFuture<T> {
	rx: oneshot::Receiver<Result<T>>,
}

impl<T> OperationFuture<T> {
	pub(crate) fn pending() -> (Completer<T>, Self) {
		let (tx, rx) = oneshot::channel();
		(tx, Self { rx })
	}

	/// Returns a handle that is already resolved.
	pub fn ready(result: Result<T>) -> Self {
		let (tx, future) = Self::pending();
		let _ = tx.send(result);
		future
	}
}

impl<T> Future for OperationFuture<T> {
	type Output = Result<T>;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		match Pin::new(&mut self.get_mut().rx).poll(cx) {
			Poll::Ready(Ok(result)) => Poll::Ready(result),
			Poll::Ready(Err(_)) => Poll::Ready(Err(Error::session_closed())),
			Poll::Pending => Poll::Pending,
		}
	}
}

/// Receiver of items pushed on a streaming operation.
///
/// Items arrive in stream order. Exactly one of `on_error` or `on_completed`
/// ends the stream, unless the stream is retried transparently after a
/// transient failure.
pub trait StreamObserver<T>: Send + Sync + 'static {
	/// Called for each item, in order.
	fn on_next(&self, item: T);

	/// Called once when the stream fails terminally.
	fn on_error(&self, error: Error) {
		let _ = error;
	}

	/// Called once when the server ends the stream.
	fn on_completed(&self) {}
}

/// Stream notification forwarded by the channel observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent<T> {
	/// Next item.
	Next(T),
	/// Terminal failure.
	Error(Error),
	/// Terminal completion.
	Completed,
}

impl<T: Send + 'static> StreamObserver<T> for mpsc::UnboundedSender<StreamEvent<T>> {
	fn on_next(&self, item: T) {
		let _ = self.send(StreamEvent::Next(item));
	}

	fn on_error(&self, error: Error) {
		let _ = self.send(StreamEvent::Error(error));
	}

	fn on_completed(&self) {
		let _ = self.send(StreamEvent::Completed);
	}
}
