//! Single-worker job queue owning a piece of state.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Job run on a [`SerialContext`] with exclusive access to its state.
pub type Job<S> = Box<dyn FnOnce(&mut S, &SerialContext<S>) + Send>;

enum Message<S> {
	Job(Job<S>),
	Shutdown,
}

/// Handle to a sequential execution context.
///
/// The context owns a value of type `S`. Jobs submitted through any clone of
/// the handle run one at a time, in submission order, on a dedicated tokio
/// task, each receiving `&mut S` and a handle for submitting follow-up work.
pub struct SerialContext<S> {
	name: Arc<str>,
	tx: mpsc::UnboundedSender<Message<S>>,
}

impl<S> Clone for SerialContext<S> {
	fn clone(&self) -> Self {
		Self {
			name: Arc::clone(&self.name),
			tx: self.tx.clone(),
		}
	}
}

impl<S> fmt::Debug for SerialContext<S> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SerialContext")
			.field("name", &self.name)
			.field("closed", &self.tx.is_closed())
			.finish()
	}
}

impl<S: Send + 'static> SerialContext<S> {
	/// Spawns the worker task that owns `state`.
	///
	/// Must be called from within a tokio runtime.
	pub fn spawn(name: impl Into<Arc<str>>, state: S) -> Self {
		let (tx, rx) = mpsc::unbounded_channel();
		let context = Self { name: name.into(), tx };
		tokio::spawn(run(context.clone(), state, rx));
		context
	}

	/// Queues `job` behind every job already submitted.
	///
	/// Returns `false` when the context has shut down; the job is dropped.
	pub fn execute<F>(&self, job: F) -> bool
	where
		F: FnOnce(&mut S, &SerialContext<S>) + Send + 'static,
	{
		self.tx.send(Message::Job(Box::new(job))).is_ok()
	}

	/// Queues `job` once `delay` has elapsed.
	///
	/// The delay runs on its own task; the context keeps draining other jobs
	/// meanwhile.
	pub fn schedule<F>(&self, delay: Duration, job: F) -> JoinHandle<()>
	where
		F: FnOnce(&mut S, &SerialContext<S>) + Send + 'static,
	{
		let context = self.clone();
		tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			if !context.execute(job) {
				debug!(target = "prim.context", context = %context.name, "scheduled job dropped after shutdown");
			}
		})
	}

	/// Stops the worker after the jobs already queued have run.
	pub fn shutdown(&self) {
		let _ = self.tx.send(Message::Shutdown);
	}
}

impl<S> SerialContext<S> {
	/// Context name used in logs.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Returns `true` once the worker has stopped.
	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}
}

async fn run<S>(context: SerialContext<S>, mut state: S, mut rx: mpsc::UnboundedReceiver<Message<S>>) {
	trace!(target = "prim.context", context = %context.name, "worker started");
	while let Some(message) = rx.recv().await {
		match message {
			Message::Job(job) => job(&mut state, &context),
			Message::Shutdown => break,
		}
	}
	rx.close();
	debug!(target = "prim.context", context = %context.name, "worker stopped");
}
