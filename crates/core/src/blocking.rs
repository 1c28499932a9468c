//! Synchronous adapters over the async primitives.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::debug;

use crate::error::{Error, Result};
use crate::lock::{AtomicLock, LockService};

/// Blocks the calling thread on primitive operations, bounding each wait.
///
/// Must not be used from a thread driving the runtime.
#[derive(Debug, Clone)]
pub struct Blocking {
	handle: Handle,
	timeout: Duration,
}

impl Blocking {
	pub fn new(handle: Handle, timeout: Duration) -> Self {
		Self { handle, timeout }
	}

	/// Binds to the runtime of the calling context.
	pub fn current(timeout: Duration) -> Result<Self> {
		let handle = Handle::try_current().map_err(|err| Error::Protocol(format!("no tokio runtime: {err}")))?;
		Ok(Self::new(handle, timeout))
	}

	pub fn timeout(&self) -> Duration {
		self.timeout
	}

	/// Waits for `future`, failing with [`Error::Timeout`] once the operation
	/// timeout elapses. The operation itself is not cancelled remotely.
	pub fn wait<T, F>(&self, future: F) -> Result<T>
	where
		F: Future<Output = Result<T>>,
	{
		let timeout = self.timeout;
		self.handle.block_on(async move {
			match tokio::time::timeout(timeout, future).await {
				Ok(result) => result,
				Err(_) => {
					debug!(target = "prim.blocking", ?timeout, "operation timed out");
					Err(Error::Timeout)
				}
			}
		})
	}
}

/// Blocking view of an [`AtomicLock`].
#[derive(Debug)]
pub struct BlockingLock<S: LockService> {
	lock: Arc<AtomicLock<S>>,
	blocking: Blocking,
}

impl<S: LockService> BlockingLock<S> {
	pub fn new(lock: Arc<AtomicLock<S>>, blocking: Blocking) -> Self {
		Self { lock, blocking }
	}

	pub fn lock(&self) -> Result<u64> {
		self.blocking.wait(self.lock.lock())
	}

	pub fn try_lock(&self) -> Result<Option<u64>> {
		self.blocking.wait(self.lock.try_lock())
	}

	pub fn try_lock_for(&self, timeout: Duration) -> Result<Option<u64>> {
		self.blocking.wait(self.lock.try_lock_for(timeout))
	}

	pub fn unlock(&self) -> Result<()> {
		self.blocking.wait(self.lock.unlock())
	}

	pub fn unlock_version(&self, version: u64) -> Result<bool> {
		self.blocking.wait(self.lock.unlock_version(version))
	}

	pub fn is_locked(&self) -> Result<bool> {
		self.blocking.wait(self.lock.is_locked())
	}

	pub fn is_locked_version(&self, version: u64) -> Result<bool> {
		self.blocking.wait(self.lock.is_locked_version(version))
	}

	pub fn close(&self) -> Result<()> {
		self.blocking.wait(self.lock.close())
	}

	/// The async lock this view wraps.
	pub fn inner(&self) -> &Arc<AtomicLock<S>> {
		&self.lock
	}
}
