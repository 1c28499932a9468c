//! Distributed lock primitive.

use std::time::Duration;

use prim_protocol::{IsLockedRequest, IsLockedResponse, LockRequest, LockResponse, Name, UnlockRequest, UnlockResponse};

use crate::error::{Error, Result};
use crate::options::SessionOptions;
use crate::session::{ManagedPrimitive, ResponseSink, SessionService};

/// Remote calls of the lock service.
pub trait LockService: SessionService {
	/// Acquires the lock. A `timeout` of `None` waits indefinitely; a zero
	/// timeout fails immediately when the lock is held.
	fn lock(&self, request: LockRequest, sink: ResponseSink<LockResponse>);

	fn unlock(&self, request: UnlockRequest, sink: ResponseSink<UnlockResponse>);

	fn is_locked(&self, request: IsLockedRequest, sink: ResponseSink<IsLockedResponse>);
}

/// Session-scoped distributed lock.
///
/// Every acquisition returns a monotonically increasing version that can be
/// used as a fencing token. The lock is released when the session ends.
#[derive(Debug)]
pub struct AtomicLock<S: LockService> {
	primitive: ManagedPrimitive<S>,
}

impl<S: LockService> AtomicLock<S> {
	/// Opens a session for the lock `name`.
	pub async fn connect(name: Name, service: S, options: SessionOptions) -> Result<Self> {
		Ok(Self::new(ManagedPrimitive::connect(name, service, options).await?))
	}

	pub fn new(primitive: ManagedPrimitive<S>) -> Self {
		Self { primitive }
	}

	pub fn primitive(&self) -> &ManagedPrimitive<S> {
		&self.primitive
	}

	/// Acquires the lock, waiting as long as it takes. Returns the lock version.
	pub async fn lock(&self) -> Result<u64> {
		match self.acquire(None).await? {
			Some(version) => Ok(version),
			None => Err(Error::CommandFailure("lock was not acquired".to_string())),
		}
	}

	/// Acquires the lock only if it is free.
	pub async fn try_lock(&self) -> Result<Option<u64>> {
		self.acquire(Some(Duration::ZERO)).await
	}

	/// Acquires the lock, giving up after `timeout`.
	pub async fn try_lock_for(&self, timeout: Duration) -> Result<Option<u64>> {
		self.acquire(Some(timeout)).await
	}

	async fn acquire(&self, timeout: Option<Duration>) -> Result<Option<u64>> {
		let response = self
			.primitive
			.command(move |service: &S, header, sink| service.lock(LockRequest { header, timeout }, sink))
			.await?;
		Ok(response.acquired.then_some(response.version))
	}

	/// Releases the lock if this session holds it.
	pub async fn unlock(&self) -> Result<()> {
		self.release(None).await?;
		Ok(())
	}

	/// Releases the lock if it is held at `version`.
	pub async fn unlock_version(&self, version: u64) -> Result<bool> {
		self.release(Some(version)).await
	}

	async fn release(&self, version: Option<u64>) -> Result<bool> {
		let response = self
			.primitive
			.command(move |service: &S, header, sink| service.unlock(UnlockRequest { header, version }, sink))
			.await?;
		Ok(response.unlocked)
	}

	/// Returns whether any session holds the lock.
	pub async fn is_locked(&self) -> Result<bool> {
		self.locked(None).await
	}

	/// Returns whether the lock is held at `version`.
	pub async fn is_locked_version(&self, version: u64) -> Result<bool> {
		self.locked(Some(version)).await
	}

	async fn locked(&self, version: Option<u64>) -> Result<bool> {
		let response = self
			.primitive
			.query(move |service: &S, header, sink| service.is_locked(IsLockedRequest { header, version }, sink))
			.await?;
		Ok(response.locked)
	}

	pub async fn close(&self) -> Result<()> {
		self.primitive.close().await
	}

	pub async fn delete(&self) -> Result<()> {
		self.primitive.delete().await
	}
}
