//! Per-client cache of open primitives.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use prim_protocol::Name;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::{Error, Result};

type Entry = Arc<OnceCell<Arc<dyn Any + Send + Sync>>>;

/// Shares one instance per primitive type and name.
///
/// Concurrent requests for the same primitive wait on a single
/// initialisation. A failed initialisation is not cached.
#[derive(Default)]
pub struct PrimitiveCache {
	entries: Mutex<HashMap<(TypeId, Name), Entry>>,
}

impl std::fmt::Debug for PrimitiveCache {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PrimitiveCache").field("entries", &self.entries.lock().len()).finish()
	}
}

impl PrimitiveCache {
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the cached primitive for `name`, creating it with `init` if absent.
	pub async fn get_or_create<P, F, Fut>(&self, name: &Name, init: F) -> Result<Arc<P>>
	where
		P: Send + Sync + 'static,
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<P>>,
	{
		let entry = Arc::clone(self.entries.lock().entry((TypeId::of::<P>(), name.clone())).or_default());
		let value = entry
			.get_or_try_init(|| async move {
				debug!(target = "prim.cache", %name, "creating primitive");
				let primitive = init().await?;
				Ok::<_, Error>(Arc::new(primitive) as Arc<dyn Any + Send + Sync>)
			})
			.await?;
		Arc::clone(value)
			.downcast::<P>()
			.map_err(|_| Error::Protocol(format!("cached primitive {name} has an unexpected type")))
	}

	/// Drops the cached primitive of type `P` for `name`.
	pub fn remove<P: 'static>(&self, name: &Name) -> bool {
		self.entries.lock().remove(&(TypeId::of::<P>(), name.clone())).is_some()
	}

	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
