//! Client-side session layer for distributed primitives.
//!
//! A primitive (a lock, a leader election) talks to its service through a
//! session. The session executor stamps every request with sequencing
//! headers, retries transient failures with Fibonacci backoff, and releases
//! completions to callers in the order they issued operations, whatever
//! order the responses arrive in.
//!
//! ```ignore
//! let lock = AtomicLock::connect(Name::new("default", "orders"), service, SessionOptions::default()).await?;
//! let version = lock.lock().await?;
//! lock.unlock().await?;
//! ```

pub mod blocking;
pub mod cache;
pub mod election;
pub mod error;
pub mod fake;
pub mod lock;
pub mod options;
pub mod session;

pub use blocking::{Blocking, BlockingLock};
pub use cache::PrimitiveCache;
pub use election::{ElectionService, Leader, LeaderElection, Leadership, LeadershipEvent, LeadershipEventType, LeadershipListenerId};
pub use error::{Error, Result};
pub use lock::{AtomicLock, LockService};
pub use options::SessionOptions;
pub use prim_protocol as protocol;
pub use session::{
	ManagedPrimitive, OperationFuture, PrimitiveResponse, PrimitiveState, ResponseSink, SessionExecutor, SessionService, SessionState, StreamEvent,
	StreamObserver,
};
