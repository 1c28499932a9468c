//! Primitive sessions: state, ordering, execution and lifecycle.

mod attempt;
mod executor;
mod handle;
mod primitive;
mod sequencer;
mod state;

pub use executor::{ResponseSink, SessionExecutor};
pub use handle::{OperationFuture, StreamEvent, StreamObserver};
pub use primitive::{ManagedPrimitive, PrimitiveResponse, SessionService};
pub use state::{ListenerId, PrimitiveState, SessionState, StateListener};
