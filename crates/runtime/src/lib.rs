//! Execution runtime for primitive sessions.
//!
//! Every session owns one [`SerialContext`]: a task queue drained by a single
//! worker task. All session bookkeeping runs as jobs on that queue, so jobs
//! never race each other and need no locking of their own. Transport
//! callbacks arriving on arbitrary threads hop onto the queue with
//! [`SerialContext::execute`]; delayed work uses [`SerialContext::schedule`].

pub mod context;

pub use context::{Job, SerialContext};
