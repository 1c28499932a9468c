//! Wire types for the primitive session protocol.
//!
//! This crate contains the serde-serializable types exchanged with the
//! primitive service. They are the "protocol layer": the shapes of data as
//! they appear on the wire.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! * Pure data: No behavior beyond serialization/deserialization
//! * Shared: Every primitive service stamps requests with a [`RequestHeader`]
//!   and answers with a [`ResponseHeader`]
//! * Stable: Changes only when the wire protocol changes
//!
//! Session ordering, retries and failure classification are built on top of
//! these types in `prim-rs`.

pub mod election;
pub mod headers;
pub mod lock;
pub mod session;
pub mod status;

pub use election::*;
pub use headers::*;
pub use lock::*;
pub use session::*;
pub use status::*;
