//! Spare-process pool for the document gateway.
//!
//! Workers are forked by an external "forkit" supervisor process and announce
//! themselves back over a callback socket.  This crate tracks the spares,
//! keeps the pool balanced against a target size, and supervises the forkit
//! itself.

pub mod child;
pub mod forkit;
pub mod pool;

pub use child::ChildProcess;
pub use forkit::Forkit;
pub use pool::ChildPool;

/// How long to wait for the forkit to acknowledge a spawn request before
/// assuming it was lost and re-requesting.
pub const CHILD_TIMEOUT_MS: u64 = 10_000;
