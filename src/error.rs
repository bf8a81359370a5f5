//! Crate-wide error and status types.
//!
//! The original engine represents both success and failure as points on a
//! single status enum (`OK`, `InProgress`, or one of several error codes).
//! Here that space is split the idiomatic way: synchronous outcomes are a
//! `Result<Status, Error>`, so `?` composes and callers cannot forget to
//! check an error code.

use std::fmt;

/// Outcome of an operation that completed synchronously or was accepted
/// for asynchronous completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The operation has already completed; no completion callback will
    /// fire (one may have been skipped because it was never scheduled).
    Ok,
    /// The operation was accepted and is in flight; the caller's
    /// completion will fire exactly once when it finishes.
    InProgress,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => f.write_str("ok"),
            Status::InProgress => f.write_str("in progress"),
        }
    }
}

/// Errors surfaced by the transport core.
///
/// `NotPresent` (memory-type cache lookup miss) is intentionally not a
/// member of this enum: a miss is a normal outcome of `lookup`, modeled as
/// `Option::None` rather than a failure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid parameter")]
    InvalidParam,

    #[error("allocation exhausted")]
    NoMemory,

    #[error("resource temporarily unavailable")]
    NoResource,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer unreachable")]
    Unreachable,

    #[error("connection attempt timed out")]
    TimedOut,

    #[error("operation not supported")]
    Unsupported,
}

impl Error {
    /// True for errors the caller may reasonably retry the same request
    /// after backing off (as opposed to terminal failures of the
    /// endpoint).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NoResource | Error::NoMemory)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
