//! A userspace active-message and RMA transport core: a generic segmented
//! SCOPY engine over a pluggable copy primitive, a single-threaded
//! nonblocking TCP active-message transport, and a memory-type cache shared
//! between them.
//!
//! Grounded on `tokio-rs-mio`: the crate-root layout (feature-gated
//! top-level modules, a thin `lib.rs` that mostly re-exports), the epoll
//! reactor in [`reactor`], and the `log`/`thiserror` ambient stack all
//! follow its conventions (see `DESIGN.md`).

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod arbiter;
pub mod config;
pub mod error;
pub mod interval;
pub mod iov;
pub mod memtype;

#[cfg(feature = "tcp")]
pub mod reactor;

#[cfg(feature = "scopy")]
pub mod scopy;

#[cfg(feature = "tcp")]
pub mod tcp;

pub use error::{Error, Result, Status};
pub use interval::{Interval, IntervalMap};
pub use iov::{IoVector, IovElement, IovIter};
pub use memtype::{MemKind, MemTypeCache, MemTypeEvent};

#[cfg(feature = "scopy")]
pub use scopy::{Completion, Op, PeerHandle, ScopyEndpoint, ScopyInterface};

#[cfg(feature = "tcp")]
pub use tcp::{TcpEpId, TcpIface};
