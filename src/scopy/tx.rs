//! Queued RMA work items and their pool.
//!
//! Grounded on `original_source/src/uct/sm/scopy/base/scopy_ep.c`
//! (`uct_scopy_tx_t` is allocated from `uct_scopy_iface_t::tx_mpool` and
//! returned to it on completion).

use crate::error::{Error, Result};
use crate::iov::{IoVector, IovIter};
use crate::scopy::primitive::PeerHandle;

/// A completion callback: fired exactly once, with the final status of
/// the operation it is attached to.
pub struct Completion {
    f: Box<dyn FnOnce(Result<()>) + Send>,
}

impl Completion {
    pub fn new(f: impl FnOnce(Result<()>) + Send + 'static) -> Self {
        Completion { f: Box::new(f) }
    }

    pub(crate) fn fire(self, status: Result<()>) {
        (self.f)(status)
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Completion(..)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Put,
    Get,
}

/// A queued RMA work item (spec section 3, `ScopyTx`).
///
/// Lifecycle: acquired from [`TxPool`] on submit, lives until fully
/// consumed or failed (at which point `completion` fires, then every
/// `flush_subscribers` fires, in that order), then returns to the pool.
pub struct ScopyTx {
    pub op: Op,
    pub iov: IoVector,
    pub total_length: usize,
    pub consumed_length: usize,
    pub iov_iter: IovIter,
    pub remote_addr: u64,
    pub remote_key: u64,
    /// The submitting endpoint's peer identity, copied in at submit time
    /// so the dispatch step can hand it to the copy primitive without
    /// threading the endpoint itself through the arbiter (spec section 4.3:
    /// "the primitive receives the remote endpoint's process identifier").
    pub peer: PeerHandle,
    pub completion: Option<Completion>,
    pub flush_subscribers: Vec<Completion>,
    /// Set by the engine's dispatch step the tick this tx becomes `Done`;
    /// consumed by `fire_pending` once the arbiter hands the tx back.
    pub pending_result: Option<Result<()>>,
}

impl ScopyTx {
    fn empty() -> Self {
        ScopyTx {
            op: Op::Put,
            iov: IoVector::new(),
            total_length: 0,
            consumed_length: 0,
            iov_iter: IovIter::new(),
            remote_addr: 0,
            remote_key: 0,
            peer: PeerHandle::Cookie(0),
            completion: None,
            flush_subscribers: Vec::new(),
            pending_result: None,
        }
    }

    fn reset(&mut self) {
        self.iov = IoVector::new();
        self.total_length = 0;
        self.consumed_length = 0;
        self.iov_iter = IovIter::new();
        self.remote_addr = 0;
        self.remote_key = 0;
        self.peer = PeerHandle::Cookie(0);
        self.completion = None;
        self.flush_subscribers.clear();
        self.pending_result = None;
    }

    /// Fires the primary completion and every flush subscriber with
    /// whatever status `pending_result` was left with by the dispatch
    /// step, defaulting to `Ok` if none was recorded. Takes `&mut self`
    /// rather than consuming the tx, since the caller still needs to hand
    /// the (now-empty) box back to the pool afterwards.
    pub fn fire_pending(&mut self) {
        let status = self.pending_result.take().unwrap_or(Ok(()));
        if let Some(completion) = self.completion.take() {
            completion.fire(status_clone(&status));
        }
        for subscriber in self.flush_subscribers.drain(..) {
            subscriber.fire(status_clone(&status));
        }
    }
}

fn status_clone(status: &Result<()>) -> Result<()> {
    match status {
        Ok(()) => Ok(()),
        Err(e) => Err(clone_error(e)),
    }
}

fn clone_error(e: &Error) -> Error {
    // `Error::Io` wraps `std::io::Error`, which isn't `Clone`; every
    // variant this engine ever constructs for a `ScopyTx` status is
    // reproduced losslessly by kind.
    match e {
        Error::InvalidParam => Error::InvalidParam,
        Error::NoMemory => Error::NoMemory,
        Error::NoResource => Error::NoResource,
        Error::Io(io) => Error::Io(std::io::Error::new(io.kind(), io.to_string())),
        Error::Unreachable => Error::Unreachable,
        Error::TimedOut => Error::TimedOut,
        Error::Unsupported => Error::Unsupported,
    }
}

/// A per-interface pool of [`ScopyTx`] request objects (spec section 9,
/// "Custom reference-counted memory pools" -> an arena per interface with
/// a free-list), bounded by `tx_pool.initial`/`tx_pool.max` (spec section
/// 6).
pub struct TxPool {
    free: Vec<Box<ScopyTx>>,
    allocated: usize,
    max: usize,
}

impl TxPool {
    pub fn new(initial: usize, max: usize) -> Self {
        let free = (0..initial).map(|_| Box::new(ScopyTx::empty())).collect();
        TxPool {
            free,
            allocated: initial,
            max,
        }
    }

    /// Draws a request object from the pool, growing it up to `max` if
    /// necessary. Returns `None` on pool exhaustion (spec section 4.3:
    /// reported to the caller as `NoMemory`).
    pub fn acquire(&mut self) -> Option<Box<ScopyTx>> {
        if let Some(tx) = self.free.pop() {
            return Some(tx);
        }
        if self.allocated < self.max {
            self.allocated += 1;
            return Some(Box::new(ScopyTx::empty()));
        }
        None
    }

    pub fn release(&mut self, mut tx: Box<ScopyTx>) {
        tx.reset();
        self.free.push(tx);
    }
}
