//! The generic segmented RMA engine (spec section 4.3).
//!
//! Grounded on `original_source/src/uct/sm/scopy/base/scopy_iface.c` /
//! `scopy_ep.c`: `uct_scopy_ep_put_zcopy`/`get_zcopy` build a
//! `uct_scopy_tx_t`, push it on the endpoint's arbiter group
//! (`uct_scopy_ep_t::arb_group`), and `uct_scopy_iface_progress` drains
//! the interface-wide arbiter one dispatch at a time via
//! `uct_scopy_ep_progress`/`uct_scopy_comp_tx`.

use crate::arbiter::{Arbiter, DispatchResult, GroupId};
use crate::config::ScopyConfig;
use crate::error::{Error, Result, Status};
use crate::iov::{IoVector, IovIter};
use crate::scopy::primitive::{CopyPrimitive, PeerHandle, RemoteIov};
use crate::scopy::tx::{Completion, Op, ScopyTx, TxPool};

/// A SCOPY endpoint: an arbiter group plus the peer identity its copy
/// primitive needs (spec section 3, `ScopyEndpoint`).
pub struct ScopyEndpoint {
    group: GroupId,
    peer: PeerHandle,
}

/// A SCOPY interface: owns the arbiter, the request pool, and the
/// pluggable copy primitive (spec section 3, `ScopyInterface`).
pub struct ScopyInterface<P: CopyPrimitive> {
    arbiter: Arbiter<Box<ScopyTx>>,
    pool: TxPool,
    primitive: P,
    config: ScopyConfig,
    outstanding_count: usize,
}

impl<P: CopyPrimitive> ScopyInterface<P> {
    pub fn new(config: ScopyConfig, primitive: P) -> Self {
        let config = config.clamped();
        ScopyInterface {
            arbiter: Arbiter::new(),
            pool: TxPool::new(config.tx_pool.initial, config.tx_pool.max),
            primitive,
            config,
            outstanding_count: 0,
        }
    }

    pub fn config(&self) -> &ScopyConfig {
        &self.config
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding_count
    }

    pub fn create_endpoint(&mut self, peer: PeerHandle) -> ScopyEndpoint {
        ScopyEndpoint {
            group: self.arbiter.create_group(),
            peer,
        }
    }

    /// Destroys an endpoint. Callers are expected to have flushed it
    /// first (standard UCT discipline); anything still queued is dropped
    /// with `remove_group`, without firing completions, since a correct
    /// caller never leaves one outstanding.
    pub fn destroy_endpoint(&mut self, ep: ScopyEndpoint) {
        self.arbiter.remove_group(ep.group);
    }

    pub fn put_zcopy(
        &mut self,
        ep: &mut ScopyEndpoint,
        iov: IoVector,
        remote_addr: u64,
        remote_key: u64,
        completion: Option<Completion>,
    ) -> Result<Status> {
        self.submit(ep, Op::Put, iov, remote_addr, remote_key, completion)
    }

    pub fn get_zcopy(
        &mut self,
        ep: &mut ScopyEndpoint,
        iov: IoVector,
        remote_addr: u64,
        remote_key: u64,
        completion: Option<Completion>,
    ) -> Result<Status> {
        self.submit(ep, Op::Get, iov, remote_addr, remote_key, completion)
    }

    fn submit(
        &mut self,
        ep: &mut ScopyEndpoint,
        op: Op,
        iov: IoVector,
        remote_addr: u64,
        remote_key: u64,
        completion: Option<Completion>,
    ) -> Result<Status> {
        if iov.len() > self.config.max_iov {
            return Err(Error::InvalidParam);
        }

        let total_length = iov.total_length();
        if total_length == 0 {
            if let Some(c) = completion {
                c.fire(Ok(()));
            }
            return Ok(Status::Ok);
        }

        let mut tx = self.pool.acquire().ok_or(Error::NoMemory)?;
        tx.op = op;
        tx.iov = iov;
        tx.total_length = total_length;
        tx.consumed_length = 0;
        tx.iov_iter = IovIter::new();
        tx.remote_addr = remote_addr;
        tx.remote_key = remote_key;
        tx.peer = ep.peer;
        tx.completion = completion;
        tx.flush_subscribers.clear();
        tx.pending_result = None;

        self.arbiter.push(ep.group, tx);
        self.outstanding_count += 1;
        Ok(Status::InProgress)
    }

    /// Per-endpoint flush (spec section 4.3, "Flush contract"): a
    /// completion attaches to the endpoint's most-recently-submitted
    /// transaction, which is always the tail of its arbiter group since
    /// `submit` only ever pushes to the tail.
    pub fn ep_flush(
        &mut self,
        ep: &mut ScopyEndpoint,
        completion: Option<Completion>,
    ) -> Result<Status> {
        if self.arbiter.is_group_empty(ep.group) {
            if let Some(c) = completion {
                c.fire(Ok(()));
            }
            return Ok(Status::Ok);
        }

        match completion {
            Some(completion) => match self.arbiter.peek_tail_mut(ep.group) {
                Some(last_tx) => {
                    last_tx.flush_subscribers.push(completion);
                    Ok(Status::InProgress)
                }
                None => {
                    completion.fire(Ok(()));
                    Ok(Status::Ok)
                }
            },
            None => Ok(Status::InProgress),
        }
    }

    /// Interface-wide flush (spec section 4.3): rejects a completion
    /// outright, since fanning it out over every endpoint's in-flight tail
    /// isn't supported by this engine.
    pub fn iface_flush(&self, completion: Option<Completion>) -> Result<Status> {
        if completion.is_some() {
            return Err(Error::Unsupported);
        }
        if self.outstanding_count == 0 {
            Ok(Status::Ok)
        } else {
            Ok(Status::InProgress)
        }
    }

    /// Drains all currently-runnable work, dispatching one segment per
    /// queued request per tick (spec section 4.3, "Progress path").
    /// Returns the number of dispatches performed.
    pub fn progress(&mut self) -> usize {
        let ScopyInterface {
            arbiter,
            pool,
            primitive,
            config,
            outstanding_count,
        } = self;

        let mut events = 0;
        while arbiter.dispatch_one(
            |tx| dispatch_segment(tx, primitive, config),
            |mut tx| {
                *outstanding_count -= 1;
                tx.fire_pending();
                pool.release(tx);
            },
        ) {
            events += 1;
        }
        events
    }
}

/// Computes this tick's segment size, invokes the copy primitive, and
/// applies the result (spec section 4.3, "Progress path"): advances
/// `consumed_length`, records the terminal status in `pending_result` and
/// reports `Done` on error or full consumption, else reports
/// `Rescheduled` so the arbiter re-dispatches this tx on a later tick.
fn dispatch_segment<P: CopyPrimitive>(
    tx: &mut Box<ScopyTx>,
    primitive: &mut P,
    config: &ScopyConfig,
) -> DispatchResult {
    let remaining = tx.total_length - tx.consumed_length;
    let seg_size = config.seg_size.min(remaining);

    let remote = RemoteIov {
        remote_addr: tx.remote_addr + tx.consumed_length as u64,
        remote_key: tx.remote_key,
        length: seg_size,
    };
    match primitive.copy(tx.op, &tx.iov, &mut tx.iov_iter, remote, &tx.peer) {
        Ok(moved) => {
            tx.consumed_length += moved;
            if tx.consumed_length >= tx.total_length {
                tx.pending_result = Some(Ok(()));
                DispatchResult::Done
            } else {
                DispatchResult::Rescheduled
            }
        }
        Err(e) => {
            tx.pending_result = Some(Err(e));
            DispatchResult::Done
        }
    }
}
