//! The nonblocking, single-threaded TCP transport interface: listener
//! lifecycle, connection establishment (including simultaneous-connect
//! tie-break), connection reuse, and active-message dispatch (spec
//! section 4.4).
//!
//! Grounded on `original_source/src/uct/tcp/tcp_cm.c` /`tcp_ep.c` for the
//! state-machine shape, generalized from UCX's class hierarchy
//! (`uct_tcp_iface_t` / `uct_tcp_ep_t`) into one struct that owns a slab of
//! endpoints, the way the teacher owns a `Poll` + registered I/O sources
//! rather than a base-class tree (spec section 9: "composition" flag).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use log::{debug, trace, warn};

use crate::config::TcpConfig;
use crate::error::{Error, Result, Status};
use crate::reactor::{Event, Events, Interest, Poll, Token};
use crate::tcp::endpoint::{Caps, ConnState, FailReason, PendingSend, TcpEndpoint};
use crate::tcp::wire::{addr_order, CmMessage, CM_AM_ID, CM_MAGIC};

const LISTENER_TOKEN: Token = Token(0);

/// Opaque handle to an endpoint owned by a [`TcpIface`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcpEpId(usize);

struct Slot {
    ep: TcpEndpoint,
    /// Number of live [`TcpEpId`] handles referring to this connection
    /// (spec overview: "connection reuse" — `create_endpoint` may hand
    /// back a handle to an already-`Connected` endpoint to the same peer).
    refcount: usize,
}

#[derive(Default)]
struct PeerConns {
    next_conn_id: u32,
    conns: HashMap<u32, usize>,
}

/// A nonblocking TCP transport interface (spec section 3, `TcpInterface`,
/// generalized: spec.md names only the per-endpoint and per-peer-connection
/// records, this struct is the `Interface` from spec section 2's data flow
/// that owns them).
pub struct TcpIface {
    poll: Poll,
    events: Events,
    listener: OwnedFd,
    /// This interface's own bind address; sent in every `CONN_REQ`/
    /// `CONN_ACK|CONN_REQ` and compared against the peer's in the
    /// simultaneous-connect tie-break (spec section 4.4.1).
    iface_addr: SocketAddr,
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    conn_map: HashMap<SocketAddr, PeerConns>,
    config: TcpConfig,
    handlers: HashMap<u8, Box<dyn FnMut(&[u8])>>,
}

impl TcpIface {
    /// Creates and binds a nonblocking listening socket at `addr`,
    /// registers it with the reactor, and returns the interface (spec
    /// section 4.4.1, "Acceptor path" step 1 and `SPEC_FULL.md` section
    /// 4.4, "Listener lifecycle").
    pub fn bind(addr: SocketAddr, config: TcpConfig) -> Result<TcpIface> {
        let listener = create_listener(addr)?;
        let bound_addr = local_addr(listener.as_raw_fd())?;

        let poll = Poll::new().map_err(Error::Io)?;
        poll.register(listener.as_raw_fd(), LISTENER_TOKEN, Interest::READABLE)
            .map_err(Error::Io)?;

        Ok(TcpIface {
            poll,
            events: Events::with_capacity(128),
            listener,
            iface_addr: bound_addr,
            slots: Vec::new(),
            free: Vec::new(),
            conn_map: HashMap::new(),
            config,
            handlers: HashMap::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.iface_addr
    }

    /// Registers the handler invoked for every received frame whose
    /// `am_id` matches (connection-manager frames, `am_id == CM_AM_ID`,
    /// are handled internally and never reach user handlers).
    pub fn set_am_handler(&mut self, am_id: u8, handler: impl FnMut(&[u8]) + 'static) {
        assert_ne!(am_id, CM_AM_ID, "am_id 0xFF is reserved for connection management");
        self.handlers.insert(am_id, Box::new(handler));
    }

    // ---- endpoint lifecycle ----------------------------------------

    /// Opens (or reuses, per spec overview "connection reuse") a
    /// connection to `peer_addr`.
    pub fn create_endpoint(&mut self, peer_addr: SocketAddr) -> Result<TcpEpId> {
        if let Some(idx) = self.find_reusable(peer_addr) {
            let slot = self.slots[idx].as_mut().expect("reusable index is occupied");
            slot.ep.caps.tx = true;
            slot.refcount += 1;
            return Ok(TcpEpId(idx));
        }

        let fd = create_nonblocking_socket(peer_addr)?;
        let raw = fd.as_raw_fd();
        let conn_id = self.alloc_conn_id(peer_addr);
        let idx = self.alloc_slot();
        let token = Token(idx + 1);

        let mut ep = TcpEndpoint::new(fd, token, Some(peer_addr), conn_id, ConnState::Closed);

        match connect_nonblocking(raw, peer_addr) {
            Ok(true) => {
                send_initial_frame(&mut ep, self.iface_addr, conn_id)?;
                ep.conn_state = ConnState::WaitingAck;
                self.poll.register(raw, token, Interest::READABLE).map_err(Error::Io)?;
            }
            Ok(false) => {
                ep.conn_state = ConnState::Connecting;
                self.poll.register(raw, token, Interest::WRITABLE).map_err(Error::Io)?;
            }
            Err(e) => return Err(e),
        }

        self.slots[idx] = Some(Slot { ep, refcount: 1 });
        self.conn_map.entry(peer_addr).or_default().conns.insert(conn_id, idx);
        Ok(TcpEpId(idx))
    }

    fn find_reusable(&self, peer_addr: SocketAddr) -> Option<usize> {
        let peer_conns = self.conn_map.get(&peer_addr)?;
        peer_conns.conns.values().copied().find(|&idx| {
            self.slots[idx]
                .as_ref()
                .map(|s| s.ep.conn_state == ConnState::Connected && s.ep.failed.is_none())
                .unwrap_or(false)
        })
    }

    /// Releases one reference to `id`; the underlying connection is torn
    /// down once its refcount reaches zero (spec section 5: "File
    /// descriptors are owned by exactly one endpoint").
    pub fn destroy_endpoint(&mut self, id: TcpEpId) {
        let Some(slot) = self.slots[id.0].as_mut() else {
            return;
        };
        slot.refcount -= 1;
        if slot.refcount > 0 {
            return;
        }
        self.teardown(id.0);
    }

    fn teardown(&mut self, idx: usize) {
        let Some(slot) = self.slots[idx].take() else {
            return;
        };
        let _ = self.poll.deregister(slot.ep.raw_fd());
        if let Some(peer_addr) = slot.ep.peer_addr {
            if let Some(peer_conns) = self.conn_map.get_mut(&peer_addr) {
                peer_conns.conns.retain(|_, v| *v != idx);
            }
        }
        self.free.push(idx);
        // `slot.ep`'s `OwnedFd` closes the socket on drop here.
    }

    fn alloc_slot(&mut self) -> usize {
        if let Some(idx) = self.free.pop() {
            idx
        } else {
            self.slots.push(None);
            self.slots.len() - 1
        }
    }

    fn alloc_conn_id(&mut self, peer_addr: SocketAddr) -> u32 {
        let peer_conns = self.conn_map.entry(peer_addr).or_default();
        let id = peer_conns.next_conn_id;
        peer_conns.next_conn_id += 1;
        id
    }

    fn slot_mut(&mut self, id: TcpEpId) -> Result<&mut Slot> {
        self.slots
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(Error::Unreachable)
    }

    // ---- active messages --------------------------------------------

    /// Sends a short active message (spec section 6, `am_short`): header
    /// and payload are copied into the endpoint's TX buffer and this
    /// returns once queued, without waiting for the bytes to reach the
    /// wire (matches `original_source`'s `uct_tcp_ep_am_short`, which
    /// returns `UCS_OK` immediately after `uct_tcp_ep_am_send` queues the
    /// buffer, not after it drains).
    pub fn am_short(&mut self, id: TcpEpId, am_id: u8, header: u64, payload: &[u8]) -> Result<Status> {
        assert_ne!(am_id, CM_AM_ID);
        let mut framed = Vec::with_capacity(8 + payload.len());
        framed.extend_from_slice(&header.to_le_bytes());
        framed.extend_from_slice(payload);
        self.send_or_fail(id, am_id, &framed)
    }

    /// Sends a buffer-copy active message built by `pack`, which returns
    /// the packed payload (spec section 6, `am_bcopy`).
    pub fn am_bcopy(&mut self, id: TcpEpId, am_id: u8, pack: impl FnOnce() -> Vec<u8>) -> Result<usize> {
        assert_ne!(am_id, CM_AM_ID);
        let payload = pack();
        let len = payload.len();
        self.send_or_fail(id, am_id, &payload)?;
        Ok(len)
    }

    fn send_or_fail(&mut self, id: TcpEpId, am_id: u8, payload: &[u8]) -> Result<Status> {
        let slot = self.slot_mut(id)?;
        if let Some(reason) = slot.ep.failed {
            return Err(reason.to_error());
        }
        if !slot.ep.can_send() {
            return Err(Error::NoResource);
        }
        slot.ep.stage_send(am_id, payload);
        self.drain_tx(id.0)?;
        Ok(Status::Ok)
    }

    /// Explicitly queues an active message for later delivery once the
    /// endpoint can send again (spec section 4.4.4; grounded on
    /// `original_source`'s `uct_tcp_ep_pending_add`). Callers are expected
    /// to have already seen `am_short`/`am_bcopy` return `NoResource`.
    pub fn pending_add(&mut self, id: TcpEpId, am_id: u8, payload: &[u8]) -> Result<()> {
        assert_ne!(am_id, CM_AM_ID);
        let mut frame = Vec::with_capacity(crate::tcp::wire::FRAME_HEADER_LEN + payload.len());
        crate::tcp::wire::encode_frame(am_id, payload, &mut frame);
        let slot = self.slot_mut(id)?;
        if slot.ep.can_send() {
            return Err(Error::Unsupported);
        }
        slot.ep.pending_queue.push_back(PendingSend { frame });
        Ok(())
    }

    /// Purges every queued pending send on `id` without attempting
    /// delivery (spec section 4.4.4; grounded on `original_source`'s
    /// `uct_tcp_ep_pending_purge`).
    pub fn pending_purge(&mut self, id: TcpEpId) -> Result<usize> {
        let slot = self.slot_mut(id)?;
        let purged = slot.ep.pending_queue.len();
        slot.ep.pending_queue.clear();
        Ok(purged)
    }

    // ---- flush --------------------------------------------------------

    /// Per-endpoint flush (spec section 4.4.4): `Ok` iff the TX buffer is
    /// empty and the pending queue has drained.
    pub fn ep_flush(&mut self, id: TcpEpId) -> Result<Status> {
        let slot = self.slot_mut(id)?;
        if let Some(reason) = slot.ep.failed {
            return Err(reason.to_error());
        }
        if slot.ep.can_send() && slot.ep.pending_queue.is_empty() {
            Ok(Status::Ok)
        } else {
            Ok(Status::InProgress)
        }
    }

    /// Interface-wide flush: `Ok` iff no endpoint has outstanding bytes
    /// (spec section 4.4.4).
    pub fn iface_flush(&self) -> Status {
        let outstanding = self
            .slots
            .iter()
            .flatten()
            .any(|s| s.ep.has_outstanding());
        if outstanding {
            Status::InProgress
        } else {
            Status::Ok
        }
    }

    // ---- progress -------------------------------------------------------

    /// Drains one round of reactor events (spec section 6, `iface_progress`).
    pub fn progress(&mut self) -> Result<usize> {
        self.poll
            .poll(&mut self.events, Some(std::time::Duration::ZERO))
            .map_err(Error::Io)?;

        let ready: Vec<Event> = self.events.iter().collect();
        let mut processed = 0;
        for event in ready {
            if event.token() == LISTENER_TOKEN {
                processed += self.accept_pending()?;
                continue;
            }
            let idx = event.token().0 - 1;
            self.handle_endpoint_event(idx, event);
            processed += 1;
        }
        Ok(processed)
    }

    fn accept_pending(&mut self) -> Result<usize> {
        let mut accepted = 0;
        loop {
            match accept_nonblocking(self.listener.as_raw_fd()) {
                Ok(Some((fd, _accepted_from))) => {
                    self.handle_accept(fd);
                    accepted += 1;
                }
                Ok(None) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(accepted)
    }

    fn handle_accept(&mut self, fd: OwnedFd) {
        let idx = self.alloc_slot();
        let token = Token(idx + 1);
        if let Err(e) = self.poll.register(fd.as_raw_fd(), token, Interest::READABLE) {
            warn!(target: "uct::tcp", "failed to register accepted fd: {e}");
            self.free.push(idx);
            return;
        }
        let ep = TcpEndpoint::new(fd, token, None, 0, ConnState::RecvMagic);
        self.slots[idx] = Some(Slot { ep, refcount: 1 });
        trace!(target: "uct::tcp", "tcp_iface: accepted connection into slot {}", idx);
    }

    fn handle_endpoint_event(&mut self, idx: usize, event: Event) {
        let state = match self.slots[idx].as_ref() {
            Some(slot) => slot.ep.conn_state,
            None => return,
        };

        let result = match state {
            ConnState::Connecting => self.on_connecting_writable(idx),
            ConnState::WaitingAck => self.on_waiting_ack_readable(idx),
            ConnState::RecvMagic => self.on_recv_magic_readable(idx),
            ConnState::Accepting => self.on_accepting_readable(idx),
            ConnState::Connected => self.on_connected_event(idx, event),
            ConnState::Closed => Ok(()),
        };

        if let Err(e) = result {
            self.fail_endpoint(idx, &e);
        }
    }

    fn on_connecting_writable(&mut self, idx: usize) -> Result<()> {
        let raw = self.slots[idx].as_ref().unwrap().ep.raw_fd();
        match socket_error(raw)? {
            Some(_) => {
                self.retry_or_fail(idx)?;
            }
            None => {
                let peer_addr = self.slots[idx].as_ref().unwrap().ep.peer_addr;
                let conn_id = self.slots[idx].as_ref().unwrap().ep.conn_id;
                let iface_addr = self.iface_addr;
                let slot = self.slots[idx].as_mut().unwrap();
                send_initial_frame(&mut slot.ep, iface_addr, conn_id)?;
                slot.ep.conn_state = ConnState::WaitingAck;
                self.poll.reregister(slot.ep.raw_fd(), slot.ep.token, Interest::READABLE).map_err(Error::Io)?;
                let _ = peer_addr;
            }
        }
        Ok(())
    }

    /// Bounded retry for a socket-level error on a `Connecting` or
    /// `WaitingAck` endpoint (spec section 4.4.5): re-issues `connect` on
    /// the same fd and re-arms the handshake from scratch, failing the
    /// endpoint with `TimedOut` once `max_conn_retries` is exhausted.
    fn retry_or_fail(&mut self, idx: usize) -> Result<()> {
        let (raw, peer_addr, retries) = {
            let ep = &self.slots[idx].as_ref().unwrap().ep;
            (ep.raw_fd(), ep.peer_addr, ep.retry_count)
        };
        if retries >= self.config.max_conn_retries {
            return Err(Error::TimedOut);
        }
        let Some(peer_addr) = peer_addr else {
            return Err(Error::Unreachable);
        };
        {
            let ep = &mut self.slots[idx].as_mut().unwrap().ep;
            ep.retry_count += 1;
            ep.reset_for_retry();
        }

        match connect_nonblocking(raw, peer_addr)? {
            true => {
                let conn_id = self.slots[idx].as_ref().unwrap().ep.conn_id;
                let iface_addr = self.iface_addr;
                let slot = self.slots[idx].as_mut().unwrap();
                send_initial_frame(&mut slot.ep, iface_addr, conn_id)?;
                slot.ep.conn_state = ConnState::WaitingAck;
                self.poll.reregister(slot.ep.raw_fd(), slot.ep.token, Interest::READABLE).map_err(Error::Io)?;
            }
            false => {
                let slot = self.slots[idx].as_mut().unwrap();
                slot.ep.conn_state = ConnState::Connecting;
                self.poll.reregister(slot.ep.raw_fd(), slot.ep.token, Interest::WRITABLE).map_err(Error::Io)?;
            }
        }
        Ok(())
    }

    fn on_waiting_ack_readable(&mut self, idx: usize) -> Result<()> {
        let frames = match self.read_frames(idx) {
            Ok(frames) => frames,
            Err(_) => return self.retry_or_fail(idx),
        };
        for (am_id, payload) in frames {
            if am_id != CM_AM_ID {
                warn!(target: "uct::tcp", "tcp_ep: unexpected user AM while awaiting CONN_ACK");
                continue;
            }
            match CmMessage::decode(&payload) {
                Some(CmMessage::ConnAck) => {
                    let slot = self.slots[idx].as_mut().unwrap();
                    slot.ep.conn_state = ConnState::Connected;
                    slot.ep.caps.add(Caps { tx: true, rx: false });
                    self.dispatch_pending(idx)?;
                }
                Some(CmMessage::ConnAckReq { .. }) => {
                    let slot = self.slots[idx].as_mut().unwrap();
                    slot.ep.conn_state = ConnState::Connected;
                    slot.ep.caps.add(Caps { tx: true, rx: true });
                    self.dispatch_pending(idx)?;
                }
                _ => warn!(target: "uct::tcp", "tcp_ep: malformed CM message while awaiting CONN_ACK"),
            }
        }
        Ok(())
    }

    fn on_recv_magic_readable(&mut self, idx: usize) -> Result<()> {
        let outcome = {
            let slot = self.slots[idx].as_mut().unwrap();
            slot.ep.try_consume_magic(CM_MAGIC)?
        };
        match outcome {
            None => {}
            Some(true) => {
                self.slots[idx].as_mut().unwrap().ep.conn_state = ConnState::Accepting;
            }
            Some(false) => {
                debug!(target: "uct::tcp", "tcp_iface: magic mismatch on accepted connection, dropping");
                self.teardown(idx);
            }
        }
        Ok(())
    }

    fn on_accepting_readable(&mut self, idx: usize) -> Result<()> {
        let frames = self.read_frames(idx)?;
        for (am_id, payload) in frames {
            if am_id != CM_AM_ID {
                continue;
            }
            if let Some(CmMessage::ConnReq { iface_addr, conn_id }) = CmMessage::decode(&payload) {
                self.handle_conn_req(idx, SocketAddr::V4(iface_addr), conn_id)?;
            } else {
                warn!(target: "uct::tcp", "tcp_iface: expected CONN_REQ while accepting");
            }
        }
        Ok(())
    }

    /// Spec section 4.4.1, "Acceptor path" step 3 and "Simultaneous-connect
    /// tie-break".
    fn handle_conn_req(&mut self, idx: usize, remote_iface_addr: SocketAddr, remote_conn_id: u32) -> Result<()> {
        let existing = self
            .conn_map
            .get(&remote_iface_addr)
            .and_then(|p| p.conns.get(&remote_conn_id).copied())
            .filter(|&other| other != idx);

        let Some(other_idx) = existing else {
            // Ordinary accept: no colliding outbound attempt.
            let slot = self.slots[idx].as_mut().unwrap();
            slot.ep.peer_addr = Some(remote_iface_addr);
            slot.ep.conn_id = remote_conn_id;
            slot.ep.caps.add(Caps { tx: false, rx: true });
            send_cm(&mut slot.ep, CmMessage::ConnAck)?;
            slot.ep.conn_state = ConnState::Connected;
            self.conn_map
                .entry(remote_iface_addr)
                .or_default()
                .conns
                .insert(remote_conn_id, idx);
            return Ok(());
        };

        let other_has_rx = self.slots[other_idx]
            .as_ref()
            .map(|s| s.ep.caps.rx)
            .unwrap_or(false);

        if other_has_rx || self.iface_addr == remote_iface_addr {
            // Either a genuine duplicate, or a loopback/self-connect pair
            // that the spec explicitly says to keep both sides of (spec
            // section 4.4.1: "Equal addresses... both connections are
            // kept; neither is considered a tie-break collision").
            if self.iface_addr == remote_iface_addr && !other_has_rx {
                let slot = self.slots[idx].as_mut().unwrap();
                slot.ep.peer_addr = Some(remote_iface_addr);
                slot.ep.caps.add(Caps { tx: false, rx: true });
                send_cm(&mut slot.ep, CmMessage::ConnAck)?;
                slot.ep.conn_state = ConnState::Connected;
                // Give this duplicate its own conn_id slot; it does not
                // replace `other_idx`.
                let fresh_id = self.alloc_conn_id(remote_iface_addr);
                self.slots[idx].as_mut().unwrap().ep.conn_id = fresh_id;
                self.conn_map
                    .entry(remote_iface_addr)
                    .or_default()
                    .conns
                    .insert(fresh_id, idx);
                return Ok(());
            }
            debug!(target: "uct::tcp", "tcp_iface: duplicate connection from {remote_iface_addr}, dropping");
            self.teardown(idx);
            return Ok(());
        }

        // Simultaneous-connect collision.
        if addr_order(&self.iface_addr, &remote_iface_addr) == std::cmp::Ordering::Less {
            self.splice_onto(other_idx, idx, remote_conn_id)?;
        } else {
            debug!(target: "uct::tcp", "tcp_iface: simultaneous connect, yielding to {remote_iface_addr}");
            self.teardown(idx);
        }
        Ok(())
    }

    /// The smaller-address side of a simultaneous-connect collision:
    /// closes its own outbound socket and takes over the peer's incoming
    /// one instead, preserving the outbound endpoint's logical identity
    /// (spec section 4.4.1, "Simultaneous-connect tie-break").
    fn splice_onto(&mut self, outbound_idx: usize, accepted_idx: usize, _remote_conn_id: u32) -> Result<()> {
        let accepted_slot = self.slots[accepted_idx].take().expect("accepted slot present");
        let _ = self.poll.deregister(accepted_slot.ep.raw_fd());
        let new_fd = accepted_slot.ep.into_fd();
        self.free.push(accepted_idx);

        let outbound = &mut self.slots[outbound_idx].as_mut().unwrap().ep;
        let _ = self.poll.deregister(outbound.raw_fd());
        outbound.replace_fd(new_fd);
        self.poll
            .register(outbound.raw_fd(), outbound.token, Interest::READABLE)
            .map_err(Error::Io)?;
        outbound.caps.add(Caps { tx: true, rx: true });
        outbound.conn_state = ConnState::Connected;
        let conn_id = outbound.conn_id;
        let iface_addr = self.iface_addr;
        send_cm(outbound, CmMessage::ConnAckReq { iface_addr: to_v4(iface_addr), conn_id })?;

        self.dispatch_pending(outbound_idx)?;
        Ok(())
    }

    fn on_connected_event(&mut self, idx: usize, event: Event) -> Result<()> {
        if event.is_writable() {
            let slot = self.slots[idx].as_mut().unwrap();
            let drained = slot.ep.progress_tx()?;
            if drained {
                self.poll.reregister(slot.ep.raw_fd(), slot.ep.token, Interest::READABLE).map_err(Error::Io)?;
                self.dispatch_pending(idx)?;
            }
        }
        if event.is_readable() {
            let frames = self.read_frames(idx)?;
            for (am_id, payload) in frames {
                if am_id == CM_AM_ID {
                    warn!(target: "uct::tcp", "tcp_ep: unexpected CM frame on a connected endpoint");
                    continue;
                }
                if let Some(handler) = self.handlers.get_mut(&am_id) {
                    handler(&payload);
                } else {
                    warn!(target: "uct::tcp", "tcp_ep: no handler registered for am_id {am_id}");
                }
            }
        }
        Ok(())
    }

    /// Reads and parses every complete frame currently available on
    /// `idx`'s socket, returning owned copies so callers can dispatch
    /// without holding a borrow of `self.slots` (spec section 4.4.3).
    fn read_frames(&mut self, idx: usize) -> Result<Vec<(u8, Vec<u8>)>> {
        let buffer_size = self.config.buffer_size;
        let slot = self.slots[idx].as_mut().unwrap();
        let mut frames = Vec::new();
        slot.ep.progress_rx(buffer_size, |hdr, payload| {
            frames.push((hdr.am_id, payload.to_vec()));
        })?;
        Ok(frames)
    }

    /// Drains the TX buffer after staging a send; if it fully empties,
    /// immediately dispatches the pending queue (spec section 4.4.4).
    fn drain_tx(&mut self, idx: usize) -> Result<()> {
        let slot = self.slots[idx].as_mut().unwrap();
        let drained = slot.ep.progress_tx()?;
        if drained {
            self.dispatch_pending(idx)?;
        } else {
            self.poll.reregister(slot.ep.raw_fd(), slot.ep.token, Interest::READABLE | Interest::WRITABLE).map_err(Error::Io)?;
        }
        Ok(())
    }

    /// Dispatches `ep.pending_queue` in FIFO order until it empties or a
    /// send can't be staged (spec section 4.4.4).
    fn dispatch_pending(&mut self, idx: usize) -> Result<()> {
        loop {
            let slot = self.slots[idx].as_mut().unwrap();
            if !slot.ep.can_send() {
                break;
            }
            let Some(pending) = slot.ep.pending_queue.pop_front() else {
                break;
            };
            slot.ep.stage_raw_send(pending.frame);
            let drained = slot.ep.progress_tx()?;
            if !drained {
                let raw = slot.ep.raw_fd();
                let token = slot.ep.token;
                self.poll.reregister(raw, token, Interest::READABLE | Interest::WRITABLE).map_err(Error::Io)?;
                break;
            }
        }
        Ok(())
    }

    fn fail_endpoint(&mut self, idx: usize, e: &Error) {
        let reason = FailReason::from(e);
        if let Some(slot) = self.slots[idx].as_mut() {
            warn!(target: "uct::tcp", "tcp_ep {idx}: failed permanently: {e}");
            slot.ep.failed = Some(reason);
            slot.ep.pending_queue.clear();
            slot.ep.conn_state = ConnState::Closed;
        }
        self.teardown(idx);
    }
}

fn to_v4(addr: SocketAddr) -> std::net::SocketAddrV4 {
    match addr {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => panic!("TcpIface only supports IPv4 (spec section 6 wire format: sockaddr_in)"),
    }
}

fn send_initial_frame(ep: &mut TcpEndpoint, iface_addr: SocketAddr, conn_id: u32) -> Result<()> {
    let msg = CmMessage::ConnReq {
        iface_addr: to_v4(iface_addr),
        conn_id,
    };
    ep.stage_initial_send(CM_MAGIC, CM_AM_ID, &msg.encode());
    ep.progress_tx()?;
    Ok(())
}

fn send_cm(ep: &mut TcpEndpoint, msg: CmMessage) -> Result<()> {
    ep.stage_send(CM_AM_ID, &msg.encode());
    ep.progress_tx()?;
    Ok(())
}

fn create_listener(addr: SocketAddr) -> Result<OwnedFd> {
    let fd = create_nonblocking_raw(addr)?;
    set_reuseaddr(fd)?;
    bind_raw(fd, addr)?;
    listen_raw(fd)?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn create_nonblocking_socket(peer_addr: SocketAddr) -> Result<OwnedFd> {
    let fd = create_nonblocking_raw(peer_addr)?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn create_nonblocking_raw(addr: SocketAddr) -> Result<RawFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = syscall_check(unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) }).map_err(Error::Io)?;
    set_nonblocking(fd)?;
    Ok(fd)
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = syscall_check(unsafe { libc::fcntl(fd, libc::F_GETFL, 0) }).map_err(Error::Io)?;
    syscall_check(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) }).map_err(Error::Io)?;
    Ok(())
}

fn set_reuseaddr(fd: RawFd) -> Result<()> {
    let one: libc::c_int = 1;
    syscall_check(unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })
    .map_err(Error::Io)?;
    Ok(())
}

fn bind_raw(fd: RawFd, addr: SocketAddr) -> Result<()> {
    let (storage, len) = sockaddr_of(addr);
    syscall_check(unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) })
        .map_err(Error::Io)?;
    Ok(())
}

fn listen_raw(fd: RawFd) -> Result<()> {
    syscall_check(unsafe { libc::listen(fd, 1024) }).map_err(Error::Io)?;
    Ok(())
}

/// Issues a nonblocking `connect`. Returns `Ok(true)` if it completed
/// synchronously (rare, e.g. loopback), `Ok(false)` if it's in progress.
fn connect_nonblocking(fd: RawFd, addr: SocketAddr) -> Result<bool> {
    let (storage, len) = sockaddr_of(addr);
    let ret = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if ret == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        Ok(false)
    } else {
        Err(Error::Io(err))
    }
}

/// Reads `SO_ERROR`: `Ok(None)` means the socket connected successfully.
fn socket_error(fd: RawFd) -> Result<Option<std::io::Error>> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    syscall_check(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    })
    .map_err(Error::Io)?;
    if err == 0 {
        Ok(None)
    } else {
        Ok(Some(std::io::Error::from_raw_os_error(err)))
    }
}

fn accept_nonblocking(fd: RawFd) -> Result<Option<(OwnedFd, SocketAddr)>> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe { libc::accept(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        return if err.kind() == std::io::ErrorKind::WouldBlock {
            Ok(None)
        } else {
            Err(Error::Io(err))
        };
    }
    set_nonblocking(ret)?;
    let addr = sockaddr_to_std(&storage)?;
    Ok(Some((unsafe { OwnedFd::from_raw_fd(ret) }, addr)))
}

fn local_addr(fd: RawFd) -> Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall_check(unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) })
        .map_err(Error::Io)?;
    sockaddr_to_std(&storage)
}

fn sockaddr_of(addr: SocketAddr) -> (libc::sockaddr_in, libc::socklen_t) {
    match addr {
        SocketAddr::V4(v4) => {
            let mut storage: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            storage.sin_family = libc::AF_INET as libc::sa_family_t;
            storage.sin_port = v4.port().to_be();
            storage.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(_) => panic!("TcpIface only supports IPv4"),
    }
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> Result<SocketAddr> {
    if storage.ss_family as i32 != libc::AF_INET {
        return Err(Error::InvalidParam);
    }
    let addr_in: libc::sockaddr_in = unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
    let ip = std::net::Ipv4Addr::from(addr_in.sin_addr.s_addr.to_ne_bytes());
    let port = u16::from_be(addr_in.sin_port);
    Ok(SocketAddr::V4(std::net::SocketAddrV4::new(ip, port)))
}

fn syscall_check(ret: libc::c_int) -> std::io::Result<libc::c_int> {
    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}
