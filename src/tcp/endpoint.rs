//! A single TCP connection: connection state machine, TX/RX framing
//! buffers and the pending-send queue (spec section 3, `TcpEndpoint`;
//! section 4.4).
//!
//! Grounded on `original_source/src/uct/tcp/tcp_ep.c`: `ep->tx`/`ep->rx`
//! (`uct_tcp_ep_ctx_t`, an `{buf, length, offset}` triple) become
//! [`FrameBuf`]; `ep->pending_q` becomes `pending_queue`; `uct_tcp_ep_send`/
//! `uct_tcp_ep_progress_rx`/`uct_tcp_ep_do_next_rx`/`uct_tcp_ep_do_partial_rx`
//! become [`TcpEndpoint::progress_tx`]/[`TcpEndpoint::progress_rx`].

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use log::trace;

use crate::error::Error;
use crate::reactor::Token;
use crate::tcp::wire::{encode_frame, parse_frame_header, FrameHeader, FRAME_HEADER_LEN, MAGIC_LEN};

/// Connection state machine (spec section 4.4.1). Transitions enforced by
/// the call sites in `tcp::iface`, not by this type itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Closed,
    Connecting,
    WaitingAck,
    RecvMagic,
    Accepting,
    Connected,
}

/// Which directions this endpoint currently carries (spec section 3:
/// `caps ⊆ {TX, RX}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Caps {
    pub tx: bool,
    pub rx: bool,
}

impl Caps {
    pub fn none() -> Caps {
        Caps::default()
    }

    pub fn add(&mut self, other: Caps) {
        self.tx |= other.tx;
        self.rx |= other.rx;
    }
}

/// A growable byte buffer consumed from the front, compacted only once
/// fully drained (spec section 4.4.3: "a second receive is scheduled that
/// appends to the tail, avoiding a memmove in the common full-consumption
/// case").
#[derive(Debug, Default)]
pub struct FrameBuf {
    data: Vec<u8>,
    offset: usize,
}

impl FrameBuf {
    pub fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    pub fn unparsed(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    pub fn consume(&mut self, n: usize) {
        self.offset += n;
        if self.offset >= self.data.len() {
            self.data.clear();
            self.offset = 0;
        }
    }

    /// Reserves space at the tail and returns it for a `read(2)` call to
    /// fill, growing the buffer by `want` bytes.
    fn reserve_tail(&mut self, want: usize) -> std::ops::Range<usize> {
        let start = self.data.len();
        self.data.resize(start + want, 0);
        start..start + want
    }

    fn truncate_tail(&mut self, filled_len: usize) {
        self.data.truncate(filled_len);
    }
}

/// A pending active-message send, queued while the TX buffer is occupied
/// (spec section 4.4.4); dispatched in FIFO order once it drains.
pub struct PendingSend {
    pub frame: Vec<u8>,
}

/// A terminal endpoint failure, recorded instead of an [`Error`] so the
/// field stays `Copy` (`Error::Io` wraps a non-`Clone` `std::io::Error`).
#[derive(Debug, Clone, Copy)]
pub enum FailReason {
    Unreachable,
    TimedOut,
    Io(std::io::ErrorKind),
}

impl FailReason {
    pub fn to_error(self) -> Error {
        match self {
            FailReason::Unreachable => Error::Unreachable,
            FailReason::TimedOut => Error::TimedOut,
            FailReason::Io(kind) => Error::Io(std::io::Error::from(kind)),
        }
    }
}

impl From<&Error> for FailReason {
    fn from(e: &Error) -> FailReason {
        match e {
            Error::Unreachable => FailReason::Unreachable,
            Error::TimedOut => FailReason::TimedOut,
            Error::Io(io) => FailReason::Io(io.kind()),
            _ => FailReason::Io(std::io::ErrorKind::Other),
        }
    }
}

/// One TCP connection (spec section 3, `TcpEndpoint`).
pub struct TcpEndpoint {
    fd: OwnedFd,
    pub token: Token,
    pub peer_addr: Option<SocketAddr>,
    pub conn_id: u32,
    pub conn_state: ConnState,
    pub caps: Caps,
    tx: FrameBuf,
    rx: FrameBuf,
    pub pending_queue: VecDeque<PendingSend>,
    pub retry_count: u32,
    pub failed: Option<FailReason>,
    /// True once the 8-byte magic prefix has been consumed (acceptor side
    /// only; meaningless once `conn_state` leaves `RecvMagic`).
    magic_consumed: bool,
}

impl TcpEndpoint {
    pub fn new(fd: OwnedFd, token: Token, peer_addr: Option<SocketAddr>, conn_id: u32, conn_state: ConnState) -> Self {
        TcpEndpoint {
            fd,
            token,
            peer_addr,
            conn_id,
            conn_state,
            caps: Caps::none(),
            tx: FrameBuf::default(),
            rx: FrameBuf::default(),
            pending_queue: VecDeque::new(),
            retry_count: 0,
            failed: None,
            magic_consumed: false,
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }

    /// Discards any partially-sent/received handshake bytes before a
    /// bounded retry re-issues `connect` on the same fd (spec section
    /// 4.4.5): the retried attempt restarts the handshake from scratch.
    pub fn reset_for_retry(&mut self) {
        self.tx = FrameBuf::default();
        self.rx = FrameBuf::default();
        self.magic_consumed = false;
    }

    /// Swaps in a different underlying socket, used only by the
    /// simultaneous-connect tie-break splice (spec section 4.4.1): the
    /// winning side keeps its logical endpoint identity (peer address,
    /// conn_id, pending queue) but now drives the accepted socket instead
    /// of its own outbound one. The donor socket is dropped by the caller
    /// before calling this, so there is never a moment with two live fds.
    pub fn replace_fd(&mut self, new_fd: OwnedFd) {
        self.fd = new_fd;
        self.tx = FrameBuf::default();
        self.rx = FrameBuf::default();
    }

    /// True iff a new frame can be queued for immediate send (spec
    /// section 4.4.4, `can_send`).
    pub fn can_send(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn has_outstanding(&self) -> bool {
        !self.tx.is_empty() || !self.pending_queue.is_empty()
    }

    /// Queues `am_id`/`payload` as the occupant of the TX buffer. Caller
    /// must have checked `can_send()` first; this never itself consults
    /// the pending queue (see `tcp::iface::dispatch_pending`).
    pub fn stage_send(&mut self, am_id: u8, payload: &[u8]) {
        debug_assert!(self.tx.is_empty());
        self.tx.data.clear();
        self.tx.offset = 0;
        encode_frame(am_id, payload, &mut self.tx.data);
    }

    /// Queues an already-encoded frame verbatim, used to replay a
    /// [`PendingSend`] (its `frame` was encoded once at `pending_add`
    /// time and must not be re-framed).
    pub fn stage_raw_send(&mut self, frame: Vec<u8>) {
        debug_assert!(self.tx.is_empty());
        self.tx.data = frame;
        self.tx.offset = 0;
    }

    /// Queues the one-time magic prefix immediately followed by a frame
    /// (spec section 4.4.1: the initiator sends its magic number once,
    /// before its first `CONN_REQ`).
    pub fn stage_initial_send(&mut self, magic: u64, am_id: u8, payload: &[u8]) {
        debug_assert!(self.tx.is_empty());
        self.tx.data.clear();
        self.tx.offset = 0;
        self.tx.data.extend_from_slice(&magic.to_le_bytes());
        encode_frame(am_id, payload, &mut self.tx.data);
    }

    /// Drains as much of the TX buffer as a nonblocking `write` allows.
    /// Returns `true` iff the buffer fully drained this call.
    pub fn progress_tx(&mut self) -> Result<bool, Error> {
        while !self.tx.is_empty() {
            let buf = self.tx.unparsed();
            match write_nonblocking(self.fd.as_raw_fd(), buf) {
                Ok(0) => break,
                Ok(n) => {
                    trace!(target: "uct::tcp", "tcp_ep fd={}: sent {} bytes", self.raw_fd(), n);
                    self.tx.consume(n);
                }
                Err(e) if would_block(&e) => break,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(self.tx.is_empty())
    }

    /// Consumes exactly the 8-byte magic prefix from the socket (acceptor
    /// side, `RecvMagic` state). Returns `Some(true)` once the magic is
    /// fully read and valid, `Some(false)` if it was read and invalid,
    /// `None` if more bytes are still needed.
    pub fn try_consume_magic(&mut self, expected: u64) -> Result<Option<bool>, Error> {
        debug_assert!(!self.magic_consumed);
        let have = self.rx.unparsed().len();
        if have < MAGIC_LEN {
            let want = MAGIC_LEN - have;
            let range = self.rx.reserve_tail(want);
            match read_nonblocking(self.fd.as_raw_fd(), &mut self.rx.data[range.clone()]) {
                Ok(0) => {
                    self.rx.truncate_tail(range.start);
                    return Err(Error::Unreachable);
                }
                Ok(n) => {
                    self.rx.truncate_tail(range.start + n);
                }
                Err(e) if would_block(&e) => {
                    self.rx.truncate_tail(range.start);
                    return Ok(None);
                }
                Err(e) => {
                    self.rx.truncate_tail(range.start);
                    return Err(Error::Io(e));
                }
            }
        }

        if self.rx.unparsed().len() < MAGIC_LEN {
            return Ok(None);
        }

        let bytes: [u8; 8] = self.rx.unparsed()[..MAGIC_LEN].try_into().unwrap();
        let got = u64::from_le_bytes(bytes);
        self.rx.consume(MAGIC_LEN);
        self.magic_consumed = true;
        Ok(Some(got == expected))
    }

    /// Reads as much as is available and parses every complete frame,
    /// invoking `on_frame` for each (spec section 4.4.3). Returns the
    /// number of frames dispatched.
    pub fn progress_rx(&mut self, max_frame_len: usize, mut on_frame: impl FnMut(FrameHeader, &[u8])) -> Result<usize, Error> {
        let range = self.rx.reserve_tail(max_frame_len);
        let n = match read_nonblocking(self.fd.as_raw_fd(), &mut self.rx.data[range.clone()]) {
            Ok(0) => {
                self.rx.truncate_tail(range.start);
                return Err(Error::Unreachable);
            }
            Ok(n) => n,
            Err(e) if would_block(&e) => {
                self.rx.truncate_tail(range.start);
                return Ok(0);
            }
            Err(e) => {
                self.rx.truncate_tail(range.start);
                return Err(Error::Io(e));
            }
        };
        self.rx.truncate_tail(range.start + n);
        trace!(target: "uct::tcp", "tcp_ep fd={}: recvd {} bytes", self.raw_fd(), n);

        let mut dispatched = 0;
        loop {
            let buf = self.rx.unparsed();
            let Some(hdr) = parse_frame_header(buf) else {
                break;
            };
            let total = FRAME_HEADER_LEN + hdr.length as usize;
            if buf.len() < total {
                break;
            }
            let payload = &buf[FRAME_HEADER_LEN..total];
            on_frame(hdr, payload);
            dispatched += 1;
            let consumed = total;
            self.rx.consume(consumed);
        }
        Ok(dispatched)
    }
}

fn would_block(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
}

fn write_nonblocking(fd: RawFd, buf: &[u8]) -> std::io::Result<usize> {
    let ret = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

fn read_nonblocking(fd: RawFd, buf: &mut [u8]) -> std::io::Result<usize> {
    let ret = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_buf_compacts_only_when_drained() {
        let mut buf = FrameBuf::default();
        let r = buf.reserve_tail(4);
        buf.data[r].copy_from_slice(&[1, 2, 3, 4]);
        buf.consume(2);
        assert_eq!(buf.unparsed(), &[3, 4]);
        assert_eq!(buf.data.len(), 4, "not compacted while partially consumed");
        buf.consume(2);
        assert!(buf.is_empty());
        assert_eq!(buf.data.len(), 0, "compacted once fully drained");
    }
}
