//! A small, Linux-epoll-only reactor: `Poll`, `Interest` and `Events`.
//!
//! Grounded on the teacher crate's `Poll`/`Registry`/`Interest`/`Events`
//! layer (`src/poll.rs`, `src/interests.rs`, `src/sys/unix/selector/epoll.rs`,
//! `src/event/events.rs`). The teacher supports epoll, kqueue and IOCP
//! behind one portable API; this crate's TCP transport is deliberately
//! narrowed to the single-threaded, Linux-epoll-only case the spec
//! describes (spec section 5), so there is no `Registry`/selector split,
//! no waker, and no cross-platform `sys` module tree -- just the one
//! epoll-backed reactor the TCP core actually drives.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Interest bitset for a registration (mirrors the teacher's `Interest`,
/// trimmed to the two readinesses this engine's TCP core ever asks for).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    readable: bool,
    writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };

    pub const fn add(self, other: Interest) -> Interest {
        Interest {
            readable: self.readable || other.readable,
            writable: self.writable || other.writable,
        }
    }

    pub fn is_readable(self) -> bool {
        self.readable
    }

    pub fn is_writable(self) -> bool {
        self.writable
    }

    fn to_epoll_bits(self) -> u32 {
        let mut bits = libc::EPOLLRDHUP;
        if self.readable {
            bits |= libc::EPOLLIN;
        }
        if self.writable {
            bits |= libc::EPOLLOUT;
        }
        bits as u32
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;
    fn bitor(self, rhs: Interest) -> Interest {
        self.add(rhs)
    }
}

/// An opaque identifier handed back on every event, chosen by the caller
/// at registration time (mirrors the teacher's `Token`, minus the
/// `usize`-newtype ceremony it needs for its public API stability).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub usize);

/// One readiness notification.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    token: Token,
    flags: u32,
}

impl Event {
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_readable(&self) -> bool {
        self.flags & (libc::EPOLLIN | libc::EPOLLPRI) as u32 != 0
    }

    pub fn is_writable(&self) -> bool {
        self.flags & libc::EPOLLOUT as u32 != 0
    }

    pub fn is_error(&self) -> bool {
        self.flags & libc::EPOLLERR as u32 != 0
    }

    pub fn is_read_closed(&self) -> bool {
        self.flags & libc::EPOLLHUP as u32 != 0
            || (self.flags & libc::EPOLLIN as u32 != 0
                && self.flags & libc::EPOLLRDHUP as u32 != 0)
    }
}

/// A reusable, growable buffer of events filled in by [`Poll::poll`].
#[derive(Debug)]
pub struct Events {
    inner: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.inner.iter().map(|ev| Event {
            token: Token(ev.u64 as usize),
            flags: ev.events,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

/// A single-threaded epoll reactor (spec section 5: "a single-threaded,
/// nonblocking, event-driven endpoint implementation").
#[derive(Debug)]
pub struct Poll {
    epoll_fd: OwnedFd,
}

impl Poll {
    pub fn new() -> io::Result<Poll> {
        // SAFETY: `epoll_create1` either returns a valid owned fd or -1.
        let raw = syscall_check(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        let epoll_fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Poll { epoll_fd })
    }

    pub fn register(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests.to_epoll_bits(),
            u64: token.0 as u64,
        };
        syscall_check(unsafe {
            libc::epoll_ctl(self.epoll_fd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)
        })?;
        Ok(())
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests.to_epoll_bits(),
            u64: token.0 as u64,
        };
        syscall_check(unsafe {
            libc::epoll_ctl(self.epoll_fd.as_raw_fd(), libc::EPOLL_CTL_MOD, fd, &mut event)
        })?;
        Ok(())
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        syscall_check(unsafe {
            libc::epoll_ctl(
                self.epoll_fd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        })?;
        Ok(())
    }

    /// Blocks (up to `timeout`, or forever if `None`) for at least one
    /// readiness event, or returns immediately with `Duration::ZERO`.
    pub fn poll(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout_ms = timeout
            .map(|to| {
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        events.inner.clear();
        let n = syscall_check(unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                events.inner.as_mut_ptr(),
                events.inner.capacity() as i32,
                timeout_ms,
            )
        })?;
        // SAFETY: `epoll_wait` just initialized the first `n` slots.
        unsafe { events.inner.set_len(n as usize) };
        Ok(())
    }
}

impl AsRawFd for Poll {
    fn as_raw_fd(&self) -> RawFd {
        self.epoll_fd.as_raw_fd()
    }
}

fn syscall_check(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd as _;

    #[test]
    fn register_and_observe_writable_pipe() {
        let poll = Poll::new().unwrap();
        let (r, w) = pipe();
        poll.register(r.as_raw_fd(), Token(1), Interest::READABLE)
            .unwrap();

        let mut events = Events::with_capacity(8);
        // Nothing written yet.
        poll.poll(&mut events, Some(Duration::from_millis(10)))
            .unwrap();
        assert!(events.is_empty());

        unsafe {
            let byte = [0u8; 1];
            libc::write(w.as_raw_fd(), byte.as_ptr() as *const _, 1);
        }

        poll.poll(&mut events, Some(Duration::from_secs(1)))
            .unwrap();
        let got: Vec<_> = events.iter().collect();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].token(), Token(1));
        assert!(got[0].is_readable());
    }

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(ret, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }
}
