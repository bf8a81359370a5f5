//! Pluggable copy back-ends invoked by the engine's progress path.
//!
//! Spec section 4.3 names two reference primitives; section 9's "dynamic
//! dispatch -> explicit dispatch table" REDESIGN FLAG is honored here as a
//! plain trait with monomorphized call sites (`ScopyInterface<P>`) rather
//! than a function-pointer table, since the primitive is fixed for the
//! lifetime of an interface.

use crate::error::{Error, Result};
use crate::iov::{IoVector, IovIter};
use crate::scopy::tx::Op;

/// One remote-side IOV element: a byte range in the peer's address space,
/// named by an opaque (transport-specific) key.
#[derive(Debug, Clone, Copy)]
pub struct RemoteIov {
    pub remote_addr: u64,
    pub remote_key: u64,
    pub length: usize,
}

/// A pluggable copy back-end (spec section 4.3, "Copy primitives").
///
/// `copy` is given the full local IOV plus a cursor into it, and must move
/// up to `remote.length` bytes between the local IOV (starting at the
/// cursor) and the single remote range described by `remote`, advancing
/// the cursor by however much it actually moved. It returns the byte count
/// actually moved; this may be less than `remote.length` (a partial
/// completion), in which case the engine re-invokes the primitive on a
/// later progress tick rather than looping internally (spec section 4.3:
/// "the engine advances `iov_iter` by that count and loops in the next
/// progress tick, not within one invocation").
pub trait CopyPrimitive {
    fn copy(
        &mut self,
        op: Op,
        iov: &IoVector,
        iter: &mut IovIter,
        remote: RemoteIov,
        peer: &PeerHandle,
    ) -> Result<usize>;
}

/// Transport-supplied identity of the remote endpoint a copy primitive
/// talks to. `ProcessVmPrimitive` interprets this as a PID;
/// `IoctlPrimitive` interprets it as a cookie naming a registered remote
/// region with the character device.
#[derive(Debug, Clone, Copy)]
pub enum PeerHandle {
    Pid(i32),
    Cookie(u64),
}

/// Process-to-process memory-copy primitive, grounded on
/// `original_source/src/uct/sm/cma/cma_ep.c` (the CMA transport: Linux
/// `process_vm_readv(2)`/`process_vm_writev(2)`, one syscall per
/// invocation, atomically copying up to the requested range between a
/// remote process's address space and a local IOV).
///
/// Neither `libc` nor older `nix` releases expose a safe wrapper for these
/// two syscalls on every supported target, so this primitive issues them
/// directly via `libc::syscall`.
#[cfg(all(target_os = "linux", feature = "tcp"))]
pub struct ProcessVmPrimitive;

#[cfg(all(target_os = "linux", feature = "tcp"))]
impl CopyPrimitive for ProcessVmPrimitive {
    fn copy(
        &mut self,
        op: Op,
        iov: &IoVector,
        iter: &mut IovIter,
        remote: RemoteIov,
        peer: &PeerHandle,
    ) -> Result<usize> {
        let PeerHandle::Pid(pid) = peer else {
            return Err(Error::InvalidParam);
        };

        // Build the local iovec array starting at the cursor, clipped to
        // `remote.length` total bytes, the way `uct_scopy_iface_get_total_iov_count`
        // plus `uct_iov_to_iovec` do in the original.
        let mut local_iovecs: Vec<libc::iovec> = Vec::new();
        let mut remaining = remote.length;
        let mut index = iter.iov_index;
        let mut offset = iter.byte_offset_in_element;

        for elem in iov.as_slice().iter().skip(index) {
            if remaining == 0 {
                break;
            }
            if elem.length == 0 {
                index += 1;
                offset = 0;
                continue;
            }
            let avail = elem.length - offset;
            let take = avail.min(remaining);
            if take > 0 {
                local_iovecs.push(libc::iovec {
                    iov_base: unsafe { elem.buffer.add(offset) } as *mut libc::c_void,
                    iov_len: take,
                });
            }
            remaining -= take;
            index += 1;
            offset = 0;
        }

        if local_iovecs.is_empty() {
            return Ok(0);
        }

        let mut remote_iovec = [libc::iovec {
            iov_base: remote.remote_addr as *mut libc::c_void,
            iov_len: remote.length,
        }];

        let syscall_num = match op {
            Op::Get => libc::SYS_process_vm_readv,
            Op::Put => libc::SYS_process_vm_writev,
        };

        let ret = unsafe {
            libc::syscall(
                syscall_num,
                *pid as libc::pid_t,
                local_iovecs.as_ptr(),
                local_iovecs.len() as libc::c_ulong,
                remote_iovec.as_mut_ptr(),
                1u64,
                0u64,
            )
        };

        if ret < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        let moved = ret as usize;
        advance_iter(iov, iter, moved);
        Ok(moved)
    }
}

/// Advances `iter` by `bytes`, skipping zero-length elements, mirroring
/// the bookkeeping `iov_converter` does in `crate::iov::fill` but without
/// copying any data (the syscall already moved it).
fn advance_iter(iov: &IoVector, iter: &mut IovIter, mut bytes: usize) {
    let elements = iov.as_slice();
    while bytes > 0 && iter.iov_index < elements.len() {
        let elem = elements[iter.iov_index];
        if elem.length == 0 {
            iter.iov_index += 1;
            iter.byte_offset_in_element = 0;
            continue;
        }
        let remaining_in_elem = elem.length - iter.byte_offset_in_element;
        let take = remaining_in_elem.min(bytes);
        iter.byte_offset_in_element += take;
        bytes -= take;
        if iter.byte_offset_in_element == elem.length {
            iter.iov_index += 1;
            iter.byte_offset_in_element = 0;
        }
    }
}

/// Request/response layout for [`IoctlPrimitive`]'s character-device
/// interaction. Crate-local, not bound to any real out-of-tree kernel
/// module's ABI (see `SPEC_FULL.md` section 4.3) so it is testable
/// against a mock device.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ScopyIoctlRequest {
    pub op_is_put: u8,
    pub cookie: u64,
    pub remote_offset: u64,
    pub local_addr: u64,
    pub length: u64,
}

/// Result written back by the mock/real character device.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ScopyIoctlResponse {
    pub status_ok: u8,
    pub moved: u64,
}

/// Anything that can service a [`ScopyIoctlRequest`]: the real ioctl call
/// against an open device fd, or (in tests) an in-memory mock.
pub trait IoctlDevice {
    fn submit(&mut self, req: ScopyIoctlRequest) -> Result<ScopyIoctlResponse>;
}

/// Character-device ioctl-based primitive, grounded on
/// `original_source/src/uct/sm/scopy/knem/knem_ep.c` (the KNEM transport):
/// one ioctl per invocation, no partial completion expected (spec section
/// 4.3).
pub struct IoctlPrimitive<D: IoctlDevice> {
    device: D,
}

impl<D: IoctlDevice> IoctlPrimitive<D> {
    pub fn new(device: D) -> Self {
        IoctlPrimitive { device }
    }
}

impl<D: IoctlDevice> CopyPrimitive for IoctlPrimitive<D> {
    fn copy(
        &mut self,
        op: Op,
        iov: &IoVector,
        iter: &mut IovIter,
        remote: RemoteIov,
        peer: &PeerHandle,
    ) -> Result<usize> {
        let PeerHandle::Cookie(cookie) = peer else {
            return Err(Error::InvalidParam);
        };

        // KNEM-style transfers address a single contiguous local buffer
        // per ioctl; if the caller's IOV element at the cursor doesn't
        // cover the whole segment the engine will simply re-invoke with a
        // smaller `seg_size` next time (segmentation is the engine's job,
        // not this primitive's).
        let elements = iov.as_slice();
        let Some(elem) = elements.get(iter.iov_index) else {
            return Ok(0);
        };
        let local_addr = unsafe { elem.buffer.add(iter.byte_offset_in_element) } as u64;

        let req = ScopyIoctlRequest {
            op_is_put: matches!(op, Op::Put) as u8,
            cookie: *cookie,
            remote_offset: remote.remote_addr,
            local_addr,
            length: remote.length as u64,
        };

        let resp = self.device.submit(req)?;
        if resp.status_ok == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "ioctl reported failure",
            )));
        }

        let moved = resp.moved as usize;
        advance_iter(iov, iter, moved);
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockDevice {
        fail: bool,
    }

    impl IoctlDevice for MockDevice {
        fn submit(&mut self, req: ScopyIoctlRequest) -> Result<ScopyIoctlResponse> {
            if self.fail {
                return Ok(ScopyIoctlResponse {
                    status_ok: 0,
                    moved: 0,
                });
            }
            Ok(ScopyIoctlResponse {
                status_ok: 1,
                moved: req.length,
            })
        }
    }

    #[test]
    fn ioctl_primitive_moves_full_segment() {
        let mut buf = vec![0u8; 16];
        let mut iov = IoVector::new();
        iov.push(buf.as_mut_ptr(), buf.len());

        let mut primitive = IoctlPrimitive::new(MockDevice { fail: false });
        let mut iter = IovIter::new();
        let moved = primitive
            .copy(
                Op::Put,
                &iov,
                &mut iter,
                RemoteIov {
                    remote_addr: 0,
                    remote_key: 0,
                    length: 16,
                },
                &PeerHandle::Cookie(7),
            )
            .unwrap();
        assert_eq!(moved, 16);
        assert!(iter.is_done(&iov));
    }

    #[test]
    fn ioctl_primitive_surfaces_device_failure() {
        let mut buf = vec![0u8; 16];
        let mut iov = IoVector::new();
        iov.push(buf.as_mut_ptr(), buf.len());

        let mut primitive = IoctlPrimitive::new(MockDevice { fail: true });
        let mut iter = IovIter::new();
        let result = primitive.copy(
            Op::Get,
            &iov,
            &mut iter,
            RemoteIov {
                remote_addr: 0,
                remote_key: 0,
                length: 16,
            },
            &PeerHandle::Cookie(7),
        );
        assert!(result.is_err());
    }
}
