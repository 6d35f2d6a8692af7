//! The client half of the farm.
//!
//! A `FarmRef` is a cloneable handle that issues one syscall-shaped request
//! at a time against a descriptor: take the fd's mutex word, encode the
//! request into the fd's call frame (staging variable-length operands in the
//! arena), ring the doorbell, block until the Park rings back, decode the
//! result, release the mutex. Errors come back as plain wire errnos.
//!
//! Staged input payloads are freed by the dispatching side; the stubs only
//! free them themselves when the call never reached the Park.

use crate::alloc::Lease;
use crate::error::Errno;
use crate::park::{FarmShared, CTRL_REGISTER_FDS};
use crate::types::{Fdstat, FdFlags, Filestat, FstFlags, Iovec, LookupFlags, OFlags, Prestat, Rights, Whence};
use crate::wait::WaitResult;
use crate::wire::{
    Frame, Payload, Request, CALL_IDLE, CALL_PENDING, MUTEX_FREE, MUTEX_HELD, MUTEX_HELD_DOUBLE,
};
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;
use tracing::{error, trace, warn};

/// The identity a Ref registers with the Park; close notifications are
/// addressed to it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RefId(u32);

impl RefId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

#[derive(Clone)]
pub struct FarmRef {
    shared: Arc<FarmShared>,
}

/// Holds one or two fd mutex words; released on drop.
struct FdGuard<'a> {
    shared: &'a FarmShared,
    first: u32,
    second: Option<u32>,
}

impl Drop for FdGuard<'_> {
    fn drop(&mut self) {
        release(self.shared, self.first);
        if let Some(second) = self.second {
            release(self.shared, second);
        }
    }
}

fn release(shared: &FarmShared, fd: u32) {
    let word = shared.mutex_word(fd as usize);
    word.store(MUTEX_FREE, SeqCst);
    shared.waits.wake(word, 1);
}

impl FarmRef {
    pub(crate) fn new(shared: Arc<FarmShared>) -> FarmRef {
        FarmRef { shared }
    }

    /// Number of descriptor slots currently addressable.
    pub fn fds_len(&self) -> u32 {
        self.shared.fds_len.load(SeqCst)
    }

    /// Report the fds this Ref holds, so the Park can route their close
    /// notifications here. Returns the identity to poll with.
    pub fn register(&self, fds: &[u32]) -> Result<RefId, Errno> {
        let shared = &self.shared;
        let id = shared.next_ref_id.fetch_add(1, SeqCst);
        let mut bytes = Vec::with_capacity(fds.len() * 4);
        for fd in fds {
            bytes.extend_from_slice(&fd.to_le_bytes());
        }
        shared.ctrl.lock(&shared.waits);
        let staged = match shared.arena.block_write(&shared.waits, &bytes) {
            Ok(lease) => lease,
            Err(e) => {
                shared.ctrl.unlock(&shared.waits);
                return Err(Errno::from(&e));
            }
        };
        let payload = staged.payload();
        shared.ctrl.set_arg(0, CTRL_REGISTER_FDS);
        shared.ctrl.set_arg(1, payload.ptr);
        shared.ctrl.set_arg(2, payload.len);
        shared.ctrl.set_arg(3, id);
        shared.ctrl.ring_and_wait(&shared.waits);
        // The control service copied and freed the payload.
        staged.release();
        shared.ctrl.unlock(&shared.waits);
        Ok(RefId(id))
    }

    /// Drain the close notifications addressed to `id`.
    pub fn take_closed_fds(&self, id: RefId) -> Vec<u32> {
        self.shared.closes.poll(&self.shared.waits, id.0)
    }

    fn frame(&self, fd: u32) -> Frame<'_> {
        self.shared.frame(fd as usize)
    }

    fn stage(&self, data: &[u8]) -> Result<Lease<'_>, Errno> {
        self.shared
            .arena
            .block_write(&self.shared.waits, data)
            .map_err(|e| Errno::from(&e))
    }

    fn acquire(&self, fd: u32, state: u32) {
        let shared = &self.shared;
        let word = shared.mutex_word(fd as usize);
        loop {
            if word
                .compare_exchange(MUTEX_FREE, state, SeqCst, SeqCst)
                .is_ok()
            {
                return;
            }
            let observed = word.load(SeqCst);
            if observed != MUTEX_FREE {
                if let WaitResult::TimedOut =
                    shared
                        .waits
                        .wait(word, observed, Some(shared.wait_timeout))
                {
                    error!(fd, "timed out waiting for the fd mutex; retrying");
                }
            }
        }
    }

    fn lock_fd(&self, fd: u32) -> Result<FdGuard<'_>, Errno> {
        if fd >= self.fds_len() {
            return Err(Errno::Badf);
        }
        self.acquire(fd, MUTEX_HELD);
        Ok(FdGuard {
            shared: &self.shared,
            first: fd,
            second: None,
        })
    }

    /// Acquire two fd mutexes in ascending index order. The total order is
    /// what rules out the symmetric two-resource deadlock.
    fn lock_double_fd(&self, a: u32, b: u32) -> Result<FdGuard<'_>, Errno> {
        let len = self.fds_len();
        if a >= len || b >= len {
            return Err(Errno::Badf);
        }
        if a == b {
            self.acquire(a, MUTEX_HELD_DOUBLE);
            return Ok(FdGuard {
                shared: &self.shared,
                first: a,
                second: None,
            });
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        self.acquire(low, MUTEX_HELD_DOUBLE);
        self.acquire(high, MUTEX_HELD_DOUBLE);
        Ok(FdGuard {
            shared: &self.shared,
            first: low,
            second: Some(high),
        })
    }

    /// Flip the doorbell and block until the Park flips it back.
    fn ring_and_wait(&self, fd: u32) -> Result<(), Errno> {
        let shared = &self.shared;
        let call = shared.call_word(fd as usize);
        let old = call.swap(CALL_PENDING, SeqCst);
        if old != CALL_IDLE {
            error!(fd, "a call was already pending on this descriptor");
            return Err(Errno::Io);
        }
        let woken = shared.waits.wake(call, 1);
        if woken != 1 {
            // The listener re-checks the word before parking, so a ring
            // that lands before it parks is not lost.
            trace!(fd, woken, "doorbell rang before the listener parked");
        }
        while call.load(SeqCst) == CALL_PENDING {
            if let WaitResult::TimedOut =
                shared
                    .waits
                    .wait(call, CALL_PENDING, Some(shared.wait_timeout))
            {
                error!(fd, "timed out waiting for completion; retrying");
            }
        }
        Ok(())
    }

    fn result_errno(&self, fd: u32) -> Errno {
        match Errno::from_raw(self.frame(fd).errno()) {
            Ok(errno) => errno,
            Err(e) => {
                error!(fd, %e, "bad errno slot");
                Errno::Io
            }
        }
    }

    /// The no-payload call template: encode, ring, read the errno.
    fn call_simple(&self, fd: u32, request: Request) -> Result<(), Errno> {
        let _guard = self.lock_fd(fd)?;
        request.encode(&self.frame(fd));
        self.ring_and_wait(fd)?;
        match self.result_errno(fd) {
            Errno::Success => Ok(()),
            errno => Err(errno),
        }
    }

    /// Like [`call_simple`] with one staged input payload, released to the
    /// Park on a successful ring.
    fn call_with_input(&self, fd: u32, request: Request, staged: Lease<'_>) -> Result<(), Errno> {
        request.encode(&self.frame(fd));
        self.ring_and_wait(fd)?;
        staged.release();
        match self.result_errno(fd) {
            Errno::Success => Ok(()),
            errno => Err(errno),
        }
    }

    /// Copy an output payload out of the arena and free it.
    fn fetch_output(&self, payload: Payload) -> Vec<u8> {
        self.shared.arena.adopt(payload).bytes()
    }

    pub fn fd_advise(&self, fd: u32) -> Result<(), Errno> {
        self.call_simple(fd, Request::FdAdvise { fd })
    }

    pub fn fd_allocate(&self, fd: u32, offset: u64, len: u64) -> Result<(), Errno> {
        self.call_simple(fd, Request::FdAllocate { fd, offset, len })
    }

    pub fn fd_close(&self, fd: u32) -> Result<(), Errno> {
        self.call_simple(fd, Request::FdClose { fd })
    }

    pub fn fd_datasync(&self, fd: u32) -> Result<(), Errno> {
        self.call_simple(fd, Request::FdDatasync { fd })
    }

    pub fn fd_fdstat_get(&self, fd: u32) -> Result<Fdstat, Errno> {
        let _guard = self.lock_fd(fd)?;
        Request::FdFdstatGet { fd }.encode(&self.frame(fd));
        self.ring_and_wait(fd)?;
        match self.result_errno(fd) {
            Errno::Success => self.frame(fd).fdstat().map_err(|e| Errno::from(&e)),
            errno => Err(errno),
        }
    }

    pub fn fd_fdstat_set_flags(&self, fd: u32, flags: FdFlags) -> Result<(), Errno> {
        self.call_simple(
            fd,
            Request::FdFdstatSetFlags {
                fd,
                flags: flags.bits(),
            },
        )
    }

    pub fn fd_fdstat_set_rights(
        &self,
        fd: u32,
        rights_base: Rights,
        rights_inheriting: Rights,
    ) -> Result<(), Errno> {
        self.call_simple(
            fd,
            Request::FdFdstatSetRights {
                fd,
                rights_base: rights_base.bits(),
                rights_inheriting: rights_inheriting.bits(),
            },
        )
    }

    pub fn fd_filestat_get(&self, fd: u32) -> Result<Filestat, Errno> {
        let _guard = self.lock_fd(fd)?;
        Request::FdFilestatGet { fd }.encode(&self.frame(fd));
        self.ring_and_wait(fd)?;
        match self.result_errno(fd) {
            Errno::Success => self.frame(fd).filestat().map_err(|e| Errno::from(&e)),
            errno => Err(errno),
        }
    }

    pub fn fd_filestat_set_size(&self, fd: u32, size: u64) -> Result<(), Errno> {
        self.call_simple(fd, Request::FdFilestatSetSize { fd, size })
    }

    pub fn fd_filestat_set_times(
        &self,
        fd: u32,
        atim: u64,
        mtim: u64,
        fst_flags: FstFlags,
    ) -> Result<(), Errno> {
        self.call_simple(
            fd,
            Request::FdFilestatSetTimes {
                fd,
                atim,
                mtim,
                fst_flags: fst_flags.bits(),
            },
        )
    }

    pub fn fd_pread(&self, fd: u32, iovs: &[Iovec], offset: u64) -> Result<(u32, Vec<u8>), Errno> {
        let _guard = self.lock_fd(fd)?;
        let staged = self.stage(&iov_bytes(iovs))?;
        Request::FdPread {
            fd,
            iovs: staged.payload(),
            offset,
        }
        .encode(&self.frame(fd));
        self.ring_and_wait(fd)?;
        staged.release();
        match self.result_errno(fd) {
            Errno::Success => {
                let (nread, payload) = self.frame(fd).read_result();
                let data = self.fetch_output(payload);
                if nread as usize != data.len() {
                    warn!(fd, nread, len = data.len(), "pread length mismatch");
                }
                Ok((nread, data))
            }
            errno => Err(errno),
        }
    }

    pub fn fd_prestat_get(&self, fd: u32) -> Result<Prestat, Errno> {
        let _guard = self.lock_fd(fd)?;
        Request::FdPrestatGet { fd }.encode(&self.frame(fd));
        self.ring_and_wait(fd)?;
        match self.result_errno(fd) {
            Errno::Success => Ok(Prestat {
                name_len: self.frame(fd).prestat_name_len(),
            }),
            errno => Err(errno),
        }
    }

    pub fn fd_prestat_dir_name(&self, fd: u32, path_len: u32) -> Result<Vec<u8>, Errno> {
        let _guard = self.lock_fd(fd)?;
        Request::FdPrestatDirName { fd, path_len }.encode(&self.frame(fd));
        self.ring_and_wait(fd)?;
        match self.result_errno(fd) {
            Errno::Success => Ok(self.fetch_output(self.frame(fd).prestat_name_result())),
            Errno::Nametoolong => {
                // The name was staged anyway; free it before reporting.
                drop(self.fetch_output(self.frame(fd).prestat_name_result()));
                Err(Errno::Nametoolong)
            }
            errno => Err(errno),
        }
    }

    pub fn fd_pwrite(&self, fd: u32, data: &[u8], offset: u64) -> Result<u32, Errno> {
        let _guard = self.lock_fd(fd)?;
        let staged = self.stage(data)?;
        let request = Request::FdPwrite {
            fd,
            data: staged.payload(),
            offset,
        };
        self.call_with_input(fd, request, staged)?;
        Ok(self.frame(fd).size_result())
    }

    pub fn fd_read(&self, fd: u32, iovs: &[Iovec]) -> Result<(u32, Vec<u8>), Errno> {
        let _guard = self.lock_fd(fd)?;
        let staged = self.stage(&iov_bytes(iovs))?;
        Request::FdRead {
            fd,
            iovs: staged.payload(),
        }
        .encode(&self.frame(fd));
        self.ring_and_wait(fd)?;
        staged.release();
        match self.result_errno(fd) {
            Errno::Success => {
                let (nread, payload) = self.frame(fd).read_result();
                let data = self.fetch_output(payload);
                if nread as usize != data.len() {
                    warn!(fd, nread, len = data.len(), "read length mismatch");
                }
                Ok((nread, data))
            }
            errno => Err(errno),
        }
    }

    pub fn fd_readdir(&self, fd: u32, buf_len: u32, cookie: u64) -> Result<(Vec<u8>, u32), Errno> {
        let _guard = self.lock_fd(fd)?;
        Request::FdReaddir {
            fd,
            buf_len,
            cookie,
        }
        .encode(&self.frame(fd));
        self.ring_and_wait(fd)?;
        match self.result_errno(fd) {
            Errno::Success => {
                let (payload, buf_used) = self.frame(fd).readdir_result();
                Ok((self.fetch_output(payload), buf_used))
            }
            errno => Err(errno),
        }
    }

    pub fn fd_renumber(&self, fd: u32, to: u32) -> Result<(), Errno> {
        let _guard = self.lock_double_fd(fd, to)?;
        Request::FdRenumber { fd, to }.encode(&self.frame(fd));
        self.ring_and_wait(fd)?;
        match self.result_errno(fd) {
            Errno::Success => Ok(()),
            errno => Err(errno),
        }
    }

    pub fn fd_seek(&self, fd: u32, offset: i64, whence: Whence) -> Result<u64, Errno> {
        let _guard = self.lock_fd(fd)?;
        Request::FdSeek {
            fd,
            offset,
            whence: whence as u8,
        }
        .encode(&self.frame(fd));
        self.ring_and_wait(fd)?;
        match self.result_errno(fd) {
            Errno::Success => Ok(self.frame(fd).offset_result()),
            errno => Err(errno),
        }
    }

    pub fn fd_sync(&self, fd: u32) -> Result<(), Errno> {
        self.call_simple(fd, Request::FdSync { fd })
    }

    pub fn fd_tell(&self, fd: u32) -> Result<u64, Errno> {
        let _guard = self.lock_fd(fd)?;
        Request::FdTell { fd }.encode(&self.frame(fd));
        self.ring_and_wait(fd)?;
        match self.result_errno(fd) {
            Errno::Success => Ok(self.frame(fd).offset_result()),
            errno => Err(errno),
        }
    }

    pub fn fd_write(&self, fd: u32, data: &[u8]) -> Result<u32, Errno> {
        let _guard = self.lock_fd(fd)?;
        let staged = self.stage(data)?;
        let request = Request::FdWrite {
            fd,
            data: staged.payload(),
        };
        self.call_with_input(fd, request, staged)?;
        Ok(self.frame(fd).size_result())
    }

    pub fn path_create_directory(&self, fd: u32, path: &str) -> Result<(), Errno> {
        let _guard = self.lock_fd(fd)?;
        let staged = self.stage(path.as_bytes())?;
        let request = Request::PathCreateDirectory {
            fd,
            path: staged.payload(),
        };
        self.call_with_input(fd, request, staged)
    }

    pub fn path_filestat_get(
        &self,
        fd: u32,
        flags: LookupFlags,
        path: &str,
    ) -> Result<Filestat, Errno> {
        let _guard = self.lock_fd(fd)?;
        let staged = self.stage(path.as_bytes())?;
        Request::PathFilestatGet {
            fd,
            flags: flags.bits(),
            path: staged.payload(),
        }
        .encode(&self.frame(fd));
        self.ring_and_wait(fd)?;
        staged.release();
        match self.result_errno(fd) {
            Errno::Success => self.frame(fd).filestat().map_err(|e| Errno::from(&e)),
            errno => Err(errno),
        }
    }

    pub fn path_filestat_set_times(
        &self,
        fd: u32,
        flags: LookupFlags,
        path: &str,
        atim: u64,
        mtim: u64,
        fst_flags: FstFlags,
    ) -> Result<(), Errno> {
        let _guard = self.lock_fd(fd)?;
        let staged = self.stage(path.as_bytes())?;
        let request = Request::PathFilestatSetTimes {
            fd,
            flags: flags.bits(),
            path: staged.payload(),
            atim,
            mtim,
            fst_flags: fst_flags.bits(),
        };
        self.call_with_input(fd, request, staged)
    }

    pub fn path_link(
        &self,
        old_fd: u32,
        old_flags: LookupFlags,
        old_path: &str,
        new_fd: u32,
        new_path: &str,
    ) -> Result<(), Errno> {
        let _guard = self.lock_double_fd(old_fd, new_fd)?;
        let staged_old = self.stage(old_path.as_bytes())?;
        let staged_new = self.stage(new_path.as_bytes())?;
        Request::PathLink {
            old_fd,
            old_flags: old_flags.bits(),
            old_path: staged_old.payload(),
            new_fd,
            new_path: staged_new.payload(),
        }
        .encode(&self.frame(old_fd));
        self.ring_and_wait(old_fd)?;
        staged_old.release();
        staged_new.release();
        match self.result_errno(old_fd) {
            Errno::Success => Ok(()),
            errno => Err(errno),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn path_open(
        &self,
        fd: u32,
        dirflags: LookupFlags,
        path: &str,
        oflags: OFlags,
        rights_base: Rights,
        rights_inheriting: Rights,
        fdflags: FdFlags,
    ) -> Result<u32, Errno> {
        let _guard = self.lock_fd(fd)?;
        let staged = self.stage(path.as_bytes())?;
        let request = Request::PathOpen {
            fd,
            dirflags: dirflags.bits(),
            path: staged.payload(),
            oflags: oflags.bits(),
            rights_base: rights_base.bits(),
            rights_inheriting: rights_inheriting.bits(),
            fdflags: fdflags.bits(),
        };
        self.call_with_input(fd, request, staged)?;
        Ok(self.frame(fd).size_result())
    }

    pub fn path_readlink(&self, fd: u32, path: &str, buf_len: u32) -> Result<Vec<u8>, Errno> {
        let _guard = self.lock_fd(fd)?;
        let staged = self.stage(path.as_bytes())?;
        Request::PathReadlink {
            fd,
            path: staged.payload(),
            buf_len,
        }
        .encode(&self.frame(fd));
        self.ring_and_wait(fd)?;
        staged.release();
        match self.result_errno(fd) {
            Errno::Success => {
                let (nread, payload) = self.frame(fd).read_result();
                let mut data = self.fetch_output(payload);
                data.truncate(nread as usize);
                Ok(data)
            }
            errno => Err(errno),
        }
    }

    pub fn path_remove_directory(&self, fd: u32, path: &str) -> Result<(), Errno> {
        let _guard = self.lock_fd(fd)?;
        let staged = self.stage(path.as_bytes())?;
        let request = Request::PathRemoveDirectory {
            fd,
            path: staged.payload(),
        };
        self.call_with_input(fd, request, staged)
    }

    pub fn path_rename(
        &self,
        old_fd: u32,
        old_path: &str,
        new_fd: u32,
        new_path: &str,
    ) -> Result<(), Errno> {
        let _guard = self.lock_double_fd(old_fd, new_fd)?;
        let staged_old = self.stage(old_path.as_bytes())?;
        let staged_new = self.stage(new_path.as_bytes())?;
        Request::PathRename {
            old_fd,
            old_path: staged_old.payload(),
            new_fd,
            new_path: staged_new.payload(),
        }
        .encode(&self.frame(old_fd));
        self.ring_and_wait(old_fd)?;
        staged_old.release();
        staged_new.release();
        match self.result_errno(old_fd) {
            Errno::Success => Ok(()),
            errno => Err(errno),
        }
    }

    pub fn path_symlink(&self, old_path: &str, fd: u32, new_path: &str) -> Result<(), Errno> {
        let _guard = self.lock_fd(fd)?;
        let staged_old = self.stage(old_path.as_bytes())?;
        let staged_new = self.stage(new_path.as_bytes())?;
        Request::PathSymlink {
            old_path: staged_old.payload(),
            fd,
            new_path: staged_new.payload(),
        }
        .encode(&self.frame(fd));
        self.ring_and_wait(fd)?;
        staged_old.release();
        staged_new.release();
        match self.result_errno(fd) {
            Errno::Success => Ok(()),
            errno => Err(errno),
        }
    }

    pub fn path_unlink_file(&self, fd: u32, path: &str) -> Result<(), Errno> {
        let _guard = self.lock_fd(fd)?;
        let staged = self.stage(path.as_bytes())?;
        let request = Request::PathUnlinkFile {
            fd,
            path: staged.payload(),
        };
        self.call_with_input(fd, request, staged)
    }
}

fn iov_bytes(iovs: &[Iovec]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(iovs.len() * 8);
    for iov in iovs {
        bytes.extend_from_slice(&iov.buf.to_le_bytes());
        bytes.extend_from_slice(&iov.buf_len.to_le_bytes());
    }
    bytes
}
