//! The owning side of the farm.
//!
//! The Park holds the authoritative descriptor table and executes every
//! operation. Each live descriptor slot has a dedicated listener thread
//! parked on that slot's doorbell word; a Ref encodes a request into the
//! slot's call frame, rings the doorbell, and the listener decodes,
//! dispatches against the capability, encodes the result, and rings back.
//! A listener never exits on error: a dispatch failure resets the frame and
//! the loop serves the next call, because a dead loop would strand every
//! future call on that descriptor.

use crate::alloc::Arena;
use crate::channel::CallChannel;
use crate::closes::FdCloseSender;
use crate::config::FarmConfig;
use crate::error::{Errno, Error, ErrorExt};
use crate::farm_ref::FarmRef;
use crate::shm::SharedRegion;
use crate::table::{FdEntry, FdTable};
use crate::types::dirent_bytes;
use crate::types::{Advice, FdFlags, FstFlags, LookupFlags, OFlags, ReaddirCursor, Rights, Whence};
use crate::wait::WaitQueue;
use crate::wire::{
    Frame, Payload, Request, CALL_IDLE, CALL_PENDING, LOCK_WORDS, SIG_WORDS,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering::SeqCst};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Control-channel command: a Ref reports the fds it holds.
pub(crate) const CTRL_REGISTER_FDS: u32 = 0;

/// State shared between the Park and every Ref: the raw regions, the
/// allocator, the close-broadcast channel, and the published counters.
pub(crate) struct FarmShared {
    pub locks: SharedRegion,
    pub frames: SharedRegion,
    pub arena: Arena,
    pub closes: FdCloseSender,
    pub ctrl: CallChannel,
    /// Number of slots with a running listener; calls beyond this are Badf.
    pub fds_len: AtomicU32,
    pub next_ref_id: AtomicU32,
    pub shutdown: AtomicBool,
    pub waits: WaitQueue,
    pub wait_timeout: Duration,
}

impl FarmShared {
    fn new(config: &FarmConfig) -> FarmShared {
        FarmShared {
            locks: SharedRegion::new(config.max_fds * LOCK_WORDS),
            frames: SharedRegion::new(config.max_fds * SIG_WORDS),
            arena: Arena::new(config.arena_bytes, config.wait_timeout),
            closes: FdCloseSender::new(config.close_arena_bytes, config.wait_timeout),
            ctrl: CallChannel::new(4, config.wait_timeout),
            fds_len: AtomicU32::new(0),
            next_ref_id: AtomicU32::new(0),
            shutdown: AtomicBool::new(false),
            waits: WaitQueue::new(),
            wait_timeout: config.wait_timeout,
        }
    }

    pub fn mutex_word(&self, fd: usize) -> &AtomicU32 {
        self.locks.word(fd * LOCK_WORDS)
    }

    pub fn call_word(&self, fd: usize) -> &AtomicU32 {
        self.locks.word(fd * LOCK_WORDS + 1)
    }

    pub fn frame(&self, fd: usize) -> Frame<'_> {
        Frame::at(self.frames.words(), fd)
    }
}

struct ParkInner {
    shared: Arc<FarmShared>,
    table: FdTable,
    /// fd → identities of the Refs that registered an interest in it.
    subs: Mutex<HashMap<u32, HashSet<u32>>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

/// The farm's owning half. Dropping it tears the farm down: every listener
/// is woken, joined, and the shared regions die with the last Ref.
pub struct FarmPark {
    inner: Arc<ParkInner>,
    ctrl_thread: Option<JoinHandle<()>>,
}

impl FarmPark {
    /// Build a farm over the given initial descriptors (index = fd number)
    /// and start one listener per slot plus the control-channel service.
    pub fn spawn(entries: Vec<FdEntry>, config: FarmConfig) -> Result<FarmPark, Error> {
        if entries.len() > config.max_fds {
            return Err(Error::too_many_files());
        }
        let initial = entries.len();
        let shared = Arc::new(FarmShared::new(&config));
        let inner = Arc::new(ParkInner {
            table: FdTable::new(entries, config.max_fds),
            shared,
            subs: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        });
        for fd in 0..initial {
            start_listener(&inner, fd)?;
        }
        let ctrl_inner = inner.clone();
        let ctrl_thread = std::thread::Builder::new()
            .name("farm-ctrl".to_string())
            .spawn(move || serve_control(ctrl_inner))
            .map_err(anyhow::Error::from)?;
        Ok(FarmPark {
            inner,
            ctrl_thread: Some(ctrl_thread),
        })
    }

    /// A client handle. Clone it freely; every clone addresses this Park.
    pub fn handle(&self) -> FarmRef {
        FarmRef::new(self.inner.shared.clone())
    }
}

impl Drop for FarmPark {
    fn drop(&mut self) {
        let shared = &self.inner.shared;
        shared.shutdown.store(true, SeqCst);
        let count = shared.fds_len.load(SeqCst) as usize;
        for fd in 0..count {
            shared.waits.wake(shared.call_word(fd), u32::MAX);
        }
        shared.ctrl.kick(&shared.waits);
        for handle in self.inner.listeners.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        if let Some(ctrl) = self.ctrl_thread.take() {
            let _ = ctrl.join();
        }
    }
}

/// Start the dispatch loop for slot `fd` and publish the new slot count.
/// Publication happens after the thread exists, so by the time a Ref can
/// address the slot there is a listener to answer it.
fn start_listener(inner: &Arc<ParkInner>, fd: usize) -> Result<(), Error> {
    let shared = &inner.shared;
    shared.mutex_word(fd).store(0, SeqCst);
    shared.call_word(fd).store(CALL_IDLE, SeqCst);
    shared.frame(fd).reset_errno();
    let thread_inner = inner.clone();
    let handle = std::thread::Builder::new()
        .name(format!("farm-fd-{fd}"))
        .spawn(move || listen_fd(thread_inner, fd))
        .map_err(anyhow::Error::from)?;
    inner.listeners.lock().unwrap().push(handle);
    shared.fds_len.fetch_max(fd as u32 + 1, SeqCst);
    Ok(())
}

fn listen_fd(inner: Arc<ParkInner>, fd_n: usize) {
    let shared = inner.shared.clone();
    let call = shared.call_word(fd_n);
    debug!(fd = fd_n, "listener started");
    loop {
        while call.load(SeqCst) == CALL_IDLE {
            if shared.shutdown.load(SeqCst) {
                debug!(fd = fd_n, "listener stopped");
                return;
            }
            shared
                .waits
                .wait(call, CALL_IDLE, Some(shared.wait_timeout));
        }
        if shared.shutdown.load(SeqCst) {
            return;
        }
        let frame = shared.frame(fd_n);
        let errno = match dispatch(&inner, fd_n as u32, &frame) {
            Ok(errno) => errno,
            Err(e) => {
                if matches!(e, Error::Errno(_)) {
                    trace!(fd = fd_n, %e, "operation failed");
                } else {
                    error!(fd = fd_n, %e, "dispatch failed; resetting frame");
                }
                Errno::from(&e)
            }
        };
        frame.set_errno(errno);
        let old = call.swap(CALL_IDLE, SeqCst);
        if old != CALL_PENDING {
            warn!(fd = fd_n, old, "call flag was not pending at completion");
        }
        let woken = shared.waits.wake(call, 1);
        if woken != 1 {
            warn!(fd = fd_n, woken, "doorbell completion reached an unexpected waiter count");
        }
    }
}

/// Decode and execute one call frame. `Ok` carries the wire errno (almost
/// always `Success`); `Err` carries capability and protocol failures, which
/// the listener collapses to an errno.
fn dispatch(inner: &Arc<ParkInner>, fd_n: u32, frame: &Frame<'_>) -> Result<Errno, Error> {
    let shared = &inner.shared;
    let table = &inner.table;
    let request = Request::decode(frame)?;
    if request.driving_fd() != fd_n {
        // A double-fd frame is executed only by its driving slot's loop; the
        // passive side is held by its mutex alone and must not re-run it.
        return Err(Error::StaleFrame {
            driving: request.driving_fd(),
            listener: fd_n,
        });
    }
    trace!(fd = fd_n, opcode = ?request.opcode(), "dispatch");
    match request {
        Request::FdAdvise { fd } => {
            // The stub layer drops the offset/len/advice hints on the floor,
            // so the capability sees neutral values.
            table.get(fd)?.fd.advise(0, 0, Advice::Normal)?;
            Ok(Errno::Success)
        }
        Request::FdAllocate { fd, offset, len } => {
            table.get(fd)?.fd.allocate(offset, len)?;
            Ok(Errno::Success)
        }
        Request::FdClose { fd } => {
            drop(table.remove(fd)?);
            let targets: Vec<u32> = inner
                .subs
                .lock()
                .unwrap()
                .remove(&fd)
                .map(|ids| ids.into_iter().collect())
                .unwrap_or_default();
            if !targets.is_empty() {
                if let Err(e) = shared.closes.send(&shared.waits, &targets, fd) {
                    error!(fd, %e, "failed to broadcast close");
                }
            }
            Ok(Errno::Success)
        }
        Request::FdDatasync { fd } => {
            table.get(fd)?.fd.datasync()?;
            Ok(Errno::Success)
        }
        Request::FdFdstatGet { fd } => {
            let fdstat = table.get(fd)?.fd.fdstat_get()?;
            frame.set_fdstat(&fdstat);
            Ok(Errno::Success)
        }
        Request::FdFdstatSetFlags { fd, flags } => {
            table
                .get(fd)?
                .fd
                .fdstat_set_flags(FdFlags::from_bits_truncate(flags))?;
            Ok(Errno::Success)
        }
        Request::FdFdstatSetRights {
            fd,
            rights_base,
            rights_inheriting,
        } => {
            table.get(fd)?.fd.fdstat_set_rights(
                Rights::from_bits_truncate(rights_base),
                Rights::from_bits_truncate(rights_inheriting),
            )?;
            Ok(Errno::Success)
        }
        Request::FdFilestatGet { fd } => {
            let stat = table.get(fd)?.fd.filestat_get()?;
            frame.set_filestat(&stat);
            Ok(Errno::Success)
        }
        Request::FdFilestatSetSize { fd, size } => {
            table.get(fd)?.fd.filestat_set_size(size)?;
            Ok(Errno::Success)
        }
        Request::FdFilestatSetTimes {
            fd,
            atim,
            mtim,
            fst_flags,
        } => {
            table.get(fd)?.fd.filestat_set_times(
                atim,
                mtim,
                FstFlags::from_bits_truncate(fst_flags),
            )?;
            Ok(Errno::Success)
        }
        Request::FdPread { fd, iovs, offset } => {
            let lens = read_iov_lens(shared, iovs)?;
            let entry = table.get(fd)?;
            let mut data = Vec::new();
            let mut pos = offset;
            for len in lens {
                let chunk = match entry.fd.pread(len as usize, pos) {
                    Ok(chunk) => chunk,
                    Err(e) if data.is_empty() => return Err(e),
                    Err(_) => break,
                };
                let short = chunk.len() < len as usize;
                pos += chunk.len() as u64;
                data.extend_from_slice(&chunk);
                if short {
                    break;
                }
            }
            let out = shared.arena.block_write(&shared.waits, &data)?;
            frame.set_read_result(data.len() as u32, out.release());
            Ok(Errno::Success)
        }
        Request::FdPrestatGet { fd } => {
            let entry = table.get(fd)?;
            let name = entry.preopen.as_ref().ok_or_else(Error::badf)?;
            frame.set_prestat(name.len() as u32);
            Ok(Errno::Success)
        }
        Request::FdPrestatDirName { fd, path_len } => {
            let entry = table.get(fd)?;
            let name = entry.preopen.as_ref().ok_or_else(Error::badf)?;
            let out = shared.arena.block_write(&shared.waits, name.as_bytes())?;
            frame.set_prestat_name_result(out.release());
            if name.len() > path_len as usize {
                Ok(Errno::Nametoolong)
            } else {
                Ok(Errno::Success)
            }
        }
        Request::FdPwrite { fd, data, offset } => {
            let bytes = shared.arena.adopt(data).bytes();
            let nwritten = table.get(fd)?.fd.pwrite(&bytes, offset)?;
            frame.set_size_result(nwritten as u32);
            Ok(Errno::Success)
        }
        Request::FdRead { fd, iovs } => {
            let lens = read_iov_lens(shared, iovs)?;
            let entry = table.get(fd)?;
            let mut data = Vec::new();
            for len in lens {
                let chunk = match entry.fd.read(len as usize) {
                    Ok(chunk) => chunk,
                    Err(e) if data.is_empty() => return Err(e),
                    Err(_) => break,
                };
                let short = chunk.len() < len as usize;
                data.extend_from_slice(&chunk);
                if short {
                    break;
                }
            }
            let out = shared.arena.block_write(&shared.waits, &data)?;
            frame.set_read_result(data.len() as u32, out.release());
            Ok(Errno::Success)
        }
        Request::FdReaddir {
            fd,
            buf_len,
            cookie,
        } => {
            let entry = table.get(fd)?;
            let mut buf: Vec<u8> = Vec::new();
            let mut truncated = false;
            for entity in entry.fd.readdir(ReaddirCursor::from(cookie))? {
                let bytes = dirent_bytes(&entity?);
                if buf.len() + bytes.len() > buf_len as usize {
                    // Fill to the brim and report a full buffer so the
                    // caller knows to come back with more space.
                    let room = buf_len as usize - buf.len();
                    buf.extend_from_slice(&bytes[..room.min(bytes.len())]);
                    truncated = true;
                    break;
                }
                buf.extend_from_slice(&bytes);
            }
            let used = if truncated { buf_len } else { buf.len() as u32 };
            let out = shared.arena.block_write(&shared.waits, &buf)?;
            frame.set_readdir_result(out.release(), used);
            Ok(Errno::Success)
        }
        Request::FdRenumber { fd, to } => {
            if fd != to {
                table.renumber(fd, to)?;
            } else {
                // Self-renumber is a no-op, but the fd must be live.
                table.get(fd)?;
            }
            Ok(Errno::Success)
        }
        Request::FdSeek { fd, offset, whence } => {
            let whence = Whence::try_from(whence)?;
            let new_offset = table.get(fd)?.fd.seek(offset, whence)?;
            frame.set_offset_result(new_offset);
            Ok(Errno::Success)
        }
        Request::FdSync { fd } => {
            table.get(fd)?.fd.sync()?;
            Ok(Errno::Success)
        }
        Request::FdTell { fd } => {
            let offset = table.get(fd)?.fd.tell()?;
            frame.set_offset_result(offset);
            Ok(Errno::Success)
        }
        Request::FdWrite { fd, data } => {
            let bytes = shared.arena.adopt(data).bytes();
            let nwritten = table.get(fd)?.fd.write(&bytes)?;
            frame.set_size_result(nwritten as u32);
            Ok(Errno::Success)
        }
        Request::PathCreateDirectory { fd, path } => {
            let path = path_string(shared, path)?;
            table.get(fd)?.fd.create_directory(&path)?;
            Ok(Errno::Success)
        }
        Request::PathFilestatGet { fd, flags, path } => {
            let path = path_string(shared, path)?;
            let stat = table
                .get(fd)?
                .fd
                .path_filestat_get(LookupFlags::from_bits_truncate(flags), &path)?;
            frame.set_filestat(&stat);
            Ok(Errno::Success)
        }
        Request::PathFilestatSetTimes {
            fd,
            flags,
            path,
            atim,
            mtim,
            fst_flags,
        } => {
            let path = path_string(shared, path)?;
            table.get(fd)?.fd.path_filestat_set_times(
                LookupFlags::from_bits_truncate(flags),
                &path,
                atim,
                mtim,
                FstFlags::from_bits_truncate(fst_flags),
            )?;
            Ok(Errno::Success)
        }
        Request::PathLink {
            old_fd,
            old_flags: _,
            old_path,
            new_fd,
            new_path,
        } => {
            let old_path = path_string(shared, old_path)?;
            let new_path = path_string(shared, new_path)?;
            let old_entry = table.get(old_fd)?;
            let new_entry = table.get(new_fd)?;
            old_entry
                .fd
                .hard_link(&old_path, new_entry.fd.as_ref(), &new_path)?;
            Ok(Errno::Success)
        }
        Request::PathOpen {
            fd,
            dirflags,
            path,
            oflags,
            rights_base,
            rights_inheriting,
            fdflags,
        } => {
            let path = path_string(shared, path)?;
            let entry = table.get(fd)?;
            let opened = entry.fd.open_at(
                LookupFlags::from_bits_truncate(dirflags),
                &path,
                OFlags::from_bits_truncate(oflags),
                Rights::from_bits_truncate(rights_base),
                Rights::from_bits_truncate(rights_inheriting),
                FdFlags::from_bits_truncate(fdflags),
            )?;
            let new_fd = table.push(FdEntry::new(Arc::from(opened)))?;
            // The listener must be live before the fd number escapes, or a
            // racing caller could ring a doorbell nobody answers.
            start_listener(inner, new_fd as usize)?;
            frame.set_size_result(new_fd);
            Ok(Errno::Success)
        }
        Request::PathReadlink { fd, path, buf_len } => {
            let path = path_string(shared, path)?;
            let mut target = table.get(fd)?.fd.read_link(&path)?;
            target.truncate(buf_len as usize);
            let nread = target.len() as u32;
            let out = shared.arena.block_write(&shared.waits, &target)?;
            frame.set_read_result(nread, out.release());
            Ok(Errno::Success)
        }
        Request::PathRemoveDirectory { fd, path } => {
            let path = path_string(shared, path)?;
            table.get(fd)?.fd.remove_directory(&path)?;
            Ok(Errno::Success)
        }
        Request::PathRename {
            old_fd,
            old_path,
            new_fd,
            new_path,
        } => {
            let old_path = path_string(shared, old_path)?;
            let new_path = path_string(shared, new_path)?;
            let old_entry = table.get(old_fd)?;
            let new_entry = table.get(new_fd)?;
            old_entry
                .fd
                .rename(&old_path, new_entry.fd.as_ref(), &new_path)?;
            Ok(Errno::Success)
        }
        Request::PathSymlink { old_path, fd, new_path } => {
            // Symbolic links are not part of the farm's contract; free the
            // staged paths and refuse.
            drop(shared.arena.adopt(old_path));
            drop(shared.arena.adopt(new_path));
            let _ = fd;
            Err(Error::not_supported())
        }
        Request::PathUnlinkFile { fd, path } => {
            let path = path_string(shared, path)?;
            table.get(fd)?.fd.unlink_file(&path)?;
            Ok(Errno::Success)
        }
    }
}

/// Copy a staged path out of the arena and release it.
fn path_string(shared: &FarmShared, payload: Payload) -> Result<String, Error> {
    let bytes = shared.arena.adopt(payload).bytes();
    Ok(std::str::from_utf8(&bytes)?.to_string())
}

/// Copy a staged iovec array out of the arena: packed `(buf, buf_len)` u32
/// pairs, of which only the lengths matter on this side.
fn read_iov_lens(shared: &FarmShared, iovs: Payload) -> Result<Vec<u32>, Error> {
    let bytes = shared.arena.adopt(iovs).bytes();
    if bytes.len() % 8 != 0 {
        return Err(Error::inval());
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|pair| u32::from_le_bytes([pair[4], pair[5], pair[6], pair[7]]))
        .collect())
}

fn serve_control(inner: Arc<ParkInner>) {
    let shared = inner.shared.clone();
    debug!("control service started");
    loop {
        if !shared.ctrl.wait_request(&shared.waits, &shared.shutdown) {
            debug!("control service stopped");
            return;
        }
        let cmd = shared.ctrl.arg(0);
        match cmd {
            CTRL_REGISTER_FDS => {
                let payload = Payload {
                    ptr: shared.ctrl.arg(1),
                    len: shared.ctrl.arg(2),
                };
                let id = shared.ctrl.arg(3);
                let bytes = shared.arena.adopt(payload).bytes();
                let mut subs = inner.subs.lock().unwrap();
                for chunk in bytes.chunks_exact(4) {
                    let fd = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    subs.entry(fd).or_default().insert(id);
                }
                trace!(id, fds = bytes.len() / 4, "ref registered");
            }
            other => error!(cmd = other, "unknown control command"),
        }
        shared.ctrl.complete(&shared.waits);
    }
}
