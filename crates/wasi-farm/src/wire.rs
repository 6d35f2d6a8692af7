//! The call-frame schema.
//!
//! Every descriptor owns one fixed slot of [`SIG_WORDS`] 32-bit words in the
//! signature region, addressable as little-endian u8/u16/u32/u64 views of
//! the same bytes. Field placement is part of the wire contract and lives
//! only in this module: requests are a tagged union keyed by opcode with
//! `encode`/`decode`, and result fields go through the typed `set_*`/`*`
//! accessors below. The trailing word of each slot is the errno slot; the
//! sentinel `-1` means "no result yet".
//!
//! Variable-length operands do not travel inline: they are staged in the
//! payload arena and the frame carries `(ptr, len)` word pairs.

use crate::error::{Errno, Error};
use crate::types::{Fdstat, FileType, Filestat};
use std::sync::atomic::{AtomicU32, Ordering::SeqCst};

/// 32-bit words per call-frame slot.
pub const SIG_WORDS: usize = 18;
/// Index of the errno word within a slot.
pub const ERRNO_WORD: usize = SIG_WORDS - 1;
/// Errno slot sentinel: no result has been produced for this frame yet.
pub const ERRNO_PENDING: i32 = -1;

/// 32-bit words per descriptor in the lock region: `[mutex, call]`.
pub const LOCK_WORDS: usize = 2;

/// Mutex word states.
pub const MUTEX_FREE: u32 = 0;
pub const MUTEX_HELD: u32 = 1;
pub const MUTEX_HELD_DOUBLE: u32 = 2;

/// Call-flag (doorbell) word states.
pub const CALL_IDLE: u32 = 0;
pub const CALL_PENDING: u32 = 1;

/// An arena handle as stored in a frame: byte offset and length within the
/// shared payload arena.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Payload {
    pub ptr: u32,
    pub len: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    FdAdvise = 7,
    FdAllocate = 8,
    FdClose = 9,
    FdDatasync = 10,
    FdFdstatGet = 11,
    FdFdstatSetFlags = 12,
    FdFdstatSetRights = 13,
    FdFilestatGet = 14,
    FdFilestatSetSize = 15,
    FdFilestatSetTimes = 16,
    FdPread = 17,
    FdPrestatGet = 18,
    FdPrestatDirName = 19,
    FdPwrite = 20,
    FdRead = 21,
    FdReaddir = 22,
    FdRenumber = 23,
    FdSeek = 24,
    FdSync = 25,
    FdTell = 26,
    FdWrite = 27,
    PathCreateDirectory = 28,
    PathFilestatGet = 29,
    PathFilestatSetTimes = 30,
    PathLink = 31,
    PathOpen = 32,
    PathReadlink = 33,
    PathRemoveDirectory = 34,
    PathRename = 35,
    PathSymlink = 36,
    PathUnlinkFile = 37,
}

impl TryFrom<u32> for Opcode {
    type Error = Error;
    fn try_from(raw: u32) -> Result<Opcode, Error> {
        use Opcode::*;
        Ok(match raw {
            7 => FdAdvise,
            8 => FdAllocate,
            9 => FdClose,
            10 => FdDatasync,
            11 => FdFdstatGet,
            12 => FdFdstatSetFlags,
            13 => FdFdstatSetRights,
            14 => FdFilestatGet,
            15 => FdFilestatSetSize,
            16 => FdFilestatSetTimes,
            17 => FdPread,
            18 => FdPrestatGet,
            19 => FdPrestatDirName,
            20 => FdPwrite,
            21 => FdRead,
            22 => FdReaddir,
            23 => FdRenumber,
            24 => FdSeek,
            25 => FdSync,
            26 => FdTell,
            27 => FdWrite,
            28 => PathCreateDirectory,
            29 => PathFilestatGet,
            30 => PathFilestatSetTimes,
            31 => PathLink,
            32 => PathOpen,
            33 => PathReadlink,
            34 => PathRemoveDirectory,
            35 => PathRename,
            36 => PathSymlink,
            37 => PathUnlinkFile,
            other => return Err(Error::UnknownOpcode(other)),
        })
    }
}

/// Typed accessor view over one frame slot.
///
/// Sub-word stores are read-modify-write on the containing word, which is
/// sound because a frame belongs to exactly one caller between fd-lock and
/// fd-release.
pub struct Frame<'a> {
    words: &'a [AtomicU32],
}

impl<'a> Frame<'a> {
    /// The frame of slot `fd` within the signature region.
    pub fn at(region: &'a [AtomicU32], fd: usize) -> Frame<'a> {
        Frame {
            words: &region[fd * SIG_WORDS..(fd + 1) * SIG_WORDS],
        }
    }

    pub fn u32(&self, index: usize) -> u32 {
        self.words[index].load(SeqCst)
    }

    pub fn set_u32(&self, index: usize, value: u32) {
        self.words[index].store(value, SeqCst);
    }

    pub fn u64(&self, index: usize) -> u64 {
        let lo = self.words[index * 2].load(SeqCst) as u64;
        let hi = self.words[index * 2 + 1].load(SeqCst) as u64;
        hi << 32 | lo
    }

    pub fn set_u64(&self, index: usize, value: u64) {
        self.words[index * 2].store(value as u32, SeqCst);
        self.words[index * 2 + 1].store((value >> 32) as u32, SeqCst);
    }

    pub fn u16(&self, index: usize) -> u16 {
        let shift = (index % 2) * 16;
        (self.words[index / 2].load(SeqCst) >> shift) as u16
    }

    pub fn set_u16(&self, index: usize, value: u16) {
        let word = &self.words[index / 2];
        let shift = (index % 2) * 16;
        let old = word.load(SeqCst);
        word.store((old & !(0xffff << shift)) | ((value as u32) << shift), SeqCst);
    }

    pub fn u8(&self, index: usize) -> u8 {
        let shift = (index % 4) * 8;
        (self.words[index / 4].load(SeqCst) >> shift) as u8
    }

    pub fn set_u8(&self, index: usize, value: u8) {
        let word = &self.words[index / 4];
        let shift = (index % 4) * 8;
        let old = word.load(SeqCst);
        word.store((old & !(0xff << shift)) | ((value as u32) << shift), SeqCst);
    }

    fn payload(&self, word: usize) -> Payload {
        Payload {
            ptr: self.u32(word),
            len: self.u32(word + 1),
        }
    }

    fn set_payload(&self, word: usize, payload: Payload) {
        self.set_u32(word, payload.ptr);
        self.set_u32(word + 1, payload.len);
    }

    pub fn errno(&self) -> i32 {
        self.words[ERRNO_WORD].load(SeqCst) as i32
    }

    pub fn set_errno(&self, errno: Errno) {
        self.words[ERRNO_WORD].store(errno.raw() as u32, SeqCst);
    }

    pub fn reset_errno(&self) {
        self.words[ERRNO_WORD].store(ERRNO_PENDING as u32, SeqCst);
    }

    // Result fields, named for the operations that produce them. The word
    // placements mirror the request layout documented on `Request`.

    pub fn set_size_result(&self, size: u32) {
        self.set_u32(0, size);
    }

    pub fn size_result(&self) -> u32 {
        self.u32(0)
    }

    pub fn set_offset_result(&self, offset: u64) {
        self.set_u64(0, offset);
    }

    pub fn offset_result(&self) -> u64 {
        self.u64(0)
    }

    pub fn set_fdstat(&self, fdstat: &Fdstat) {
        self.set_u8(0, fdstat.filetype.into());
        self.set_u16(2, fdstat.flags.bits());
        self.set_u64(1, fdstat.rights_base.bits());
        self.set_u64(2, fdstat.rights_inheriting.bits());
    }

    pub fn fdstat(&self) -> Result<Fdstat, Error> {
        Ok(Fdstat {
            filetype: FileType::try_from(self.u8(0))?,
            flags: crate::types::FdFlags::from_bits_truncate(self.u16(2)),
            rights_base: crate::types::Rights::from_bits_truncate(self.u64(1)),
            rights_inheriting: crate::types::Rights::from_bits_truncate(self.u64(2)),
        })
    }

    pub fn set_filestat(&self, stat: &Filestat) {
        self.set_u64(0, stat.device_id);
        self.set_u64(1, stat.inode);
        self.set_u8(16, stat.filetype.into());
        self.set_u64(3, stat.nlink);
        self.set_u64(4, stat.size);
        self.set_u64(5, stat.atim);
        self.set_u64(6, stat.mtim);
        self.set_u64(7, stat.ctim);
    }

    pub fn filestat(&self) -> Result<Filestat, Error> {
        Ok(Filestat {
            device_id: self.u64(0),
            inode: self.u64(1),
            filetype: FileType::try_from(self.u8(16))?,
            nlink: self.u64(3),
            size: self.u64(4),
            atim: self.u64(5),
            mtim: self.u64(6),
            ctim: self.u64(7),
        })
    }

    pub fn set_prestat(&self, name_len: u32) {
        self.set_u32(0, 0); // tag: preopened directory
        self.set_u32(1, name_len);
    }

    pub fn prestat_name_len(&self) -> u32 {
        self.u32(1)
    }

    pub fn set_read_result(&self, nread: u32, data: Payload) {
        self.set_u32(0, nread);
        self.set_payload(1, data);
    }

    pub fn read_result(&self) -> (u32, Payload) {
        (self.u32(0), self.payload(1))
    }

    pub fn set_prestat_name_result(&self, name: Payload) {
        self.set_payload(0, name);
    }

    pub fn prestat_name_result(&self) -> Payload {
        self.payload(0)
    }

    pub fn set_readdir_result(&self, buf: Payload, buf_used: u32) {
        self.set_payload(0, buf);
        self.set_u32(2, buf_used);
    }

    pub fn readdir_result(&self) -> (Payload, u32) {
        (self.payload(0), self.u32(2))
    }
}

/// A decoded request frame.
///
/// Word placements per opcode (u32 indices unless noted; `P` marks a
/// `(ptr, len)` payload pair):
///
/// ```text
/// 7  advise                 [1]=fd
/// 8  allocate               [1]=fd  u64[1]=offset  u64[2]=len
/// 9  close                  [1]=fd
/// 10 datasync               [1]=fd
/// 11 fdstat_get             [1]=fd
/// 12 fdstat_set_flags       [1]=fd  u16[4]=flags
/// 13 fdstat_set_rights      [1]=fd  u64[1]=base  u64[2]=inheriting
/// 14 filestat_get           [1]=fd
/// 15 filestat_set_size      [1]=fd  u64[1]=size
/// 16 filestat_set_times     [1]=fd  u64[1]=atim  u64[2]=mtim  u16[12]=fst
/// 17 pread                  [1]=fd  P[2]=iovs  u64[2]=offset
/// 18 prestat_get            [1]=fd
/// 19 prestat_dir_name       [1]=fd  [2]=path_len
/// 20 pwrite                 [1]=fd  P[2]=data  u64[2]=offset
/// 21 read                   [1]=fd  P[2]=iovs
/// 22 readdir                [1]=fd  [2]=buf_len  u64[2]=cookie
/// 23 renumber               [1]=fd  [2]=to
/// 24 seek                   [1]=fd  u64[1]=offset  u8[16]=whence
/// 25 sync                   [1]=fd
/// 26 tell                   [1]=fd
/// 27 write                  [1]=fd  P[2]=data
/// 28 path_create_directory  [1]=fd  P[2]=path
/// 29 path_filestat_get      [1]=fd  [2]=flags  P[3]=path
/// 30 path_filestat_set_times[1]=fd  [2]=flags  P[3]=path  u64[3]=atim  u64[4]=mtim  u16[26]=fst
/// 31 path_link              [1]=old_fd  [2]=old_flags  P[3]=old_path  [5]=new_fd  P[6]=new_path
/// 32 path_open              [1]=fd  [2]=dirflags  P[3]=path  [5]=oflags  u64[3]=base  u64[4]=inheriting  u16[20]=fdflags
/// 33 path_readlink          [1]=fd  P[2]=path  [4]=buf_len
/// 34 path_remove_directory  [1]=fd  P[2]=path
/// 35 path_rename            [1]=old_fd  P[2]=old_path  [4]=new_fd  P[5]=new_path
/// 36 path_symlink           P[1]=old_path  [3]=fd  P[4]=new_path
/// 37 path_unlink_file       [1]=fd  P[2]=path
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    FdAdvise {
        fd: u32,
    },
    FdAllocate {
        fd: u32,
        offset: u64,
        len: u64,
    },
    FdClose {
        fd: u32,
    },
    FdDatasync {
        fd: u32,
    },
    FdFdstatGet {
        fd: u32,
    },
    FdFdstatSetFlags {
        fd: u32,
        flags: u16,
    },
    FdFdstatSetRights {
        fd: u32,
        rights_base: u64,
        rights_inheriting: u64,
    },
    FdFilestatGet {
        fd: u32,
    },
    FdFilestatSetSize {
        fd: u32,
        size: u64,
    },
    FdFilestatSetTimes {
        fd: u32,
        atim: u64,
        mtim: u64,
        fst_flags: u16,
    },
    FdPread {
        fd: u32,
        iovs: Payload,
        offset: u64,
    },
    FdPrestatGet {
        fd: u32,
    },
    FdPrestatDirName {
        fd: u32,
        path_len: u32,
    },
    FdPwrite {
        fd: u32,
        data: Payload,
        offset: u64,
    },
    FdRead {
        fd: u32,
        iovs: Payload,
    },
    FdReaddir {
        fd: u32,
        buf_len: u32,
        cookie: u64,
    },
    FdRenumber {
        fd: u32,
        to: u32,
    },
    FdSeek {
        fd: u32,
        offset: i64,
        whence: u8,
    },
    FdSync {
        fd: u32,
    },
    FdTell {
        fd: u32,
    },
    FdWrite {
        fd: u32,
        data: Payload,
    },
    PathCreateDirectory {
        fd: u32,
        path: Payload,
    },
    PathFilestatGet {
        fd: u32,
        flags: u32,
        path: Payload,
    },
    PathFilestatSetTimes {
        fd: u32,
        flags: u32,
        path: Payload,
        atim: u64,
        mtim: u64,
        fst_flags: u16,
    },
    PathLink {
        old_fd: u32,
        old_flags: u32,
        old_path: Payload,
        new_fd: u32,
        new_path: Payload,
    },
    PathOpen {
        fd: u32,
        dirflags: u32,
        path: Payload,
        oflags: u32,
        rights_base: u64,
        rights_inheriting: u64,
        fdflags: u16,
    },
    PathReadlink {
        fd: u32,
        path: Payload,
        buf_len: u32,
    },
    PathRemoveDirectory {
        fd: u32,
        path: Payload,
    },
    PathRename {
        old_fd: u32,
        old_path: Payload,
        new_fd: u32,
        new_path: Payload,
    },
    PathSymlink {
        old_path: Payload,
        fd: u32,
        new_path: Payload,
    },
    PathUnlinkFile {
        fd: u32,
        path: Payload,
    },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        use Request::*;
        match self {
            FdAdvise { .. } => Opcode::FdAdvise,
            FdAllocate { .. } => Opcode::FdAllocate,
            FdClose { .. } => Opcode::FdClose,
            FdDatasync { .. } => Opcode::FdDatasync,
            FdFdstatGet { .. } => Opcode::FdFdstatGet,
            FdFdstatSetFlags { .. } => Opcode::FdFdstatSetFlags,
            FdFdstatSetRights { .. } => Opcode::FdFdstatSetRights,
            FdFilestatGet { .. } => Opcode::FdFilestatGet,
            FdFilestatSetSize { .. } => Opcode::FdFilestatSetSize,
            FdFilestatSetTimes { .. } => Opcode::FdFilestatSetTimes,
            FdPread { .. } => Opcode::FdPread,
            FdPrestatGet { .. } => Opcode::FdPrestatGet,
            FdPrestatDirName { .. } => Opcode::FdPrestatDirName,
            FdPwrite { .. } => Opcode::FdPwrite,
            FdRead { .. } => Opcode::FdRead,
            FdReaddir { .. } => Opcode::FdReaddir,
            FdRenumber { .. } => Opcode::FdRenumber,
            FdSeek { .. } => Opcode::FdSeek,
            FdSync { .. } => Opcode::FdSync,
            FdTell { .. } => Opcode::FdTell,
            FdWrite { .. } => Opcode::FdWrite,
            PathCreateDirectory { .. } => Opcode::PathCreateDirectory,
            PathFilestatGet { .. } => Opcode::PathFilestatGet,
            PathFilestatSetTimes { .. } => Opcode::PathFilestatSetTimes,
            PathLink { .. } => Opcode::PathLink,
            PathOpen { .. } => Opcode::PathOpen,
            PathReadlink { .. } => Opcode::PathReadlink,
            PathRemoveDirectory { .. } => Opcode::PathRemoveDirectory,
            PathRename { .. } => Opcode::PathRename,
            PathSymlink { .. } => Opcode::PathSymlink,
            PathUnlinkFile { .. } => Opcode::PathUnlinkFile,
        }
    }

    /// The descriptor whose dispatch loop is expected to execute this
    /// request (for double-fd operations, the frame lives in this fd's
    /// slot and only this fd's doorbell rings).
    pub fn driving_fd(&self) -> u32 {
        use Request::*;
        match *self {
            FdAdvise { fd }
            | FdClose { fd }
            | FdDatasync { fd }
            | FdFdstatGet { fd }
            | FdFilestatGet { fd }
            | FdPrestatGet { fd }
            | FdSync { fd }
            | FdTell { fd } => fd,
            FdAllocate { fd, .. }
            | FdFdstatSetFlags { fd, .. }
            | FdFdstatSetRights { fd, .. }
            | FdFilestatSetSize { fd, .. }
            | FdFilestatSetTimes { fd, .. }
            | FdPread { fd, .. }
            | FdPrestatDirName { fd, .. }
            | FdPwrite { fd, .. }
            | FdRead { fd, .. }
            | FdReaddir { fd, .. }
            | FdRenumber { fd, .. }
            | FdSeek { fd, .. }
            | FdWrite { fd, .. }
            | PathCreateDirectory { fd, .. }
            | PathFilestatGet { fd, .. }
            | PathFilestatSetTimes { fd, .. }
            | PathOpen { fd, .. }
            | PathReadlink { fd, .. }
            | PathRemoveDirectory { fd, .. }
            | PathSymlink { fd, .. }
            | PathUnlinkFile { fd, .. } => fd,
            PathLink { old_fd, .. } => old_fd,
            PathRename { old_fd, .. } => old_fd,
        }
    }

    pub fn encode(&self, frame: &Frame<'_>) {
        use Request::*;
        frame.set_u32(0, self.opcode() as u32);
        match *self {
            FdAdvise { fd } | FdClose { fd } | FdDatasync { fd } | FdFdstatGet { fd }
            | FdFilestatGet { fd } | FdPrestatGet { fd } | FdSync { fd } | FdTell { fd } => {
                frame.set_u32(1, fd);
            }
            FdAllocate { fd, offset, len } => {
                frame.set_u32(1, fd);
                frame.set_u64(1, offset);
                frame.set_u64(2, len);
            }
            FdFdstatSetFlags { fd, flags } => {
                frame.set_u32(1, fd);
                frame.set_u16(4, flags);
            }
            FdFdstatSetRights {
                fd,
                rights_base,
                rights_inheriting,
            } => {
                frame.set_u32(1, fd);
                frame.set_u64(1, rights_base);
                frame.set_u64(2, rights_inheriting);
            }
            FdFilestatSetSize { fd, size } => {
                frame.set_u32(1, fd);
                frame.set_u64(1, size);
            }
            FdFilestatSetTimes {
                fd,
                atim,
                mtim,
                fst_flags,
            } => {
                frame.set_u32(1, fd);
                frame.set_u64(1, atim);
                frame.set_u64(2, mtim);
                frame.set_u16(12, fst_flags);
            }
            FdPread { fd, iovs, offset } => {
                frame.set_u32(1, fd);
                frame.set_payload(2, iovs);
                frame.set_u64(2, offset);
            }
            FdPrestatDirName { fd, path_len } => {
                frame.set_u32(1, fd);
                frame.set_u32(2, path_len);
            }
            FdPwrite { fd, data, offset } => {
                frame.set_u32(1, fd);
                frame.set_payload(2, data);
                frame.set_u64(2, offset);
            }
            FdRead { fd, iovs } => {
                frame.set_u32(1, fd);
                frame.set_payload(2, iovs);
            }
            FdReaddir {
                fd,
                buf_len,
                cookie,
            } => {
                frame.set_u32(1, fd);
                frame.set_u32(2, buf_len);
                frame.set_u64(2, cookie);
            }
            FdRenumber { fd, to } => {
                frame.set_u32(1, fd);
                frame.set_u32(2, to);
            }
            FdSeek { fd, offset, whence } => {
                frame.set_u32(1, fd);
                frame.set_u64(1, offset as u64);
                frame.set_u8(16, whence);
            }
            FdWrite { fd, data } => {
                frame.set_u32(1, fd);
                frame.set_payload(2, data);
            }
            PathCreateDirectory { fd, path }
            | PathRemoveDirectory { fd, path }
            | PathUnlinkFile { fd, path } => {
                frame.set_u32(1, fd);
                frame.set_payload(2, path);
            }
            PathFilestatGet { fd, flags, path } => {
                frame.set_u32(1, fd);
                frame.set_u32(2, flags);
                frame.set_payload(3, path);
            }
            PathFilestatSetTimes {
                fd,
                flags,
                path,
                atim,
                mtim,
                fst_flags,
            } => {
                frame.set_u32(1, fd);
                frame.set_u32(2, flags);
                frame.set_payload(3, path);
                frame.set_u64(3, atim);
                frame.set_u64(4, mtim);
                // Half-word 26 (byte 52): the timestamps occupy bytes 24..40,
                // so the flags cannot share byte 24 the way opcode 16 lays
                // them out.
                frame.set_u16(26, fst_flags);
            }
            PathLink {
                old_fd,
                old_flags,
                old_path,
                new_fd,
                new_path,
            } => {
                frame.set_u32(1, old_fd);
                frame.set_u32(2, old_flags);
                frame.set_payload(3, old_path);
                frame.set_u32(5, new_fd);
                frame.set_payload(6, new_path);
            }
            PathOpen {
                fd,
                dirflags,
                path,
                oflags,
                rights_base,
                rights_inheriting,
                fdflags,
            } => {
                frame.set_u32(1, fd);
                frame.set_u32(2, dirflags);
                frame.set_payload(3, path);
                frame.set_u32(5, oflags);
                frame.set_u64(3, rights_base);
                frame.set_u64(4, rights_inheriting);
                frame.set_u16(20, fdflags);
            }
            PathReadlink { fd, path, buf_len } => {
                frame.set_u32(1, fd);
                frame.set_payload(2, path);
                frame.set_u32(4, buf_len);
            }
            PathRename {
                old_fd,
                old_path,
                new_fd,
                new_path,
            } => {
                frame.set_u32(1, old_fd);
                frame.set_payload(2, old_path);
                frame.set_u32(4, new_fd);
                frame.set_payload(5, new_path);
            }
            PathSymlink {
                old_path,
                fd,
                new_path,
            } => {
                frame.set_payload(1, old_path);
                frame.set_u32(3, fd);
                frame.set_payload(4, new_path);
            }
        }
    }

    pub fn decode(frame: &Frame<'_>) -> Result<Request, Error> {
        let opcode = Opcode::try_from(frame.u32(0))?;
        Ok(match opcode {
            Opcode::FdAdvise => Request::FdAdvise { fd: frame.u32(1) },
            Opcode::FdAllocate => Request::FdAllocate {
                fd: frame.u32(1),
                offset: frame.u64(1),
                len: frame.u64(2),
            },
            Opcode::FdClose => Request::FdClose { fd: frame.u32(1) },
            Opcode::FdDatasync => Request::FdDatasync { fd: frame.u32(1) },
            Opcode::FdFdstatGet => Request::FdFdstatGet { fd: frame.u32(1) },
            Opcode::FdFdstatSetFlags => Request::FdFdstatSetFlags {
                fd: frame.u32(1),
                flags: frame.u16(4),
            },
            Opcode::FdFdstatSetRights => Request::FdFdstatSetRights {
                fd: frame.u32(1),
                rights_base: frame.u64(1),
                rights_inheriting: frame.u64(2),
            },
            Opcode::FdFilestatGet => Request::FdFilestatGet { fd: frame.u32(1) },
            Opcode::FdFilestatSetSize => Request::FdFilestatSetSize {
                fd: frame.u32(1),
                size: frame.u64(1),
            },
            Opcode::FdFilestatSetTimes => Request::FdFilestatSetTimes {
                fd: frame.u32(1),
                atim: frame.u64(1),
                mtim: frame.u64(2),
                fst_flags: frame.u16(12),
            },
            Opcode::FdPread => Request::FdPread {
                fd: frame.u32(1),
                iovs: frame.payload(2),
                offset: frame.u64(2),
            },
            Opcode::FdPrestatGet => Request::FdPrestatGet { fd: frame.u32(1) },
            Opcode::FdPrestatDirName => Request::FdPrestatDirName {
                fd: frame.u32(1),
                path_len: frame.u32(2),
            },
            Opcode::FdPwrite => Request::FdPwrite {
                fd: frame.u32(1),
                data: frame.payload(2),
                offset: frame.u64(2),
            },
            Opcode::FdRead => Request::FdRead {
                fd: frame.u32(1),
                iovs: frame.payload(2),
            },
            Opcode::FdReaddir => Request::FdReaddir {
                fd: frame.u32(1),
                buf_len: frame.u32(2),
                cookie: frame.u64(2),
            },
            Opcode::FdRenumber => Request::FdRenumber {
                fd: frame.u32(1),
                to: frame.u32(2),
            },
            Opcode::FdSeek => Request::FdSeek {
                fd: frame.u32(1),
                offset: frame.u64(1) as i64,
                whence: frame.u8(16),
            },
            Opcode::FdSync => Request::FdSync { fd: frame.u32(1) },
            Opcode::FdTell => Request::FdTell { fd: frame.u32(1) },
            Opcode::FdWrite => Request::FdWrite {
                fd: frame.u32(1),
                data: frame.payload(2),
            },
            Opcode::PathCreateDirectory => Request::PathCreateDirectory {
                fd: frame.u32(1),
                path: frame.payload(2),
            },
            Opcode::PathFilestatGet => Request::PathFilestatGet {
                fd: frame.u32(1),
                flags: frame.u32(2),
                path: frame.payload(3),
            },
            Opcode::PathFilestatSetTimes => Request::PathFilestatSetTimes {
                fd: frame.u32(1),
                flags: frame.u32(2),
                path: frame.payload(3),
                atim: frame.u64(3),
                mtim: frame.u64(4),
                fst_flags: frame.u16(26),
            },
            Opcode::PathLink => Request::PathLink {
                old_fd: frame.u32(1),
                old_flags: frame.u32(2),
                old_path: frame.payload(3),
                new_fd: frame.u32(5),
                new_path: frame.payload(6),
            },
            Opcode::PathOpen => Request::PathOpen {
                fd: frame.u32(1),
                dirflags: frame.u32(2),
                path: frame.payload(3),
                oflags: frame.u32(5),
                rights_base: frame.u64(3),
                rights_inheriting: frame.u64(4),
                fdflags: frame.u16(20),
            },
            Opcode::PathReadlink => Request::PathReadlink {
                fd: frame.u32(1),
                path: frame.payload(2),
                buf_len: frame.u32(4),
            },
            Opcode::PathRemoveDirectory => Request::PathRemoveDirectory {
                fd: frame.u32(1),
                path: frame.payload(2),
            },
            Opcode::PathRename => Request::PathRename {
                old_fd: frame.u32(1),
                old_path: frame.payload(2),
                new_fd: frame.u32(4),
                new_path: frame.payload(5),
            },
            Opcode::PathSymlink => Request::PathSymlink {
                old_path: frame.payload(1),
                fd: frame.u32(3),
                new_path: frame.payload(4),
            },
            Opcode::PathUnlinkFile => Request::PathUnlinkFile {
                fd: frame.u32(1),
                path: frame.payload(2),
            },
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::shm::SharedRegion;

    fn region() -> SharedRegion {
        SharedRegion::new(SIG_WORDS * 4)
    }

    #[test]
    fn errno_slot_is_trailing_word() {
        let region = region();
        let frame = Frame::at(region.words(), 1);
        frame.set_errno(Errno::Badf);
        assert_eq!(
            region.word(SIG_WORDS + ERRNO_WORD).load(SeqCst),
            Errno::Badf.raw() as u32
        );
        frame.reset_errno();
        assert_eq!(frame.errno(), ERRNO_PENDING);
    }

    #[test]
    fn path_open_field_placement() {
        let region = region();
        let frame = Frame::at(region.words(), 0);
        Request::PathOpen {
            fd: 3,
            dirflags: 1,
            path: Payload { ptr: 12, len: 9 },
            oflags: 0b1001,
            rights_base: 0xdead_beef_cafe_f00d,
            rights_inheriting: 0x1122_3344_5566_7788,
            fdflags: 0b10001,
        }
        .encode(&frame);
        assert_eq!(frame.u32(0), 32);
        assert_eq!(frame.u32(1), 3);
        assert_eq!(frame.u32(2), 1);
        assert_eq!((frame.u32(3), frame.u32(4)), (12, 9));
        assert_eq!(frame.u32(5), 0b1001);
        // rights_base occupies words 6 and 7; fdflags the low half of word 10.
        assert_eq!(frame.u32(6), 0xcafe_f00d);
        assert_eq!(frame.u32(7), 0xdead_beef);
        assert_eq!(frame.u32(10) & 0xffff, 0b10001);
    }

    #[test]
    fn filestat_filetype_at_byte_16() {
        let region = region();
        let frame = Frame::at(region.words(), 0);
        frame.set_filestat(&Filestat {
            device_id: 1,
            inode: 2,
            filetype: FileType::Directory,
            nlink: 3,
            size: 4,
            atim: 5,
            mtim: 6,
            ctim: 7,
        });
        assert_eq!(frame.u8(16), u8::from(FileType::Directory));
        let stat = frame.filestat().unwrap();
        assert_eq!(stat.inode, 2);
        assert_eq!(stat.size, 4);
    }

    #[test]
    fn representative_round_trips() {
        let region = region();
        let frame = Frame::at(region.words(), 2);
        let requests = [
            Request::FdSeek {
                fd: 4,
                offset: -16,
                whence: 2,
            },
            Request::FdPread {
                fd: 9,
                iovs: Payload { ptr: 100, len: 16 },
                offset: 1 << 40,
            },
            Request::PathRename {
                old_fd: 3,
                old_path: Payload { ptr: 12, len: 2 },
                new_fd: 5,
                new_path: Payload { ptr: 14, len: 4 },
            },
        ];
        for request in requests {
            request.encode(&frame);
            assert_eq!(Request::decode(&frame).unwrap(), request);
        }
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let region = region();
        let frame = Frame::at(region.words(), 0);
        frame.set_u32(0, 99);
        assert!(matches!(
            Request::decode(&frame),
            Err(Error::UnknownOpcode(99))
        ));
    }
}
