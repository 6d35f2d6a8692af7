//! WASI value types shared by the capability trait and the wire codec.

use crate::{Error, ErrorExt};
use bitflags::bitflags;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum FileType {
    Unknown = 0,
    BlockDevice = 1,
    CharacterDevice = 2,
    Directory = 3,
    RegularFile = 4,
    SocketDgram = 5,
    SocketStream = 6,
    SymbolicLink = 7,
}

impl From<FileType> for u8 {
    fn from(ft: FileType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FileType {
    type Error = Error;
    fn try_from(raw: u8) -> Result<FileType, Error> {
        match raw {
            0 => Ok(FileType::Unknown),
            1 => Ok(FileType::BlockDevice),
            2 => Ok(FileType::CharacterDevice),
            3 => Ok(FileType::Directory),
            4 => Ok(FileType::RegularFile),
            5 => Ok(FileType::SocketDgram),
            6 => Ok(FileType::SocketStream),
            7 => Ok(FileType::SymbolicLink),
            _ => Err(Error::inval()),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Advice {
    Normal,
    Sequential,
    Random,
    WillNeed,
    DontNeed,
    NoReuse,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Whence {
    Set = 0,
    Cur = 1,
    End = 2,
}

impl TryFrom<u8> for Whence {
    type Error = Error;
    fn try_from(raw: u8) -> Result<Whence, Error> {
        match raw {
            0 => Ok(Whence::Set),
            1 => Ok(Whence::Cur),
            2 => Ok(Whence::End),
            _ => Err(Error::inval()),
        }
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct FdFlags: u16 {
        const APPEND   = 0b1;
        const DSYNC    = 0b10;
        const NONBLOCK = 0b100;
        const RSYNC    = 0b1000;
        const SYNC     = 0b10000;
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct OFlags: u32 {
        const CREATE    = 0b1;
        const DIRECTORY = 0b10;
        const EXCLUSIVE = 0b100;
        const TRUNCATE  = 0b1000;
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct LookupFlags: u32 {
        const SYMLINK_FOLLOW = 0b1;
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct FstFlags: u16 {
        const ATIM     = 0b1;
        const ATIM_NOW = 0b10;
        const MTIM     = 0b100;
        const MTIM_NOW = 0b1000;
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Rights: u64 {
        const FD_DATASYNC             = 1 << 0;
        const FD_READ                 = 1 << 1;
        const FD_SEEK                 = 1 << 2;
        const FD_FDSTAT_SET_FLAGS     = 1 << 3;
        const FD_SYNC                 = 1 << 4;
        const FD_TELL                 = 1 << 5;
        const FD_WRITE                = 1 << 6;
        const FD_ADVISE               = 1 << 7;
        const FD_ALLOCATE             = 1 << 8;
        const PATH_CREATE_DIRECTORY   = 1 << 9;
        const PATH_CREATE_FILE        = 1 << 10;
        const PATH_LINK_SOURCE        = 1 << 11;
        const PATH_LINK_TARGET        = 1 << 12;
        const PATH_OPEN               = 1 << 13;
        const FD_READDIR              = 1 << 14;
        const PATH_READLINK           = 1 << 15;
        const PATH_RENAME_SOURCE      = 1 << 16;
        const PATH_RENAME_TARGET      = 1 << 17;
        const PATH_FILESTAT_GET       = 1 << 18;
        const PATH_FILESTAT_SET_SIZE  = 1 << 19;
        const PATH_FILESTAT_SET_TIMES = 1 << 20;
        const FD_FILESTAT_GET         = 1 << 21;
        const FD_FILESTAT_SET_SIZE    = 1 << 22;
        const FD_FILESTAT_SET_TIMES   = 1 << 23;
        const PATH_SYMLINK            = 1 << 24;
        const PATH_REMOVE_DIRECTORY   = 1 << 25;
        const PATH_UNLINK_FILE        = 1 << 26;
        const POLL_FD_READWRITE       = 1 << 27;
        const SOCK_SHUTDOWN           = 1 << 28;
    }
}

impl Rights {
    /// Operations that apply to regular files.
    pub fn regular_file_base() -> Rights {
        Rights::FD_DATASYNC
            | Rights::FD_READ
            | Rights::FD_SEEK
            | Rights::FD_FDSTAT_SET_FLAGS
            | Rights::FD_SYNC
            | Rights::FD_TELL
            | Rights::FD_WRITE
            | Rights::FD_ADVISE
            | Rights::FD_ALLOCATE
            | Rights::FD_FILESTAT_GET
            | Rights::FD_FILESTAT_SET_SIZE
            | Rights::FD_FILESTAT_SET_TIMES
            | Rights::POLL_FD_READWRITE
    }

    /// Directories can only yield descriptors to other directories and files.
    pub fn directory_base() -> Rights {
        Rights::FD_FDSTAT_SET_FLAGS
            | Rights::FD_SYNC
            | Rights::FD_ADVISE
            | Rights::PATH_CREATE_DIRECTORY
            | Rights::PATH_CREATE_FILE
            | Rights::PATH_LINK_SOURCE
            | Rights::PATH_LINK_TARGET
            | Rights::PATH_OPEN
            | Rights::FD_READDIR
            | Rights::PATH_READLINK
            | Rights::PATH_RENAME_SOURCE
            | Rights::PATH_RENAME_TARGET
            | Rights::PATH_FILESTAT_GET
            | Rights::PATH_FILESTAT_SET_SIZE
            | Rights::PATH_FILESTAT_SET_TIMES
            | Rights::FD_FILESTAT_GET
            | Rights::FD_FILESTAT_SET_TIMES
            | Rights::PATH_SYMLINK
            | Rights::PATH_UNLINK_FILE
            | Rights::PATH_REMOVE_DIRECTORY
            | Rights::POLL_FD_READWRITE
    }

    pub fn directory_inheriting() -> Rights {
        Rights::directory_base() | Rights::regular_file_base()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fdstat {
    pub filetype: FileType,
    pub flags: FdFlags,
    pub rights_base: Rights,
    pub rights_inheriting: Rights,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filestat {
    pub device_id: u64,
    pub inode: u64,
    pub filetype: FileType,
    pub nlink: u64,
    pub size: u64,
    /// Access/modification/change times in nanoseconds since the epoch.
    pub atim: u64,
    pub mtim: u64,
    pub ctim: u64,
}

/// A preopened directory's advertisement: tag 0 plus the name length, with
/// the name bytes themselves fetched separately via `fd_prestat_dir_name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prestat {
    pub name_len: u32,
}

/// A guest scatter/gather element. The `buf` pointer is meaningful only in
/// the caller's address space; the dispatch side consumes the lengths.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Iovec {
    pub buf: u32,
    pub buf_len: u32,
}

#[derive(Debug, Clone)]
pub struct ReaddirEntity {
    pub next: ReaddirCursor,
    pub inode: u64,
    pub name: String,
    pub filetype: FileType,
}

#[derive(Debug, Copy, Clone)]
pub struct ReaddirCursor(u64);

impl From<u64> for ReaddirCursor {
    fn from(c: u64) -> ReaddirCursor {
        ReaddirCursor(c)
    }
}

impl From<ReaddirCursor> for u64 {
    fn from(c: ReaddirCursor) -> u64 {
        c.0
    }
}

/// Size of the fixed part of a serialized dirent: `d_next: u64, d_ino: u64,
/// d_namlen: u32, d_type: u8` plus three bytes of padding.
pub const DIRENT_HEADER_LEN: usize = 24;

/// Serialize one directory entry the way `fd_readdir` buffers expect.
pub fn dirent_bytes(entity: &ReaddirEntity) -> Vec<u8> {
    let name = entity.name.as_bytes();
    let mut out = Vec::with_capacity(DIRENT_HEADER_LEN + name.len());
    out.extend_from_slice(&u64::from(entity.next).to_le_bytes());
    out.extend_from_slice(&entity.inode.to_le_bytes());
    out.extend_from_slice(&(name.len() as u32).to_le_bytes());
    out.push(entity.filetype.into());
    out.extend_from_slice(&[0u8; 3]);
    out.extend_from_slice(name);
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dirent_layout() {
        let e = ReaddirEntity {
            next: 5.into(),
            inode: 7,
            name: "hello.txt".to_string(),
            filetype: FileType::RegularFile,
        };
        let bytes = dirent_bytes(&e);
        assert_eq!(bytes.len(), DIRENT_HEADER_LEN + 9);
        assert_eq!(&bytes[0..8], &5u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &7u64.to_le_bytes());
        assert_eq!(&bytes[16..20], &9u32.to_le_bytes());
        assert_eq!(bytes[20], u8::from(FileType::RegularFile));
        assert_eq!(&bytes[DIRENT_HEADER_LEN..], b"hello.txt");
    }
}
