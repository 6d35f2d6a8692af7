//! The per-descriptor capability consumed by the dispatch loops.

use crate::types::{
    Advice, FdFlags, Fdstat, FileType, Filestat, FstFlags, LookupFlags, OFlags, ReaddirCursor,
    ReaddirEntity, Rights, Whence,
};
use crate::{Error, ErrorExt};
use std::any::Any;

/// One slot of the shared descriptor table.
///
/// The wire protocol addresses a single capability per descriptor, so file
/// and directory operations live on one trait; implementations answer
/// `Err(Error::badf())` (or `not_supported`) for the operations that do not
/// apply to their kind, which is also what every default below does.
///
/// All operations are synchronous: each live descriptor has a dedicated
/// dispatch thread, and a call holds that descriptor's mutex for its whole
/// duration, so there is no executor to yield to.
pub trait WasiFd: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn filetype(&self) -> Result<FileType, Error>;

    fn fdstat_get(&self) -> Result<Fdstat, Error> {
        Ok(Fdstat {
            filetype: self.filetype()?,
            flags: FdFlags::empty(),
            rights_base: Rights::empty(),
            rights_inheriting: Rights::empty(),
        })
    }

    fn fdstat_set_flags(&self, _flags: FdFlags) -> Result<(), Error> {
        Err(Error::badf())
    }

    fn fdstat_set_rights(&self, _base: Rights, _inheriting: Rights) -> Result<(), Error> {
        Ok(())
    }

    fn advise(&self, _offset: u64, _len: u64, _advice: Advice) -> Result<(), Error> {
        Ok(())
    }

    fn allocate(&self, _offset: u64, _len: u64) -> Result<(), Error> {
        Err(Error::badf())
    }

    fn datasync(&self) -> Result<(), Error> {
        Ok(())
    }

    fn sync(&self) -> Result<(), Error> {
        Ok(())
    }

    fn filestat_get(&self) -> Result<Filestat, Error> {
        Ok(Filestat {
            device_id: 0,
            inode: 0,
            filetype: self.filetype()?,
            nlink: 0,
            size: 0,
            atim: 0,
            mtim: 0,
            ctim: 0,
        })
    }

    fn filestat_set_size(&self, _size: u64) -> Result<(), Error> {
        Err(Error::badf())
    }

    fn filestat_set_times(&self, _atim: u64, _mtim: u64, _flags: FstFlags) -> Result<(), Error> {
        Err(Error::badf())
    }

    /// Read up to `len` bytes at the current position. Returning fewer bytes
    /// than requested ends the caller's scatter loop.
    fn read(&self, _len: usize) -> Result<Vec<u8>, Error> {
        Err(Error::badf())
    }

    fn pread(&self, _len: usize, _offset: u64) -> Result<Vec<u8>, Error> {
        Err(Error::badf())
    }

    fn write(&self, _buf: &[u8]) -> Result<u64, Error> {
        Err(Error::badf())
    }

    fn pwrite(&self, _buf: &[u8], _offset: u64) -> Result<u64, Error> {
        Err(Error::badf())
    }

    fn seek(&self, _offset: i64, _whence: Whence) -> Result<u64, Error> {
        Err(Error::badf())
    }

    fn tell(&self) -> Result<u64, Error> {
        Err(Error::badf())
    }

    fn readdir(
        &self,
        _cursor: ReaddirCursor,
    ) -> Result<Box<dyn Iterator<Item = Result<ReaddirEntity, Error>> + '_>, Error> {
        Err(Error::notdir())
    }

    fn open_at(
        &self,
        _lookup: LookupFlags,
        _path: &str,
        _oflags: OFlags,
        _rights_base: Rights,
        _rights_inheriting: Rights,
        _fdflags: FdFlags,
    ) -> Result<Box<dyn WasiFd>, Error> {
        Err(Error::notdir())
    }

    fn create_directory(&self, _path: &str) -> Result<(), Error> {
        Err(Error::notdir())
    }

    fn path_filestat_get(&self, _lookup: LookupFlags, _path: &str) -> Result<Filestat, Error> {
        Err(Error::notdir())
    }

    fn path_filestat_set_times(
        &self,
        _lookup: LookupFlags,
        _path: &str,
        _atim: u64,
        _mtim: u64,
        _flags: FstFlags,
    ) -> Result<(), Error> {
        Err(Error::notdir())
    }

    /// Create a hard link at `new_path` under `target_dir`, pointing at
    /// `old_path` resolved under `self`.
    fn hard_link(
        &self,
        _old_path: &str,
        _target_dir: &dyn WasiFd,
        _new_path: &str,
    ) -> Result<(), Error> {
        Err(Error::notdir())
    }

    fn rename(&self, _old_path: &str, _dest_dir: &dyn WasiFd, _new_path: &str) -> Result<(), Error> {
        Err(Error::notdir())
    }

    fn read_link(&self, _path: &str) -> Result<Vec<u8>, Error> {
        Err(Error::notdir())
    }

    fn remove_directory(&self, _path: &str) -> Result<(), Error> {
        Err(Error::notdir())
    }

    fn unlink_file(&self, _path: &str) -> Result<(), Error> {
        Err(Error::notdir())
    }
}
