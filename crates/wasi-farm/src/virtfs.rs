//! An in-memory fd capability.
//!
//! Directories are name→node maps, files are byte vectors; nodes are
//! reference-counted so hard links share content. This is the backend the
//! integration tests mount, and a usable default for farms that have no host
//! filesystem at all.
//!
//! Path rules: components are `/`-separated, `.` is skipped, and `..` or
//! absolute paths are refused with `Notcapable` (a preopen is a sandbox
//! root). There are no symlinks, so `path_readlink` answers `Inval` and the
//! lookup flags are accepted but moot.

use crate::error::Errno;
use crate::fd::WasiFd;
use crate::types::{
    FdFlags, Fdstat, FileType, Filestat, FstFlags, LookupFlags, OFlags, ReaddirCursor,
    ReaddirEntity, Rights, Whence,
};
use crate::{Error, ErrorExt};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

static NEXT_INODE: AtomicU64 = AtomicU64::new(1);

fn next_inode() -> u64 {
    NEXT_INODE.fetch_add(1, Relaxed)
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy)]
struct Timestamps {
    atim: u64,
    mtim: u64,
    ctim: u64,
}

impl Timestamps {
    fn new() -> Timestamps {
        let now = now_ns();
        Timestamps {
            atim: now,
            mtim: now,
            ctim: now,
        }
    }

    fn set(&mut self, atim: u64, mtim: u64, flags: FstFlags) -> Result<(), Error> {
        if flags.contains(FstFlags::ATIM) && flags.contains(FstFlags::ATIM_NOW)
            || flags.contains(FstFlags::MTIM) && flags.contains(FstFlags::MTIM_NOW)
        {
            return Err(Error::inval());
        }
        if flags.contains(FstFlags::ATIM) {
            self.atim = atim;
        }
        if flags.contains(FstFlags::ATIM_NOW) {
            self.atim = now_ns();
        }
        if flags.contains(FstFlags::MTIM) {
            self.mtim = mtim;
        }
        if flags.contains(FstFlags::MTIM_NOW) {
            self.mtim = now_ns();
        }
        self.ctim = now_ns();
        Ok(())
    }
}

struct FileNode {
    inode: u64,
    times: Mutex<Timestamps>,
    content: RwLock<Vec<u8>>,
}

struct DirNode {
    inode: u64,
    times: Mutex<Timestamps>,
    entries: RwLock<BTreeMap<String, Node>>,
}

#[derive(Clone)]
enum Node {
    Dir(Arc<DirNode>),
    File(Arc<FileNode>),
}

impl Node {
    fn filetype(&self) -> FileType {
        match self {
            Node::Dir(_) => FileType::Directory,
            Node::File(_) => FileType::RegularFile,
        }
    }

    fn filestat(&self) -> Filestat {
        match self {
            Node::Dir(dir) => {
                let times = dir.times.lock().unwrap();
                Filestat {
                    device_id: 0,
                    inode: dir.inode,
                    filetype: FileType::Directory,
                    nlink: 1,
                    size: 0,
                    atim: times.atim,
                    mtim: times.mtim,
                    ctim: times.ctim,
                }
            }
            Node::File(file) => {
                let times = file.times.lock().unwrap();
                Filestat {
                    device_id: 0,
                    inode: file.inode,
                    filetype: FileType::RegularFile,
                    nlink: 1,
                    size: file.content.read().unwrap().len() as u64,
                    atim: times.atim,
                    mtim: times.mtim,
                    ctim: times.ctim,
                }
            }
        }
    }
}

/// A directory descriptor over the in-memory tree. Cloning shares the node.
#[derive(Clone)]
pub struct VirtDir {
    node: Arc<DirNode>,
}

impl VirtDir {
    pub fn new() -> VirtDir {
        VirtDir {
            node: Arc::new(DirNode {
                inode: next_inode(),
                times: Mutex::new(Timestamps::new()),
                entries: RwLock::new(BTreeMap::new()),
            }),
        }
    }

    /// Create (or replace) a file directly under this directory.
    pub fn put_file(&self, name: &str, content: &[u8]) -> Result<(), Error> {
        validate_component(name)?;
        let node = Node::File(Arc::new(FileNode {
            inode: next_inode(),
            times: Mutex::new(Timestamps::new()),
            content: RwLock::new(content.to_vec()),
        }));
        self.node
            .entries
            .write()
            .unwrap()
            .insert(name.to_string(), node);
        Ok(())
    }

    /// Create a subdirectory and return a descriptor for it.
    pub fn put_dir(&self, name: &str) -> Result<VirtDir, Error> {
        validate_component(name)?;
        let dir = VirtDir::new();
        self.node
            .entries
            .write()
            .unwrap()
            .insert(name.to_string(), Node::Dir(dir.node.clone()));
        Ok(dir)
    }

    fn lookup(&self, path: &str) -> Result<Node, Error> {
        let (parent, name) = self.resolve_parent(path)?;
        match name {
            None => Ok(Node::Dir(parent)),
            Some(name) => parent
                .entries
                .read()
                .unwrap()
                .get(&name)
                .cloned()
                .ok_or_else(Error::noent),
        }
    }

    /// Walk to the parent of `path`'s final component. A path that resolves
    /// to this directory itself yields `None` for the component.
    fn resolve_parent(&self, path: &str) -> Result<(Arc<DirNode>, Option<String>), Error> {
        if path.starts_with('/') {
            return Err(Errno::Notcapable.into());
        }
        let mut components = Vec::new();
        for component in path.split('/') {
            match component {
                "" | "." => continue,
                ".." => return Err(Errno::Notcapable.into()),
                other => components.push(other),
            }
        }
        let Some((last, dirs)) = components.split_last() else {
            return Ok((self.node.clone(), None));
        };
        let mut current = self.node.clone();
        for component in dirs {
            let next = current
                .entries
                .read()
                .unwrap()
                .get(*component)
                .cloned()
                .ok_or_else(Error::noent)?;
            current = match next {
                Node::Dir(dir) => dir,
                Node::File(_) => return Err(Error::notdir()),
            };
        }
        Ok((current, Some(last.to_string())))
    }
}

impl Default for VirtDir {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_component(name: &str) -> Result<(), Error> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(Error::inval());
    }
    Ok(())
}

impl WasiFd for VirtDir {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn filetype(&self) -> Result<FileType, Error> {
        Ok(FileType::Directory)
    }

    fn fdstat_get(&self) -> Result<Fdstat, Error> {
        Ok(Fdstat {
            filetype: FileType::Directory,
            flags: FdFlags::empty(),
            rights_base: Rights::directory_base(),
            rights_inheriting: Rights::directory_inheriting(),
        })
    }

    fn filestat_get(&self) -> Result<Filestat, Error> {
        Ok(Node::Dir(self.node.clone()).filestat())
    }

    fn filestat_set_times(&self, atim: u64, mtim: u64, flags: FstFlags) -> Result<(), Error> {
        self.node.times.lock().unwrap().set(atim, mtim, flags)
    }

    fn readdir(
        &self,
        cursor: ReaddirCursor,
    ) -> Result<Box<dyn Iterator<Item = Result<ReaddirEntity, Error>> + '_>, Error> {
        let mut entities = vec![
            ReaddirEntity {
                next: 1.into(),
                inode: self.node.inode,
                name: ".".to_string(),
                filetype: FileType::Directory,
            },
            ReaddirEntity {
                next: 2.into(),
                inode: self.node.inode,
                name: "..".to_string(),
                filetype: FileType::Directory,
            },
        ];
        for (name, node) in self.node.entries.read().unwrap().iter() {
            let next = entities.len() as u64 + 1;
            entities.push(ReaddirEntity {
                next: next.into(),
                inode: match node {
                    Node::Dir(d) => d.inode,
                    Node::File(f) => f.inode,
                },
                name: name.clone(),
                filetype: node.filetype(),
            });
        }
        let start = u64::from(cursor) as usize;
        Ok(Box::new(entities.into_iter().skip(start).map(Ok)))
    }

    fn open_at(
        &self,
        _lookup: LookupFlags,
        path: &str,
        oflags: OFlags,
        rights_base: Rights,
        _rights_inheriting: Rights,
        fdflags: FdFlags,
    ) -> Result<Box<dyn WasiFd>, Error> {
        let (parent, name) = self.resolve_parent(path)?;
        let Some(name) = name else {
            // The path resolved to this directory itself.
            if oflags.contains(OFlags::CREATE) || oflags.contains(OFlags::EXCLUSIVE) {
                return Err(Error::exist());
            }
            return Ok(Box::new(VirtDir {
                node: self.node.clone(),
            }));
        };
        let existing = parent.entries.read().unwrap().get(&name).cloned();
        match existing {
            Some(Node::Dir(dir)) => {
                if oflags.contains(OFlags::CREATE) && oflags.contains(OFlags::EXCLUSIVE) {
                    return Err(Error::exist());
                }
                if oflags.contains(OFlags::TRUNCATE) {
                    return Err(Error::isdir());
                }
                Ok(Box::new(VirtDir { node: dir }))
            }
            Some(Node::File(file)) => {
                if oflags.contains(OFlags::CREATE) && oflags.contains(OFlags::EXCLUSIVE) {
                    return Err(Error::exist());
                }
                if oflags.contains(OFlags::DIRECTORY) {
                    return Err(Error::notdir());
                }
                let write = rights_base.contains(Rights::FD_WRITE);
                if oflags.contains(OFlags::TRUNCATE) {
                    if !write {
                        return Err(Error::perm());
                    }
                    file.content.write().unwrap().clear();
                }
                Ok(Box::new(VirtFile::open(file, rights_base, fdflags)))
            }
            None => {
                if !oflags.contains(OFlags::CREATE) {
                    return Err(Error::noent());
                }
                if oflags.contains(OFlags::DIRECTORY) {
                    return Err(Error::inval());
                }
                let file = Arc::new(FileNode {
                    inode: next_inode(),
                    times: Mutex::new(Timestamps::new()),
                    content: RwLock::new(Vec::new()),
                });
                parent
                    .entries
                    .write()
                    .unwrap()
                    .insert(name, Node::File(file.clone()));
                Ok(Box::new(VirtFile::open(file, rights_base, fdflags)))
            }
        }
    }

    fn create_directory(&self, path: &str) -> Result<(), Error> {
        let (parent, name) = self.resolve_parent(path)?;
        let name = name.ok_or_else(Error::exist)?;
        let mut entries = parent.entries.write().unwrap();
        if entries.contains_key(&name) {
            return Err(Error::exist());
        }
        entries.insert(
            name,
            Node::Dir(Arc::new(DirNode {
                inode: next_inode(),
                times: Mutex::new(Timestamps::new()),
                entries: RwLock::new(BTreeMap::new()),
            })),
        );
        Ok(())
    }

    fn path_filestat_get(&self, _lookup: LookupFlags, path: &str) -> Result<Filestat, Error> {
        Ok(self.lookup(path)?.filestat())
    }

    fn path_filestat_set_times(
        &self,
        _lookup: LookupFlags,
        path: &str,
        atim: u64,
        mtim: u64,
        flags: FstFlags,
    ) -> Result<(), Error> {
        match self.lookup(path)? {
            Node::Dir(dir) => dir.times.lock().unwrap().set(atim, mtim, flags),
            Node::File(file) => file.times.lock().unwrap().set(atim, mtim, flags),
        }
    }

    fn hard_link(
        &self,
        old_path: &str,
        target_dir: &dyn WasiFd,
        new_path: &str,
    ) -> Result<(), Error> {
        let target = target_dir
            .as_any()
            .downcast_ref::<VirtDir>()
            .ok_or_else(|| Error::from(Errno::Xdev))?;
        let file = match self.lookup(old_path)? {
            Node::File(file) => file,
            Node::Dir(_) => return Err(Error::perm()),
        };
        let (parent, name) = target.resolve_parent(new_path)?;
        let name = name.ok_or_else(Error::exist)?;
        let mut entries = parent.entries.write().unwrap();
        if entries.contains_key(&name) {
            return Err(Error::exist());
        }
        entries.insert(name, Node::File(file));
        Ok(())
    }

    fn rename(&self, old_path: &str, dest_dir: &dyn WasiFd, new_path: &str) -> Result<(), Error> {
        let dest = dest_dir
            .as_any()
            .downcast_ref::<VirtDir>()
            .ok_or_else(|| Error::from(Errno::Xdev))?;
        let (old_parent, old_name) = self.resolve_parent(old_path)?;
        let old_name = old_name.ok_or_else(Error::inval)?;
        let (new_parent, new_name) = dest.resolve_parent(new_path)?;
        let new_name = new_name.ok_or_else(Error::inval)?;

        // Unlink, then link; put the old entry back if the link is refused.
        let node = old_parent
            .entries
            .write()
            .unwrap()
            .remove(&old_name)
            .ok_or_else(Error::noent)?;
        let replaced = {
            let mut entries = new_parent.entries.write().unwrap();
            match entries.get(&new_name) {
                Some(Node::Dir(dir)) if !dir.entries.read().unwrap().is_empty() => {
                    Err(Error::notempty())
                }
                Some(Node::Dir(_)) if matches!(node, Node::File(_)) => Err(Error::isdir()),
                Some(Node::File(_)) if matches!(node, Node::Dir(_)) => Err(Error::notdir()),
                _ => {
                    entries.insert(new_name.clone(), node.clone());
                    Ok(())
                }
            }
        };
        if let Err(e) = replaced {
            old_parent
                .entries
                .write()
                .unwrap()
                .insert(old_name, node);
            return Err(e);
        }
        Ok(())
    }

    fn read_link(&self, path: &str) -> Result<Vec<u8>, Error> {
        // No symlinks in this tree: anything that resolves is not a link.
        self.lookup(path)?;
        Err(Error::inval())
    }

    fn remove_directory(&self, path: &str) -> Result<(), Error> {
        let (parent, name) = self.resolve_parent(path)?;
        let name = name.ok_or_else(Error::inval)?;
        let mut entries = parent.entries.write().unwrap();
        match entries.get(&name) {
            Some(Node::Dir(dir)) => {
                if !dir.entries.read().unwrap().is_empty() {
                    return Err(Error::notempty());
                }
            }
            Some(Node::File(_)) => return Err(Error::notdir()),
            None => return Err(Error::noent()),
        }
        entries.remove(&name);
        Ok(())
    }

    fn unlink_file(&self, path: &str) -> Result<(), Error> {
        let (parent, name) = self.resolve_parent(path)?;
        let name = name.ok_or_else(Error::inval)?;
        let mut entries = parent.entries.write().unwrap();
        match entries.get(&name) {
            Some(Node::File(_)) => {
                entries.remove(&name);
                Ok(())
            }
            Some(Node::Dir(_)) => Err(Error::isdir()),
            None => Err(Error::noent()),
        }
    }
}

/// An open regular file: shared content node plus this handle's position and
/// flags.
pub struct VirtFile {
    node: Arc<FileNode>,
    pos: Mutex<u64>,
    flags: Mutex<FdFlags>,
    read: bool,
    write: bool,
}

impl VirtFile {
    fn open(node: Arc<FileNode>, rights: Rights, flags: FdFlags) -> VirtFile {
        VirtFile {
            node,
            pos: Mutex::new(0),
            flags: Mutex::new(flags),
            read: rights.contains(Rights::FD_READ),
            write: rights.contains(Rights::FD_WRITE),
        }
    }

    fn read_at(&self, len: usize, offset: u64) -> Vec<u8> {
        let content = self.node.content.read().unwrap();
        let start = (offset as usize).min(content.len());
        let end = start.saturating_add(len).min(content.len());
        content[start..end].to_vec()
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> u64 {
        let mut content = self.node.content.write().unwrap();
        let offset = offset as usize;
        if content.len() < offset + buf.len() {
            content.resize(offset + buf.len(), 0);
        }
        content[offset..offset + buf.len()].copy_from_slice(buf);
        self.node.times.lock().unwrap().mtim = now_ns();
        buf.len() as u64
    }
}

impl WasiFd for VirtFile {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn filetype(&self) -> Result<FileType, Error> {
        Ok(FileType::RegularFile)
    }

    fn fdstat_get(&self) -> Result<Fdstat, Error> {
        Ok(Fdstat {
            filetype: FileType::RegularFile,
            flags: *self.flags.lock().unwrap(),
            rights_base: Rights::regular_file_base(),
            rights_inheriting: Rights::empty(),
        })
    }

    fn fdstat_set_flags(&self, flags: FdFlags) -> Result<(), Error> {
        *self.flags.lock().unwrap() = flags;
        Ok(())
    }

    fn advise(&self, _offset: u64, _len: u64, _advice: crate::types::Advice) -> Result<(), Error> {
        Ok(())
    }

    fn allocate(&self, offset: u64, len: u64) -> Result<(), Error> {
        if !self.write {
            return Err(Error::perm());
        }
        let want = offset
            .checked_add(len)
            .ok_or_else(Error::overflow)? as usize;
        let mut content = self.node.content.write().unwrap();
        if content.len() < want {
            content.resize(want, 0);
        }
        Ok(())
    }

    fn filestat_get(&self) -> Result<Filestat, Error> {
        Ok(Node::File(self.node.clone()).filestat())
    }

    fn filestat_set_size(&self, size: u64) -> Result<(), Error> {
        if !self.write {
            return Err(Error::perm());
        }
        self.node.content.write().unwrap().resize(size as usize, 0);
        Ok(())
    }

    fn filestat_set_times(&self, atim: u64, mtim: u64, flags: FstFlags) -> Result<(), Error> {
        self.node.times.lock().unwrap().set(atim, mtim, flags)
    }

    fn read(&self, len: usize) -> Result<Vec<u8>, Error> {
        if !self.read {
            return Err(Error::perm());
        }
        let mut pos = self.pos.lock().unwrap();
        let out = self.read_at(len, *pos);
        *pos += out.len() as u64;
        Ok(out)
    }

    fn pread(&self, len: usize, offset: u64) -> Result<Vec<u8>, Error> {
        if !self.read {
            return Err(Error::perm());
        }
        Ok(self.read_at(len, offset))
    }

    fn write(&self, buf: &[u8]) -> Result<u64, Error> {
        if !self.write {
            return Err(Error::perm());
        }
        let mut pos = self.pos.lock().unwrap();
        let at = if self.flags.lock().unwrap().contains(FdFlags::APPEND) {
            self.node.content.read().unwrap().len() as u64
        } else {
            *pos
        };
        let written = self.write_at(buf, at);
        *pos = at + written;
        Ok(written)
    }

    fn pwrite(&self, buf: &[u8], offset: u64) -> Result<u64, Error> {
        if !self.write {
            return Err(Error::perm());
        }
        Ok(self.write_at(buf, offset))
    }

    fn seek(&self, offset: i64, whence: Whence) -> Result<u64, Error> {
        let mut pos = self.pos.lock().unwrap();
        let base = match whence {
            Whence::Set => 0i64,
            Whence::Cur => *pos as i64,
            Whence::End => self.node.content.read().unwrap().len() as i64,
        };
        let target = base.checked_add(offset).ok_or_else(Error::overflow)?;
        if target < 0 {
            return Err(Error::inval());
        }
        *pos = target as u64;
        Ok(*pos)
    }

    fn tell(&self) -> Result<u64, Error> {
        Ok(*self.pos.lock().unwrap())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn open(
        dir: &VirtDir,
        path: &str,
        oflags: OFlags,
    ) -> Result<Box<dyn WasiFd>, Error> {
        dir.open_at(
            LookupFlags::empty(),
            path,
            oflags,
            Rights::FD_READ | Rights::FD_WRITE,
            Rights::empty(),
            FdFlags::empty(),
        )
    }

    #[test]
    fn write_then_read_back() {
        let root = VirtDir::new();
        let file = open(&root, "a.txt", OFlags::CREATE).unwrap();
        assert_eq!(file.write(b"farm").unwrap(), 4);
        assert_eq!(file.seek(0, Whence::Set).unwrap(), 0);
        assert_eq!(file.read(16).unwrap(), b"farm");
        assert_eq!(file.tell().unwrap(), 4);
    }

    #[test]
    fn two_handles_share_content() {
        let root = VirtDir::new();
        root.put_file("shared", b"abc").unwrap();
        let a = open(&root, "shared", OFlags::empty()).unwrap();
        let b = open(&root, "shared", OFlags::empty()).unwrap();
        a.pwrite(b"xyz", 3).unwrap();
        assert_eq!(b.pread(6, 0).unwrap(), b"abcxyz");
    }

    #[test]
    fn nested_paths_resolve() {
        let root = VirtDir::new();
        let sub = root.put_dir("sub").unwrap();
        sub.put_file("deep.txt", b"d").unwrap();
        assert_eq!(
            root.path_filestat_get(LookupFlags::empty(), "sub/deep.txt")
                .unwrap()
                .filetype,
            FileType::RegularFile
        );
        assert!(matches!(
            root.lookup("sub/missing"),
            Err(Error::Errno(Errno::Noent))
        ));
    }

    #[test]
    fn sandbox_escapes_are_refused() {
        let root = VirtDir::new();
        assert!(matches!(
            root.lookup("../etc"),
            Err(Error::Errno(Errno::Notcapable))
        ));
        assert!(matches!(
            root.lookup("/abs"),
            Err(Error::Errno(Errno::Notcapable))
        ));
    }

    #[test]
    fn hard_links_share_and_rename_rolls_back() {
        let root = VirtDir::new();
        root.put_file("orig", b"1").unwrap();
        root.hard_link("orig", &root, "link").unwrap();
        let link = open(&root, "link", OFlags::empty()).unwrap();
        assert_eq!(link.pread(1, 0).unwrap(), b"1");

        // A rename onto a non-empty directory fails and leaves the source.
        let blocker = root.put_dir("busy").unwrap();
        blocker.put_file("x", b"x").unwrap();
        assert!(root.rename("orig", &root, "busy").is_err());
        assert!(root.lookup("orig").is_ok());

        root.rename("orig", &root, "moved").unwrap();
        assert!(root.lookup("orig").is_err());
        assert!(root.lookup("moved").is_ok());
    }

    #[test]
    fn readdir_walks_dot_entries_then_names() {
        let root = VirtDir::new();
        root.put_file("b", b"").unwrap();
        root.put_file("a", b"").unwrap();
        let names: Vec<String> = root
            .readdir(0.into())
            .unwrap()
            .map(|e| e.unwrap().name)
            .collect();
        assert_eq!(names, vec![".", "..", "a", "b"]);
        let resumed: Vec<String> = root
            .readdir(3.into())
            .unwrap()
            .map(|e| e.unwrap().name)
            .collect();
        assert_eq!(resumed, vec!["b"]);
    }

    #[test]
    fn remove_directory_requires_empty() {
        let root = VirtDir::new();
        let sub = root.put_dir("sub").unwrap();
        sub.put_file("f", b"").unwrap();
        assert!(matches!(
            root.remove_directory("sub"),
            Err(Error::Errno(Errno::Notempty))
        ));
        sub.unlink_file("f").unwrap();
        root.remove_directory("sub").unwrap();
        assert!(root.lookup("sub").is_err());
    }
}
