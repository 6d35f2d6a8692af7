use crate::fd::WasiFd;
use crate::{Error, ErrorExt};
use std::sync::{Arc, RwLock};

/// One occupied slot: the capability plus, for preopens, the advertised name.
#[derive(Clone)]
pub struct FdEntry {
    pub fd: Arc<dyn WasiFd>,
    pub preopen: Option<String>,
}

impl FdEntry {
    pub fn new(fd: Arc<dyn WasiFd>) -> Self {
        FdEntry { fd, preopen: None }
    }

    pub fn preopen(fd: Arc<dyn WasiFd>, name: impl Into<String>) -> Self {
        FdEntry {
            fd,
            preopen: Some(name.into()),
        }
    }
}

/// The descriptor table: an arena of `Option<FdEntry>` slots indexed by fd
/// number. Slots are appended by `path_open` and vacated by `fd_close`; a
/// vacated slot stays empty (its dispatch loop keeps answering `Badf`), so
/// an index never changes meaning behind a caller's back except through the
/// explicit `renumber` operation.
pub struct FdTable {
    slots: RwLock<Vec<Option<FdEntry>>>,
    capacity: usize,
}

impl FdTable {
    pub fn new(entries: Vec<FdEntry>, capacity: usize) -> Self {
        FdTable {
            slots: RwLock::new(entries.into_iter().map(Some).collect()),
            capacity,
        }
    }

    /// Number of slots ever occupied (the append cursor). The matching count
    /// of dispatch loops is published to Refs separately.
    pub fn len(&self) -> usize {
        self.slots.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, fd: u32) -> Result<FdEntry, Error> {
        self.slots
            .read()
            .unwrap()
            .get(fd as usize)
            .and_then(|slot| slot.clone())
            .ok_or_else(Error::badf)
    }

    pub fn contains(&self, fd: u32) -> bool {
        matches!(self.slots.read().unwrap().get(fd as usize), Some(Some(_)))
    }

    /// Append a new entry, returning its index.
    pub fn push(&self, entry: FdEntry) -> Result<u32, Error> {
        let mut slots = self.slots.write().unwrap();
        if slots.len() >= self.capacity {
            return Err(Error::too_many_files());
        }
        slots.push(Some(entry));
        Ok((slots.len() - 1) as u32)
    }

    /// Vacate a slot, returning the entry that occupied it.
    pub fn remove(&self, fd: u32) -> Result<FdEntry, Error> {
        self.slots
            .write()
            .unwrap()
            .get_mut(fd as usize)
            .and_then(|slot| slot.take())
            .ok_or_else(Error::badf)
    }

    /// Move `from`'s entry into slot `to`, dropping whatever occupied `to`.
    /// `to` must name a slot whose dispatch loop exists.
    pub fn renumber(&self, from: u32, to: u32) -> Result<(), Error> {
        let mut slots = self.slots.write().unwrap();
        if to as usize >= slots.len() {
            return Err(Error::badf());
        }
        let entry = slots
            .get_mut(from as usize)
            .and_then(|slot| slot.take())
            .ok_or_else(Error::badf)?;
        slots[to as usize] = Some(entry);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::FileType;

    struct NullFd;
    impl WasiFd for NullFd {
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
        fn filetype(&self) -> Result<FileType, Error> {
            Ok(FileType::Unknown)
        }
    }

    fn entry() -> FdEntry {
        FdEntry::new(Arc::new(NullFd))
    }

    #[test]
    fn push_appends_past_closed_slots() {
        let table = FdTable::new(vec![entry(), entry()], 8);
        assert!(table.remove(0).is_ok());
        let fd = table.push(entry()).unwrap();
        assert_eq!(fd, 2);
        assert!(!table.contains(0));
        assert!(table.get(0).is_err());
    }

    #[test]
    fn renumber_moves_and_vacates() {
        let table = FdTable::new(vec![entry(), entry(), entry()], 8);
        table.renumber(0, 2).unwrap();
        assert!(!table.contains(0));
        assert!(table.contains(2));
        // Renumbering to an index with no dispatch loop is refused.
        assert!(table.renumber(1, 7).is_err());
    }

    #[test]
    fn capacity_is_enforced() {
        let table = FdTable::new(vec![entry()], 1);
        assert!(table.push(entry()).is_err());
    }
}
