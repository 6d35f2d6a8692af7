//! The shared payload arena.
//!
//! Variable-length operands (paths, write buffers, iovec arrays, dirent
//! buffers) move between threads through one bump-allocated region guarded
//! by a single lock word. The header is three words: `[lock, live, tail]`.
//! `free` only decrements `live`; space is reclaimed in bulk by the next
//! `block_write` that observes `live` rising from zero, which resets `tail`
//! to the base offset. That is sound because every call is synchronous
//! end-to-end: a payload's lifetime is contained within its call, so once
//! no payloads are live the whole region is dead.
//!
//! Each allocation is paired with exactly one decrement. To keep that true
//! on error paths, `block_write` hands back a [`Lease`] that frees on drop;
//! a lease whose payload must outlive the local scope (an output consumed
//! by the far side) is surrendered with [`Lease::release`].

use crate::error::{Error, Result};
use crate::shm::SharedRegion;
use crate::wait::{WaitQueue, WaitResult};
use crate::wire::Payload;
use std::sync::atomic::Ordering::SeqCst;
use std::time::Duration;
use tracing::error;

const LOCK_WORD: usize = 0;
const LIVE_WORD: usize = 1;
const TAIL_WORD: usize = 2;
/// First usable byte offset, just past the header words.
pub const ARENA_BASE: u32 = 12;

pub struct Arena {
    region: SharedRegion,
    wait_timeout: Duration,
}

impl Arena {
    pub fn new(capacity_bytes: usize, wait_timeout: Duration) -> Arena {
        let arena = Arena {
            region: SharedRegion::new((capacity_bytes + 3) / 4),
            wait_timeout,
        };
        arena.region.word(TAIL_WORD).store(ARENA_BASE, SeqCst);
        arena
    }

    pub fn capacity(&self) -> usize {
        self.region.byte_len()
    }

    fn lock(&self, waits: &WaitQueue) {
        let lock = self.region.word(LOCK_WORD);
        loop {
            if lock.compare_exchange(0, 1, SeqCst, SeqCst).is_ok() {
                return;
            }
            if let WaitResult::TimedOut = waits.wait(lock, 1, Some(self.wait_timeout)) {
                error!("timed out waiting for the arena lock; retrying");
            }
        }
    }

    fn unlock(&self, waits: &WaitQueue) {
        self.region.word(LOCK_WORD).store(0, SeqCst);
        waits.wake(self.region.word(LOCK_WORD), 1);
    }

    /// Stage `data` in the arena, blocking on the arena lock, and return a
    /// lease over the written range.
    pub fn block_write<'a>(&'a self, waits: &WaitQueue, data: &[u8]) -> Result<Lease<'a>> {
        self.lock(waits);
        let result = self.write_locked(data);
        self.unlock(waits);
        let payload = result?;
        Ok(Lease {
            arena: self,
            payload: Some(payload),
        })
    }

    fn write_locked(&self, data: &[u8]) -> Result<Payload> {
        let live = self.region.word(LIVE_WORD);
        let tail = self.region.word(TAIL_WORD);
        let base = if live.fetch_add(1, SeqCst) == 0 {
            // Nothing is live: reclaim the whole region.
            tail.store(ARENA_BASE, SeqCst);
            ARENA_BASE
        } else {
            tail.load(SeqCst)
        };
        let end = base as usize + data.len();
        if end > self.capacity() {
            live.fetch_sub(1, SeqCst);
            return Err(Error::ArenaFull {
                needed: data.len(),
                capacity: self.capacity(),
            });
        }
        self.region.write_bytes(base as usize, data);
        tail.store(end as u32, SeqCst);
        Ok(Payload {
            ptr: base,
            len: data.len() as u32,
        })
    }

    /// Copy a staged payload back out.
    pub fn get(&self, payload: Payload) -> Vec<u8> {
        self.region
            .read_bytes(payload.ptr as usize, payload.len as usize)
    }

    /// Drop one live reference. The range itself is reclaimed only when the
    /// live count reaches zero and the next writer resets the tail.
    pub fn free(&self, payload: Payload) {
        let old = self.region.word(LIVE_WORD).fetch_sub(1, SeqCst);
        if old == 0 {
            error!(
                ptr = payload.ptr,
                len = payload.len,
                "arena free without a matching allocation"
            );
        }
    }

    /// Adopt a payload allocated by the far side, so it is freed on drop.
    pub fn adopt(&self, payload: Payload) -> Lease<'_> {
        Lease {
            arena: self,
            payload: Some(payload),
        }
    }

    /// Bytes currently in use, for capacity-planning tests.
    pub fn tail(&self) -> u32 {
        self.region.word(TAIL_WORD).load(SeqCst)
    }
}

/// A live reference into the arena; dropping it runs `free`.
pub struct Lease<'a> {
    arena: &'a Arena,
    payload: Option<Payload>,
}

impl<'a> Lease<'a> {
    pub fn payload(&self) -> Payload {
        self.payload.unwrap_or(Payload { ptr: 0, len: 0 })
    }

    /// Copy the leased bytes out of the arena.
    pub fn bytes(&self) -> Vec<u8> {
        self.arena.get(self.payload())
    }

    /// Hand ownership of the range to the far side: no free on drop.
    pub fn release(mut self) -> Payload {
        self.payload
            .take()
            .unwrap_or(Payload { ptr: 0, len: 0 })
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if let Some(payload) = self.payload.take() {
            self.arena.free(payload);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn arena(bytes: usize) -> (Arena, WaitQueue) {
        (Arena::new(bytes, Duration::from_millis(50)), WaitQueue::new())
    }

    #[test]
    fn resets_to_base_when_drained() {
        let (arena, waits) = arena(64);
        let first = arena.block_write(&waits, b"hello").unwrap();
        assert_eq!(first.payload().ptr, ARENA_BASE);
        let second = arena.block_write(&waits, b"world").unwrap();
        assert_eq!(second.payload().ptr, ARENA_BASE + 5);
        drop(first);
        drop(second);
        // Live count hit zero, so the next write starts over at the base.
        let third = arena.block_write(&waits, b"again").unwrap();
        assert_eq!(third.payload().ptr, ARENA_BASE);
    }

    #[test]
    fn capacity_edge() {
        let (arena, waits) = arena(64);
        let room = arena.capacity() - ARENA_BASE as usize;
        let exact = arena.block_write(&waits, &vec![0xa5; room]).unwrap();
        assert_eq!(exact.payload().len as usize, room);
        // One more byte does not fit while the exact-fit lease is live.
        match arena.block_write(&waits, &[0]) {
            Err(Error::ArenaFull { .. }) => {}
            other => panic!("expected ArenaFull, got {:?}", other.map(|l| l.payload())),
        }
        drop(exact);
        // The failed attempt must not have leaked a live reference.
        let again = arena.block_write(&waits, &[1, 2, 3]).unwrap();
        assert_eq!(again.payload().ptr, ARENA_BASE);
    }

    #[test]
    fn release_skips_the_drop_free() {
        let (arena, waits) = arena(64);
        let payload = arena.block_write(&waits, b"keep").unwrap().release();
        assert_eq!(arena.get(payload), b"keep");
        // Still one live reference: tail does not reset.
        let next = arena.block_write(&waits, b"x").unwrap();
        assert_eq!(next.payload().ptr, ARENA_BASE + 4);
        arena.free(payload);
    }

    #[test]
    fn round_trips_bytes() {
        let (arena, waits) = arena(256);
        let data: Vec<u8> = (0..=200).collect();
        let lease = arena.block_write(&waits, &data).unwrap();
        assert_eq!(lease.bytes(), data);
    }
}
