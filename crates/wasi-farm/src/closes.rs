//! Broadcast of small records to a set of Ref identities.
//!
//! Structurally close to the payload arena, but with a different reclaim
//! rule: each record carries its own target list, every target's poll strikes
//! its id from the list, and the record is compacted out of the buffer when
//! the last target has seen it. The Park never blocks on a slow consumer.
//!
//! Region layout (bytes): header words `[lock, count, tail]`, then `count`
//! records of `[remaining: u32, total: u32, targets[total]: u32,
//! data[DATA_WORDS]: u32]`, packed end to end from byte 12.

use crate::error::{Error, Result};
use crate::shm::SharedRegion;
use crate::wait::{WaitQueue, WaitResult};
use std::sync::atomic::Ordering::SeqCst;
use std::time::Duration;
use tracing::error;

const LOCK_WORD: usize = 0;
const COUNT_WORD: usize = 1;
const TAIL_WORD: usize = 2;
const BASE: usize = 12;

/// Target-slot value after a target has taken its copy.
const TAKEN: u32 = u32::MAX;

pub struct ToRefSender {
    region: SharedRegion,
    data_words: usize,
    wait_timeout: Duration,
}

impl ToRefSender {
    pub fn new(data_words: usize, capacity_bytes: usize, wait_timeout: Duration) -> ToRefSender {
        let sender = ToRefSender {
            region: SharedRegion::new((capacity_bytes + 3) / 4),
            data_words,
            wait_timeout,
        };
        sender.region.word(TAIL_WORD).store(BASE as u32, SeqCst);
        sender
    }

    fn lock(&self, waits: &WaitQueue) {
        let lock = self.region.word(LOCK_WORD);
        loop {
            if lock.compare_exchange(0, 1, SeqCst, SeqCst).is_ok() {
                return;
            }
            if let WaitResult::TimedOut = waits.wait(lock, 1, Some(self.wait_timeout)) {
                error!("timed out waiting for the broadcast lock; retrying");
            }
        }
    }

    fn unlock(&self, waits: &WaitQueue) {
        self.region.word(LOCK_WORD).store(0, SeqCst);
        waits.wake(self.region.word(LOCK_WORD), 1);
    }

    fn record_words(&self, total: usize) -> usize {
        2 + total + self.data_words
    }

    /// Append one record addressed to `targets`.
    pub fn send(&self, waits: &WaitQueue, targets: &[u32], data: &[u32]) -> Result<()> {
        debug_assert_eq!(data.len(), self.data_words);
        if targets.is_empty() {
            return Ok(());
        }
        self.lock(waits);
        let tail = self.region.word(TAIL_WORD).load(SeqCst) as usize;
        let record_bytes = self.record_words(targets.len()) * 4;
        if tail + record_bytes > self.region.byte_len() {
            self.unlock(waits);
            return Err(Error::ArenaFull {
                needed: record_bytes,
                capacity: self.region.byte_len(),
            });
        }
        let mut word = tail / 4;
        self.region.word(word).store(targets.len() as u32, SeqCst);
        self.region
            .word(word + 1)
            .store(targets.len() as u32, SeqCst);
        word += 2;
        for &target in targets {
            self.region.word(word).store(target, SeqCst);
            word += 1;
        }
        for &value in data {
            self.region.word(word).store(value, SeqCst);
            word += 1;
        }
        self.region
            .word(TAIL_WORD)
            .store((tail + record_bytes) as u32, SeqCst);
        self.region.word(COUNT_WORD).fetch_add(1, SeqCst);
        self.unlock(waits);
        Ok(())
    }

    /// Collect every record addressed to `id`, striking `id` from each and
    /// compacting records whose target list is exhausted.
    pub fn poll(&self, waits: &WaitQueue, id: u32) -> Vec<Vec<u32>> {
        if self.region.word(COUNT_WORD).load(SeqCst) == 0 {
            return Vec::new();
        }
        self.lock(waits);
        let records = self.region.word(COUNT_WORD).load(SeqCst) as usize;
        let mut collected = Vec::new();
        let mut offset = BASE;
        for _ in 0..records {
            let word = offset / 4;
            let total = self.region.word(word + 1).load(SeqCst) as usize;
            let record_bytes = self.record_words(total) * 4;
            let slot = (0..total)
                .map(|i| word + 2 + i)
                .find(|&w| self.region.word(w).load(SeqCst) == id);
            let Some(slot) = slot else {
                offset += record_bytes;
                continue;
            };
            let data_base = word + 2 + total;
            collected.push(
                (0..self.data_words)
                    .map(|i| self.region.word(data_base + i).load(SeqCst))
                    .collect(),
            );
            self.region.word(slot).store(TAKEN, SeqCst);
            let remaining = self.region.word(word).load(SeqCst) - 1;
            self.region.word(word).store(remaining, SeqCst);
            if remaining == 0 {
                let tail = self.region.word(TAIL_WORD).load(SeqCst) as usize;
                let next = offset + record_bytes;
                self.region.copy_within(next, offset, tail - next);
                self.region
                    .word(TAIL_WORD)
                    .store((tail - record_bytes) as u32, SeqCst);
                self.region.word(COUNT_WORD).fetch_sub(1, SeqCst);
                // The following records shifted into place; stay put.
            } else {
                offset += record_bytes;
            }
        }
        let tail = self.region.word(TAIL_WORD).load(SeqCst) as usize;
        if offset != tail {
            error!(offset, tail, "broadcast buffer walk ended off the tail");
        }
        self.unlock(waits);
        collected
    }
}

/// The fd-close notification channel: one u32 of payload, the closed fd.
pub struct FdCloseSender {
    inner: ToRefSender,
}

impl FdCloseSender {
    pub fn new(capacity_bytes: usize, wait_timeout: Duration) -> FdCloseSender {
        FdCloseSender {
            inner: ToRefSender::new(1, capacity_bytes, wait_timeout),
        }
    }

    pub fn send(&self, waits: &WaitQueue, targets: &[u32], fd: u32) -> Result<()> {
        self.inner.send(waits, targets, &[fd])
    }

    pub fn poll(&self, waits: &WaitQueue, id: u32) -> Vec<u32> {
        self.inner
            .poll(waits, id)
            .into_iter()
            .map(|record| record[0])
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sender() -> (FdCloseSender, WaitQueue) {
        (
            FdCloseSender::new(256, Duration::from_millis(50)),
            WaitQueue::new(),
        )
    }

    #[test]
    fn each_target_sees_each_record_once() {
        let (sender, waits) = sender();
        sender.send(&waits, &[1, 2], 4).unwrap();
        sender.send(&waits, &[2], 5).unwrap();
        assert_eq!(sender.poll(&waits, 2), vec![4, 5]);
        assert_eq!(sender.poll(&waits, 2), Vec::<u32>::new());
        assert_eq!(sender.poll(&waits, 1), vec![4]);
        assert_eq!(sender.poll(&waits, 1), Vec::<u32>::new());
    }

    #[test]
    fn compaction_reclaims_space() {
        let (sender, waits) = sender();
        sender.send(&waits, &[7], 3).unwrap();
        assert_eq!(sender.poll(&waits, 7), vec![3]);
        assert_eq!(sender.inner.region.word(super::TAIL_WORD).load(SeqCst), 12);
        assert_eq!(sender.inner.region.word(super::COUNT_WORD).load(SeqCst), 0);
    }

    #[test]
    fn unaddressed_ref_sees_nothing() {
        let (sender, waits) = sender();
        sender.send(&waits, &[1], 9).unwrap();
        assert_eq!(sender.poll(&waits, 3), Vec::<u32>::new());
        assert_eq!(sender.poll(&waits, 1), vec![9]);
    }

    #[test]
    fn overflow_is_reported() {
        let sender = ToRefSender::new(1, 16, Duration::from_millis(50));
        let waits = WaitQueue::new();
        // Header takes 12 bytes; a one-target record needs 16 more.
        assert!(matches!(
            sender.send(&waits, &[1], &[0]),
            Err(Error::ArenaFull { .. })
        ));
    }
}
