//! Blocking wait/notify on shared `AtomicU32` words.
//!
//! This is the primitive under every doorbell and mutex word in the farm:
//! `wait` parks the calling thread until the word is poked, `wake` pokes up
//! to `count` parked threads and reports how many it reached. The expected
//! value is re-checked under the spot's internal lock, so a wake issued
//! after the caller decided to park but before it actually parked is
//! observed as a `Mismatch` rather than lost.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering::SeqCst};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Result of a [`WaitQueue::wait`] call.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum WaitResult {
    /// The thread went to sleep and was awoken by a `wake`.
    Ok,
    /// The value in memory did not match the expected value; no sleep.
    Mismatch,
    /// The value matched but nothing called `wake` within the timeout.
    TimedOut,
}

#[derive(Default)]
struct SpotState {
    /// Threads currently parked on this word.
    waiters: u32,
    /// Wake permits issued but not yet consumed by a parked thread.
    wakes: u32,
}

#[derive(Default)]
struct Spot {
    state: Mutex<SpotState>,
    cond: Condvar,
}

/// A table of parking spots keyed by word address.
///
/// Spots are never removed: the set of words that ever see a waiter is
/// bounded by the shared regions of one farm, and the farm owns its queue.
#[derive(Default)]
pub struct WaitQueue {
    spots: Mutex<HashMap<usize, Arc<Spot>>>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn spot(&self, word: &AtomicU32) -> Arc<Spot> {
        let key = word as *const AtomicU32 as usize;
        self.spots
            .lock()
            .unwrap()
            .entry(key)
            .or_default()
            .clone()
    }

    /// Park until `word` is poked, provided it currently holds `expected`.
    pub fn wait(&self, word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitResult {
        let spot = self.spot(word);
        let mut state = spot.state.lock().unwrap();
        if word.load(SeqCst) != expected {
            return WaitResult::Mismatch;
        }
        state.waiters += 1;
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if state.wakes > 0 {
                state.wakes -= 1;
                state.waiters -= 1;
                return WaitResult::Ok;
            }
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.waiters -= 1;
                        return WaitResult::TimedOut;
                    }
                    self.block_timeout(&spot, state, deadline - now)
                }
                None => spot.cond.wait(state).unwrap(),
            };
        }
    }

    fn block_timeout<'a>(
        &self,
        spot: &'a Spot,
        state: MutexGuard<'a, SpotState>,
        dur: Duration,
    ) -> MutexGuard<'a, SpotState> {
        spot.cond.wait_timeout(state, dur).unwrap().0
    }

    /// Wake up to `count` threads parked on `word`, returning how many were
    /// actually reached.
    pub fn wake(&self, word: &AtomicU32, count: u32) -> u32 {
        let spot = self.spot(word);
        let mut state = spot.state.lock().unwrap();
        let reachable = state.waiters - state.wakes;
        let woken = count.min(reachable);
        if woken > 0 {
            state.wakes += woken;
            spot.cond.notify_all();
        }
        woken
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn mismatch_does_not_block() {
        let q = WaitQueue::new();
        let word = AtomicU32::new(1);
        assert_eq!(q.wait(&word, 0, None), WaitResult::Mismatch);
    }

    #[test]
    fn times_out() {
        let q = WaitQueue::new();
        let word = AtomicU32::new(0);
        assert_eq!(
            q.wait(&word, 0, Some(Duration::from_millis(10))),
            WaitResult::TimedOut
        );
    }

    #[test]
    fn wake_reaches_waiter() {
        let q = WaitQueue::new();
        let word = AtomicU32::new(0);
        std::thread::scope(|s| {
            let waiter = s.spawn(|| q.wait(&word, 0, None));
            // Poke until the waiter is actually parked.
            while q.wake(&word, 1) == 0 {
                std::thread::yield_now();
            }
            assert_eq!(waiter.join().unwrap(), WaitResult::Ok);
        });
    }

    #[test]
    fn wake_reports_zero_without_waiters() {
        let q = WaitQueue::new();
        let word = AtomicU32::new(0);
        assert_eq!(q.wake(&word, 1), 0);
    }
}
