//! A one-deep call channel over shared words.
//!
//! The control plane and the worker spawner both speak this shape: word 0 is
//! a mutex callers hold across one request/response exchange, word 1 is the
//! doorbell (0 idle, 1 pending), and the remaining words carry arguments and
//! the reply. Exactly one request is in flight at a time.

use crate::shm::SharedRegion;
use crate::wait::{WaitQueue, WaitResult};
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::time::Duration;
use tracing::{error, warn};

const LOCK_WORD: usize = 0;
const CALL_WORD: usize = 1;
const ARGS_BASE: usize = 2;

pub struct CallChannel {
    region: SharedRegion,
    wait_timeout: Duration,
}

impl CallChannel {
    pub fn new(arg_words: usize, wait_timeout: Duration) -> CallChannel {
        CallChannel {
            region: SharedRegion::new(ARGS_BASE + arg_words),
            wait_timeout,
        }
    }

    pub fn arg(&self, index: usize) -> u32 {
        self.region.word(ARGS_BASE + index).load(SeqCst)
    }

    pub fn set_arg(&self, index: usize, value: u32) {
        self.region.word(ARGS_BASE + index).store(value, SeqCst);
    }

    /// Caller side: take the channel mutex.
    pub fn lock(&self, waits: &WaitQueue) {
        let lock = self.region.word(LOCK_WORD);
        loop {
            if lock.compare_exchange(0, 1, SeqCst, SeqCst).is_ok() {
                return;
            }
            if let WaitResult::TimedOut = waits.wait(lock, 1, Some(self.wait_timeout)) {
                error!("timed out waiting for a channel lock; retrying");
            }
        }
    }

    pub fn unlock(&self, waits: &WaitQueue) {
        self.region.word(LOCK_WORD).store(0, SeqCst);
        waits.wake(self.region.word(LOCK_WORD), 1);
    }

    /// Caller side: ring the doorbell and block until the server answers.
    pub fn ring_and_wait(&self, waits: &WaitQueue) {
        let call = self.region.word(CALL_WORD);
        let old = call.swap(1, SeqCst);
        if old != 0 {
            error!("channel doorbell was already pending");
        }
        waits.wake(call, 1);
        while call.load(SeqCst) == 1 {
            if let WaitResult::TimedOut = waits.wait(call, 1, Some(self.wait_timeout)) {
                error!("timed out waiting for a channel reply; retrying");
            }
        }
    }

    /// Server side: block until a request is pending. Returns `false` when
    /// the shutdown flag was raised instead.
    pub fn wait_request(&self, waits: &WaitQueue, shutdown: &AtomicBool) -> bool {
        let call = self.region.word(CALL_WORD);
        while call.load(SeqCst) == 0 {
            if shutdown.load(SeqCst) {
                return false;
            }
            waits.wait(call, 0, Some(self.wait_timeout));
        }
        !shutdown.load(SeqCst)
    }

    /// Server side: publish the reply written into the argument words.
    pub fn complete(&self, waits: &WaitQueue) {
        let call = self.region.word(CALL_WORD);
        let old = call.swap(0, SeqCst);
        if old != 1 {
            warn!(old, "channel doorbell cleared out from under the server");
        }
        let woken = waits.wake(call, 1);
        if woken != 1 {
            warn!(woken, "channel reply reached an unexpected waiter count");
        }
    }

    /// Wake anything parked on the doorbell (used at shutdown).
    pub fn kick(&self, waits: &WaitQueue) {
        waits.wake(self.region.word(CALL_WORD), u32::MAX);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn request_reply_exchange() {
        let chan = CallChannel::new(2, Duration::from_millis(100));
        let waits = WaitQueue::new();
        let shutdown = AtomicBool::new(false);
        std::thread::scope(|s| {
            s.spawn(|| {
                assert!(chan.wait_request(&waits, &shutdown));
                let n = chan.arg(0);
                chan.set_arg(1, n * 2);
                chan.complete(&waits);
            });
            chan.lock(&waits);
            chan.set_arg(0, 21);
            chan.ring_and_wait(&waits);
            assert_eq!(chan.arg(1), 42);
            chan.unlock(&waits);
        });
    }

    #[test]
    fn shutdown_unblocks_server() {
        let chan = CallChannel::new(0, Duration::from_millis(10));
        let waits = WaitQueue::new();
        let shutdown = AtomicBool::new(false);
        std::thread::scope(|s| {
            let server = s.spawn(|| chan.wait_request(&waits, &shutdown));
            shutdown.store(true, SeqCst);
            chan.kick(&waits);
            assert!(!server.join().unwrap());
        });
    }
}
