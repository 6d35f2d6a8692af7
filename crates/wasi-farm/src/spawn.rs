//! Spawn-on-behalf service.
//!
//! A thread that is blocked in a synchronous farm wait cannot always create
//! its own siblings (the runtime this design came from forbade it outright).
//! The worker background owns real thread creation: callers submit a spawn
//! request over a call channel, a dedicated unblocked thread performs the
//! spawn through a caller-supplied function, and the opaque worker id comes
//! back once the worker exists. Ids are slab-style and reused after `done`.

use crate::alloc::Arena;
use crate::channel::CallChannel;
use crate::config::FarmConfig;
use crate::error::{Errno, Error};
use crate::wait::WaitQueue;
use crate::wire::Payload;
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error};

const CMD_NEW_WORKER: u32 = 1;
const CMD_DONE: u32 = 2;

/// Reply value for a spawn the service could not perform.
const SPAWN_FAILED: u32 = u32::MAX;

/// Argument words: `[cmd, name_ptr, name_len, flags, init_ptr, init_len]`;
/// the reply (the worker id) comes back in word 0.
const ARG_WORDS: usize = 6;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WorkerId(u32);

impl WorkerId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

struct SpawnShared {
    chan: CallChannel,
    arena: Arena,
    waits: WaitQueue,
    shutdown: AtomicBool,
}

/// The service half. Dropping it stops the request loop and joins every
/// worker still registered.
pub struct WorkerBackground {
    shared: Arc<SpawnShared>,
    thread: Option<JoinHandle<()>>,
}

/// A cloneable client for the spawn service.
#[derive(Clone)]
pub struct WorkerBackgroundRef {
    shared: Arc<SpawnShared>,
}

impl WorkerBackground {
    /// Start the service. `spawner` receives the request's name and init
    /// payload and returns the join handle of the worker it created.
    pub fn spawn<F>(mut spawner: F) -> Result<WorkerBackground, Error>
    where
        F: FnMut(&str, Vec<u8>) -> std::io::Result<JoinHandle<()>> + Send + 'static,
    {
        let config = FarmConfig::default();
        let shared = Arc::new(SpawnShared {
            chan: CallChannel::new(ARG_WORDS, config.wait_timeout),
            arena: Arena::new(10 * 1024, config.wait_timeout),
            waits: WaitQueue::new(),
            shutdown: AtomicBool::new(false),
        });
        let loop_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("farm-worker-background".to_string())
            .spawn(move || {
                let mut workers: Vec<Option<JoinHandle<()>>> = Vec::new();
                serve(&loop_shared, &mut workers, &mut spawner);
                for worker in workers.into_iter().flatten() {
                    let _ = worker.join();
                }
            })
            .map_err(anyhow::Error::from)?;
        Ok(WorkerBackground {
            shared,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> WorkerBackgroundRef {
        WorkerBackgroundRef {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for WorkerBackground {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, SeqCst);
        self.shared.chan.kick(&self.shared.waits);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn serve<F>(shared: &SpawnShared, workers: &mut Vec<Option<JoinHandle<()>>>, spawner: &mut F)
where
    F: FnMut(&str, Vec<u8>) -> std::io::Result<JoinHandle<()>>,
{
    debug!("worker background started");
    loop {
        if !shared.chan.wait_request(&shared.waits, &shared.shutdown) {
            debug!("worker background stopped");
            return;
        }
        match shared.chan.arg(0) {
            CMD_NEW_WORKER => {
                let name_bytes = shared
                    .arena
                    .adopt(Payload {
                        ptr: shared.chan.arg(1),
                        len: shared.chan.arg(2),
                    })
                    .bytes();
                let init = shared
                    .arena
                    .adopt(Payload {
                        ptr: shared.chan.arg(4),
                        len: shared.chan.arg(5),
                    })
                    .bytes();
                let name = String::from_utf8_lossy(&name_bytes).into_owned();
                match spawner(&name, init) {
                    Ok(handle) => {
                        let id = assign_worker_id(workers, handle);
                        debug!(name = %name, id, "worker spawned");
                        shared.chan.set_arg(0, id);
                    }
                    Err(e) => {
                        error!(name = %name, %e, "worker spawn failed");
                        shared.chan.set_arg(0, SPAWN_FAILED);
                    }
                }
            }
            CMD_DONE => {
                let id = shared.chan.arg(1) as usize;
                match workers.get_mut(id).and_then(Option::take) {
                    // The worker announced its own exit; detach the handle
                    // and make the slot reusable.
                    Some(handle) => drop(handle),
                    None => error!(id, "done for an unknown worker"),
                }
            }
            other => error!(cmd = other, "unknown spawn command"),
        }
        shared.chan.complete(&shared.waits);
    }
}

fn assign_worker_id(workers: &mut Vec<Option<JoinHandle<()>>>, handle: JoinHandle<()>) -> u32 {
    for (id, slot) in workers.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(handle);
            return id as u32;
        }
    }
    workers.push(Some(handle));
    (workers.len() - 1) as u32
}

impl WorkerBackgroundRef {
    /// Ask the service to create a worker. Blocks until the worker exists.
    pub fn new_worker(&self, name: &str, init: &[u8]) -> Result<WorkerId, Errno> {
        let shared = &self.shared;
        shared.chan.lock(&shared.waits);
        let result = self.request_spawn(name, init);
        shared.chan.unlock(&shared.waits);
        result
    }

    fn request_spawn(&self, name: &str, init: &[u8]) -> Result<WorkerId, Errno> {
        let shared = &self.shared;
        let staged_name = shared
            .arena
            .block_write(&shared.waits, name.as_bytes())
            .map_err(|e| Errno::from(&e))?;
        let staged_init = shared
            .arena
            .block_write(&shared.waits, init)
            .map_err(|e| Errno::from(&e))?;
        shared.chan.set_arg(0, CMD_NEW_WORKER);
        let name_payload = staged_name.payload();
        shared.chan.set_arg(1, name_payload.ptr);
        shared.chan.set_arg(2, name_payload.len);
        shared.chan.set_arg(3, 0);
        let init_payload = staged_init.payload();
        shared.chan.set_arg(4, init_payload.ptr);
        shared.chan.set_arg(5, init_payload.len);
        shared.chan.ring_and_wait(&shared.waits);
        // The service copied and freed both payloads.
        staged_name.release();
        staged_init.release();
        match shared.chan.arg(0) {
            SPAWN_FAILED => Err(Errno::Io),
            id => Ok(WorkerId(id)),
        }
    }

    /// Report a worker as finished; its id becomes reusable.
    pub fn done(&self, id: WorkerId) -> Result<(), Errno> {
        let shared = &self.shared;
        shared.chan.lock(&shared.waits);
        shared.chan.set_arg(0, CMD_DONE);
        shared.chan.set_arg(1, id.0);
        shared.chan.ring_and_wait(&shared.waits);
        shared.chan.unlock(&shared.waits);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::mpsc;

    #[test]
    fn spawns_and_reuses_ids() {
        let counter = Arc::new(AtomicU32::new(0));
        let spawn_counter = counter.clone();
        let background = WorkerBackground::spawn(move |_name, _init| {
            let counter = spawn_counter.clone();
            std::thread::Builder::new().spawn(move || {
                counter.fetch_add(1, SeqCst);
            })
        })
        .unwrap();
        let handle = background.handle();
        let first = handle.new_worker("a", b"").unwrap();
        handle.done(first).unwrap();
        let second = handle.new_worker("b", b"").unwrap();
        // The freed slot is handed out again.
        assert_eq!(first, second);
        drop(background);
        // The first worker was detached by `done`, so give it a moment.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while counter.load(SeqCst) < 2 && std::time::Instant::now() < deadline {
            std::thread::yield_now();
        }
        assert_eq!(counter.load(SeqCst), 2);
    }

    #[test]
    fn init_payload_reaches_the_spawner() {
        let (tx, rx) = mpsc::channel();
        let background = WorkerBackground::spawn(move |name, init| {
            tx.send((name.to_string(), init)).unwrap();
            std::thread::Builder::new().spawn(|| {})
        })
        .unwrap();
        background.handle().new_worker("animal", b"seed").unwrap();
        let (name, init) = rx.recv().unwrap();
        assert_eq!(name, "animal");
        assert_eq!(init, b"seed");
        drop(background);
    }
}
