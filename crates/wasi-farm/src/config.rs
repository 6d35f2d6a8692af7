use std::time::Duration;

/// Capacities and liveness knobs for one farm.
///
/// The shared regions are sized up front: growing them while Refs hold raw
/// offsets into them is not supported, so pick capacities for the workload.
#[derive(Debug, Clone)]
pub struct FarmConfig {
    /// Maximum descriptor slots (lock cells and call frames are preallocated
    /// for all of them).
    pub max_fds: usize,
    /// Payload arena capacity in bytes, including its 12-byte header. Reads
    /// larger than this cannot be transferred.
    pub arena_bytes: usize,
    /// Close-broadcast buffer capacity in bytes.
    pub close_arena_bytes: usize,
    /// How long a blocking wait sleeps before it logs and retries. This is a
    /// liveness aid, not a deadline: protocol waits never give up.
    pub wait_timeout: Duration,
}

impl Default for FarmConfig {
    fn default() -> FarmConfig {
        FarmConfig {
            max_fds: 128,
            arena_bytes: 10 * 1024 * 1024,
            close_arena_bytes: 100 * 1024,
            wait_timeout: Duration::from_secs(2),
        }
    }
}

impl FarmConfig {
    pub fn max_fds(mut self, max_fds: usize) -> Self {
        self.max_fds = max_fds;
        self
    }

    pub fn arena_bytes(mut self, bytes: usize) -> Self {
        self.arena_bytes = bytes;
        self
    }

    pub fn close_arena_bytes(mut self, bytes: usize) -> Self {
        self.close_arena_bytes = bytes;
        self
    }

    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }
}
