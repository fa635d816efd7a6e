use std::time::Duration;

use crate::error::{LogError, LogResult};

/// Configuration of a participant in a shared log.
///
/// `chunk_size` only matters to the participant creating the log. Everyone joining later adopts
/// the chunk size recorded in the metadata store.
#[derive(Clone, Debug)]
pub struct LogConfig {
    /// Size of each mapped window over the data store. Must be a multiple of the page size.
    pub chunk_size: u64,
    /// Capacity of the chunk ring, bounding the resident mapped memory of this process.
    pub max_resident_chunks: usize,
    /// How long a joiner waits for the creator to publish the record.
    pub init_timeout: Duration,
    /// How long to wait for the structural lock, or for a running trim to lift its fence.
    pub lock_timeout: Duration,
    /// How long `append` retries when every resident chunk is pinned.
    pub backpressure_timeout: Duration,
    pub backoff: BackoffPolicy,
}

/// Shape of the polling loops in all blocking waits.
///
/// Waits spin first, then yield the time slice, then sleep with exponentially growing intervals
/// capped at `max_sleep`. There is no wake-up primitive shared across processes.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub spin_rounds: u32,
    pub yield_rounds: u32,
    pub initial_sleep: Duration,
    pub max_sleep: Duration,
}

impl LogConfig {
    pub const DEFAULT_CHUNK_SIZE: u64 = 1 << 20;
    pub const DEFAULT_RESIDENT_CHUNKS: usize = 8;

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_max_resident_chunks(mut self, max_resident_chunks: usize) -> Self {
        self.max_resident_chunks = max_resident_chunks;
        self
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.backpressure_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Check the configuration against the page size of the platform.
    pub fn validate(&self, page_size: u64) -> LogResult<()> {
        if self.chunk_size == 0 {
            return Err(LogError::invalid_config("chunk size must be non-zero"));
        }

        if page_size == 0 || self.chunk_size % page_size != 0 {
            return Err(LogError::invalid_config(format_args!(
                "chunk size {} is not a multiple of the page size {}",
                self.chunk_size, page_size
            )));
        }

        if usize::try_from(self.chunk_size).is_err() {
            return Err(LogError::invalid_config(format_args!(
                "chunk size {} can not be mapped on this architecture",
                self.chunk_size
            )));
        }

        // A write crossing a chunk boundary pins both of its chunks together.
        if self.max_resident_chunks < 2 {
            return Err(LogError::invalid_config(format_args!(
                "at least 2 resident chunks are required, got {}",
                self.max_resident_chunks
            )));
        }

        if self.backoff.initial_sleep > self.backoff.max_sleep {
            return Err(LogError::invalid_config(
                "initial backoff sleep exceeds the maximum sleep",
            ));
        }

        Ok(())
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
            max_resident_chunks: Self::DEFAULT_RESIDENT_CHUNKS,
            init_timeout: Duration::from_secs(5),
            lock_timeout: Duration::from_secs(1),
            backpressure_timeout: Duration::from_millis(100),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            spin_rounds: 6,
            yield_rounds: 10,
            initial_sleep: Duration::from_micros(10),
            max_sleep: Duration::from_millis(1),
        }
    }
}

/// The page size of the running system.
pub fn page_size() -> LogResult<u64> {
    // Safety: `sysconf` has no memory preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if size <= 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    Ok(size as u64)
}

/// Round `n` up to the next multiple of `align`.
pub(crate) fn align_up(n: u64, align: u64) -> Option<u64> {
    let rem = n % align;
    if rem == 0 {
        Some(n)
    } else {
        n.checked_add(align - rem)
    }
}
