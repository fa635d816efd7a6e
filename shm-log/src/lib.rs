//! An append-only log shared by independent processes.
//!
//! Every participant opens the same two files: a metadata store holding one fixed record of
//! atomics, and the data store that records are appended to. Appending reserves a byte range by
//! advancing the cursor in the shared record, then copies into a memory-mapped window of the data
//! store. The common write performs no system call and takes no lock shared with other processes.
//!
//! ```no_run
//! use shm_log::{Log, LogConfig};
//!
//! let log = Log::create_or_attach("app.meta", "app.log", &LogConfig::default())?;
//! let at = log.append(b"hello, world")?;
//! assert_eq!(at.end - at.start, 12);
//! # Ok::<_, shm_log::LogError>(())
//! ```
//!
//! ## shm-log is not a database
//!
//! There is no reader, no recovery and no durability: the writes are observable through the
//! page cache by every process on the host, nothing more. Records are laid out in the order of
//! their reservation, which need not be the order in which their bytes become visible.
//!
//! Whenever the cursor outruns the data store, the participant who noticed grows it under a
//! short-lived lock inside the shared record. If that fails the log is *panicked*, permanently.
//! Nobody recovers a lock whose holder died; waiters time out and report the holder's pid.

mod chunk;
mod config;
mod error;
mod grow;
mod init;
mod meta;
mod store;
mod wait;
mod writer;

pub use config::{page_size, BackoffPolicy, LogConfig};
pub use error::{LogError, LogResult};
pub use init::Role;
pub use meta::LogStatus;
pub use writer::{LogStats, WritePath};

use std::path::Path;

use chunk::ChunkWindows;
use meta::SharedMeta;
use store::DataStore;
use writer::{Counters, Dispatch};

/// A process-local handle onto a shared log.
///
/// The handle may be shared between threads of one process. Other processes open their own.
pub struct Log {
    meta: SharedMeta,
    data: DataStore,
    windows: ChunkWindows,
    /// The configuration, with the chunk size adopted from the shared record.
    config: LogConfig,
    counters: Counters,
    role: Role,
}

/// The range of the log an append was written to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Appended {
    pub start: u64,
    pub end: u64,
    pub path: WritePath,
}

impl Log {
    /// Create the log at the two paths, or join it if someone else got there first.
    ///
    /// Any number of processes may call this concurrently for the same paths; exactly one of them
    /// initializes the stores, see [`Log::role`].
    pub fn create_or_attach(
        meta_path: impl AsRef<Path>,
        data_path: impl AsRef<Path>,
        config: &LogConfig,
    ) -> LogResult<Self> {
        let attached = init::create_or_attach(meta_path.as_ref(), data_path.as_ref(), config)?;

        let config = LogConfig {
            chunk_size: attached.meta.chunk_size(),
            ..config.clone()
        };
        config.validate(page_size()?)?;

        Ok(Log {
            windows: ChunkWindows::new(config.chunk_size, config.max_resident_chunks),
            meta: attached.meta,
            data: attached.data,
            config,
            counters: Counters::default(),
            role: attached.role,
        })
    }

    /// Append `buf` as one contiguous record.
    ///
    /// The range is reserved even if the write itself fails afterwards, its contents are then
    /// unspecified. An empty buffer reserves nothing.
    ///
    /// Usually this neither locks nor blocks. It waits while a [`Log::trim`] of any participant
    /// holds the cursor, at most for `lock_timeout`, and while every resident chunk is pinned, at
    /// most for `backpressure_timeout`. Growing the data store takes the structural lock.
    pub fn append(&self, buf: &[u8]) -> LogResult<Appended> {
        let range = self.meta.checkout(
            buf.len() as u64,
            self.config.backoff,
            self.config.lock_timeout,
        )?;

        // A hint only, rechecked under the lock.
        if !range.is_empty() && range.end > self.meta.committed_size() {
            let resize = grow::ensure_capacity(&self.meta, &self.data, range.end, &self.config)?;
            if resize.changed {
                self.counters.record_growth();
            }
        }

        let path = self.dispatch().write(range.clone(), buf)?;

        Ok(Appended {
            start: range.start,
            end: range.end,
            path,
        })
    }

    /// Shrink the data store to the chunk covering the cursor. Returns the new committed size.
    ///
    /// Idempotent: without intervening appends, a second call changes nothing.
    pub fn trim(&self) -> LogResult<u64> {
        let resize = grow::trim(&self.meta, &self.data, &self.config)?;

        if resize.changed {
            self.counters.record_trim();
        }

        Ok(resize.size)
    }

    /// Unmap all windows and close the stores. The shared log is left untouched.
    pub fn close(self) {
        tracing::debug!(
            role = ?self.role,
            resident = self.windows.resident(),
            "closing log handle"
        );
        drop(self)
    }

    pub fn status(&self) -> LogStatus {
        self.meta.status()
    }

    pub fn stats(&self) -> LogStats {
        self.counters.snapshot(&self.windows)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn chunk_size(&self) -> u64 {
        self.config.chunk_size
    }

    pub fn page_size(&self) -> u64 {
        self.meta.page_size()
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    fn dispatch(&self) -> Dispatch<'_> {
        Dispatch {
            windows: &self.windows,
            data: &self.data,
            config: &self.config,
            counters: &self.counters,
        }
    }
}

impl core::fmt::Debug for Log {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Log")
            .field("role", &self.role)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
