//! Getting the bytes of a reserved range into the data store.
//!
//! Ranges within a chunk are copied into a mapped window, ranges crossing a boundary into the two
//! windows around it. Anything of chunk size or larger bypasses the windows.
use core::ops::Range;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::chunk::ChunkWindows;
use crate::config::LogConfig;
use crate::error::{LogError, LogResult};
use crate::store::DataStore;
use crate::wait::Waiter;

/// How the bytes of one append reach the data store.
///
/// Decided once per write from the reserved range alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WritePath {
    /// Nothing to write.
    Empty,
    /// The range lies within one chunk.
    Single,
    /// The range is shorter than a chunk but crosses into the next one.
    Boundary,
    /// At least a full chunk; written positionally without any mapping.
    Bulk,
}

impl WritePath {
    pub fn classify(range: Range<u64>, chunk_size: u64) -> Self {
        let len = range.end - range.start;

        if len == 0 {
            WritePath::Empty
        } else if len >= chunk_size {
            WritePath::Bulk
        } else if range.start / chunk_size == (range.end - 1) / chunk_size {
            WritePath::Single
        } else {
            WritePath::Boundary
        }
    }
}

/// Counters of one handle. Relaxed, for observation only.
#[derive(Default)]
pub(crate) struct Counters {
    empty: AtomicU64,
    single: AtomicU64,
    boundary: AtomicU64,
    bulk: AtomicU64,
    bytes: AtomicU64,
    growths: AtomicU64,
    trims: AtomicU64,
    backpressure_waits: AtomicU64,
}

/// Statistics of a single handle, not of the shared log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LogStats {
    pub empty_writes: u64,
    pub single_writes: u64,
    pub boundary_writes: u64,
    pub bulk_writes: u64,
    pub bytes_written: u64,
    /// Growths of the data store performed by this handle.
    pub growths: u64,
    /// Trims that actually shrank the data store.
    pub trims: u64,
    /// Times an append found every resident chunk pinned and had to wait.
    pub backpressure_waits: u64,
    pub resident_chunks: usize,
    pub chunks_mapped: u64,
    pub chunks_evicted: u64,
}

impl Counters {
    pub(crate) fn record_write(&self, path: WritePath, bytes: u64) {
        let counter = match path {
            WritePath::Empty => &self.empty,
            WritePath::Single => &self.single,
            WritePath::Boundary => &self.boundary,
            WritePath::Bulk => &self.bulk,
        };

        counter.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_growth(&self) {
        self.growths.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_trim(&self) {
        self.trims.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, windows: &ChunkWindows) -> LogStats {
        LogStats {
            empty_writes: self.empty.load(Ordering::Relaxed),
            single_writes: self.single.load(Ordering::Relaxed),
            boundary_writes: self.boundary.load(Ordering::Relaxed),
            bulk_writes: self.bulk.load(Ordering::Relaxed),
            bytes_written: self.bytes.load(Ordering::Relaxed),
            growths: self.growths.load(Ordering::Relaxed),
            trims: self.trims.load(Ordering::Relaxed),
            backpressure_waits: self.backpressure_waits.load(Ordering::Relaxed),
            resident_chunks: windows.resident(),
            chunks_mapped: windows.mapped(),
            chunks_evicted: windows.evictions(),
        }
    }
}

/// Everything a write into a reserved, capacity-backed range needs.
pub(crate) struct Dispatch<'lt> {
    pub windows: &'lt ChunkWindows,
    pub data: &'lt DataStore,
    pub config: &'lt LogConfig,
    pub counters: &'lt Counters,
}

impl Dispatch<'_> {
    /// Copy `buf` into the reserved `range`.
    ///
    /// The committed size must already cover the range.
    pub(crate) fn write(&self, range: Range<u64>, buf: &[u8]) -> LogResult<WritePath> {
        debug_assert_eq!(range.end - range.start, buf.len() as u64);
        let chunk_size = self.windows.chunk_size();
        let path = WritePath::classify(range.clone(), chunk_size);

        match path {
            WritePath::Empty => {}
            WritePath::Single => {
                let chunk =
                    self.retry(range.start, || self.windows.acquire(range.start, self.data))?;
                chunk.copy_in(range.start, buf);
                self.windows.release(chunk);
            }
            WritePath::Boundary => {
                let (first, second) = self.retry(range.start, || {
                    self.windows.acquire_pair(range.start, range.end - 1, self.data)
                })?;
                debug_assert_eq!(first.start() + chunk_size, second.start());

                let split = (second.start() - range.start) as usize;
                let (prefix, suffix) = buf.split_at(split);
                first.copy_in(range.start, prefix);
                second.copy_in(second.start(), suffix);

                self.windows.release(second);
                self.windows.release(first);
            }
            WritePath::Bulk => {
                self.data.write_at(buf, range.start)?;
            }
        }

        self.counters.record_write(path, buf.len() as u64);
        Ok(path)
    }

    /// Pin chunks with `acquire`, waiting for the ring to drain while it is exhausted.
    fn retry<T>(&self, offset: u64, mut acquire: impl FnMut() -> LogResult<T>) -> LogResult<T> {
        let mut waiter: Option<Waiter> = None;

        loop {
            match acquire() {
                Err(LogError::BackpressureExhausted { capacity }) => {
                    self.counters
                        .backpressure_waits
                        .fetch_add(1, Ordering::Relaxed);

                    let waiter = waiter.get_or_insert_with(|| {
                        Waiter::new(self.config.backoff, self.config.backpressure_timeout)
                    });

                    if let Err(waited) = waiter.snooze() {
                        tracing::debug!(offset, capacity, ?waited, "chunk ring stayed exhausted");
                        return Err(LogError::BackpressureExhausted { capacity });
                    }
                }
                other => return other,
            }
        }
    }
}
