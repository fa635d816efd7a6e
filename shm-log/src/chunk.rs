//! Process-local windows into the data store.
//!
//! Each process keeps at most `capacity` chunks mapped. Chunks live in a fixed array used as a
//! FIFO ring; reclamation only ever happens at the tail and only for chunks no writer depends on.
//! A pinned tail stalls all reclamation, which the caller observes as backpressure.
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use memmap2::MmapRaw;
use parking_lot::Mutex;

use crate::error::{LogError, LogResult};
use crate::store::DataStore;

pub(crate) struct ChunkWindows {
    ring: Mutex<Ring>,
    chunk_size: u64,
    evictions: AtomicU64,
    mapped: AtomicU64,
}

/// A chunk-aligned window mapped over the data store.
struct Chunk {
    start: u64,
    map: MmapRaw,
    /// Writers currently depending on the mapping.
    refs: AtomicUsize,
}

struct Ring {
    slots: Box<[Option<Arc<Chunk>>]>,
    /// Slot to place the next chunk into, one past the most recently added.
    head: usize,
    /// The oldest chunk, next in line for eviction.
    tail: usize,
    len: usize,
}

/// A pinned chunk. Dropping it releases the reference.
pub(crate) struct ChunkRef {
    chunk: Arc<Chunk>,
}

impl ChunkWindows {
    pub(crate) fn new(chunk_size: u64, capacity: usize) -> Self {
        ChunkWindows {
            ring: Mutex::new(Ring::with_capacity(capacity)),
            chunk_size,
            evictions: AtomicU64::new(0),
            mapped: AtomicU64::new(0),
        }
    }

    /// Pin the chunk containing `offset`, mapping it if it is not resident.
    ///
    /// The caller must have made sure the data store covers the whole chunk.
    pub(crate) fn acquire(&self, offset: u64, data: &DataStore) -> LogResult<ChunkRef> {
        let start = self.chunk_start(offset);
        let mut ring = self.ring.lock();

        self.make_room(&mut ring, &[start])?;
        self.pin(&mut ring, start, data)
    }

    /// Pin the chunks containing `first` and `last` together, or neither of them.
    ///
    /// Nothing is held while the ring is exhausted, so writers needing two chunks never wait on
    /// each other with one chunk pinned.
    pub(crate) fn acquire_pair(
        &self,
        first: u64,
        last: u64,
        data: &DataStore,
    ) -> LogResult<(ChunkRef, ChunkRef)> {
        let (first, last) = (self.chunk_start(first), self.chunk_start(last));
        let mut ring = self.ring.lock();

        self.make_room(&mut ring, &[first, last])?;
        let first = self.pin(&mut ring, first, data)?;
        let last = self.pin(&mut ring, last, data)?;
        Ok((first, last))
    }

    fn chunk_start(&self, offset: u64) -> u64 {
        offset - offset % self.chunk_size
    }

    /// Evict from the tail until every chunk of `starts` fits into the ring.
    ///
    /// Evicting one of `starts` only makes it missing again. The loop ends at the latest when
    /// the ring runs out of unpinned tails.
    fn make_room(&self, ring: &mut Ring, starts: &[u64]) -> LogResult<()> {
        loop {
            let missing = starts
                .iter()
                .filter(|&&start| ring.find(start).is_none())
                .count();

            if ring.len + missing <= ring.capacity() {
                return Ok(());
            }

            if !ring.evict_tail() {
                return Err(LogError::BackpressureExhausted {
                    capacity: ring.capacity(),
                });
            }

            self.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(resident = ring.len, "evicted oldest chunk");
        }
    }

    /// Reference the chunk at `start`, mapping it into a free slot if it is not resident.
    fn pin(&self, ring: &mut Ring, start: u64, data: &DataStore) -> LogResult<ChunkRef> {
        if let Some(chunk) = ring.find(start) {
            chunk.refs.fetch_add(1, Ordering::Relaxed);
            return Ok(ChunkRef {
                chunk: Arc::clone(chunk),
            });
        }

        // Lossless, the chunk size was validated to fit into `usize`.
        let map = data.map_window(start, self.chunk_size as usize)?;
        self.mapped.fetch_add(1, Ordering::Relaxed);

        let chunk = Arc::new(Chunk {
            start,
            map,
            refs: AtomicUsize::new(1),
        });

        ring.push(Arc::clone(&chunk));
        tracing::trace!(start, resident = ring.len, "mapped chunk");

        Ok(ChunkRef { chunk })
    }

    /// Release a pinned chunk. Equivalent to dropping it.
    pub(crate) fn release(&self, chunk: ChunkRef) {
        drop(chunk)
    }

    pub(crate) fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Number of currently mapped chunks.
    pub(crate) fn resident(&self) -> usize {
        self.ring.lock().len
    }

    pub(crate) fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub(crate) fn mapped(&self) -> u64 {
        self.mapped.load(Ordering::Relaxed)
    }
}

impl Ring {
    fn with_capacity(capacity: usize) -> Self {
        Ring {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    fn find(&self, start: u64) -> Option<&Arc<Chunk>> {
        (0..self.len)
            .map(|i| (self.tail + i) % self.slots.len())
            .filter_map(|idx| self.slots[idx].as_ref())
            .find(|chunk| chunk.start == start)
    }

    fn push(&mut self, chunk: Arc<Chunk>) {
        debug_assert!(!self.is_full());
        debug_assert!(self.slots[self.head].is_none());
        self.slots[self.head] = Some(chunk);
        self.head = (self.head + 1) % self.slots.len();
        self.len += 1;
    }

    /// Unmap the oldest chunk if nobody depends on it.
    fn evict_tail(&mut self) -> bool {
        if self.len == 0 {
            return false;
        }

        let slot = &mut self.slots[self.tail];
        // Acquire: all writes through the mapping by released references happen before the unmap.
        match slot {
            Some(chunk) if chunk.refs.load(Ordering::Acquire) == 0 => {}
            _ => return false,
        }

        *slot = None;
        self.tail = (self.tail + 1) % self.slots.len();
        self.len -= 1;
        true
    }
}

impl ChunkRef {
    pub(crate) fn start(&self) -> u64 {
        self.chunk.start
    }

    /// Copy `bytes` into the window at the absolute log offset `offset`.
    ///
    /// The range must be part of a reservation held by the caller.
    pub(crate) fn copy_in(&self, offset: u64, bytes: &[u8]) {
        let at = offset
            .checked_sub(self.chunk.start)
            .and_then(|at| usize::try_from(at).ok())
            .filter(|&at| at <= self.chunk.map.len() && bytes.len() <= self.chunk.map.len() - at);
        let Some(at) = at else {
            panic!(
                "write of {} bytes at {offset} outside of chunk at {}",
                bytes.len(),
                self.chunk.start
            );
        };

        // Safety: in bounds of the mapping as checked above, and the mapping lives as long as the
        // `Arc`. Reservations are disjoint so no other writer touches these bytes; and `bytes`
        // can not alias a shared mapping we hand out nowhere.
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.chunk.map.as_mut_ptr().add(at),
                bytes.len(),
            )
        }
    }
}

impl Drop for ChunkRef {
    fn drop(&mut self) {
        self.chunk.refs.fetch_sub(1, Ordering::Release);
    }
}
