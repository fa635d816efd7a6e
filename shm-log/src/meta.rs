//! The record shared by every participant of a log.
//!
//! All fields are atomics in a `#[repr(C)]` struct at the start of the metadata store. Since the
//! store is a mapped file, its layout *is* the protocol between processes and must not change
//! without bumping [`MetaRecord::VERSION`].
use core::ops::Range;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use memmap2::MmapRaw;

use crate::config::BackoffPolicy;
use crate::error::{LogError, LogResult};
use crate::wait::Waiter;

/// Set in the cursor word when the log panicked. Never cleared.
const CURSOR_FROZEN: u64 = 1 << 63;
/// Set in the cursor word while a trim sizes the data store against the cursor.
const CURSOR_FENCED: u64 = 1 << 62;
/// Bits of the cursor word holding the offset.
const CURSOR_OFFSET: u64 = CURSOR_FENCED - 1;

#[repr(C)]
pub(crate) struct MetaRecord {
    magic: AtomicU64,
    version: AtomicU32,
    ready: AtomicU32,
    locked: AtomicU32,
    /// Pid of the lock holder, diagnostics only.
    lock_owner: AtomicU32,
    panicked: AtomicU32,
    _reserved: AtomicU32,
    page_size: AtomicU64,
    chunk_size: AtomicU64,
    committed_size: AtomicU64,
    cursor: CursorLine,
}

/// The cursor is hammered by every writer, keep it away from the flags.
#[repr(C, align(128))]
struct CursorLine {
    value: AtomicU64,
}

const _: () = assert!(core::mem::size_of::<MetaRecord>() <= MetaRecord::RECORD_SIZE);

/// Owner of the metadata mapping.
pub(crate) struct SharedMeta {
    record: &'static MetaRecord,
    /// The memory map keeping `record` valid. Only accessed on `Drop`.
    #[allow(dead_code)]
    map: MmapRaw,
}

/// Proof of holding the structural lock. Releases it on drop.
pub(crate) struct StructuralLock<'lt> {
    record: &'lt MetaRecord,
}

/// A snapshot of the shared record.
///
/// Fields are loaded one by one, so the snapshot is not atomic as a whole.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogStatus {
    pub version: u32,
    pub ready: bool,
    pub locked: bool,
    pub lock_owner: u32,
    pub panicked: bool,
    pub fenced: bool,
    pub page_size: u64,
    pub chunk_size: u64,
    pub committed_size: u64,
    pub cursor: u64,
}

impl MetaRecord {
    pub const MAGIC: u64 = u64::from_le_bytes(*b"shm-log\0");
    pub const VERSION: u32 = 1;
    /// The fixed size of the metadata store. Joiners wait for the store to reach it.
    pub const RECORD_SIZE: usize = 4096;

    #[cfg(test)]
    pub(crate) fn zeroed() -> Self {
        MetaRecord {
            magic: AtomicU64::new(0),
            version: AtomicU32::new(0),
            ready: AtomicU32::new(0),
            locked: AtomicU32::new(0),
            lock_owner: AtomicU32::new(0),
            panicked: AtomicU32::new(0),
            _reserved: AtomicU32::new(0),
            page_size: AtomicU64::new(0),
            chunk_size: AtomicU64::new(0),
            committed_size: AtomicU64::new(0),
            cursor: CursorLine {
                value: AtomicU64::new(0),
            },
        }
    }

    /// Write all fields of a fresh record. Does not publish `ready`.
    pub(crate) fn initialize(&self, page_size: u64, chunk_size: u64, committed_size: u64) {
        self.magic.store(Self::MAGIC, Ordering::Relaxed);
        self.version.store(Self::VERSION, Ordering::Relaxed);
        self.locked.store(0, Ordering::Relaxed);
        self.lock_owner.store(0, Ordering::Relaxed);
        self.panicked.store(0, Ordering::Relaxed);
        self.page_size.store(page_size, Ordering::Relaxed);
        self.chunk_size.store(chunk_size, Ordering::Relaxed);
        self.committed_size.store(committed_size, Ordering::Relaxed);
        self.cursor.value.store(0, Ordering::Relaxed);
    }

    /// The final step of initialization; every prior write becomes visible with it.
    pub(crate) fn publish_ready(&self) {
        self.ready.store(1, Ordering::Release);
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) != 0
    }

    /// Check that the record was written in a layout we understand.
    pub(crate) fn validate(&self) -> LogResult<()> {
        let found = self.version.load(Ordering::Relaxed);

        if self.magic.load(Ordering::Relaxed) != Self::MAGIC || found != Self::VERSION {
            return Err(LogError::VersionMismatch {
                expected: Self::VERSION,
                found,
            });
        }

        Ok(())
    }

    pub(crate) fn chunk_size(&self) -> u64 {
        self.chunk_size.load(Ordering::Relaxed)
    }

    pub(crate) fn page_size(&self) -> u64 {
        self.page_size.load(Ordering::Relaxed)
    }

    /// The committed size of the data store.
    ///
    /// Acquire ordering: a size observed here is backed by the store when mapping chunks.
    pub(crate) fn committed_size(&self) -> u64 {
        self.committed_size.load(Ordering::Acquire)
    }

    pub(crate) fn cursor(&self) -> u64 {
        self.cursor.value.load(Ordering::Acquire) & CURSOR_OFFSET
    }

    pub(crate) fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire) != 0
    }

    pub(crate) fn lock_owner(&self) -> u32 {
        self.lock_owner.load(Ordering::Relaxed)
    }

    /// Reserve `size` bytes at the end of the log.
    ///
    /// A panicked log fails without touching the cursor. While a trim holds the fence this waits,
    /// bounded by `timeout`.
    pub(crate) fn checkout(
        &self,
        size: u64,
        policy: BackoffPolicy,
        timeout: Duration,
    ) -> LogResult<Range<u64>> {
        let mut fence_wait: Option<Waiter> = None;
        let mut current = self.cursor.value.load(Ordering::Relaxed);

        loop {
            if current & CURSOR_FROZEN != 0 {
                return Err(LogError::Panicked);
            }

            if current & CURSOR_FENCED != 0 {
                let waiter = fence_wait.get_or_insert_with(|| Waiter::new(policy, timeout));
                waiter.snooze().map_err(|waited| LogError::LockTimeout {
                    waited,
                    owner: self.lock_owner(),
                })?;
                current = self.cursor.value.load(Ordering::Relaxed);
                continue;
            }

            let end = current
                .checked_add(size)
                .filter(|&end| end <= CURSOR_OFFSET)
                .ok_or(LogError::CursorOverflow { requested: size })?;

            match self.cursor.value.compare_exchange_weak(
                current,
                end,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(current..end),
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn try_lock(&self) -> Option<StructuralLock<'_>> {
        self.locked
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .ok()?;
        self.lock_owner.store(std::process::id(), Ordering::Relaxed);
        Some(StructuralLock { record: self })
    }

    /// Acquire the structural lock, polling with backoff.
    ///
    /// There is no recovery if the holder died; the wait simply times out.
    pub(crate) fn lock(
        &self,
        policy: BackoffPolicy,
        timeout: Duration,
    ) -> LogResult<StructuralLock<'_>> {
        let mut waiter = Waiter::new(policy, timeout);

        loop {
            if let Some(lock) = self.try_lock() {
                return Ok(lock);
            }

            if let Err(waited) = waiter.snooze() {
                let owner = self.lock_owner();
                tracing::warn!(?waited, owner, "structural lock wait timed out");
                return Err(LogError::LockTimeout { waited, owner });
            }
        }
    }

    /// Publish a new committed size. Call only after the store has been resized.
    pub(crate) fn publish_committed(&self, _held: &StructuralLock<'_>, size: u64) {
        self.committed_size.store(size, Ordering::Release);
    }

    /// Freeze the log forever. The cursor is frozen before the flag is raised so that no
    /// reservation slips through after `panicked` can be observed.
    pub(crate) fn mark_panicked(&self, _held: &StructuralLock<'_>) {
        self.cursor.value.fetch_or(CURSOR_FROZEN, Ordering::AcqRel);
        self.panicked.store(1, Ordering::Release);
    }

    /// Stop all reservations and return the exact cursor.
    pub(crate) fn fence_cursor(&self, _held: &StructuralLock<'_>) -> u64 {
        self.cursor.value.fetch_or(CURSOR_FENCED, Ordering::AcqRel) & CURSOR_OFFSET
    }

    pub(crate) fn lift_fence(&self, _held: &StructuralLock<'_>) {
        self.cursor.value.fetch_and(!CURSOR_FENCED, Ordering::Release);
    }

    pub(crate) fn status(&self) -> LogStatus {
        let cursor = self.cursor.value.load(Ordering::Acquire);

        LogStatus {
            version: self.version.load(Ordering::Relaxed),
            ready: self.is_ready(),
            locked: self.locked.load(Ordering::Relaxed) != 0,
            lock_owner: self.lock_owner(),
            panicked: self.is_panicked(),
            fenced: cursor & CURSOR_FENCED != 0,
            page_size: self.page_size(),
            chunk_size: self.chunk_size(),
            committed_size: self.committed_size(),
            cursor: cursor & CURSOR_OFFSET,
        }
    }
}

impl Drop for StructuralLock<'_> {
    fn drop(&mut self) {
        self.record.lock_owner.store(0, Ordering::Relaxed);
        self.record.locked.store(0, Ordering::Release);
    }
}

impl SharedMeta {
    /// Wrap a mapping of the metadata store.
    pub(crate) fn from_map(map: MmapRaw) -> std::io::Result<Self> {
        if map.len() < MetaRecord::RECORD_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "metadata store is smaller than the record",
            ));
        }

        let ptr = map.as_ptr() as *const MetaRecord;
        // Mappings are page aligned, but do not rely on it silently.
        if ptr.align_offset(core::mem::align_of::<MetaRecord>()) != 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "metadata mapping is misaligned",
            ));
        }

        // Safety: the pointer is in-bounds and aligned, and `map` is kept for as long as the
        // reference is handed out (only through `Deref`, bound to the lifetime of `self`). The
        // record consists of atomics only so other processes modifying it concurrently is fine.
        // Mapped file pages are always initialized, zero beyond what was written.
        let record = unsafe { &*ptr };

        Ok(SharedMeta { record, map })
    }
}

impl core::ops::Deref for SharedMeta {
    type Target = MetaRecord;

    fn deref(&self) -> &MetaRecord {
        self.record
    }
}
