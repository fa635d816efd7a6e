//! Structural changes of the data store size: growth behind the cursor and trimming.
//!
//! Both run under the structural lock of the shared record. The committed size is only ever
//! published after the store itself has been resized, so no participant maps a chunk beyond the
//! real extent of the file.
use crate::config::{align_up, LogConfig};
use crate::error::{LogError, LogResult};
use crate::meta::MetaRecord;
use crate::store::DataStore;

/// Outcome of a sizing operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Resize {
    /// The committed size afterwards.
    pub size: u64,
    /// Whether this call changed the store.
    pub changed: bool,
}

/// Make sure the committed size covers `end`.
pub(crate) fn ensure_capacity(
    meta: &MetaRecord,
    data: &DataStore,
    end: u64,
    config: &LogConfig,
) -> LogResult<Resize> {
    let committed = meta.committed_size();
    if end <= committed {
        return Ok(Resize {
            size: committed,
            changed: false,
        });
    }

    let lock = meta.lock(config.backoff, config.lock_timeout)?;

    if meta.is_panicked() {
        return Err(LogError::Panicked);
    }

    // Someone else may have grown the store while we waited.
    let committed = meta.committed_size();
    if end <= committed {
        return Ok(Resize {
            size: committed,
            changed: false,
        });
    }

    let target =
        align_up(end, meta.chunk_size()).ok_or(LogError::CursorOverflow { requested: end })?;

    if let Err(source) = data.extend(committed, target) {
        meta.mark_panicked(&lock);
        tracing::warn!(committed, target, %source, "data store extension failed, log panicked");
        return Err(LogError::CapacityExtensionFailed {
            requested: target,
            source,
        });
    }

    meta.publish_committed(&lock, target);
    tracing::debug!(from = committed, to = target, "grew data store");

    Ok(Resize {
        size: target,
        changed: true,
    })
}

/// Shrink the store to the smallest chunk multiple covering the cursor, never below one chunk.
///
/// The cursor is fenced for the duration so that no reservation can land beyond the size we are
/// about to cut the store down to. Writers already holding a reservation end at or before the
/// fenced cursor and are not affected.
pub(crate) fn trim(meta: &MetaRecord, data: &DataStore, config: &LogConfig) -> LogResult<Resize> {
    if meta.is_panicked() {
        return Err(LogError::Panicked);
    }

    let lock = meta.lock(config.backoff, config.lock_timeout)?;

    if meta.is_panicked() {
        return Err(LogError::Panicked);
    }

    let chunk_size = meta.chunk_size();
    let committed = meta.committed_size();
    let cursor = meta.fence_cursor(&lock);

    let target = align_up(cursor, chunk_size).map(|target| target.max(chunk_size));

    let result = match target {
        Some(target) if target < committed => {
            match data.shrink(target) {
                Ok(()) => {
                    meta.publish_committed(&lock, target);
                    tracing::debug!(from = committed, to = target, cursor, "trimmed data store");
                    Ok(Resize {
                        size: target,
                        changed: true,
                    })
                }
                Err(err) => {
                    // The store has an unknown size now.
                    meta.mark_panicked(&lock);
                    tracing::warn!(committed, target, %err, "data store trim failed, log panicked");
                    Err(LogError::Io(err))
                }
            }
        }
        _ => Ok(Resize {
            size: committed,
            changed: false,
        }),
    };

    meta.lift_fence(&lock);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU64;

    const CHUNK: u64 = 4096;

    fn setup() -> (&'static MetaRecord, DataStore, LogConfig) {
        let record = Box::leak(Box::new(MetaRecord::zeroed()));
        let data = DataStore::new(tempfile::tempfile().unwrap());
        data.extend(0, CHUNK).unwrap();
        record.initialize(4096, CHUNK, CHUNK);
        record.publish_ready();
        let config = LogConfig::default().with_chunk_size(CHUNK);
        (record, data, config)
    }

    #[test]
    fn growth_rounds_to_chunks() {
        let (meta, data, config) = setup();

        let r = ensure_capacity(meta, &data, 100, &config).unwrap();
        assert_eq!(r, Resize { size: CHUNK, changed: false });

        let r = ensure_capacity(meta, &data, CHUNK + 1, &config).unwrap();
        assert_eq!(r, Resize { size: 2 * CHUNK, changed: true });
        assert_eq!(data.len().unwrap(), 2 * CHUNK);

        let r = ensure_capacity(meta, &data, 51200, &config).unwrap();
        assert_eq!(r.size, 53248);
        assert_eq!(meta.committed_size() % CHUNK, 0);
    }

    #[test]
    fn trim_is_idempotent() {
        let (meta, data, config) = setup();
        let t = config.lock_timeout;
        ensure_capacity(meta, &data, 10 * CHUNK, &config).unwrap();
        meta.checkout(CHUNK + 7, config.backoff, t).unwrap();

        let first = trim(meta, &data, &config).unwrap();
        assert_eq!(first, Resize { size: 2 * CHUNK, changed: true });
        assert_eq!(data.len().unwrap(), 2 * CHUNK);

        let second = trim(meta, &data, &config).unwrap();
        assert_eq!(second, Resize { size: 2 * CHUNK, changed: false });
        assert!(!meta.status().fenced);
    }

    #[test]
    fn trim_keeps_one_chunk() {
        let (meta, data, config) = setup();
        ensure_capacity(meta, &data, 3 * CHUNK, &config).unwrap();

        let r = trim(meta, &data, &config).unwrap();
        assert_eq!(r.size, CHUNK);
        assert_eq!(data.len().unwrap(), CHUNK);
    }

    #[test]
    fn trim_does_not_grow() {
        let (meta, data, config) = setup();
        // Reserved but growth not yet performed.
        meta.checkout(5 * CHUNK, config.backoff, config.lock_timeout).unwrap();

        let r = trim(meta, &data, &config).unwrap();
        assert_eq!(r, Resize { size: CHUNK, changed: false });
    }

    /// A store whose file descriptor refuses every resize.
    fn read_only_store(len: u64) -> DataStore {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(len).unwrap();
        DataStore::new(std::fs::File::open(file.path()).unwrap())
    }

    #[test]
    fn failed_extension_panics_the_log() {
        let (meta, _, config) = setup();
        let data = read_only_store(CHUNK);
        let t = config.lock_timeout;
        meta.checkout(3 * CHUNK, config.backoff, t).unwrap();

        match ensure_capacity(meta, &data, 3 * CHUNK, &config) {
            Err(err @ LogError::CapacityExtensionFailed { requested, .. }) => {
                assert_eq!(requested, 3 * CHUNK);
                assert!(err.is_fatal());
            }
            other => panic!("expected extension failure, got {other:?}"),
        }

        let status = meta.status();
        assert!(status.panicked);
        assert!(!status.locked);
        assert_eq!(status.committed_size, CHUNK);
        assert_eq!(status.cursor, 3 * CHUNK);

        assert!(matches!(meta.checkout(1, config.backoff, t), Err(LogError::Panicked)));
        assert!(matches!(trim(meta, &data, &config), Err(LogError::Panicked)));
        assert!(matches!(
            ensure_capacity(meta, &data, 4 * CHUNK, &config),
            Err(LogError::Panicked)
        ));
        assert_eq!(meta.cursor(), 3 * CHUNK);
    }

    #[test]
    fn failed_shrink_panics_the_log() {
        let (meta, _, config) = setup();
        let data = read_only_store(4 * CHUNK);
        {
            let lock = meta.try_lock().unwrap();
            meta.publish_committed(&lock, 4 * CHUNK);
        }
        meta.checkout(10, config.backoff, config.lock_timeout).unwrap();

        assert!(matches!(trim(meta, &data, &config), Err(LogError::Io(_))));

        let status = meta.status();
        assert!(status.panicked);
        assert!(!status.locked);
        assert!(!status.fenced);
        assert_eq!(status.committed_size, 4 * CHUNK);

        assert!(matches!(
            meta.checkout(1, config.backoff, config.lock_timeout),
            Err(LogError::Panicked)
        ));
        assert!(matches!(trim(meta, &data, &config), Err(LogError::Panicked)));
    }

    #[test]
    fn panicked_log_refuses_structural_changes() {
        let (meta, data, config) = setup();
        {
            let lock = meta.try_lock().unwrap();
            meta.mark_panicked(&lock);
        }

        let committed = meta.committed_size();
        assert!(matches!(
            ensure_capacity(meta, &data, 2 * CHUNK, &config),
            Err(LogError::Panicked)
        ));
        assert!(matches!(trim(meta, &data, &config), Err(LogError::Panicked)));
        assert_eq!(meta.committed_size(), committed);
    }

    #[test]
    fn concurrent_growth_extends_once() {
        let (meta, data, config) = setup();
        let changed = AtomicU64::new(0);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let r = ensure_capacity(meta, &data, 8 * CHUNK, &config).unwrap();
                    assert_eq!(r.size, 8 * CHUNK);
                    if r.changed {
                        changed.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
                    }
                });
            }
        });

        assert_eq!(changed.into_inner(), 1);
        assert_eq!(data.len().unwrap(), 8 * CHUNK);
    }
}
