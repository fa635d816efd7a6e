//! Creating the two stores of a log exactly once, or joining them.
//!
//! Exclusive creation of the metadata store elects the initializer. Everyone else is a joiner and
//! must not touch the data store before the record reads `ready`, the last write of the
//! initializer. To observers the pair of stores thus appears atomically.
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use memmap2::MmapRaw;

use crate::config::{page_size, LogConfig};
use crate::error::{LogError, LogResult};
use crate::meta::{MetaRecord, SharedMeta};
use crate::store::DataStore;
use crate::wait::Waiter;

/// How this participant came to hold the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Created the stores and initialized the shared record.
    Creator,
    /// Found the stores already present and waited for them to become ready.
    Joiner,
}

pub(crate) struct Attached {
    pub meta: SharedMeta,
    pub data: DataStore,
    pub role: Role,
}

pub(crate) fn create_or_attach(
    meta_path: &Path,
    data_path: &Path,
    config: &LogConfig,
) -> LogResult<Attached> {
    let page_size = page_size()?;
    config.validate(page_size)?;

    let mut waiter = Waiter::new(config.backoff, config.init_timeout);

    loop {
        let created = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(meta_path);

        match created {
            Ok(file) => {
                let attached = initialize(file, data_path, page_size, config);

                if let Err(err) = &attached {
                    // Let a later attempt elect a new initializer instead of waiting on us.
                    tracing::warn!(path = %meta_path.display(), %err, "log initialization failed");
                    if let Err(err) = std::fs::remove_file(meta_path) {
                        tracing::warn!(
                            path = %meta_path.display(),
                            %err,
                            "failed to remove metadata store, joiners will time out"
                        );
                    }
                }

                return attached;
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                if let Some(attached) = join(meta_path, data_path, config, &mut waiter)? {
                    return Ok(attached);
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn initialize(
    file: File,
    data_path: &Path,
    page_size: u64,
    config: &LogConfig,
) -> LogResult<Attached> {
    file.set_len(MetaRecord::RECORD_SIZE as u64)?;
    let meta = SharedMeta::from_map(MmapRaw::map_raw(&file)?)?;

    let data_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(data_path)?;
    let data = DataStore::new(data_file);
    data.extend(0, config.chunk_size)?;

    meta.initialize(page_size, config.chunk_size, config.chunk_size);
    meta.publish_ready();
    tracing::debug!(
        data = %data_path.display(),
        chunk_size = config.chunk_size,
        "created log"
    );

    Ok(Attached {
        meta,
        data,
        role: Role::Creator,
    })
}

/// Wait for the initializer and attach to its stores.
///
/// Returns `None` if the metadata store vanished or was replaced, i.e. the initializer gave up.
fn join(
    meta_path: &Path,
    data_path: &Path,
    config: &LogConfig,
    waiter: &mut Waiter,
) -> LogResult<Option<Attached>> {
    let timed_out = |waited| {
        tracing::warn!(path = %meta_path.display(), ?waited, "log never became ready");
        LogError::InitializationTimeout { waited }
    };

    // The path existing is not enough, it may still be mid-creation.
    let file = loop {
        match OpenOptions::new().read(true).write(true).open(meta_path) {
            Ok(file) if file.metadata()?.len() >= MetaRecord::RECORD_SIZE as u64 => break file,
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {
                waiter.snooze().map_err(timed_out)?;
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        }

        waiter.snooze().map_err(timed_out)?;
    };

    let meta = SharedMeta::from_map(MmapRaw::map_raw(&file)?)?;
    let opened = file.metadata()?;

    while !meta.is_ready() {
        // A creator that gave up unlinks the store we mapped, never to publish it.
        match std::fs::metadata(meta_path) {
            Ok(current) if (current.dev(), current.ino()) == (opened.dev(), opened.ino()) => {}
            Ok(_) => return Ok(None),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        }

        waiter.snooze().map_err(timed_out)?;
    }

    meta.validate()?;

    if meta.chunk_size() != config.chunk_size {
        tracing::debug!(
            configured = config.chunk_size,
            stored = meta.chunk_size(),
            "adopting chunk size of the existing log"
        );
    }

    let data_file = OpenOptions::new().read(true).write(true).open(data_path)?;
    tracing::debug!(data = %data_path.display(), "joined log");

    Ok(Some(Attached {
        meta,
        data: DataStore::new(data_file),
        role: Role::Joiner,
    }))
}
