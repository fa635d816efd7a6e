use std::time::Duration;

/// Every way an operation on a shared log can fail.
///
/// Structural failures (`VersionMismatch`, `Panicked`, `CapacityExtensionFailed`) are terminal
/// for the log instance. `BackpressureExhausted` is local to this process and retryable.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// A joiner never observed the `ready` flag of the metadata record.
    #[error("log was not initialized within {waited:?}")]
    InitializationTimeout { waited: Duration },
    /// The metadata store was written with a layout we do not understand.
    #[error("metadata layout mismatch: expected version {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    /// The shared record has been marked unusable by some participant.
    #[error("log is panicked, no further writes are possible")]
    Panicked,
    /// The chunk ring is full and every resident chunk is pinned.
    #[error("all {capacity} resident chunks are in use")]
    BackpressureExhausted { capacity: usize },
    /// The data store could not be grown. The log has been panicked as a consequence.
    #[error("failed to extend data store to {requested} bytes: {source}")]
    CapacityExtensionFailed {
        requested: u64,
        #[source]
        source: std::io::Error,
    },
    /// The structural lock was not released within the configured bound.
    #[error("structural lock still held by pid {owner} after {waited:?}")]
    LockTimeout { waited: Duration, owner: u32 },
    /// The reservation does not fit into the cursor's value range.
    #[error("cannot reserve {requested} more bytes, cursor would overflow")]
    CursorOverflow { requested: u64 },
    /// The configuration was rejected before touching any store.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LogError {
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: core::fmt::Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Whether retrying the same operation later may succeed.
    ///
    /// Only failures local to this process or to a single wait qualify. Once the log is panicked
    /// or its layout is foreign, no amount of retrying helps.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LogError::InitializationTimeout { .. } | LogError::BackpressureExhausted { .. }
        )
    }

    /// Whether this error means the shared log itself is no longer usable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LogError::Panicked
                | LogError::VersionMismatch { .. }
                | LogError::CapacityExtensionFailed { .. }
        )
    }
}

pub type LogResult<T> = Result<T, LogError>;
