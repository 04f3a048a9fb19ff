//! Core domain types shared by the cache, the peer protocol, and the
//! metadata store.

use thiserror::Error;

/// Wire status code meaning success. The only code equal to zero.
pub const CODE_SUCCESS: i64 = 0;
/// Wire status code for any otherwise-unclassified failure.
pub const CODE_UNKNOWN: i64 = 1;
/// Wire status code for an allocation refused by the memory monitor.
pub const CODE_OOM: i64 = 2;
/// Wire status code for a metadata lookup miss.
pub const CODE_NOT_FOUND: i64 = 404;

/// Failure kinds surfaced by every internal operation.
///
/// `NotFound` is never treated as a failure upstream: during reconciliation it
/// means the record was evicted under us and terminates the loop. `OutOfMemory`
/// is recoverable and is surfaced to the requesting peer as a response code.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("record not found")]
    NotFound,
    #[error("out of memory")]
    OutOfMemory,
    #[error(transparent)]
    Unknown(#[from] anyhow::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;

impl CacheError {
    /// Map the error to its wire status code.
    pub fn code(&self) -> i64 {
        match self {
            CacheError::NotFound => CODE_NOT_FOUND,
            CacheError::OutOfMemory => CODE_OOM,
            CacheError::Unknown(_) => CODE_UNKNOWN,
        }
    }

    /// Map a wire status code back to a result.
    pub fn check(code: i64) -> CacheResult<()> {
        match code {
            CODE_SUCCESS => Ok(()),
            CODE_NOT_FOUND => Err(CacheError::NotFound),
            CODE_OOM => Err(CacheError::OutOfMemory),
            other => Err(CacheError::Unknown(anyhow::anyhow!(
                "peer returned code {other}"
            ))),
        }
    }
}

/// Lifecycle state of a checkpoint file.
///
/// Transitions are monotonic along the legal graph; `Broken` and
/// `Obsolescent` are sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointState {
    /// Request issued, bytes not written to cache yet.
    Pending,
    /// Bytes are in local shared memory, not yet replicated.
    Cached,
    /// Replicated to the ring successor, not yet persisted.
    BackedUp,
    /// Persisted to durable storage. Terminal for a live record.
    Persistent,
    /// Metadata/data mismatch or corruption. Skipped by the reconciler.
    Broken,
    /// Evicted; awaiting deletion.
    Obsolescent,
}

impl CheckpointState {
    pub fn as_i64(self) -> i64 {
        match self {
            CheckpointState::Pending => 0,
            CheckpointState::Cached => 1,
            CheckpointState::BackedUp => 2,
            CheckpointState::Persistent => 3,
            CheckpointState::Broken => 4,
            CheckpointState::Obsolescent => 5,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        Some(match value {
            0 => CheckpointState::Pending,
            1 => CheckpointState::Cached,
            2 => CheckpointState::BackedUp,
            3 => CheckpointState::Persistent,
            4 => CheckpointState::Broken,
            5 => CheckpointState::Obsolescent,
            _ => return None,
        })
    }
}

impl std::fmt::Display for CheckpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CheckpointState::Pending => "PENDING",
            CheckpointState::Cached => "CACHED",
            CheckpointState::BackedUp => "BACKED_UP",
            CheckpointState::Persistent => "PERSISTENT",
            CheckpointState::Broken => "BROKEN",
            CheckpointState::Obsolescent => "OBSOLESCENT",
        };
        f.write_str(name)
    }
}

/// Iteration tag used when the client could not extract a numeric iteration.
pub const ITERATION_UNKNOWN: &str = "unknown";

/// Durable descriptor of a checkpoint file. One row per file in the metadata
/// store; the filename is the primary key within a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// Tenant key of the training job.
    pub job: String,
    /// Checkpoint file path, unique per job.
    pub filename: String,
    /// Rank of the node whose client created this checkpoint.
    pub node_rank: i64,
    /// Numeric iteration tag, or [`ITERATION_UNKNOWN`].
    pub iteration: String,
    pub state: CheckpointState,
    /// Payload size in bytes. Non-zero for any state at or past `Cached`.
    pub size: u64,
}

impl Metadata {
    /// A lookup skeleton: only job and filename populated.
    pub fn key(job: impl Into<String>, filename: impl Into<String>) -> Self {
        Metadata {
            job: job.into(),
            filename: filename.into(),
            node_rank: -1,
            iteration: String::new(),
            state: CheckpointState::Pending,
            size: 0,
        }
    }
}

impl std::fmt::Display for Metadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "job {} file {} rank {} iteration {} state {} size {}",
            self.job, self.filename, self.node_rank, self.iteration, self.state, self.size
        )
    }
}

/// Volatile, node-local handle of a resident checkpoint region.
///
/// `(pid, memfd)` uniquely identify the memfd-backed region; clients mmap it
/// through `/proc/<pid>/fd/<memfd>`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataEntry {
    /// Mapped address in the owning process. Non-zero for a live entry.
    pub address: u64,
    /// Process that holds the file descriptor.
    pub pid: i32,
    /// The memfd itself.
    pub memfd: i32,
}

impl std::fmt::Display for DataEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "address {:#x} pid {} memfd {}",
            self.address, self.pid, self.memfd
        )
    }
}

/// Filter for batch metadata queries. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchFilter {
    pub node_rank: Option<i64>,
    pub iteration: Option<String>,
    pub state: Option<CheckpointState>,
}

impl BatchFilter {
    pub fn by_rank(rank: i64) -> Self {
        BatchFilter {
            node_rank: Some(rank),
            ..Default::default()
        }
    }

    pub fn by_rank_and_iteration(rank: i64, iteration: impl Into<String>) -> Self {
        BatchFilter {
            node_rank: Some(rank),
            iteration: Some(iteration.into()),
            state: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes_round_trip() {
        for value in 0..6 {
            let state = CheckpointState::from_i64(value).unwrap();
            assert_eq!(state.as_i64(), value);
        }
        assert!(CheckpointState::from_i64(6).is_none());
        assert!(CheckpointState::from_i64(-1).is_none());
    }

    #[test]
    fn error_codes_round_trip() {
        assert!(CacheError::check(CODE_SUCCESS).is_ok());
        assert!(matches!(
            CacheError::check(CODE_NOT_FOUND),
            Err(CacheError::NotFound)
        ));
        assert!(matches!(CacheError::check(CODE_OOM), Err(CacheError::OutOfMemory)));
        assert!(matches!(CacheError::check(7), Err(CacheError::Unknown(_))));
        assert_eq!(CacheError::NotFound.code(), CODE_NOT_FOUND);
        assert_eq!(CacheError::OutOfMemory.code(), CODE_OOM);
    }
}
