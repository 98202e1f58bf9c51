//! Error types for Meridian operations.
//!
//! All fallible operations in the crate return `Result<T, MeridianError>`.
//! The variants map onto the failure modes of the quorum protocol: transport
//! and timeout errors are tolerated per-replica as long as a quorum is still
//! reachable, while `QuorumUnreachable` is what a client actually sees when
//! a phase definitely failed.
use crate::types::ClockValue;
use std::time::Duration;
use thiserror::Error;

/// The main error type for Meridian operations.
#[derive(Error, Debug)]
pub enum MeridianError {
    /// Key not found on any contacted replica.
    #[error("key '{key}' not found")]
    KeyNotFound {
        /// The key that was not found
        key: String,
    },

    /// A connection could not be established, broke mid-call, or the peer
    /// answered with a protocol-level error.
    #[error("transport error: {0}")]
    Transport(String),

    /// A per-RPC deadline elapsed.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Fewer than a strict majority of replicas completed a quorum phase.
    #[error("{0}")]
    QuorumUnreachable(String),

    /// A replica refused to overwrite a stored entry with an older clock.
    ///
    /// The coordinator tolerates this: whichever writer carried the newer
    /// clock has already won the key.
    #[error("stale write: stored clock {stored:?} is newer than {proposed:?}")]
    StaleWrite {
        /// Clock of the entry already stored
        stored: ClockValue,
        /// Clock of the rejected incoming entry
        proposed: ClockValue,
    },

    /// I/O failure in the local storage engine.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// The clock server could not read, parse, or advance its epoch file.
    /// Fatal at startup.
    #[error("clock initialisation failed: {0}")]
    ClockInit(String),

    /// Wire-format (JSON) serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage-record (bincode) encoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// Invalid or unreadable configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Unexpected error from a ticket shard.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Result type alias for Meridian operations.
pub type MeridianResult<T> = Result<T, MeridianError>;
