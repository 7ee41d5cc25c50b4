//! Error types for classifier construction and loading
//!
//! Everything here is fatal at construction or load time. The hot path has no
//! recoverable errors; a full parallel-worker queue is a backpressure signal
//! surfaced as a `false` return, not an error.

use nuevomatch_common::ReadError;
use thiserror::Error;

/// Classifier error type
#[derive(Error, Debug)]
pub enum ClassifierError {
    /// Malformed or truncated container blob
    #[error("container read failed: {0}")]
    Read(#[from] ReadError),

    /// A remainder classifier is enabled but the configuration carries none
    #[error("remainder classifier is enabled but is not set")]
    MissingRemainder,

    /// The remainder was declared external but no instance was supplied
    #[error("remainder classifier was set as external, but is not available")]
    MissingExternalRemainder,

    /// Rebuild requested for a remainder type name that is not known
    #[error("cannot rebuild a remainder classifier of type {0:?}")]
    UnknownRemainderType(String),

    /// The remainder failed to load twice: once from the blob, once rebuilt
    #[error("remainder classifier failed to load after rebuilding: {0}")]
    RemainderLoadFailed(ReadError),

    /// Subset filtering left nothing to classify with
    #[error("classifier has no valid subsets")]
    NoValidSubsets,

    /// Parallel worker queues must be power-of-two deep
    #[error("queue size must be a power of two, got {0}")]
    InvalidQueueSize(u32),

    /// At least one processing unit is required
    #[error("number of cores must be at least 1")]
    InvalidCoreCount,

    /// A worker group may hold at most one remainder classifier
    #[error("cannot add two remainder classifiers to the same worker group")]
    DuplicateRemainder,

    /// A worker processing unit could not be started
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),
}

/// Result alias for classifier operations
pub type Result<T> = std::result::Result<T, ClassifierError>;
