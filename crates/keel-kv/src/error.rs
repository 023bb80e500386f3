//! Store error types.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

use crate::device::DeviceError;
use crate::transaction::TxnState;

/// Result type for store operations.
pub type KvResult<T> = Result<T, KvError>;

/// Phase of a device-side batch that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStage {
    Begin,
    Submit,
    Commit,
    Abort,
}

impl fmt::Display for BatchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Begin => "begin",
            Self::Submit => "submit",
            Self::Commit => "commit",
            Self::Abort => "abort",
        })
    }
}

/// Errors surfaced by the key-value backend.
///
/// A missing key is not an error: lookups return `Ok(None)`. Pool exhaustion
/// is not an error either: acquisition blocks until a connection is free.
#[derive(Debug, Error)]
pub enum KvError {
    /// Network or protocol failure talking to the device.
    #[error("device transport error: {0}")]
    Transport(#[source] DeviceError),

    /// A combined key without its separator. Treat as data corruption.
    #[error("combined key {key:?} has no prefix separator")]
    Encoding { key: Bytes },

    /// A device-side batch failed; the transaction was rolled back.
    #[error("batch {stage} failed: {source}")]
    BatchProtocol {
        stage: BatchStage,
        #[source]
        source: DeviceError,
    },

    /// Opening a device session failed.
    #[error("failed to connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: DeviceError,
    },

    /// Store settings were rejected at open.
    #[error("invalid store settings: {0}")]
    InvalidSettings(String),

    /// The transaction no longer accepts this call.
    #[error("transaction is {state}")]
    TransactionState { state: TxnState },

    /// Iterator accessor called while positioned past the end.
    #[error("iterator is positioned past the end")]
    PastTheEnd,
}

impl KvError {
    /// Maps a device status from a non-batch call.
    pub(crate) fn transport(source: DeviceError) -> Self {
        Self::Transport(source)
    }

    pub(crate) fn batch(stage: BatchStage, source: DeviceError) -> Self {
        Self::BatchProtocol { stage, source }
    }

    /// Returns true if this error indicates corrupt data rather than a
    /// transient fault.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Encoding { .. })
    }
}
