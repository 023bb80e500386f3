//! Remote device protocol.
//!
//! The [`Connection`] trait is the seam between the store and a
//! Kinetic-style key-value device. The device natively offers only point
//! lookups, neighbour lookups (`get_next` / `get_previous`), unconditional or
//! versioned writes, and device-side batches. Everything ordered or atomic
//! above that is built by this crate.
//!
//! A [`Connector`] turns [`ConnectionOptions`] into authenticated sessions;
//! [`MemoryConnector`](crate::memory::MemoryConnector) is the in-process
//! implementation used by tests and simulations.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

/// Result type for raw device calls.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Identifier of an open device-side batch.
pub type BatchId = u64;

/// Status returned by a failed device call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// The key (or its requested neighbour) does not exist.
    #[error("key not found")]
    NotFound,

    /// The request never completed (socket, TLS, timeout, framing).
    #[error("transport failure: {0}")]
    Transport(String),

    /// The device answered with a non-success status.
    #[error("device rejected request (status {code}): {message}")]
    Rejected { code: u32, message: String },
}

impl DeviceError {
    /// Returns true for [`DeviceError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// A stored value as the device returns it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Record {
    value: Bytes,
}

impl Record {
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            value: value.into(),
        }
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn into_value(self) -> Bytes {
        self.value
    }
}

/// Version check applied by a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Overwrite unconditionally; concurrent writers resolve last-writer-wins.
    IgnoreVersion,
    /// Reject the write unless the stored version matches.
    RequireSameVersion,
}

/// Durability requested for a non-batched write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistMode {
    /// Acknowledge once persisted.
    WriteThrough,
    /// Acknowledge once accepted; persist later.
    WriteBack,
    /// Persist this write and everything acknowledged before it.
    Flush,
}

/// Capacity log reported by the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriveCapacity {
    pub nominal_capacity_in_bytes: u64,
    /// Fraction of nominal capacity in use, `0.0..=1.0`.
    pub portion_full: f32,
}

/// An authenticated session with the device.
///
/// A connection is not safe for concurrent use; every method takes
/// `&mut self` and the pool lends each connection to one owner at a time.
pub trait Connection: Send {
    /// Point lookup.
    fn get(&mut self, key: &[u8]) -> DeviceResult<Record>;

    /// Returns the first key strictly greater than `key`, with its record.
    fn get_next(&mut self, key: &[u8]) -> DeviceResult<(Bytes, Record)>;

    /// Returns the last key strictly less than `key`, with its record.
    fn get_previous(&mut self, key: &[u8]) -> DeviceResult<(Bytes, Record)>;

    fn put(
        &mut self,
        key: &[u8],
        record: Record,
        write_mode: WriteMode,
        persist: PersistMode,
    ) -> DeviceResult<()>;

    fn delete(&mut self, key: &[u8], write_mode: WriteMode, persist: PersistMode)
    -> DeviceResult<()>;

    /// Opens a device-side batch.
    fn batch_start(&mut self) -> DeviceResult<BatchId>;

    fn batch_put(
        &mut self,
        batch: BatchId,
        key: &[u8],
        record: Record,
        write_mode: WriteMode,
    ) -> DeviceResult<()>;

    fn batch_delete(&mut self, batch: BatchId, key: &[u8], write_mode: WriteMode)
    -> DeviceResult<()>;

    /// Applies every operation in the batch atomically.
    fn batch_commit(&mut self, batch: BatchId) -> DeviceResult<()>;

    /// Discards the batch. An unaborted batch keeps device-side state alive
    /// and blocks later batches.
    fn batch_abort(&mut self, batch: BatchId) -> DeviceResult<()>;

    /// Queries the capacity log.
    fn capacity(&mut self) -> DeviceResult<DriveCapacity>;
}

/// Parameters for opening a device session.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub host: String,
    pub port: u16,
    pub user_id: i64,
    pub hmac_key: String,
    pub use_ssl: bool,
    pub timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8123,
            user_id: 1,
            hmac_key: "asdfasdf".to_string(),
            use_ssl: false,
            timeout: Duration::from_secs(10),
        }
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user_id", &self.user_id)
            .field("hmac_key", &"<redacted>")
            .field("use_ssl", &self.use_ssl)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Opens device sessions.
pub trait Connector: Send + Sync {
    fn connect(&self, options: &ConnectionOptions) -> DeviceResult<Box<dyn Connection>>;
}
