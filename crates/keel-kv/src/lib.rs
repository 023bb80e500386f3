//! # keel-kv: Ordered Key-Value Backend for Keel
//!
//! Adapts a Kinetic-style network key-value device into the ordered,
//! transactional store the storage engine expects. The device natively knows
//! only point lookups, neighbour lookups and device-side batches; this crate
//! adds namespaces, ordered iteration and chunked atomic commits on top.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                   KineticStore                   │
//! │  get · get_many · capacity · transaction ·       │
//! │  iterator · prefix_iterator                      │
//! └────────┬──────────────────┬───────────────┬──────┘
//!          │ one call         │ object life   │ object life
//! ┌────────▼────────┐ ┌───────▼──────┐ ┌──────▼───────┐
//! │  point lookups  │ │ Transaction  │ │ RangeIterator│
//! └────────┬────────┘ └───────┬──────┘ └──────┬───────┘
//!          └───────── PooledConnection ───────┘
//!                            │
//! ┌──────────────────────────▼───────────────────────┐
//! │  ConnectionPool (fixed size, blocking acquire)   │
//! └──────────────────────────┬───────────────────────┘
//!                            │ dyn Connection
//!                  device (remote or MemoryDevice)
//! ```
//!
//! Every `(prefix, key)` pair is stored under one [`CombinedKey`]; see
//! [`key`] for the encoding and its ordering guarantees.
//!
//! # Example
//!
//! ```
//! use keel_kv::memory::{MemoryConnector, MemoryDevice};
//! use keel_kv::{KineticStore, StoreSettings};
//!
//! let connector = MemoryConnector::new(MemoryDevice::new());
//! let store = KineticStore::open(StoreSettings::default(), &connector)?;
//!
//! let mut txn = store.transaction();
//! txn.write(b"obj", b"name", "value")?;
//! store.submit_transaction(txn)?;
//!
//! assert_eq!(store.get(b"obj", b"name")?.as_deref(), Some(&b"value"[..]));
//! # Ok::<(), keel_kv::KvError>(())
//! ```

pub mod device;
mod error;
mod iterator;
pub mod key;
pub mod memory;
mod metrics;
mod pool;
mod store;
mod transaction;

pub use device::{
    BatchId, Connection, ConnectionOptions, Connector, DeviceError, DeviceResult, DriveCapacity,
    PersistMode, Record, WriteMode,
};
pub use error::{BatchStage, KvError, KvResult};
pub use iterator::{PrefixIterator, RangeIterator};
pub use key::{CombinedKey, MAX_KEY_SIZE, PREFIX_UPPER, SEPARATOR, combine, has_prefix, split};
pub use metrics::StoreMetrics;
pub use pool::{ConnectionPool, PooledConnection};
pub use store::{CapacityReport, KineticStore, StoreSettings};
pub use transaction::{Op, Transaction, TxnState};
