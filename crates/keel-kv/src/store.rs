//! The key-value store facade.
//!
//! [`KineticStore`] owns the connection pool and counters and hands out the
//! objects that talk to the device: point lookups run on a connection borrowed
//! for one call, while [`Transaction`]s and iterators keep theirs until
//! dropped.

use std::sync::Arc;

use bytes::Bytes;

use crate::device::{ConnectionOptions, Connector, DeviceError};
use crate::error::{KvError, KvResult};
use crate::iterator::{PrefixIterator, RangeIterator};
use crate::key::combine;
use crate::metrics::StoreMetrics;
use crate::pool::ConnectionPool;
use crate::transaction::Transaction;

/// Settings for opening a [`KineticStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    pub options: ConnectionOptions,
    /// Connections opened at startup; fixed for the life of the store.
    pub num_connections: usize,
    /// Most ops per device batch. `<= 1` selects unbatched commits.
    pub max_batch_ops: usize,
    /// Block size used to express capacity in blocks.
    pub block_size: u64,
    /// Permits `max_batch_ops <= 1`, which commits without atomicity.
    pub allow_unbatched_commit: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            options: ConnectionOptions::default(),
            num_connections: 8,
            max_batch_ops: 100,
            block_size: 65536,
            allow_unbatched_commit: false,
        }
    }
}

impl StoreSettings {
    pub fn validate(&self) -> KvResult<()> {
        if self.num_connections == 0 {
            return Err(KvError::InvalidSettings(
                "num_connections must be positive".to_string(),
            ));
        }
        if self.block_size == 0 {
            return Err(KvError::InvalidSettings(
                "block_size must be positive".to_string(),
            ));
        }
        if self.max_batch_ops <= 1 && !self.allow_unbatched_commit {
            return Err(KvError::InvalidSettings(format!(
                "max_batch_ops = {} disables atomic commits; set allow_unbatched_commit to opt in",
                self.max_batch_ops
            )));
        }
        Ok(())
    }

    /// True when commits go through device batches.
    pub fn batched(&self) -> bool {
        self.max_batch_ops > 1
    }
}

/// Device capacity expressed in blocks, in the manner of `statfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityReport {
    pub block_size: u64,
    pub total_blocks: u64,
    pub free_blocks: u64,
    /// Blocks available to unprivileged writers; the device makes no
    /// distinction, so this equals `free_blocks`.
    pub available_blocks: u64,
}

struct StoreInner {
    pool: Arc<ConnectionPool>,
    settings: StoreSettings,
    metrics: StoreMetrics,
}

/// An ordered, transactional key-value store backed by a remote device.
///
/// Cloning is cheap; clones share the pool and counters.
#[derive(Clone)]
pub struct KineticStore {
    inner: Arc<StoreInner>,
}

impl KineticStore {
    /// Validates `settings` and fills the pool with `num_connections`
    /// connections.
    pub fn open(settings: StoreSettings, connector: &dyn Connector) -> KvResult<Self> {
        settings.validate()?;
        let pool = ConnectionPool::connect(connector, &settings.options, settings.num_connections)?;
        Self::with_pool(pool, settings)
    }

    /// Builds a store over an existing pool. `settings` are validated as in
    /// [`open`](Self::open), except that `num_connections` is ignored in
    /// favour of the pool's size.
    pub fn with_pool(pool: Arc<ConnectionPool>, settings: StoreSettings) -> KvResult<Self> {
        settings.validate()?;
        if !settings.batched() {
            tracing::warn!(
                max_batch_ops = settings.max_batch_ops,
                "unbatched commits enabled; transactions are not atomic"
            );
        }
        Ok(Self {
            inner: Arc::new(StoreInner {
                pool,
                settings,
                metrics: StoreMetrics::new(),
            }),
        })
    }

    /// Checks that the device accepts a session with `options`.
    pub fn probe(options: &ConnectionOptions, connector: &dyn Connector) -> KvResult<()> {
        match connector.connect(options) {
            Ok(_conn) => {
                tracing::debug!(host = %options.host, port = options.port, "device reachable");
                Ok(())
            }
            Err(source) => {
                tracing::error!(
                    host = %options.host,
                    port = options.port,
                    error = %source,
                    "unable to connect to device"
                );
                Err(KvError::Connect {
                    host: options.host.clone(),
                    port: options.port,
                    source,
                })
            }
        }
    }

    /// Looks up `(prefix, key)`. A missing key is `Ok(None)`.
    pub fn get(&self, prefix: &[u8], key: &[u8]) -> KvResult<Option<Bytes>> {
        let mut conn = self.inner.pool.acquire();
        let combined = combine(prefix, key);
        self.inner.metrics.record_get();
        match conn.get(combined.as_bytes()) {
            Ok(record) => {
                tracing::trace!(key = ?combined, len = record.value().len(), "get hit");
                Ok(Some(record.into_value()))
            }
            Err(DeviceError::NotFound) => {
                tracing::trace!(key = ?combined, "get miss");
                Ok(None)
            }
            Err(e) => Err(KvError::transport(e)),
        }
    }

    /// Looks up every key under `prefix` on one connection.
    ///
    /// Returns the keys found, with their values, in the order given. Missing
    /// keys are skipped. A transport failure stops the remaining lookups and
    /// is returned; nothing found before it is returned.
    pub fn get_many<I, K>(&self, prefix: &[u8], keys: I) -> KvResult<Vec<(Bytes, Bytes)>>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        let mut conn = self.inner.pool.acquire();
        let mut found = Vec::new();
        for key in keys {
            let key = key.as_ref();
            let combined = combine(prefix, key);
            self.inner.metrics.record_get();
            match conn.get(combined.as_bytes()) {
                Ok(record) => found.push((Bytes::copy_from_slice(key), record.into_value())),
                Err(DeviceError::NotFound) => {
                    tracing::trace!(key = ?combined, "get miss");
                }
                Err(e) => {
                    tracing::debug!(key = ?combined, error = %e, "multi-get aborted");
                    return Err(KvError::transport(e));
                }
            }
        }
        Ok(found)
    }

    /// Queries device capacity.
    ///
    /// A full device is reported, not an error.
    pub fn capacity(&self) -> KvResult<CapacityReport> {
        let mut conn = self.inner.pool.acquire();
        let log = conn.capacity().map_err(|e| {
            tracing::error!(error = %e, "device capacity query failed");
            KvError::transport(e)
        })?;

        let block_size = self.inner.settings.block_size;
        let nominal = log.nominal_capacity_in_bytes;
        let free_fraction = 1.0 - f64::from(log.portion_full).clamp(0.0, 1.0);
        let free_bytes = (nominal as f64 * free_fraction) as u64;
        let report = CapacityReport {
            block_size,
            total_blocks: nominal / block_size,
            free_blocks: free_bytes / block_size,
            available_blocks: free_bytes / block_size,
        };
        tracing::debug!(
            block_size,
            total_blocks = report.total_blocks,
            bytes = nominal,
            "device capacity"
        );
        Ok(report)
    }

    /// Starts a transaction holding one pooled connection.
    ///
    /// Blocks while every connection is borrowed.
    pub fn transaction(&self) -> Transaction {
        Transaction::begin(
            self.inner.pool.acquire(),
            self.inner.settings.max_batch_ops,
            self.inner.metrics.clone(),
        )
    }

    /// Commits `txn`; the connection returns to the pool when it is dropped.
    pub fn submit_transaction(&self, mut txn: Transaction) -> KvResult<()> {
        txn.commit()
    }

    /// Same as [`submit_transaction`](Self::submit_transaction); every commit
    /// already waits for the device.
    pub fn submit_transaction_sync(&self, txn: Transaction) -> KvResult<()> {
        self.submit_transaction(txn)
    }

    /// Iterator over the whole key space, positioned past the end.
    pub fn iterator(&self) -> RangeIterator {
        RangeIterator::new(self.inner.pool.acquire())
    }

    /// Iterator bounded to `prefix`, positioned past the end.
    pub fn prefix_iterator(&self, prefix: impl Into<Bytes>) -> PrefixIterator {
        PrefixIterator::new(self.iterator(), prefix.into())
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.inner.settings
    }

    pub fn metrics(&self) -> &StoreMetrics {
        &self.inner.metrics
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.inner.pool
    }
}

impl std::fmt::Debug for KineticStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KineticStore")
            .field("pool", &self.inner.pool)
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}
