//! Buffered write transactions.
//!
//! A [`Transaction`] owns one pooled connection for its whole life. Writes and
//! deletes are buffered locally and sent only by [`Transaction::commit`]:
//!
//! - **Batched** (`max_batch_ops > 1`): ops are split into chunks of at most
//!   `max_batch_ops`; each chunk is one device batch (begin, put/delete, commit).
//!   Any failure aborts the open batch, so a chunk is all-or-nothing. Chunks
//!   committed before the failure stay applied.
//! - **Sequential** (`max_batch_ops <= 1`, explicit opt-in only): ops are sent
//!   one by one as plain writes; the last requests a flush, the rest
//!   write-back. A failure mid-sequence leaves a prefix of the ops applied.
//!
//! Concurrent transactions touching the same keys are not isolated; every
//! write uses [`WriteMode::IgnoreVersion`], so the last writer wins.

use std::fmt;
use std::mem;

use bytes::Bytes;

use crate::device::{BatchId, DeviceError, PersistMode, Record, WriteMode};
use crate::error::{BatchStage, KvError, KvResult};
use crate::key::{CombinedKey, combine};
use crate::metrics::StoreMetrics;
use crate::pool::PooledConnection;

/// Lifecycle of a [`Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Accepting ops.
    Open,
    /// `commit` is sending ops to the device.
    Committing,
    Committed,
    /// Commit failed; whatever batch was open has been aborted.
    Aborted,
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        })
    }
}

/// A buffered mutation against a combined key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Write { key: CombinedKey, value: Bytes },
    Delete { key: CombinedKey },
}

impl Op {
    pub fn key(&self) -> &CombinedKey {
        match self {
            Self::Write { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// A set of writes and deletes committed together.
pub struct Transaction {
    conn: PooledConnection,
    ops: Vec<Op>,
    batch: Option<BatchId>,
    state: TxnState,
    max_batch_ops: usize,
    metrics: StoreMetrics,
}

impl Transaction {
    pub(crate) fn begin(conn: PooledConnection, max_batch_ops: usize, metrics: StoreMetrics) -> Self {
        Self {
            conn,
            ops: Vec::new(),
            batch: None,
            state: TxnState::Open,
            max_batch_ops,
            metrics,
        }
    }

    /// Buffers a write of `value` under `(prefix, key)`.
    pub fn write(&mut self, prefix: &[u8], key: &[u8], value: impl Into<Bytes>) -> KvResult<()> {
        self.ensure_open()?;
        let key = combine(prefix, key);
        tracing::trace!(key = ?key, "buffered write");
        self.ops.push(Op::Write {
            key,
            value: value.into(),
        });
        Ok(())
    }

    /// Buffers a delete of `(prefix, key)`.
    pub fn delete(&mut self, prefix: &[u8], key: &[u8]) -> KvResult<()> {
        self.ensure_open()?;
        let key = combine(prefix, key);
        tracing::trace!(key = ?key, "buffered delete");
        self.ops.push(Op::Delete { key });
        Ok(())
    }

    /// Buffers a delete for every key currently stored under `prefix`.
    ///
    /// The key set is scanned now, on this transaction's connection; keys
    /// written under `prefix` between this call and `commit` survive.
    pub fn delete_prefix(&mut self, prefix: &[u8]) -> KvResult<usize> {
        self.ensure_open()?;
        let first = combine(prefix, b"");
        let mut found = Vec::new();

        match self.conn.get(first.as_bytes()) {
            Ok(_) => found.push(first.clone()),
            Err(DeviceError::NotFound) => {}
            Err(e) => return Err(KvError::transport(e)),
        }

        let mut cursor = first.into_bytes();
        loop {
            match self.conn.get_next(&cursor) {
                Ok((next, _)) => {
                    let next = CombinedKey::from_raw(next);
                    if !next.has_prefix(prefix) {
                        break;
                    }
                    cursor = next.clone().into_bytes();
                    found.push(next);
                }
                Err(DeviceError::NotFound) => break,
                Err(e) => return Err(KvError::transport(e)),
            }
        }

        let count = found.len();
        tracing::debug!(
            prefix = ?Bytes::copy_from_slice(prefix),
            keys = count,
            "expanded prefix delete"
        );
        self.ops.extend(found.into_iter().map(|key| Op::Delete { key }));
        Ok(count)
    }

    /// Buffered ops, in append order.
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Sends every buffered op to the device.
    ///
    /// Only an open transaction can commit. On failure the transaction is
    /// [`TxnState::Aborted`] and any open device batch has been aborted.
    pub fn commit(&mut self) -> KvResult<()> {
        self.ensure_open()?;
        self.state = TxnState::Committing;
        let ops = mem::take(&mut self.ops);

        let result = if self.max_batch_ops > 1 {
            self.commit_batched(&ops)
        } else {
            self.commit_sequential(&ops)
        };

        match result {
            Ok(()) => {
                self.state = TxnState::Committed;
                self.metrics.record_transaction();
                tracing::debug!(ops = ops.len(), "transaction committed");
                Ok(())
            }
            Err(e) => {
                self.abort_open_batch();
                self.state = TxnState::Aborted;
                tracing::error!(ops = ops.len(), error = %e, "transaction commit failed");
                Err(e)
            }
        }
    }

    fn commit_batched(&mut self, ops: &[Op]) -> KvResult<()> {
        for (n, chunk) in ops.chunks(self.max_batch_ops).enumerate() {
            let batch = self
                .conn
                .batch_start()
                .map_err(|e| KvError::batch(BatchStage::Begin, e))?;
            self.batch = Some(batch);

            for op in chunk {
                let sent = match op {
                    Op::Write { key, value } => self.conn.batch_put(
                        batch,
                        key.as_bytes(),
                        Record::new(value.clone()),
                        WriteMode::IgnoreVersion,
                    ),
                    Op::Delete { key } => {
                        self.conn
                            .batch_delete(batch, key.as_bytes(), WriteMode::IgnoreVersion)
                    }
                };
                sent.map_err(|e| KvError::batch(BatchStage::Submit, e))?;
            }

            self.conn
                .batch_commit(batch)
                .map_err(|e| KvError::batch(BatchStage::Commit, e))?;
            self.batch = None;
            tracing::debug!(batch, chunk = n, ops = chunk.len(), "batch committed");
        }
        Ok(())
    }

    fn commit_sequential(&mut self, ops: &[Op]) -> KvResult<()> {
        let last = ops.len().saturating_sub(1);
        for (i, op) in ops.iter().enumerate() {
            let persist = if i == last {
                PersistMode::Flush
            } else {
                PersistMode::WriteBack
            };
            let sent = match op {
                Op::Write { key, value } => self.conn.put(
                    key.as_bytes(),
                    Record::new(value.clone()),
                    WriteMode::IgnoreVersion,
                    persist,
                ),
                Op::Delete { key } => {
                    self.conn
                        .delete(key.as_bytes(), WriteMode::IgnoreVersion, persist)
                }
            };
            sent.map_err(KvError::transport)?;
        }
        Ok(())
    }

    /// Aborts the device batch left open by a failed commit, if any.
    fn abort_open_batch(&mut self) {
        if let Some(batch) = self.batch.take() {
            if let Err(e) = self.conn.batch_abort(batch) {
                let e = KvError::batch(BatchStage::Abort, e);
                tracing::warn!(batch, error = %e, "failed to abort device batch");
            }
        }
    }

    fn ensure_open(&self) -> KvResult<()> {
        match self.state {
            TxnState::Open => Ok(()),
            state => Err(KvError::TransactionState { state }),
        }
    }
}

impl Drop for Transaction {
    // Runs before `conn` is released back to the pool.
    fn drop(&mut self) {
        self.abort_open_batch();
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("state", &self.state)
            .field("ops", &self.ops.len())
            .field("batch", &self.batch)
            .finish_non_exhaustive()
    }
}
