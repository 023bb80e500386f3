//! Ordered iteration over a point-lookup device.
//!
//! The device can only answer "this key", "the key after" and "the key
//! before". [`RangeIterator`] turns those three calls into a cursor over the
//! whole combined key space, across every prefix. Each positioning call costs
//! one round trip (`seek_to_first` and `lower_bound` cost up to two); nothing
//! is cached beyond the record fetched for the current position.
//!
//! Past-the-end is modelled as a position of its own. On the wire it is
//! represented by a key that sorts after every legal combined key, so `prev()`
//! from past-the-end lands on the last key.
//!
//! [`PrefixIterator`] bounds a whole-space iterator to one prefix.

use std::fmt;

use bytes::Bytes;

use crate::device::{DeviceError, DeviceResult, Record};
use crate::error::{KvError, KvResult};
use crate::key::{CombinedKey, END_KEY, combine, has_prefix, prefix_upper_bound};
use crate::pool::PooledConnection;

enum Position {
    End,
    At { key: CombinedKey, record: Record },
}

/// Key bytes sent to the device for the current position.
fn cursor(position: &Position) -> &[u8] {
    match position {
        Position::End => &END_KEY[..],
        Position::At { key, .. } => key.as_bytes(),
    }
}

/// A cursor over every combined key on the device.
///
/// Holds one pooled connection until dropped. Not for concurrent use.
pub struct RangeIterator {
    conn: PooledConnection,
    position: Position,
    status: Option<DeviceError>,
}

impl RangeIterator {
    /// Creates an iterator positioned past the end.
    pub(crate) fn new(conn: PooledConnection) -> Self {
        Self {
            conn,
            position: Position::End,
            status: None,
        }
    }

    /// Positions at the first combined key at or after `prefix`.
    pub fn seek_to_first(&mut self, prefix: &[u8]) -> KvResult<()> {
        let target = CombinedKey::from_raw(Bytes::copy_from_slice(prefix));
        tracing::trace!(key = ?target, "seek_to_first");
        self.seek_at_or_after(target)
    }

    /// Positions at the greatest key on the device.
    pub fn seek_to_last(&mut self) -> KvResult<()> {
        tracing::trace!("seek_to_last");
        let found = self.conn.get_previous(&END_KEY);
        self.land(found)
    }

    /// Positions at the greatest key under `prefix`, or past the end when
    /// `prefix` holds no keys.
    pub fn seek_to_last_in(&mut self, prefix: &[u8]) -> KvResult<()> {
        tracing::trace!(prefix = ?Bytes::copy_from_slice(prefix), "seek_to_last_in");
        let found = self.conn.get_previous(&prefix_upper_bound(prefix));
        self.land(found)?;
        if !self.raw_key_is_prefixed(prefix) {
            self.position = Position::End;
        }
        Ok(())
    }

    /// Positions at `(prefix, key)` if stored, else at its successor.
    pub fn lower_bound(&mut self, prefix: &[u8], key: &[u8]) -> KvResult<()> {
        let target = combine(prefix, key);
        tracing::trace!(key = ?target, "lower_bound");
        self.seek_at_or_after(target)
    }

    fn seek_at_or_after(&mut self, target: CombinedKey) -> KvResult<()> {
        match self.conn.get(target.as_bytes()) {
            Ok(record) => {
                self.status = None;
                self.position = Position::At { key: target, record };
                Ok(())
            }
            Err(DeviceError::NotFound) => {
                let found = self.conn.get_next(target.as_bytes());
                self.land(found)
            }
            Err(e) => self.fail(e),
        }
    }

    /// Positions at the first key strictly after `(prefix, after)`.
    pub fn upper_bound(&mut self, prefix: &[u8], after: &[u8]) -> KvResult<()> {
        let target = combine(prefix, after);
        tracing::trace!(key = ?target, "upper_bound");
        let found = self.conn.get_next(target.as_bytes());
        self.land(found)
    }

    /// Moves to the successor; past the end stays past the end.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> KvResult<()> {
        let found = self.conn.get_next(cursor(&self.position));
        self.land(found)
    }

    /// Moves to the predecessor; from past the end this is the last key.
    pub fn prev(&mut self) -> KvResult<()> {
        let found = self.conn.get_previous(cursor(&self.position));
        self.land(found)
    }

    /// True unless positioned past the end.
    pub fn valid(&self) -> bool {
        matches!(self.position, Position::At { .. })
    }

    /// Key component of the current position.
    pub fn key(&self) -> KvResult<Bytes> {
        self.current()?.key()
    }

    /// `(prefix, key)` of the current position.
    pub fn raw_key(&self) -> KvResult<(Bytes, Bytes)> {
        self.current()?.split()
    }

    /// True if positioned on a key under `prefix`.
    pub fn raw_key_is_prefixed(&self, prefix: &[u8]) -> bool {
        match &self.position {
            Position::At { key, .. } => has_prefix(key.as_bytes(), prefix),
            Position::End => false,
        }
    }

    /// Value fetched for the current position.
    pub fn value(&self) -> KvResult<Bytes> {
        match &self.position {
            Position::At { record, .. } => Ok(record.value().clone()),
            Position::End => Err(KvError::PastTheEnd),
        }
    }

    /// Device error from the last positioning call, if it failed.
    ///
    /// Running off either end is not an error.
    pub fn status(&self) -> KvResult<()> {
        match &self.status {
            Some(e) => Err(KvError::transport(e.clone())),
            None => Ok(()),
        }
    }

    fn current(&self) -> KvResult<&CombinedKey> {
        match &self.position {
            Position::At { key, .. } => Ok(key),
            Position::End => Err(KvError::PastTheEnd),
        }
    }

    fn land(&mut self, found: DeviceResult<(Bytes, Record)>) -> KvResult<()> {
        match found {
            Ok((key, record)) => {
                self.status = None;
                self.position = Position::At {
                    key: CombinedKey::from_raw(key),
                    record,
                };
                Ok(())
            }
            Err(DeviceError::NotFound) => {
                self.status = None;
                self.position = Position::End;
                Ok(())
            }
            Err(e) => self.fail(e),
        }
    }

    fn fail(&mut self, e: DeviceError) -> KvResult<()> {
        tracing::debug!(error = %e, "iterator positioning failed");
        self.position = Position::End;
        self.status = Some(e.clone());
        Err(KvError::transport(e))
    }
}

impl fmt::Debug for RangeIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let position = match &self.position {
            Position::End => None,
            Position::At { key, .. } => Some(key),
        };
        f.debug_struct("RangeIterator")
            .field("position", &position)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// A [`RangeIterator`] that is valid only while positioned under one prefix.
///
/// Keys are addressed without their prefix. Once the walk leaves the prefix
/// `next()` does nothing and `prev()` re-enters at the last key.
#[derive(Debug)]
pub struct PrefixIterator {
    inner: RangeIterator,
    prefix: Bytes,
}

impl PrefixIterator {
    pub(crate) fn new(inner: RangeIterator, prefix: Bytes) -> Self {
        Self { inner, prefix }
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn seek_to_first(&mut self) -> KvResult<()> {
        self.inner.lower_bound(&self.prefix, b"")
    }

    pub fn seek_to_last(&mut self) -> KvResult<()> {
        self.inner.seek_to_last_in(&self.prefix)
    }

    pub fn lower_bound(&mut self, key: &[u8]) -> KvResult<()> {
        self.inner.lower_bound(&self.prefix, key)
    }

    pub fn upper_bound(&mut self, after: &[u8]) -> KvResult<()> {
        self.inner.upper_bound(&self.prefix, after)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> KvResult<()> {
        if !self.valid() {
            return Ok(());
        }
        self.inner.next()
    }

    pub fn prev(&mut self) -> KvResult<()> {
        if !self.valid() {
            return self.seek_to_last();
        }
        self.inner.prev()
    }

    pub fn valid(&self) -> bool {
        self.inner.raw_key_is_prefixed(&self.prefix)
    }

    pub fn key(&self) -> KvResult<Bytes> {
        if !self.valid() {
            return Err(KvError::PastTheEnd);
        }
        self.inner.key()
    }

    pub fn value(&self) -> KvResult<Bytes> {
        if !self.valid() {
            return Err(KvError::PastTheEnd);
        }
        self.inner.value()
    }

    pub fn status(&self) -> KvResult<()> {
        self.inner.status()
    }

    /// Unbounded view of the same cursor.
    pub fn into_inner(self) -> RangeIterator {
        self.inner
    }
}
