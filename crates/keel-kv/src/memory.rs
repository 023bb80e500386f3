//! In-process device.
//!
//! [`MemoryDevice`] implements the device protocol over an ordered map so the
//! store can run without hardware: unit tests, simulations, and local
//! development. All connections to one device share its state.
//!
//! Faults are injected with [`MemoryDevice::inject`]. Each fault fires once,
//! on the first call it matches, and reports a transport failure.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use crate::device::{
    BatchId, Connection, ConnectionOptions, Connector, DeviceError, DeviceResult, DriveCapacity,
    PersistMode, Record, WriteMode,
};

/// Default nominal capacity: 4 TB.
const DEFAULT_NOMINAL_CAPACITY: u64 = 4_000_000_000_000;

/// A one-shot failure the device will report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The next connection attempt fails.
    Connect,
    /// The next `get` fails.
    Get,
    /// The next `get_next` or `get_previous` fails.
    Scan,
    /// The next `batch_start` fails.
    BatchStart,
    /// Batch operations succeed `after` times, then one fails.
    BatchOp { after: usize },
    /// The next `batch_commit` fails; the batch stays open.
    BatchCommit,
    /// The next plain `put` or `delete` fails.
    Write,
    /// The next capacity query fails.
    Capacity,
}

#[derive(Debug, Clone)]
enum BatchOp {
    Put { key: Bytes, value: Bytes },
    Delete { key: Bytes },
}

#[derive(Debug, Default)]
struct DeviceState {
    records: BTreeMap<Bytes, Bytes>,
    batches: HashMap<BatchId, Vec<BatchOp>>,
    next_batch: BatchId,
    nominal_capacity: u64,
    faults: Vec<Fault>,
    persist_log: Vec<PersistMode>,
}

impl DeviceState {
    /// Fires and disarms the first armed fault matching `pred`.
    fn trip(&mut self, pred: impl Fn(&Fault) -> bool) -> DeviceResult<()> {
        if let Some(at) = self.faults.iter().position(pred) {
            let fault = self.faults.remove(at);
            return Err(DeviceError::Transport(format!("injected fault: {fault:?}")));
        }
        Ok(())
    }

    /// Counts down batch-op faults, firing the one that reaches zero.
    fn trip_batch_op(&mut self) -> DeviceResult<()> {
        let mut fired = None;
        for (i, fault) in self.faults.iter_mut().enumerate() {
            if let Fault::BatchOp { after } = fault {
                if *after == 0 {
                    fired = Some(i);
                    break;
                }
                *after -= 1;
            }
        }
        if let Some(i) = fired {
            let fault = self.faults.remove(i);
            return Err(DeviceError::Transport(format!("injected fault: {fault:?}")));
        }
        Ok(())
    }

    fn batch_mut(&mut self, batch: BatchId) -> DeviceResult<&mut Vec<BatchOp>> {
        self.batches.get_mut(&batch).ok_or_else(|| DeviceError::Rejected {
            code: 404,
            message: format!("unknown batch {batch}"),
        })
    }

    fn used_bytes(&self) -> u64 {
        self.records
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum()
    }
}

/// Shared in-memory device state.
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    state: Arc<Mutex<DeviceState>>,
    round_trips: Arc<AtomicU64>,
}

impl MemoryDevice {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_NOMINAL_CAPACITY)
    }

    /// Creates a device reporting `nominal_capacity` bytes.
    pub fn with_capacity(nominal_capacity: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                next_batch: 1,
                nominal_capacity,
                ..DeviceState::default()
            })),
            round_trips: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Arms a one-shot fault.
    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }

    /// Number of batches opened and neither committed nor aborted.
    pub fn open_batches(&self) -> usize {
        self.lock().batches.len()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    /// Reads a raw combined key directly, without a round trip.
    pub fn peek(&self, key: &[u8]) -> Option<Bytes> {
        self.lock().records.get(key).cloned()
    }

    /// Total requests served by every connection so far.
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::SeqCst)
    }

    /// Persist modes requested by plain writes, in arrival order.
    pub fn persist_log(&self) -> Vec<PersistMode> {
        self.lock().persist_log.clone()
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts one round trip and locks the state for it.
    fn request(&self) -> MutexGuard<'_, DeviceState> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        self.lock()
    }
}

impl Default for MemoryDevice {
    fn default() -> Self {
        Self::new()
    }
}

/// One session with a [`MemoryDevice`].
#[derive(Debug)]
pub struct MemoryConnection {
    device: MemoryDevice,
}

impl Connection for MemoryConnection {
    fn get(&mut self, key: &[u8]) -> DeviceResult<Record> {
        let mut state = self.device.request();
        state.trip(|f| *f == Fault::Get)?;
        state
            .records
            .get(key)
            .map(|v| Record::new(v.clone()))
            .ok_or(DeviceError::NotFound)
    }

    fn get_next(&mut self, key: &[u8]) -> DeviceResult<(Bytes, Record)> {
        let mut state = self.device.request();
        state.trip(|f| *f == Fault::Scan)?;
        state
            .records
            .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), Record::new(v.clone())))
            .ok_or(DeviceError::NotFound)
    }

    fn get_previous(&mut self, key: &[u8]) -> DeviceResult<(Bytes, Record)> {
        let mut state = self.device.request();
        state.trip(|f| *f == Fault::Scan)?;
        state
            .records
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
            .next_back()
            .map(|(k, v)| (k.clone(), Record::new(v.clone())))
            .ok_or(DeviceError::NotFound)
    }

    fn put(
        &mut self,
        key: &[u8],
        record: Record,
        _write_mode: WriteMode,
        persist: PersistMode,
    ) -> DeviceResult<()> {
        let mut state = self.device.request();
        state.trip(|f| *f == Fault::Write)?;
        state
            .records
            .insert(Bytes::copy_from_slice(key), record.into_value());
        state.persist_log.push(persist);
        Ok(())
    }

    fn delete(
        &mut self,
        key: &[u8],
        _write_mode: WriteMode,
        persist: PersistMode,
    ) -> DeviceResult<()> {
        let mut state = self.device.request();
        state.trip(|f| *f == Fault::Write)?;
        state.records.remove(key);
        state.persist_log.push(persist);
        Ok(())
    }

    fn batch_start(&mut self) -> DeviceResult<BatchId> {
        let mut state = self.device.request();
        state.trip(|f| *f == Fault::BatchStart)?;
        let id = state.next_batch;
        state.next_batch += 1;
        state.batches.insert(id, Vec::new());
        Ok(id)
    }

    fn batch_put(
        &mut self,
        batch: BatchId,
        key: &[u8],
        record: Record,
        _write_mode: WriteMode,
    ) -> DeviceResult<()> {
        let mut state = self.device.request();
        state.trip_batch_op()?;
        state.batch_mut(batch)?.push(BatchOp::Put {
            key: Bytes::copy_from_slice(key),
            value: record.into_value(),
        });
        Ok(())
    }

    fn batch_delete(
        &mut self,
        batch: BatchId,
        key: &[u8],
        _write_mode: WriteMode,
    ) -> DeviceResult<()> {
        let mut state = self.device.request();
        state.trip_batch_op()?;
        state.batch_mut(batch)?.push(BatchOp::Delete {
            key: Bytes::copy_from_slice(key),
        });
        Ok(())
    }

    fn batch_commit(&mut self, batch: BatchId) -> DeviceResult<()> {
        let mut state = self.device.request();
        state.trip(|f| *f == Fault::BatchCommit)?;
        let ops = state.batches.remove(&batch).ok_or_else(|| DeviceError::Rejected {
            code: 404,
            message: format!("unknown batch {batch}"),
        })?;
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    state.records.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    state.records.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn batch_abort(&mut self, batch: BatchId) -> DeviceResult<()> {
        let mut state = self.device.request();
        state
            .batches
            .remove(&batch)
            .map(|_| ())
            .ok_or_else(|| DeviceError::Rejected {
                code: 404,
                message: format!("unknown batch {batch}"),
            })
    }

    fn capacity(&mut self) -> DeviceResult<DriveCapacity> {
        let mut state = self.device.request();
        state.trip(|f| *f == Fault::Capacity)?;
        let nominal = state.nominal_capacity;
        let portion_full = if nominal == 0 {
            1.0
        } else {
            (state.used_bytes() as f64 / nominal as f64).min(1.0) as f32
        };
        Ok(DriveCapacity {
            nominal_capacity_in_bytes: nominal,
            portion_full,
        })
    }
}

/// Opens sessions against a [`MemoryDevice`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    device: MemoryDevice,
}

impl MemoryConnector {
    pub fn new(device: MemoryDevice) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &MemoryDevice {
        &self.device
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, options: &ConnectionOptions) -> DeviceResult<Box<dyn Connection>> {
        self.device.lock().trip(|f| *f == Fault::Connect)?;
        tracing::trace!(host = %options.host, port = options.port, "memory device session opened");
        Ok(Box::new(MemoryConnection {
            device: self.device.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(device: &MemoryDevice) -> Box<dyn Connection> {
        MemoryConnector::new(device.clone())
            .connect(&ConnectionOptions::default())
            .unwrap()
    }

    #[test]
    fn neighbours_are_strict() {
        let device = MemoryDevice::new();
        let mut c = conn(&device);
        for k in [b"a".as_slice(), b"b", b"c"] {
            c.put(k, Record::new(k.to_vec()), WriteMode::IgnoreVersion, PersistMode::Flush)
                .unwrap();
        }

        assert_eq!(&c.get_next(b"a").unwrap().0[..], b"b");
        assert_eq!(&c.get_previous(b"b").unwrap().0[..], b"a");
        assert!(c.get_next(b"c").unwrap_err().is_not_found());
        assert!(c.get_previous(b"a").unwrap_err().is_not_found());
    }

    #[test]
    fn batch_is_invisible_until_commit() {
        let device = MemoryDevice::new();
        let mut c = conn(&device);

        let batch = c.batch_start().unwrap();
        c.batch_put(batch, b"k", Record::new("v"), WriteMode::IgnoreVersion)
            .unwrap();
        assert!(device.peek(b"k").is_none());
        assert_eq!(device.open_batches(), 1);

        c.batch_commit(batch).unwrap();
        assert_eq!(device.peek(b"k").unwrap(), "v");
        assert_eq!(device.open_batches(), 0);
    }

    #[test]
    fn batch_op_fault_counts_down() {
        let device = MemoryDevice::new();
        device.inject(Fault::BatchOp { after: 2 });
        let mut c = conn(&device);

        let batch = c.batch_start().unwrap();
        c.batch_put(batch, b"1", Record::new("1"), WriteMode::IgnoreVersion)
            .unwrap();
        c.batch_put(batch, b"2", Record::new("2"), WriteMode::IgnoreVersion)
            .unwrap();
        let err = c
            .batch_put(batch, b"3", Record::new("3"), WriteMode::IgnoreVersion)
            .unwrap_err();
        assert!(matches!(err, DeviceError::Transport(_)));

        // One-shot: the next op succeeds.
        c.batch_put(batch, b"4", Record::new("4"), WriteMode::IgnoreVersion)
            .unwrap();
        c.batch_abort(batch).unwrap();
        assert!(device.is_empty());
    }

    #[test]
    fn capacity_reflects_usage() {
        let device = MemoryDevice::with_capacity(1000);
        let mut c = conn(&device);
        c.put(b"key", Record::new(vec![0u8; 97]), WriteMode::IgnoreVersion, PersistMode::Flush)
            .unwrap();

        let cap = c.capacity().unwrap();
        assert_eq!(cap.nominal_capacity_in_bytes, 1000);
        assert!((cap.portion_full - 0.1).abs() < 1e-6);
    }

    #[test]
    fn round_trips_are_counted() {
        let device = MemoryDevice::new();
        let mut c = conn(&device);
        let _ = c.get(b"missing");
        let _ = c.get_next(b"");
        assert_eq!(device.round_trips(), 2);
    }
}
