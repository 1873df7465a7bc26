//! Per-frame metadata containers and the metadata pool interface
//!
//! The session never interprets metadata beyond the handful of tags in
//! [`tags`]; everything else is carried opaquely between the client and the
//! pipelines.

use crate::error::{Error, Result};
use crate::types::RequestId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Metadata tag identifier
pub type MetadataTag = u32;

/// Tags the session reads or writes
pub mod tags {
    use super::MetadataTag;

    /// Sensor exposure time, nanoseconds
    pub const SENSOR_EXPOSURE_TIME: MetadataTag = 0x000E_0000;
    /// Sensor frame duration, nanoseconds
    pub const SENSOR_FRAME_DURATION: MetadataTag = 0x000E_0001;
    /// Exposure priority mode (0 = off, 1 = exposure time priority)
    pub const EXPOSURE_PRIORITY_MODE: MetadataTag = 0x8000_0010;
    /// Exposure priority value, nanoseconds
    pub const EXPOSURE_PRIORITY_VALUE: MetadataTag = 0x8000_0011;
    /// AE lock range, disabled while flushing
    pub const AE_LOCK_RANGE: MetadataTag = 0x8000_0020;
    /// Sensor start-of-exposure timestamp, nanoseconds
    pub const SENSOR_TIMESTAMP: MetadataTag = 0x000E_0010;
}

/// Exposure priority mode value selecting exposure-time priority
pub const EXPOSURE_PRIORITY_EXPOSURE_TIME: i64 = 1;

/// Tagged metadata value
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Range(i64, i64),
    Bytes(Vec<u8>),
}

impl MetadataValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            MetadataValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

static NEXT_METABUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Metadata container shared between client, session and pipelines
#[derive(Debug)]
pub struct MetaBuffer {
    id: u64,
    entries: Mutex<HashMap<MetadataTag, MetadataValue>>,
    valid: AtomicBool,
}

impl MetaBuffer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_METABUFFER_ID.fetch_add(1, Ordering::Relaxed),
            entries: Mutex::new(HashMap::new()),
            valid: AtomicBool::new(true),
        })
    }

    /// Build a buffer pre-populated with `entries`
    pub fn with_entries(entries: impl IntoIterator<Item = (MetadataTag, MetadataValue)>) -> Arc<Self> {
        let buffer = Self::new();
        buffer.entries.lock().extend(entries);
        buffer
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn get(&self, tag: MetadataTag) -> Option<MetadataValue> {
        self.entries.lock().get(&tag).cloned()
    }

    pub fn get_int(&self, tag: MetadataTag) -> Option<i64> {
        self.get(tag).and_then(|v| v.as_int())
    }

    pub fn set(&self, tag: MetadataTag, value: MetadataValue) {
        self.entries.lock().insert(tag, value);
    }

    pub fn remove(&self, tag: MetadataTag) -> Option<MetadataValue> {
        self.entries.lock().remove(&tag)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Mark the buffer unusable and drop its contents
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
        self.entries.lock().clear();
    }

    /// Copy every entry of `other` into this buffer, overwriting duplicates
    pub fn merge_from(&self, other: &MetaBuffer) {
        if std::ptr::eq(self, other) {
            return;
        }
        let source = other.entries.lock().clone();
        self.entries.lock().extend(source);
    }
}

/// Pipeline-owned pool of per-request metadata slots
///
/// Implemented by the pipeline layer; the session uses it to reach the
/// slot for a request, disable AE lock during flush and release slots once
/// results are out.
pub trait MetadataPool: Send + Sync {
    /// Metadata buffer for `request_id`, if the slot still belongs to it
    fn get_slot(&self, request_id: RequestId) -> Option<Arc<MetaBuffer>>;

    fn set_metadata_by_tag(
        &self,
        request_id: RequestId,
        tag: MetadataTag,
        value: MetadataValue,
    ) -> Result<()>;

    fn get_metadata_by_tag(&self, request_id: RequestId, tag: MetadataTag) -> Option<MetadataValue>;

    /// Make `tag` visible to nodes waiting on it
    fn publish_metadata(&self, request_id: RequestId, tag: MetadataTag) -> Result<()>;

    /// Release the slot held by `request_id`
    fn invalidate(&self, request_id: RequestId);

    /// Assign the slot for `request_id`, recycling whatever it held
    fn update_request_id(&self, request_id: RequestId);
}

#[derive(Debug)]
struct Slot {
    request_id: Option<RequestId>,
    buffer: Arc<MetaBuffer>,
    published: HashSet<MetadataTag>,
}

/// In-memory ring of metadata slots indexed by `request_id % depth`
pub struct SlotMetadataPool {
    slots: Vec<Mutex<Slot>>,
}

impl SlotMetadataPool {
    pub fn new(depth: usize) -> Self {
        let slots = (0..depth.max(1))
            .map(|_| {
                Mutex::new(Slot {
                    request_id: None,
                    buffer: MetaBuffer::new(),
                    published: HashSet::new(),
                })
            })
            .collect();
        Self { slots }
    }

    fn slot(&self, request_id: RequestId) -> &Mutex<Slot> {
        &self.slots[(request_id % self.slots.len() as u64) as usize]
    }

    /// Number of slots currently assigned to a request
    pub fn active_slots(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.lock().request_id.is_some())
            .count()
    }

    pub fn is_published(&self, request_id: RequestId, tag: MetadataTag) -> bool {
        let slot = self.slot(request_id).lock();
        slot.request_id == Some(request_id) && slot.published.contains(&tag)
    }
}

impl MetadataPool for SlotMetadataPool {
    fn get_slot(&self, request_id: RequestId) -> Option<Arc<MetaBuffer>> {
        let slot = self.slot(request_id).lock();
        (slot.request_id == Some(request_id)).then(|| Arc::clone(&slot.buffer))
    }

    fn set_metadata_by_tag(
        &self,
        request_id: RequestId,
        tag: MetadataTag,
        value: MetadataValue,
    ) -> Result<()> {
        let slot = self.slot(request_id).lock();
        if slot.request_id != Some(request_id) {
            return Err(Error::InvalidState(format!(
                "metadata slot not owned by request {}",
                request_id
            )));
        }
        slot.buffer.set(tag, value);
        Ok(())
    }

    fn get_metadata_by_tag(&self, request_id: RequestId, tag: MetadataTag) -> Option<MetadataValue> {
        let slot = self.slot(request_id).lock();
        if slot.request_id != Some(request_id) {
            return None;
        }
        slot.buffer.get(tag)
    }

    fn publish_metadata(&self, request_id: RequestId, tag: MetadataTag) -> Result<()> {
        let mut slot = self.slot(request_id).lock();
        if slot.request_id != Some(request_id) {
            return Err(Error::InvalidState(format!(
                "metadata slot not owned by request {}",
                request_id
            )));
        }
        slot.published.insert(tag);
        Ok(())
    }

    fn invalidate(&self, request_id: RequestId) {
        let mut slot = self.slot(request_id).lock();
        if slot.request_id == Some(request_id) {
            trace!(request_id, "Releasing metadata slot");
            slot.buffer.invalidate();
            slot.request_id = None;
            slot.published.clear();
        }
    }

    fn update_request_id(&self, request_id: RequestId) {
        let mut slot = self.slot(request_id).lock();
        slot.request_id = Some(request_id);
        slot.buffer = MetaBuffer::new();
        slot.published.clear();
    }
}
