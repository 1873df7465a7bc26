//! Pipeline interface
//!
//! A pipeline is the external processing graph that turns requests into
//! results. The session drives it through [`Pipeline`] and receives its
//! results through the [`SessionHandle`] bound at session creation.

use crate::error::Result;
use crate::metadata::MetadataPool;
use crate::session::SessionHandle;
use crate::types::{PipelineProcessRequestData, RequestId};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Stream-off behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOffMode {
    /// Let in-flight work complete
    Default,
    /// Stop immediately; in-flight work is discarded
    Immediate,
}

/// Coarse pipeline status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    Initialized,
    StreamedOn,
    StreamedOff,
}

/// Processing pipeline driven by a session
pub trait Pipeline: Send + Sync {
    fn name(&self) -> &str;

    /// Receive the handle used to report results
    fn bind_session(&self, _session: SessionHandle) {}

    /// Announce a request before its frames are submitted
    fn open_request(
        &self,
        request_id: RequestId,
        sync_id: u64,
        is_sync_mode: bool,
        expected_exposure_time_ms: u32,
    ) -> Result<()>;

    /// Submit the frames of an opened request
    ///
    /// Returns `CancelledRequest` when the pipeline is flushing.
    fn process_request(&self, data: PipelineProcessRequestData) -> Result<()>;

    fn stream_on(&self) -> Result<()>;

    fn stream_off(&self, mode: StreamOffMode) -> Result<()>;

    /// Cancel in-flight work; cancelled results are still reported
    fn flush(&self) -> Result<()>;

    /// Force nodes that are still holding work to return it
    fn flush_pending_nodes(&self);

    fn status(&self) -> PipelineStatus;

    /// True once no node holds outstanding work
    fn all_nodes_done(&self) -> bool;

    /// Expected time for this pipeline to return all work after a flush
    fn flush_response_time(&self) -> Duration;

    fn set_flush_in_progress(&self, _flushing: bool) {}

    fn notify_triggering_recovery(&self, _recovering: bool) {}

    fn metadata_pool(&self) -> Arc<dyn MetadataPool>;
}

/// Session-side bookkeeping for one pipeline
pub(crate) struct PipelineHandle {
    pub index: usize,
    pub pipeline: Arc<dyn Pipeline>,

    /// Requests submitted to this pipeline whose results are still pending
    live_pending: AtomicU32,

    /// Pipeline is targeted by the running flush
    flushing: AtomicBool,

    /// Targeted pipeline has returned all results of the flush
    flush_results_available: AtomicBool,

    /// Last request id handed to the pipeline
    last_request_id: AtomicU64,

    /// Last request id submitted before the most recent flush
    last_valid_request_id: AtomicU64,

    /// Last request id whose results were fully delivered
    last_completed_request_id: AtomicU64,
}

impl PipelineHandle {
    pub fn new(index: usize, pipeline: Arc<dyn Pipeline>) -> Self {
        Self {
            index,
            pipeline,
            live_pending: AtomicU32::new(0),
            flushing: AtomicBool::new(false),
            flush_results_available: AtomicBool::new(false),
            last_request_id: AtomicU64::new(0),
            last_valid_request_id: AtomicU64::new(0),
            last_completed_request_id: AtomicU64::new(0),
        }
    }

    pub fn get_live_pending_request(&self) -> u32 {
        self.live_pending.load(Ordering::Acquire)
    }

    pub fn increment_live_pending_request(&self) -> u32 {
        self.live_pending.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement and return the new count; never wraps below zero
    pub fn decrement_live_pending_request(&self) -> u32 {
        let previous = self
            .live_pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    pub fn set_flushing(&self, flushing: bool) {
        self.flushing.store(flushing, Ordering::Release);
        if flushing {
            self.flush_results_available
                .store(self.get_live_pending_request() == 0, Ordering::Release);
        } else {
            self.flush_results_available.store(false, Ordering::Release);
        }
    }

    pub fn flush_results_available(&self) -> bool {
        self.flush_results_available.load(Ordering::Acquire)
    }

    pub fn set_flush_results_available(&self) {
        self.flush_results_available.store(true, Ordering::Release);
    }

    pub fn record_request_id(&self, request_id: RequestId) {
        self.last_request_id.store(request_id, Ordering::Release);
    }

    pub fn last_request_id(&self) -> RequestId {
        self.last_request_id.load(Ordering::Acquire)
    }

    /// Remember the last request submitted before a flush
    pub fn save_last_valid_request_id(&self) {
        self.last_valid_request_id
            .store(self.last_request_id(), Ordering::Release);
    }

    pub fn last_valid_request_id(&self) -> RequestId {
        self.last_valid_request_id.load(Ordering::Acquire)
    }

    pub fn set_last_completed_request_id(&self, request_id: RequestId) {
        self.last_completed_request_id
            .fetch_max(request_id, Ordering::AcqRel);
    }

    pub fn last_completed_request_id(&self) -> RequestId {
        self.last_completed_request_id.load(Ordering::Acquire)
    }
}

impl fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("index", &self.index)
            .field("name", &self.pipeline.name())
            .field("live_pending", &self.get_live_pending_request())
            .field("flushing", &self.is_flushing())
            .field("flush_results_available", &self.flush_results_available())
            .field("last_request_id", &self.last_request_id())
            .field("last_completed_request_id", &self.last_completed_request_id())
            .finish()
    }
}
