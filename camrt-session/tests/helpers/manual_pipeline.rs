//! Pipeline driven by the test
//!
//! Records every submitted request and leaves result delivery to the test.
//! Flush behaviour is configurable to reach each flush escalation tier.

use camrt_session::error::{Error, Result};
use camrt_session::metadata::{tags, MetaBuffer, MetadataPool, MetadataValue, SlotMetadataPool};
use camrt_session::pipeline::{Pipeline, PipelineStatus, StreamOffMode};
use camrt_session::session::{CallbackPayload, PipelineErrorKind, ResultsData, SessionHandle};
use camrt_session::types::{PipelineProcessRequestData, RequestId, SequenceId, StreamBuffer};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How outstanding work reacts to flush requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeBehaviour {
    /// `flush` returns outstanding work as errors
    Responsive,
    /// Only `flush_pending_nodes` returns outstanding work
    NeedsForce,
    /// Outstanding work is never returned
    Stalled,
}

#[derive(Debug, Clone)]
struct Outstanding {
    request_id: RequestId,
    buffers: Vec<StreamBuffer>,
}

pub struct ManualPipeline {
    index: usize,
    name: String,
    session: Mutex<Option<SessionHandle>>,
    submitted: Mutex<Vec<PipelineProcessRequestData>>,
    submitted_cv: Condvar,
    outstanding: Mutex<BTreeMap<SequenceId, Outstanding>>,
    behaviour: Mutex<NodeBehaviour>,
    reject_next: Mutex<Option<Error>>,
    flushing: AtomicBool,
    recovering: AtomicBool,
    flush_calls: AtomicUsize,
    forced_flush_calls: AtomicUsize,
    pool: Arc<SlotMetadataPool>,
}

impl ManualPipeline {
    pub fn new(index: usize) -> Arc<Self> {
        Arc::new(Self {
            index,
            name: format!("manual{}", index),
            session: Mutex::new(None),
            submitted: Mutex::new(Vec::new()),
            submitted_cv: Condvar::new(),
            outstanding: Mutex::new(BTreeMap::new()),
            behaviour: Mutex::new(NodeBehaviour::Responsive),
            reject_next: Mutex::new(None),
            flushing: AtomicBool::new(false),
            recovering: AtomicBool::new(false),
            flush_calls: AtomicUsize::new(0),
            forced_flush_calls: AtomicUsize::new(0),
            pool: Arc::new(SlotMetadataPool::new(64)),
        })
    }

    pub fn set_behaviour(&self, behaviour: NodeBehaviour) {
        *self.behaviour.lock() = behaviour;
    }

    /// Fail the next `process_request` with `error`
    pub fn reject_next(&self, error: Error) {
        *self.reject_next.lock() = Some(error);
    }

    pub fn submitted(&self) -> Vec<PipelineProcessRequestData> {
        self.submitted.lock().clone()
    }

    /// Frames (not requests) submitted so far
    pub fn submitted_frames(&self) -> usize {
        self.submitted.lock().iter().map(|r| r.frames.len()).sum()
    }

    pub fn wait_for_frames(&self, frames: usize, timeout: Duration) -> bool {
        let mut submitted = self.submitted.lock();
        let deadline = std::time::Instant::now() + timeout;
        while submitted.iter().map(|r| r.frames.len()).sum::<usize>() < frames {
            if self.submitted_cv.wait_until(&mut submitted, deadline).timed_out() {
                return submitted.iter().map(|r| r.frames.len()).sum::<usize>() >= frames;
            }
        }
        true
    }

    pub fn outstanding(&self) -> Vec<SequenceId> {
        self.outstanding.lock().keys().copied().collect()
    }

    /// Forget outstanding work without reporting it
    pub fn clear_outstanding(&self) {
        self.outstanding.lock().clear();
    }

    pub fn flush_calls(&self) -> usize {
        self.flush_calls.load(Ordering::Acquire)
    }

    pub fn forced_flush_calls(&self) -> usize {
        self.forced_flush_calls.load(Ordering::Acquire)
    }

    /// Metadata slots still owned by a request
    pub fn metadata_slots_in_use(&self) -> usize {
        self.pool.active_slots()
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::Acquire)
    }

    pub fn send(&self, payload: CallbackPayload) -> Result<()> {
        let session = self
            .session
            .lock()
            .clone()
            .ok_or_else(|| Error::InvalidState("pipeline not bound".to_string()))?;
        session.notify_result(ResultsData::new(self.index, payload))
    }

    pub fn send_metadata(&self, sequence_id: SequenceId) -> Result<()> {
        let metadata = MetaBuffer::with_entries([(
            tags::SENSOR_TIMESTAMP,
            MetadataValue::Int(1_000 + sequence_id as i64),
        )]);
        self.send(CallbackPayload::Metadata {
            sequence_id,
            metadata,
        })
    }

    pub fn send_metadata_error(&self, sequence_id: SequenceId) -> Result<()> {
        self.send(CallbackPayload::Error {
            sequence_id: Some(sequence_id),
            kind: PipelineErrorKind::Metadata,
            stream: None,
        })
    }

    /// Return every buffer of `sequence_id`
    pub fn send_buffers(&self, sequence_id: SequenceId) -> Result<()> {
        let buffers = self
            .outstanding
            .lock()
            .get(&sequence_id)
            .map(|o| o.buffers.clone())
            .unwrap_or_default();
        for buffer in buffers {
            self.send(CallbackPayload::Buffer {
                sequence_id,
                buffer,
            })?;
        }
        Ok(())
    }

    /// Deliver metadata and every buffer of `sequence_id`
    pub fn complete(&self, sequence_id: SequenceId) -> Result<()> {
        self.send_metadata(sequence_id)?;
        self.send_buffers(sequence_id)?;
        self.outstanding.lock().remove(&sequence_id);
        Ok(())
    }

    pub fn send_device_error(&self) -> Result<()> {
        self.send(CallbackPayload::Error {
            sequence_id: None,
            kind: PipelineErrorKind::Device,
            stream: None,
        })
    }

    /// Report all outstanding work as errors
    fn return_outstanding_as_errors(&self) {
        let outstanding = std::mem::take(&mut *self.outstanding.lock());
        for (sequence_id, work) in outstanding {
            // The session may already have given up on the sequence
            let _ = self.send(CallbackPayload::Error {
                sequence_id: Some(sequence_id),
                kind: PipelineErrorKind::Metadata,
                stream: None,
            });
            for buffer in work.buffers {
                let _ = self.send(CallbackPayload::Buffer {
                    sequence_id,
                    buffer: buffer.into_error(),
                });
            }
            let _ = self.send(CallbackPayload::MetaBufferDone {
                request_id: work.request_id,
            });
        }
    }
}

impl Pipeline for ManualPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn bind_session(&self, session: SessionHandle) {
        *self.session.lock() = Some(session);
    }

    fn open_request(
        &self,
        _request_id: RequestId,
        _sync_id: u64,
        _is_sync_mode: bool,
        _expected_exposure_time_ms: u32,
    ) -> Result<()> {
        Ok(())
    }

    fn process_request(&self, data: PipelineProcessRequestData) -> Result<()> {
        if let Some(error) = self.reject_next.lock().take() {
            return Err(error);
        }
        if self.flushing.load(Ordering::Acquire) {
            return Err(Error::CancelledRequest("flushing".to_string()));
        }

        {
            let mut outstanding = self.outstanding.lock();
            for frame in &data.frames {
                outstanding.insert(
                    frame.sequence_id,
                    Outstanding {
                        request_id: data.request_id,
                        buffers: frame.output_buffers.clone(),
                    },
                );
            }
        }
        self.submitted.lock().push(data);
        self.submitted_cv.notify_all();
        Ok(())
    }

    fn stream_on(&self) -> Result<()> {
        Ok(())
    }

    fn stream_off(&self, _mode: StreamOffMode) -> Result<()> {
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.flush_calls.fetch_add(1, Ordering::AcqRel);
        if *self.behaviour.lock() == NodeBehaviour::Responsive {
            self.return_outstanding_as_errors();
        }
        Ok(())
    }

    fn flush_pending_nodes(&self) {
        self.forced_flush_calls.fetch_add(1, Ordering::AcqRel);
        if *self.behaviour.lock() == NodeBehaviour::NeedsForce {
            self.return_outstanding_as_errors();
        }
    }

    fn status(&self) -> PipelineStatus {
        PipelineStatus::StreamedOn
    }

    fn all_nodes_done(&self) -> bool {
        self.outstanding.lock().is_empty()
    }

    fn flush_response_time(&self) -> Duration {
        Duration::from_millis(20)
    }

    fn set_flush_in_progress(&self, flushing: bool) {
        self.flushing.store(flushing, Ordering::Release);
    }

    fn notify_triggering_recovery(&self, recovering: bool) {
        self.recovering.store(recovering, Ordering::Release);
    }

    fn metadata_pool(&self) -> Arc<dyn MetadataPool> {
        self.pool.clone()
    }
}
