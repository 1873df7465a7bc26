//! Session request queue
//!
//! Accepted requests wait here, already sequenced and batched, until the
//! worker job dispatches them to their pipelines.

use crate::error::{Error, Result};
use crate::metadata::MetaBuffer;
use crate::sync::wait_until;
use crate::types::{FrameNumber, RequestId, SequenceId, StreamBuffer};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// One client frame inside a pipeline request
#[derive(Debug, Clone)]
pub(crate) struct BatchedFrame {
    pub sequence_id: SequenceId,
    pub frame_number: FrameNumber,
    pub input_buffers: Vec<StreamBuffer>,
    pub output_buffers: Vec<StreamBuffer>,
    pub input_metadata: Arc<MetaBuffer>,
    pub output_metadata: Arc<MetaBuffer>,
    pub expected_exposure_time_ms: u32,
}

/// Frames bound for one pipeline under one request id
#[derive(Debug, Clone)]
pub(crate) struct PipelineCaptureRequest {
    pub pipeline_index: usize,
    pub request_id: RequestId,
    pub frames: Vec<BatchedFrame>,
}

/// Session-owned copy of an accepted request (one full batch)
#[derive(Debug, Clone)]
pub(crate) struct CaptureRequest {
    pub sync_id: u64,
    pub pipeline_requests: Vec<PipelineCaptureRequest>,
}

impl CaptureRequest {
    /// Batched-frame count shared by every sub-request
    pub fn num_batched_frames(&self) -> Result<usize> {
        let mut counts = self.pipeline_requests.iter().map(|r| r.frames.len());
        let first = counts
            .next()
            .ok_or_else(|| Error::InvalidArg("capture request has no pipelines".to_string()))?;
        if counts.any(|n| n != first) {
            return Err(Error::InvalidArg(format!(
                "sub-requests disagree on batched frame count (sync id {})",
                self.sync_id
            )));
        }
        Ok(first)
    }

    /// Distinct sequence ids in ascending order
    pub fn sequence_ids(&self) -> Vec<SequenceId> {
        let mut ids: Vec<SequenceId> = self
            .pipeline_requests
            .iter()
            .flat_map(|r| r.frames.iter().map(|f| f.sequence_id))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn is_sync_mode(&self) -> bool {
        self.pipeline_requests.len() > 1
    }

    pub fn targets(&self, pipeline_index: usize) -> bool {
        self.pipeline_requests
            .iter()
            .any(|r| r.pipeline_index == pipeline_index)
    }
}

struct QueueInner {
    queue: VecDeque<CaptureRequest>,
    depth: usize,
}

pub(crate) struct RequestQueue {
    inner: Mutex<QueueInner>,
    condvar: Condvar,
}

impl RequestQueue {
    pub fn new(depth: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                queue: VecDeque::with_capacity(depth),
                depth,
            }),
            condvar: Condvar::new(),
        }
    }

    pub fn enqueue(&self, request: CaptureRequest) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.queue.len() >= inner.depth {
            return Err(Error::NoMemory(format!(
                "request queue full ({} entries)",
                inner.depth
            )));
        }
        trace!(sync_id = request.sync_id, "Request enqueued");
        inner.queue.push_back(request);
        Ok(())
    }

    /// Push back at the head, used when a flush returns untouched requests
    pub fn requeue_front(&self, requests: Vec<CaptureRequest>) {
        let mut inner = self.inner.lock();
        for request in requests.into_iter().rev() {
            inner.queue.push_front(request);
        }
    }

    pub fn try_dequeue(&self) -> Option<CaptureRequest> {
        let request = self.inner.lock().queue.pop_front();
        if request.is_some() {
            self.condvar.notify_all();
        }
        request
    }

    /// Remove every queued request
    pub fn drain(&self) -> Vec<CaptureRequest> {
        let drained: Vec<_> = self.inner.lock().queue.drain(..).collect();
        self.condvar.notify_all();
        drained
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().depth
    }

    /// Change capacity; only legal while empty
    pub fn set_depth(&self, depth: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.queue.is_empty() {
            return Err(Error::InvalidState(format!(
                "cannot resize request queue with {} pending entries",
                inner.queue.len()
            )));
        }
        inner.depth = depth;
        Ok(())
    }

    pub fn wait_until_empty(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        wait_until(&mut inner, &self.condvar, timeout, |q| q.queue.is_empty())
    }
}
