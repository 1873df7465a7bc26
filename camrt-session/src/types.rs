//! Shared type definitions for the session runtime
//!
//! Client-facing request and result types plus the records exchanged with
//! pipelines.

use crate::fence::Fence;
use crate::metadata::MetaBuffer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Session-internal dense request number
pub type SequenceId = u32;

/// Client frame number
pub type FrameNumber = u64;

/// Per-pipeline request (batch) id
pub type RequestId = u64;

/// Timestamp in nanoseconds
pub type Timestamp = u64;

/// Maximum output buffers per pipeline request
pub const MAX_OUTPUT_BUFFERS: usize = 8;

/// Maximum input buffers per pipeline request
pub const MAX_INPUT_BUFFERS: usize = 4;

/// Maximum pipelines a session may drive
pub const MAX_PIPELINES_PER_SESSION: usize = 8;

/// Output or input stream identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream{}", self.0)
    }
}

/// Buffer completion status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferStatus {
    Ok,
    Error,
}

/// Buffer descriptor travelling with requests and results
#[derive(Debug, Clone)]
pub struct StreamBuffer {
    pub stream: StreamId,
    /// Opaque client buffer handle
    pub buffer_id: u64,
    pub status: BufferStatus,
    /// Must be signaled before the buffer may be read
    pub acquire_fence: Option<Fence>,
}

impl StreamBuffer {
    pub fn new(stream: StreamId, buffer_id: u64) -> Self {
        Self {
            stream,
            buffer_id,
            status: BufferStatus::Ok,
            acquire_fence: None,
        }
    }

    pub fn with_fence(mut self, fence: Fence) -> Self {
        self.acquire_fence = Some(fence);
        self
    }

    /// Same buffer, returned in error
    pub fn into_error(mut self) -> Self {
        self.status = BufferStatus::Error;
        self
    }

    pub fn is_error(&self) -> bool {
        self.status == BufferStatus::Error
    }
}

/// Client request for one pipeline
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub pipeline_index: usize,
    pub frame_number: FrameNumber,
    pub input_buffers: Vec<StreamBuffer>,
    pub output_buffers: Vec<StreamBuffer>,
    pub input_metadata: Option<Arc<MetaBuffer>>,
    pub output_metadata: Option<Arc<MetaBuffer>>,
    /// Request runs in the session's batched-frame mode
    pub batching: bool,
}

impl PipelineRequest {
    /// Request with fresh input/output metadata and no buffers
    pub fn new(pipeline_index: usize, frame_number: FrameNumber) -> Self {
        Self {
            pipeline_index,
            frame_number,
            input_buffers: Vec::new(),
            output_buffers: Vec::new(),
            input_metadata: Some(MetaBuffer::new()),
            output_metadata: Some(MetaBuffer::new()),
            batching: false,
        }
    }

    pub fn with_output(mut self, buffer: StreamBuffer) -> Self {
        self.output_buffers.push(buffer);
        self
    }

    pub fn with_input(mut self, buffer: StreamBuffer) -> Self {
        self.input_buffers.push(buffer);
        self
    }

    pub fn batched(mut self, batching: bool) -> Self {
        self.batching = batching;
        self
    }
}

/// One client submission: a request per pipeline of a sync group
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub requests: Vec<PipelineRequest>,
}

impl SessionRequest {
    pub fn single(request: PipelineRequest) -> Self {
        Self {
            requests: vec![request],
        }
    }

    pub fn is_batching(&self) -> bool {
        self.requests.iter().any(|r| r.batching)
    }
}

/// One frame of a request as handed to a pipeline
#[derive(Debug, Clone)]
pub struct ProcessFrame {
    pub sequence_id: SequenceId,
    pub batch_index: usize,
    pub input_buffers: Vec<StreamBuffer>,
    pub output_buffers: Vec<StreamBuffer>,
    pub input_metadata: Arc<MetaBuffer>,
    pub output_metadata: Arc<MetaBuffer>,
}

/// Everything a pipeline needs to execute one (possibly batched) request
#[derive(Debug, Clone)]
pub struct PipelineProcessRequestData {
    pub request_id: RequestId,
    pub sync_id: u64,
    pub frames: Vec<ProcessFrame>,
}

/// Error categories reported to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Fatal device failure; no further results
    Device,
    /// Whole request failed; no metadata or buffers will follow
    Request,
    /// Metadata failed; buffers may still follow
    Result,
    /// A single buffer failed
    Buffer,
}

/// Notification messages delivered ahead of or alongside capture results
#[derive(Debug, Clone, PartialEq)]
pub enum NotifyMessage {
    Shutter {
        frame_number: FrameNumber,
        sequence_id: SequenceId,
        timestamp: Timestamp,
    },
    Error {
        frame_number: FrameNumber,
        /// `None` for requests rejected before sequencing
        sequence_id: Option<SequenceId>,
        kind: ErrorKind,
        stream: Option<StreamId>,
    },
}

/// Capture result for one frame of one pipeline
#[derive(Debug, Clone)]
pub struct CaptureResult {
    pub frame_number: FrameNumber,
    pub sequence_id: Option<SequenceId>,
    pub pipeline_index: usize,
    pub metadata: Option<Arc<MetaBuffer>>,
    /// 0 for buffer-only results
    pub num_partial_metadata: u32,
    pub output_buffers: Vec<StreamBuffer>,
    pub input_buffers: Vec<StreamBuffer>,
}

impl CaptureResult {
    pub fn new(frame_number: FrameNumber, sequence_id: Option<SequenceId>, pipeline_index: usize) -> Self {
        Self {
            frame_number,
            sequence_id,
            pipeline_index,
            metadata: None,
            num_partial_metadata: 0,
            output_buffers: Vec::new(),
            input_buffers: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_none() && self.output_buffers.is_empty() && self.input_buffers.is_empty()
    }
}

/// Item of an ordered result batch
#[derive(Debug, Clone)]
pub enum SessionResult {
    Notify(NotifyMessage),
    Capture(CaptureResult),
}

impl SessionResult {
    /// Sequence id this result belongs to, if sequenced
    pub fn sequence_id(&self) -> Option<SequenceId> {
        match self {
            SessionResult::Notify(NotifyMessage::Shutter { sequence_id, .. }) => Some(*sequence_id),
            SessionResult::Notify(NotifyMessage::Error { sequence_id, .. }) => *sequence_id,
            SessionResult::Capture(result) => result.sequence_id,
        }
    }

    pub fn frame_number(&self) -> FrameNumber {
        match self {
            SessionResult::Notify(NotifyMessage::Shutter { frame_number, .. })
            | SessionResult::Notify(NotifyMessage::Error { frame_number, .. }) => *frame_number,
            SessionResult::Capture(result) => result.frame_number,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = PipelineRequest::new(1, 42)
            .with_output(StreamBuffer::new(StreamId(0), 100))
            .batched(true);

        assert_eq!(request.pipeline_index, 1);
        assert_eq!(request.output_buffers.len(), 1);
        assert!(SessionRequest::single(request).is_batching());
    }

    #[test]
    fn test_session_result_accessors() {
        let notify = SessionResult::Notify(NotifyMessage::Error {
            frame_number: 3,
            sequence_id: None,
            kind: ErrorKind::Request,
            stream: None,
        });
        assert_eq!(notify.sequence_id(), None);
        assert_eq!(notify.frame_number(), 3);

        let capture = SessionResult::Capture(CaptureResult::new(4, Some(2), 0));
        assert_eq!(capture.sequence_id(), Some(2));
    }

    #[test]
    fn test_buffer_into_error() {
        let buffer = StreamBuffer::new(StreamId(1), 7).into_error();
        assert!(buffer.is_error());
    }
}
