//! Per-sequence result holders
//!
//! A [`SessionResultHolder`] tracks one sequence id across every pipeline
//! of its sync group; each pipeline's share is a [`ResultHolder`]. Holders
//! accumulate injected results until the aggregation pass delivers them.

use crate::error::{Error, Result};
use crate::metadata::MetaBuffer;
use crate::session::metabuffer::{BUFFER_READY, META_READY};
use crate::types::{FrameNumber, RequestId, SequenceId, StreamBuffer, StreamId, Timestamp};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

pub const METADATA_SLOT_MAIN: usize = 0;
pub const METADATA_SLOT_INPUT: usize = 1;
pub const METADATA_SLOT_EARLY: usize = 2;
pub const MAX_METADATA_SLOTS: usize = 3;

/// Result injected by a pipeline (or synthesized by the session)
#[derive(Debug, Clone)]
pub enum InjectedResult {
    /// Whole request failed
    RequestError,
    /// Metadata will not arrive
    MetadataError,
    MetadataOk(Arc<MetaBuffer>),
    EarlyMetadataOk(Arc<MetaBuffer>),
    BufferOk(StreamBuffer),
    BufferError(StreamBuffer),
}

/// Output buffer slot
///
/// `stream` is cleared once the buffer has been dispatched.
#[derive(Debug, Clone)]
pub struct BufferResult {
    pub stream: Option<StreamId>,
    /// Buffer as submitted by the client
    pub requested: StreamBuffer,
    /// Buffer as returned by the pipeline, awaiting dispatch
    pub returned: Option<StreamBuffer>,
    pub error: bool,
}

impl BufferResult {
    fn new(requested: StreamBuffer) -> Self {
        Self {
            stream: Some(requested.stream),
            requested,
            returned: None,
            error: false,
        }
    }

    /// Returned and waiting for its stream's turn
    pub fn is_valid(&self) -> bool {
        self.stream.is_some() && self.returned.is_some()
    }
}

/// Input buffer returned to the client with the final metadata
#[derive(Debug, Clone)]
pub struct InputBufferInfo {
    pub stream: StreamId,
    pub buffer: StreamBuffer,
}

/// One pipeline's share of a sequence id
#[derive(Debug)]
pub struct ResultHolder {
    pub sequence_id: SequenceId,
    pub pipeline_index: usize,
    pub request_id: RequestId,
    pub frame_number: FrameNumber,
    pub batch_index: usize,

    /// Metadata components still to deliver (early + main)
    pub pending_metadata_count: u32,
    pub metadata: [Option<Arc<MetaBuffer>>; MAX_METADATA_SLOTS],
    /// Metadata error placeholder waiting for its turn
    pub metadata_error: bool,
    /// At least one metadata component (or error) has been dispatched
    pub metadata_delivered: bool,
    pub early_metadata_sent: bool,
    expects_early_metadata: bool,

    /// Client's output metadata, receives the merged main result
    pub output_metadata: Arc<MetaBuffer>,

    pub buffers: Vec<BufferResult>,
    pub num_ok_buffers: u32,
    pub num_error_buffers: u32,
    pub input_buffers: Vec<InputBufferInfo>,

    pub is_cancelled: bool,
    pub request_error_sent: bool,
    pub shutter_sent: bool,
    pub shutter_timestamp: Option<Timestamp>,
    pub expected_exposure_time_ms: u32,
}

/// Construction parameters for a [`ResultHolder`]
#[derive(Debug, Clone)]
pub struct HolderSpec {
    pub sequence_id: SequenceId,
    pub pipeline_index: usize,
    pub request_id: RequestId,
    pub frame_number: FrameNumber,
    pub batch_index: usize,
    pub partial_metadata_count: u32,
    pub output_buffers: Vec<StreamBuffer>,
    pub input_buffers: Vec<StreamBuffer>,
    pub input_metadata: Arc<MetaBuffer>,
    pub output_metadata: Arc<MetaBuffer>,
    pub expected_exposure_time_ms: u32,
}

impl ResultHolder {
    pub fn new(spec: HolderSpec) -> Self {
        let mut metadata: [Option<Arc<MetaBuffer>>; MAX_METADATA_SLOTS] = Default::default();
        metadata[METADATA_SLOT_INPUT] = Some(spec.input_metadata);

        Self {
            sequence_id: spec.sequence_id,
            pipeline_index: spec.pipeline_index,
            request_id: spec.request_id,
            frame_number: spec.frame_number,
            batch_index: spec.batch_index,
            pending_metadata_count: spec.partial_metadata_count + 1,
            metadata,
            metadata_error: false,
            metadata_delivered: false,
            early_metadata_sent: false,
            expects_early_metadata: spec.partial_metadata_count > 0,
            output_metadata: spec.output_metadata,
            buffers: spec.output_buffers.into_iter().map(BufferResult::new).collect(),
            num_ok_buffers: 0,
            num_error_buffers: 0,
            input_buffers: spec
                .input_buffers
                .into_iter()
                .map(|buffer| InputBufferInfo {
                    stream: buffer.stream,
                    buffer,
                })
                .collect(),
            is_cancelled: false,
            request_error_sent: false,
            shutter_sent: false,
            shutter_timestamp: None,
            expected_exposure_time_ms: spec.expected_exposure_time_ms,
        }
    }

    /// Record an injected result
    ///
    /// Duplicate metadata errors and late metadata after resolution are
    /// ignored. A buffer for a stream this holder does not carry, or one
    /// already returned, is rejected.
    pub fn apply(&mut self, result: InjectedResult) -> Result<()> {
        match result {
            InjectedResult::RequestError => {
                self.is_cancelled = true;
            }
            InjectedResult::MetadataError => {
                if self.metadata_error || self.pending_metadata_count == 0 {
                    debug!(sequence_id = self.sequence_id, "Duplicate metadata error ignored");
                } else {
                    self.metadata_error = true;
                }
            }
            InjectedResult::MetadataOk(metadata) => {
                if self.metadata_error || self.pending_metadata_count == 0 {
                    debug!(sequence_id = self.sequence_id, "Late metadata ignored");
                } else if self.metadata[METADATA_SLOT_MAIN].is_some() {
                    return Err(Error::InvalidArg(format!(
                        "duplicate metadata for sequence {}",
                        self.sequence_id
                    )));
                } else {
                    self.metadata[METADATA_SLOT_MAIN] = Some(metadata);
                }
            }
            InjectedResult::EarlyMetadataOk(metadata) => {
                if !self.expects_early_metadata
                    || self.early_metadata_sent
                    || self.metadata_error
                    || self.metadata[METADATA_SLOT_EARLY].is_some()
                    || self.pending_metadata_count <= 1
                {
                    debug!(sequence_id = self.sequence_id, "Early metadata ignored");
                } else {
                    self.metadata[METADATA_SLOT_EARLY] = Some(metadata);
                }
            }
            InjectedResult::BufferOk(buffer) => self.return_buffer(buffer, false)?,
            InjectedResult::BufferError(buffer) => self.return_buffer(buffer.into_error(), true)?,
        }
        Ok(())
    }

    fn return_buffer(&mut self, buffer: StreamBuffer, error: bool) -> Result<()> {
        let stream = buffer.stream;
        let slot = self
            .buffers
            .iter_mut()
            .find(|slot| slot.requested.stream == stream)
            .ok_or_else(|| {
                Error::InvalidArg(format!(
                    "sequence {} has no buffer for {}",
                    self.sequence_id, stream
                ))
            })?;

        if slot.returned.is_some() || slot.stream.is_none() {
            return Err(Error::InvalidArg(format!(
                "buffer for {} already returned (sequence {})",
                stream, self.sequence_id
            )));
        }

        let error = error || buffer.is_error();
        slot.returned = Some(if error { buffer.into_error() } else { buffer });
        slot.error = error;
        if error {
            self.num_error_buffers += 1;
        } else {
            self.num_ok_buffers += 1;
        }
        Ok(())
    }

    /// Fill every outstanding buffer slot with an error buffer
    pub fn fail_outstanding_buffers(&mut self) {
        for slot in self.buffers.iter_mut() {
            if slot.stream.is_some() && slot.returned.is_none() {
                slot.returned = Some(slot.requested.clone().into_error());
                slot.error = true;
                self.num_error_buffers += 1;
            }
        }
    }

    pub fn cancel(&mut self) {
        self.is_cancelled = true;
    }

    pub fn all_buffers_returned(&self) -> bool {
        (self.num_ok_buffers + self.num_error_buffers) as usize == self.buffers.len()
    }

    /// Metadata arrived in any form, dispatched or not
    pub fn any_metadata_arrived(&self) -> bool {
        self.metadata_delivered
            || self.metadata_error
            || self.metadata[METADATA_SLOT_MAIN].is_some()
            || self.metadata[METADATA_SLOT_EARLY].is_some()
    }

    /// Something is waiting to be dispatched
    pub fn has_pending_output(&self) -> bool {
        self.shutter_timestamp.is_some()
            || self.metadata_error
            || self.metadata[METADATA_SLOT_MAIN].is_some()
            || self.metadata[METADATA_SLOT_EARLY].is_some()
            || self.buffers.iter().any(BufferResult::is_valid)
    }

    /// Every metadata component and buffer has been delivered
    pub fn is_resolved(&self) -> bool {
        self.pending_metadata_count == 0 && self.buffers.iter().all(|b| b.stream.is_none())
    }

    /// Delivery progress as metabuffer-done ready bits
    pub fn ready_flags(&self) -> u8 {
        let mut flags = 0;
        if self.pending_metadata_count == 0 {
            flags |= META_READY;
        }
        if self.buffers.iter().all(|b| b.stream.is_none()) {
            flags |= BUFFER_READY;
        }
        flags
    }

    /// Streams still owed to the client
    pub fn outstanding_streams(&self) -> Vec<StreamId> {
        self.buffers.iter().filter_map(|b| b.stream).collect()
    }

    pub fn take_input_buffers(&mut self) -> Vec<StreamBuffer> {
        self.input_buffers.drain(..).map(|info| info.buffer).collect()
    }
}

/// All pipeline holders for one sequence id
#[derive(Debug)]
pub struct SessionResultHolder {
    pub sequence_id: SequenceId,
    pub holders: Vec<ResultHolder>,
    /// Exposure registered with admission, released on completion
    pub long_exposure_ms: u64,
    pub created_at: Instant,
}

impl SessionResultHolder {
    pub fn new(sequence_id: SequenceId, holders: Vec<ResultHolder>, long_exposure_ms: u64) -> Self {
        Self {
            sequence_id,
            holders,
            long_exposure_ms,
            created_at: Instant::now(),
        }
    }

    pub fn holder_mut(&mut self, pipeline_index: usize) -> Option<&mut ResultHolder> {
        self.holders
            .iter_mut()
            .find(|h| h.pipeline_index == pipeline_index)
    }

    pub fn is_resolved(&self) -> bool {
        self.holders.iter().all(ResultHolder::is_resolved)
    }

    pub fn metadata_delivered(&self) -> bool {
        self.holders.iter().all(|h| h.metadata_delivered)
    }

    pub fn shutter_sent(&self) -> bool {
        self.holders.iter().all(|h| h.shutter_sent)
    }

    pub fn cancel(&mut self) {
        for holder in self.holders.iter_mut() {
            holder.cancel();
        }
    }

    /// Cancel only the holders of the given pipelines
    pub fn cancel_pipelines(&mut self, pipelines: &[usize]) -> usize {
        let mut cancelled = 0;
        for holder in self.holders.iter_mut() {
            if pipelines.contains(&holder.pipeline_index) && !holder.is_cancelled {
                holder.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }
}
