//! Pipeline callbacks
//!
//! Pipelines report everything through [`ResultsData`]. Each payload kind
//! maps onto a result injection or a session-level reaction.
//!
//! Pipelines must not hold locks of their own that `all_nodes_done` or
//! `flush` take while calling back into the session.

use super::core::SessionInner;
use crate::error::{Error, Result};
use crate::metadata::MetaBuffer;
use crate::session::result_holder::InjectedResult;
use crate::types::{BufferStatus, RequestId, SequenceId, StreamBuffer, StreamId, Timestamp};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Error categories a pipeline can report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    /// Unrecoverable device failure
    Device,
    /// Device wants to be flushed back to health
    Recovery,
    Request,
    Metadata,
    Buffer,
}

/// Callback payload
#[derive(Debug, Clone)]
pub enum CallbackPayload {
    Error {
        sequence_id: Option<SequenceId>,
        kind: PipelineErrorKind,
        stream: Option<StreamId>,
    },
    /// Shutter
    Async {
        sequence_id: SequenceId,
        timestamp: Timestamp,
    },
    /// Start of frame
    Sof {
        sequence_id: SequenceId,
        timestamp: Timestamp,
    },
    Metadata {
        sequence_id: SequenceId,
        metadata: Arc<MetaBuffer>,
    },
    /// Merged into the client's output metadata without being delivered
    PartialMetadata {
        sequence_id: SequenceId,
        metadata: Arc<MetaBuffer>,
    },
    EarlyMetadata {
        sequence_id: SequenceId,
        metadata: Arc<MetaBuffer>,
    },
    Buffer {
        sequence_id: SequenceId,
        buffer: StreamBuffer,
    },
    /// Pipeline no longer uses the metadata slot of `request_id`
    MetaBufferDone { request_id: RequestId },
}

/// A callback from one pipeline
#[derive(Debug, Clone)]
pub struct ResultsData {
    pub pipeline_index: usize,
    pub payload: CallbackPayload,
}

impl ResultsData {
    pub fn new(pipeline_index: usize, payload: CallbackPayload) -> Self {
        Self {
            pipeline_index,
            payload,
        }
    }
}

impl SessionInner {
    pub(super) fn notify_result(&self, data: ResultsData) -> Result<()> {
        let pipeline_index = data.pipeline_index;
        if pipeline_index >= self.pipelines.len() {
            return Err(Error::InvalidArg(format!(
                "callback from unknown pipeline {}",
                pipeline_index
            )));
        }

        match data.payload {
            CallbackPayload::Error {
                sequence_id,
                kind,
                stream,
            } => self.handle_error(pipeline_index, sequence_id, kind, stream),
            CallbackPayload::Async {
                sequence_id,
                timestamp,
            } => self.handle_shutter(pipeline_index, sequence_id, timestamp),
            CallbackPayload::Sof {
                sequence_id,
                timestamp,
            } => {
                trace!(pipeline = pipeline_index, sequence_id, timestamp, "SOF");
                self.last_sof_timestamp.store(timestamp, Ordering::Release);
                Ok(())
            }
            CallbackPayload::Metadata {
                sequence_id,
                metadata,
            } => self.inject_result(sequence_id, pipeline_index, InjectedResult::MetadataOk(metadata)),
            CallbackPayload::PartialMetadata {
                sequence_id,
                metadata,
            } => self.handle_partial_metadata(pipeline_index, sequence_id, &metadata),
            CallbackPayload::EarlyMetadata {
                sequence_id,
                metadata,
            } => self.inject_result(
                sequence_id,
                pipeline_index,
                InjectedResult::EarlyMetadataOk(metadata),
            ),
            CallbackPayload::Buffer {
                sequence_id,
                buffer,
            } => {
                let result = match buffer.status {
                    BufferStatus::Ok => InjectedResult::BufferOk(buffer),
                    BufferStatus::Error => InjectedResult::BufferError(buffer),
                };
                self.inject_result(sequence_id, pipeline_index, result)
            }
            CallbackPayload::MetaBufferDone { request_id } => {
                let releasable = {
                    let mut metabuffers = self.metabuffers.lock();
                    metabuffers.pipeline_done(pipeline_index, request_id);
                    metabuffers.drain_releasable()
                };
                self.invalidate_metabuffers(&releasable);
                Ok(())
            }
        }
    }

    fn handle_error(
        &self,
        pipeline_index: usize,
        sequence_id: Option<SequenceId>,
        kind: PipelineErrorKind,
        stream: Option<StreamId>,
    ) -> Result<()> {
        match kind {
            PipelineErrorKind::Device => {
                self.set_device_in_error(&format!("device error from pipeline {}", pipeline_index));
                Ok(())
            }
            PipelineErrorKind::Recovery => {
                self.trigger_recovery(&format!("recovery requested by pipeline {}", pipeline_index));
                Ok(())
            }
            PipelineErrorKind::Request => {
                let sequence_id = required_sequence(sequence_id, kind)?;
                self.inject_result(sequence_id, pipeline_index, InjectedResult::RequestError)
            }
            PipelineErrorKind::Metadata => {
                let sequence_id = required_sequence(sequence_id, kind)?;
                self.inject_result(sequence_id, pipeline_index, InjectedResult::MetadataError)
            }
            PipelineErrorKind::Buffer => {
                let sequence_id = required_sequence(sequence_id, kind)?;
                let stream = stream.ok_or_else(|| {
                    Error::InvalidArg("buffer error without a stream".to_string())
                })?;
                let buffer = self.requested_buffer(sequence_id, pipeline_index, stream)?;
                self.inject_result(sequence_id, pipeline_index, InjectedResult::BufferError(buffer))
            }
        }
    }

    /// The buffer the client submitted for `stream`
    fn requested_buffer(
        &self,
        sequence_id: SequenceId,
        pipeline_index: usize,
        stream: StreamId,
    ) -> Result<StreamBuffer> {
        let list = self.results.lock();
        list.get(sequence_id)
            .and_then(|h| h.holders.iter().find(|h| h.pipeline_index == pipeline_index))
            .and_then(|h| h.buffers.iter().find(|b| b.requested.stream == stream))
            .map(|slot| slot.requested.clone())
            .ok_or_else(|| {
                Error::InvalidArg(format!(
                    "sequence {} has no buffer for {} on pipeline {}",
                    sequence_id, stream, pipeline_index
                ))
            })
    }

    fn handle_shutter(
        &self,
        pipeline_index: usize,
        sequence_id: SequenceId,
        timestamp: Timestamp,
    ) -> Result<()> {
        if self.state.is_device_error() {
            return Err(Error::InvalidState(format!(
                "session {} is in device error",
                self.id
            )));
        }
        {
            let mut list = self.results.lock();
            let holder = list
                .get_mut(sequence_id)
                .and_then(|h| h.holder_mut(pipeline_index))
                .ok_or_else(|| {
                    Error::InvalidArg(format!(
                        "shutter for unknown sequence {} on pipeline {}",
                        sequence_id, pipeline_index
                    ))
                })?;
            if holder.shutter_sent || holder.shutter_timestamp.is_some() {
                debug!(sequence_id, "Duplicate shutter ignored");
                return Ok(());
            }
            holder.shutter_timestamp = Some(timestamp);
        }
        self.check_results.store(true, Ordering::Release);
        self.post_job();
        Ok(())
    }

    fn handle_partial_metadata(
        &self,
        pipeline_index: usize,
        sequence_id: SequenceId,
        metadata: &MetaBuffer,
    ) -> Result<()> {
        let list = self.results.lock();
        let holder = list
            .get(sequence_id)
            .and_then(|h| h.holders.iter().find(|h| h.pipeline_index == pipeline_index))
            .ok_or_else(|| {
                Error::InvalidArg(format!(
                    "partial metadata for unknown sequence {} on pipeline {}",
                    sequence_id, pipeline_index
                ))
            })?;
        if holder.pending_metadata_count == 0 {
            warn!(sequence_id, "Partial metadata after final result ignored");
            return Ok(());
        }
        holder.output_metadata.merge_from(metadata);
        Ok(())
    }
}

fn required_sequence(sequence_id: Option<SequenceId>, kind: PipelineErrorKind) -> Result<SequenceId> {
    sequence_id.ok_or_else(|| Error::InvalidArg(format!("{:?} error without a sequence id", kind)))
}
