//! Result aggregation
//!
//! Pipelines inject results in any order; the worker job turns them into
//! client results in ascending sequence order. Metadata for a sequence is
//! held back until the previous sequence delivered some metadata, and each
//! stream's buffers leave in the order the stream was requested.

use super::core::SessionInner;
use crate::error::{Error, Result};
use crate::metadata::tags;
use crate::session::result_holder::{
    InjectedResult, ResultHolder, SessionResultHolder, METADATA_SLOT_EARLY, METADATA_SLOT_MAIN,
};
use crate::session::result_list::StreamTracker;
use crate::types::{CaptureResult, ErrorKind, NotifyMessage, RequestId, SequenceId, SessionResult};
use std::sync::atomic::Ordering;
use tracing::{debug, trace};

/// Delivery state of the previous sequence id
#[derive(Debug, Clone, Copy)]
struct Gates {
    metadata: bool,
    shutter: bool,
}

impl SessionInner {
    pub(super) fn inject_result(
        &self,
        sequence_id: SequenceId,
        pipeline_index: usize,
        result: InjectedResult,
    ) -> Result<()> {
        if self.state.is_device_error() {
            return Err(Error::InvalidState(format!(
                "session {} is in device error",
                self.id
            )));
        }

        {
            let mut list = self.results.lock();
            let session_holder = list.get_mut(sequence_id).ok_or_else(|| {
                Error::InvalidArg(format!("no result holder for sequence {}", sequence_id))
            })?;
            let holder = session_holder.holder_mut(pipeline_index).ok_or_else(|| {
                Error::InvalidArg(format!(
                    "sequence {} has no holder for pipeline {}",
                    sequence_id, pipeline_index
                ))
            })?;
            holder.apply(result)?;
        }

        self.check_results.store(true, Ordering::Release);
        self.post_job();
        Ok(())
    }

    /// Stage and dispatch everything that is ready to leave
    ///
    /// Result lock must be held.
    pub(super) fn process_results(&self) {
        let mut batch = Vec::new();

        if self.device_error_notify.swap(false, Ordering::AcqRel) {
            batch.push(SessionResult::Notify(NotifyMessage::Error {
                frame_number: 0,
                sequence_id: None,
                kind: ErrorKind::Device,
                stream: None,
            }));
        }

        let partial = self.config.partial_metadata_count;
        let mut last_shutter = None;
        let mut ready = Vec::new();
        {
            let mut list = self.results.lock();
            let (holders, streams) = list.split_mut();
            let mut gates = Gates {
                metadata: true,
                shutter: true,
            };

            for session_holder in holders {
                for holder in session_holder.holders.iter_mut() {
                    let before = holder.ready_flags();
                    stage_holder(holder, streams, gates, partial, &mut batch);
                    let after = holder.ready_flags();
                    if after != before {
                        ready.push((holder.sequence_id, holder.pipeline_index, after));
                    }
                }
                if session_holder.shutter_sent() {
                    last_shutter = Some(session_holder.sequence_id);
                }
                gates = Gates {
                    metadata: session_holder.metadata_delivered(),
                    shutter: session_holder.shutter_sent(),
                };
            }
        }

        if let Some(sequence_id) = last_shutter {
            self.last_shutter_sequence_id
                .fetch_max(sequence_id as i64, Ordering::AcqRel);
        }

        if !batch.is_empty() {
            trace!(results = batch.len(), "Dispatching result batch");
            self.sink.dispatch(&batch);
        }

        if !ready.is_empty() {
            let releasable = {
                let mut metabuffers = self.metabuffers.lock();
                for &(sequence_id, pipeline_index, flags) in &ready {
                    metabuffers.mark(sequence_id, pipeline_index, flags);
                }
                metabuffers.drain_releasable()
            };
            self.invalidate_metabuffers(&releasable);
        }

        self.advance_min_expected_result();
    }

    /// Pop fully resolved holders from the head and release their resources
    pub(super) fn advance_min_expected_result(&self) {
        let popped = self.results.lock().pop_resolved();
        if popped.is_empty() {
            return;
        }

        for session_holder in &popped {
            self.complete_holder(session_holder);
        }

        let mut completion = self.completion.lock();
        *completion += popped.len() as u64;
        self.completion_cv.notify_all();
    }

    /// Release what a finished sequence id held
    pub(super) fn complete_holder(&self, session_holder: &SessionResultHolder) {
        for holder in &session_holder.holders {
            let Some(handle) = self.pipelines.get(holder.pipeline_index) else {
                continue;
            };
            let remaining = handle.decrement_live_pending_request();
            if remaining == 0 && handle.is_flushing() {
                handle.set_flush_results_available();
            }
            handle.set_last_completed_request_id(holder.request_id);
        }

        if session_holder.long_exposure_ms > 0 {
            self.admission.remove_long_exposure(session_holder.long_exposure_ms);
        }
        self.release_admission();

        if let Some(elapsed) = self.timing.lock().finish(session_holder.sequence_id) {
            trace!(
                sequence_id = session_holder.sequence_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "Sequence complete"
            );
        }
    }

    pub(super) fn invalidate_metabuffers(&self, released: &[(usize, RequestId)]) {
        for &(pipeline_index, request_id) in released {
            if let Some(handle) = self.pipelines.get(pipeline_index) {
                debug!(pipeline = pipeline_index, request_id, "Releasing metadata slot");
                handle.pipeline.metadata_pool().invalidate(request_id);
            }
        }
    }
}

/// Stage whatever `holder` may deliver now
fn stage_holder(
    holder: &mut ResultHolder,
    streams: &mut StreamTracker,
    gates: Gates,
    partial_metadata_count: u32,
    out: &mut Vec<SessionResult>,
) {
    if holder.is_resolved() {
        return;
    }

    if holder.is_cancelled {
        holder.fail_outstanding_buffers();
    } else if holder.all_buffers_returned()
        && holder.num_error_buffers > 0
        && holder.pending_metadata_count > 0
        && !holder.any_metadata_arrived()
    {
        debug!(
            sequence_id = holder.sequence_id,
            "All buffers returned with errors and no metadata; failing metadata"
        );
        holder.metadata_error = true;
    }

    let sequence_id = holder.sequence_id;
    let frame_number = holder.frame_number;
    let mut capture = CaptureResult::new(frame_number, Some(sequence_id), holder.pipeline_index);

    if !holder.shutter_sent {
        if !gates.shutter {
            return;
        }
        if holder.is_cancelled && !holder.metadata_delivered {
            if !gates.metadata {
                return;
            }
            out.push(SessionResult::Notify(NotifyMessage::Error {
                frame_number,
                sequence_id: Some(sequence_id),
                kind: ErrorKind::Request,
                stream: None,
            }));
            holder.request_error_sent = true;
            holder.shutter_sent = true;
            holder.metadata_delivered = true;
            holder.pending_metadata_count = 0;
            capture.input_buffers = holder.take_input_buffers();
        } else if holder.has_pending_output() {
            let timestamp = holder
                .shutter_timestamp
                .or_else(|| {
                    holder.metadata[METADATA_SLOT_MAIN]
                        .as_ref()
                        .and_then(|m| m.get_int(tags::SENSOR_TIMESTAMP))
                        .map(|ts| ts.max(0) as u64)
                })
                .unwrap_or(0);
            out.push(SessionResult::Notify(NotifyMessage::Shutter {
                frame_number,
                sequence_id,
                timestamp,
            }));
            holder.shutter_sent = true;
        } else {
            return;
        }
    }

    if holder.pending_metadata_count > 0 && gates.metadata {
        if holder.is_cancelled || holder.metadata_error {
            out.push(SessionResult::Notify(NotifyMessage::Error {
                frame_number,
                sequence_id: Some(sequence_id),
                kind: ErrorKind::Result,
                stream: None,
            }));
            holder.pending_metadata_count = 0;
            holder.metadata_delivered = true;
            capture.input_buffers = holder.take_input_buffers();
        } else {
            if let Some(early) = holder.metadata[METADATA_SLOT_EARLY].take() {
                let mut early_capture =
                    CaptureResult::new(frame_number, Some(sequence_id), holder.pipeline_index);
                early_capture.metadata = Some(early);
                early_capture.num_partial_metadata = 1;
                out.push(SessionResult::Capture(early_capture));
                holder.pending_metadata_count -= 1;
                holder.early_metadata_sent = true;
                holder.metadata_delivered = true;
            }
            if let Some(main) = holder.metadata[METADATA_SLOT_MAIN].take() {
                holder.output_metadata.merge_from(&main);
                capture.metadata = Some(holder.output_metadata.clone());
                capture.num_partial_metadata = partial_metadata_count + 1;
                holder.pending_metadata_count = 0;
                holder.metadata_delivered = true;
                capture.input_buffers = holder.take_input_buffers();
            }
        }
    }

    for slot in holder.buffers.iter_mut() {
        let Some(stream) = slot.stream else {
            continue;
        };
        if slot.returned.is_none() || !streams.is_next(stream, sequence_id) {
            continue;
        }
        let Some(buffer) = slot.returned.take() else {
            continue;
        };
        if slot.error && !holder.request_error_sent {
            out.push(SessionResult::Notify(NotifyMessage::Error {
                frame_number,
                sequence_id: Some(sequence_id),
                kind: ErrorKind::Buffer,
                stream: Some(stream),
            }));
        }
        capture.output_buffers.push(buffer);
        slot.stream = None;
        streams.advance(stream, sequence_id);
    }

    if !capture.is_empty() {
        out.push(SessionResult::Capture(capture));
    }

    if holder.is_resolved() {
        trace!(sequence_id, pipeline = holder.pipeline_index, "Holder resolved");
    }
}
