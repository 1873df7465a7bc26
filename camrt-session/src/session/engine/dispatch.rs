//! Request dispatch worker
//!
//! Runs on the worker job with the result lock held. Moves batched
//! requests from the queue into the result list and hands them to their
//! pipelines.

use super::core::SessionInner;
use crate::error::{Error, Result};
use crate::fence::Fence;
use crate::session::request_queue::CaptureRequest;
use crate::session::result_holder::{HolderSpec, InjectedResult, ResultHolder, SessionResultHolder};
use crate::types::{
    CaptureResult, ErrorKind, NotifyMessage, PipelineProcessRequestData, ProcessFrame, RequestId,
    SequenceId, SessionResult,
};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use tracing::{debug, error, trace, warn};

impl SessionInner {
    /// Dispatch every queued request
    pub(super) fn process_request(&self) {
        while let Some(request) = self.request_queue.try_dequeue() {
            if self.state.is_closed() {
                self.insert_cancelled_holders(&request);
                self.check_results.store(true, Ordering::Release);
                continue;
            }

            if let Err(e) = request.num_batched_frames() {
                warn!("Session {}: {}; cancelling request", self.id, e);
                self.insert_cancelled_holders(&request);
                self.check_results.store(true, Ordering::Release);
                continue;
            }

            if !self.dispatch_one(request) {
                break;
            }
        }
    }

    /// Returns false when the result list is full and dispatch must stop
    fn dispatch_one(&self, mut request: CaptureRequest) -> bool {
        let holders = self.build_session_holders(&request, false);
        match self.insert_holders(holders) {
            Ok(()) => {}
            Err(Error::NoMemory(_)) => return false,
            Err(_) => return true,
        }

        for pipeline_request in request.pipeline_requests.iter_mut() {
            for frame in pipeline_request.frames.iter_mut() {
                for buffer in frame.input_buffers.iter_mut() {
                    if buffer.acquire_fence.is_none() {
                        buffer.acquire_fence = Some(Fence::internal());
                    }
                }
            }
        }

        {
            let mut metabuffers = self.metabuffers.lock();
            for pr in &request.pipeline_requests {
                for frame in &pr.frames {
                    metabuffers.register(frame.sequence_id, pr.pipeline_index, pr.request_id);
                }
            }
        }
        {
            let mut timing = self.timing.lock();
            let request_ids: Vec<(usize, RequestId)> = request
                .pipeline_requests
                .iter()
                .map(|pr| (pr.pipeline_index, pr.request_id))
                .collect();
            for sequence_id in request.sequence_ids() {
                timing.start(sequence_id, request_ids.clone());
            }
        }

        let is_sync_mode = request.is_sync_mode();
        let sync_id = request.sync_id;

        for pr in request.pipeline_requests {
            let handle = &self.pipelines[pr.pipeline_index];
            let sequence_ids: Vec<SequenceId> = pr.frames.iter().map(|f| f.sequence_id).collect();
            let expected_exposure_time_ms = pr
                .frames
                .iter()
                .map(|f| f.expected_exposure_time_ms)
                .max()
                .unwrap_or(0);

            if handle.is_flushing() {
                debug!(
                    pipeline = pr.pipeline_index,
                    request_id = pr.request_id,
                    "Pipeline flushing; request not submitted"
                );
                self.fail_pipeline_request(pr.pipeline_index, &sequence_ids);
                continue;
            }

            handle.record_request_id(pr.request_id);
            handle.pipeline.metadata_pool().update_request_id(pr.request_id);

            let data = PipelineProcessRequestData {
                request_id: pr.request_id,
                sync_id,
                frames: pr
                    .frames
                    .into_iter()
                    .enumerate()
                    .map(|(batch_index, frame)| ProcessFrame {
                        sequence_id: frame.sequence_id,
                        batch_index,
                        input_buffers: frame.input_buffers,
                        output_buffers: frame.output_buffers,
                        input_metadata: frame.input_metadata,
                        output_metadata: frame.output_metadata,
                    })
                    .collect(),
            };

            trace!(
                pipeline = pr.pipeline_index,
                request_id = pr.request_id,
                sync_id,
                "Submitting request"
            );

            let submitted = handle
                .pipeline
                .open_request(pr.request_id, sync_id, is_sync_mode, expected_exposure_time_ms)
                .and_then(|_| handle.pipeline.process_request(data));

            if let Err(e) = submitted {
                if e.is_cancelled() && handle.is_flushing() {
                    debug!(
                        pipeline = pr.pipeline_index,
                        request_id = pr.request_id,
                        "Request cancelled by flush"
                    );
                } else {
                    warn!(
                        pipeline = pr.pipeline_index,
                        request_id = pr.request_id,
                        "Pipeline rejected request: {}",
                        e
                    );
                }
                self.fail_pipeline_request(pr.pipeline_index, &sequence_ids);
            }
        }
        true
    }

    /// Resolve a pipeline's holders as request errors
    fn fail_pipeline_request(&self, pipeline_index: usize, sequence_ids: &[SequenceId]) {
        let mut list = self.results.lock();
        for &sequence_id in sequence_ids {
            if let Some(holder) = list
                .get_mut(sequence_id)
                .and_then(|h| h.holder_mut(pipeline_index))
            {
                if let Err(e) = holder.apply(InjectedResult::RequestError) {
                    warn!(sequence_id, "Could not fail holder: {}", e);
                }
            }
        }
        self.check_results.store(true, Ordering::Release);
    }

    /// One holder per sequence id of the request
    pub(super) fn build_session_holders(
        &self,
        request: &CaptureRequest,
        cancelled: bool,
    ) -> Vec<SessionResultHolder> {
        let mut by_sequence: BTreeMap<SequenceId, Vec<ResultHolder>> = BTreeMap::new();

        for pr in &request.pipeline_requests {
            for (batch_index, frame) in pr.frames.iter().enumerate() {
                let mut holder = ResultHolder::new(HolderSpec {
                    sequence_id: frame.sequence_id,
                    pipeline_index: pr.pipeline_index,
                    request_id: pr.request_id,
                    frame_number: frame.frame_number,
                    batch_index,
                    partial_metadata_count: self.config.partial_metadata_count,
                    output_buffers: frame.output_buffers.clone(),
                    input_buffers: frame.input_buffers.clone(),
                    input_metadata: frame.input_metadata.clone(),
                    output_metadata: frame.output_metadata.clone(),
                    expected_exposure_time_ms: frame.expected_exposure_time_ms,
                });
                if cancelled {
                    holder.cancel();
                }
                by_sequence.entry(frame.sequence_id).or_default().push(holder);
            }
        }

        by_sequence
            .into_iter()
            .map(|(sequence_id, holders)| {
                let exposure = holders
                    .iter()
                    .map(|h| h.expected_exposure_time_ms as u64)
                    .max()
                    .unwrap_or(0);
                let long_exposure_ms = if exposure > self.config.long_exposure_threshold_ms {
                    exposure
                } else {
                    0
                };
                SessionResultHolder::new(sequence_id, holders, long_exposure_ms)
            })
            .collect()
    }

    /// Append holders at the list tail
    ///
    /// When the list has no room, the holders already inserted for this
    /// request are cancelled and the rest are failed directly.
    fn insert_holders(&self, holders: Vec<SessionResultHolder>) -> Result<()> {
        let mut inserted: Vec<SequenceId> = Vec::new();
        let mut rejected = Vec::new();
        let mut failure = None;
        {
            let mut list = self.results.lock();
            for holder in holders {
                if failure.is_some() {
                    rejected.push(holder);
                    continue;
                }
                match list.check_insert(holder.sequence_id) {
                    Ok(()) => {
                        let sequence_id = holder.sequence_id;
                        if let Err(e) = list.push_back(holder) {
                            error!(sequence_id, "Result list insert failed: {}", e);
                            failure = Some(e);
                            continue;
                        }
                        inserted.push(sequence_id);
                    }
                    Err(e) => {
                        failure = Some(e);
                        rejected.push(holder);
                    }
                }
            }

            if failure.is_some() {
                for &sequence_id in &inserted {
                    if let Some(holder) = list.get_mut(sequence_id) {
                        holder.cancel();
                    }
                }
                for holder in &rejected {
                    list.streams_mut().remove_sequence(holder.sequence_id);
                }
            }
        }

        match failure {
            None => Ok(()),
            Some(e) => {
                error!("Session {}: {}; failing request", self.id, e);
                self.fail_uninserted(rejected);
                self.check_results.store(true, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Deliver request errors for holders that never made it into the list
    fn fail_uninserted(&self, holders: Vec<SessionResultHolder>) {
        let mut batch = Vec::new();
        for session_holder in &holders {
            for holder in &session_holder.holders {
                batch.push(SessionResult::Notify(NotifyMessage::Error {
                    frame_number: holder.frame_number,
                    sequence_id: Some(holder.sequence_id),
                    kind: ErrorKind::Request,
                    stream: None,
                }));
                let mut capture = CaptureResult::new(
                    holder.frame_number,
                    Some(holder.sequence_id),
                    holder.pipeline_index,
                );
                capture.output_buffers = holder
                    .buffers
                    .iter()
                    .map(|slot| slot.requested.clone().into_error())
                    .collect();
                capture.input_buffers = holder
                    .input_buffers
                    .iter()
                    .map(|info| info.buffer.clone())
                    .collect();
                batch.push(SessionResult::Capture(capture));
            }
        }
        if !batch.is_empty() {
            self.sink.dispatch(&batch);
        }
        for holder in &holders {
            self.complete_holder(holder);
        }
    }

    /// Turn an undispatched request into cancelled holders
    ///
    /// Must be called with the result lock held. Returns the number of
    /// sequence ids affected.
    pub(super) fn insert_cancelled_holders(&self, request: &CaptureRequest) -> usize {
        let holders = self.build_session_holders(request, true);
        let count = holders.len();
        // Failures are delivered directly by insert_holders
        let _ = self.insert_holders(holders);
        self.check_results.store(true, Ordering::Release);
        count
    }
}
