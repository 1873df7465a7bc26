//! Request submission path
//!
//! **Responsibilities:**
//! - State gate and request validation
//! - Acquire-fence waits and admission
//! - Holding requests back while their pipelines flush
//! - Batch mode switches
//! - Sequencing, exposure estimation, batching and enqueue

use super::core::{RequestState, SessionInner};
use crate::error::{Error, Result};
use crate::metadata::{tags, EXPOSURE_PRIORITY_EXPOSURE_TIME};
use crate::session::request_queue::{BatchedFrame, CaptureRequest, PipelineCaptureRequest};
use crate::sync::wait_until_polling;
use crate::types::{PipelineRequest, SequenceId, SessionRequest, MAX_INPUT_BUFFERS, MAX_OUTPUT_BUFFERS};
use camrt_common::time::nanos_to_millis_ceil;
use camrt_common::{SessionEvent, SessionState};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

impl SessionInner {
    pub(super) fn process_capture_request(&self, request: SessionRequest) -> Result<()> {
        self.check_submission_state()?;
        self.validate_request(&request)?;
        self.wait_for_acquire_fences(&request)?;
        self.admit()?;

        let mut requests = self.requests.lock();

        // State may have moved while waiting for admission
        if let Err(e) = self.check_submission_state() {
            drop(requests);
            self.release_admission();
            return Err(e);
        }

        if request
            .requests
            .iter()
            .any(|r| self.pipelines[r.pipeline_index].is_flushing())
        {
            self.release_admission();
            let generation = {
                let mut flush = self.flush.lock();
                debug!(
                    frame_number = request.requests[0].frame_number,
                    "Request held back by flush"
                );
                flush.rejected.push(request);
                flush.generation
            };
            drop(requests);
            self.wait_for_flush_completion(generation);
            return Ok(());
        }

        let batching = request.is_batching();
        if batching != requests.batching_on {
            if let Err(e) = self.switch_batch_mode(&mut requests, batching) {
                drop(requests);
                self.release_admission();
                return Err(e);
            }
        }

        let sequence_id = match self.sequence_request(&mut requests, request) {
            Ok(sequence_id) => sequence_id,
            Err(e) => {
                drop(requests);
                self.release_admission();
                return Err(e);
            }
        };
        drop(requests);

        trace!(sequence_id, "Request accepted");
        self.post_job();
        Ok(())
    }

    fn check_submission_state(&self) -> Result<()> {
        match self.state.current() {
            SessionState::Normal | SessionState::Flushing => Ok(()),
            SessionState::Recovering => Err(Error::CancelledRequest(
                "session is recovering".to_string(),
            )),
            state => Err(Error::InvalidState(format!(
                "session cannot accept requests in state {}",
                state
            ))),
        }
    }

    fn validate_request(&self, request: &SessionRequest) -> Result<()> {
        if request.requests.is_empty() {
            return Err(Error::InvalidArg("request has no pipeline requests".to_string()));
        }

        let mut pipelines = HashSet::new();
        let mut streams = HashSet::new();
        let batching = request.requests[0].batching;

        for r in &request.requests {
            if r.pipeline_index >= self.pipelines.len() {
                return Err(Error::InvalidArg(format!(
                    "unknown pipeline index {}",
                    r.pipeline_index
                )));
            }
            if !pipelines.insert(r.pipeline_index) {
                return Err(Error::InvalidArg(format!(
                    "pipeline {} appears twice in one request",
                    r.pipeline_index
                )));
            }
            if r.batching != batching {
                return Err(Error::InvalidArg(
                    "sub-requests disagree on batching".to_string(),
                ));
            }

            let (Some(input), Some(output)) = (&r.input_metadata, &r.output_metadata) else {
                return Err(Error::InvalidPointer(format!(
                    "frame {} is missing input or output metadata",
                    r.frame_number
                )));
            };
            if Arc::ptr_eq(input, output) {
                return Err(Error::InvalidArg(format!(
                    "frame {} uses the same metadata for input and output",
                    r.frame_number
                )));
            }
            if !input.is_valid() || !output.is_valid() {
                return Err(Error::InvalidArg(format!(
                    "frame {} carries invalidated metadata",
                    r.frame_number
                )));
            }

            if r.output_buffers.is_empty() || r.output_buffers.len() > MAX_OUTPUT_BUFFERS {
                return Err(Error::InvalidArg(format!(
                    "frame {} has {} output buffers (1..={} allowed)",
                    r.frame_number,
                    r.output_buffers.len(),
                    MAX_OUTPUT_BUFFERS
                )));
            }
            if r.input_buffers.len() > MAX_INPUT_BUFFERS {
                return Err(Error::InvalidArg(format!(
                    "frame {} has {} input buffers (max {})",
                    r.frame_number,
                    r.input_buffers.len(),
                    MAX_INPUT_BUFFERS
                )));
            }
            for buffer in &r.output_buffers {
                if !streams.insert(buffer.stream) {
                    return Err(Error::InvalidArg(format!(
                        "{} requested twice for frame {}",
                        buffer.stream, r.frame_number
                    )));
                }
            }
        }
        Ok(())
    }

    fn wait_for_acquire_fences(&self, request: &SessionRequest) -> Result<()> {
        let timeout = self.config.fence_wait_timeout();
        for r in &request.requests {
            for buffer in &r.input_buffers {
                if let Some(fence) = &buffer.acquire_fence {
                    fence.wait(timeout).map_err(|e| {
                        warn!(
                            frame_number = r.frame_number,
                            "Input acquire fence for {} not signaled: {}",
                            buffer.stream,
                            e
                        );
                        e
                    })?;
                }
            }
        }
        Ok(())
    }

    fn admission_gate(&self) -> Option<Error> {
        match self.state.current() {
            SessionState::Normal | SessionState::Flushing => None,
            SessionState::Recovering => Some(Error::CancelledRequest(
                "session entered recovery".to_string(),
            )),
            state => Some(Error::InvalidState(format!(
                "session entered state {}",
                state
            ))),
        }
    }

    fn admit(&self) -> Result<()> {
        let start = Instant::now();
        match self.admission.acquire(|| self.admission_gate()) {
            Ok(()) => Ok(()),
            Err(Error::Timeout(msg)) => {
                self.handle_admission_timeout(start.elapsed());
                Err(Error::Timeout(msg))
            }
            Err(e) => Err(e),
        }
    }

    fn handle_admission_timeout(&self, waited: Duration) {
        let live_pending = self.admission.live_pending();
        let sequence_id = self.requests.lock().next_sequence_id;

        warn!(
            "Session {} admission timed out after {}ms (live pending {}, next sequence {})",
            self.id,
            waited.as_millis(),
            live_pending,
            sequence_id
        );
        self.context.broadcast_event(SessionEvent::AdmissionTimeout {
            session_id: self.id,
            sequence_id,
            live_pending,
            waited_ms: waited.as_millis() as u64,
            timestamp: chrono::Utc::now(),
        });

        if self.config.abort_on_admission_timeout {
            self.dump_state();
            error!("Aborting on admission timeout");
            std::process::abort();
        }

        if self.config.enable_recovery {
            self.trigger_recovery("admission timeout");
        } else {
            self.dump_once("admission timeout");
        }
    }

    pub(super) fn release_admission(&self) {
        if let Err(e) = self.admission.release() {
            warn!("Session {}: {}", self.id, e);
        }
    }

    fn wait_for_flush_completion(&self, generation: u64) {
        let budget = self.config.flush_max_wait() + self.config.flush_fallback_wait() * 2;
        let mut flush = self.flush.lock();
        let completed = wait_until_polling(
            &mut flush,
            &self.flush_done,
            budget,
            self.config.wait_poll_interval(),
            |f| f.generation != generation || self.state.is_closed(),
        );
        if !completed {
            warn!("Session {}: flush still running after {}ms", self.id, budget.as_millis());
        }
    }

    /// Drain in-flight work and change the live pending bound
    fn switch_batch_mode(&self, requests: &mut RequestState, batching: bool) -> Result<()> {
        if requests.staging.is_some() {
            return Err(Error::InvalidState(
                "cannot switch batch mode with a partial batch pending".to_string(),
            ));
        }

        let wait = self.config.batch_switch_wait();
        if !self.request_queue.wait_until_empty(wait) || !self.wait_for_results_drained(wait) {
            return Err(Error::Timeout(format!(
                "in-flight requests did not drain within {}ms for batch mode switch",
                wait.as_millis()
            )));
        }

        let max_live = self.config.max_live_pending(batching);
        self.request_queue.set_depth(max_live as usize)?;
        self.admission.set_max_live_pending(max_live);
        requests.batching_on = batching;

        info!(
            "Session {} batch mode {} (max live pending {})",
            self.id,
            if batching { "on" } else { "off" },
            max_live
        );
        Ok(())
    }

    fn wait_for_results_drained(&self, timeout: Duration) -> bool {
        let mut completion = self.completion.lock();
        wait_until_polling(
            &mut completion,
            &self.completion_cv,
            timeout,
            self.config.wait_poll_interval(),
            |_| self.results.lock().is_empty(),
        )
    }

    /// Expected exposure in milliseconds
    ///
    /// Exposure-priority requests use the priority value; otherwise the
    /// longer of sensor exposure and frame duration.
    pub(super) fn expected_exposure_time_ms(request: &PipelineRequest) -> u32 {
        let Some(metadata) = request.input_metadata.as_ref() else {
            return 0;
        };

        if metadata.get_int(tags::EXPOSURE_PRIORITY_MODE) == Some(EXPOSURE_PRIORITY_EXPOSURE_TIME) {
            if let Some(value) = metadata.get_int(tags::EXPOSURE_PRIORITY_VALUE) {
                return nanos_to_millis_ceil(value).min(u32::MAX as u64) as u32;
            }
        }

        let exposure = metadata.get_int(tags::SENSOR_EXPOSURE_TIME).unwrap_or(0);
        let frame_duration = metadata.get_int(tags::SENSOR_FRAME_DURATION).unwrap_or(0);
        nanos_to_millis_ceil(exposure.max(frame_duration)).min(u32::MAX as u64) as u32
    }

    /// Assign a sequence id and stage the request into the current batch
    fn sequence_request(
        &self,
        requests: &mut RequestState,
        request: SessionRequest,
    ) -> Result<SequenceId> {
        let sequence_id = requests.next_sequence_id;
        let frame_number = request.requests[0].frame_number;
        let expected_exposure_ms = request
            .requests
            .iter()
            .map(Self::expected_exposure_time_ms)
            .max()
            .unwrap_or(0);

        let mut frames = Vec::with_capacity(request.requests.len());
        for r in request.requests {
            let (Some(input_metadata), Some(output_metadata)) = (r.input_metadata, r.output_metadata)
            else {
                return Err(Error::InvalidPointer(format!(
                    "frame {} is missing input or output metadata",
                    r.frame_number
                )));
            };
            frames.push((
                r.pipeline_index,
                BatchedFrame {
                    sequence_id,
                    frame_number: r.frame_number,
                    input_buffers: r.input_buffers,
                    output_buffers: r.output_buffers,
                    input_metadata,
                    output_metadata,
                    expected_exposure_time_ms: expected_exposure_ms,
                },
            ));
        }

        requests.next_sequence_id = sequence_id.wrapping_add(1);
        trace!(sequence_id, frame_number, "Sequence id assigned");

        if expected_exposure_ms as u64 > self.config.long_exposure_threshold_ms {
            debug!(sequence_id, expected_exposure_ms, "Long exposure registered");
            self.admission.add_long_exposure(expected_exposure_ms as u64);
        }

        {
            let mut list = self.results.lock();
            let streams = list.streams_mut();
            for (_, frame) in &frames {
                for buffer in &frame.output_buffers {
                    streams.register(buffer.stream, sequence_id);
                }
            }
        }

        let batch_size = if requests.batching_on {
            self.config.num_batched_frames
        } else {
            1
        };

        for (pipeline_index, frame) in frames {
            self.pipelines[pipeline_index].increment_live_pending_request();

            if requests.batched_frame_index[pipeline_index] == 0 {
                requests.request_batch_id[pipeline_index] += 1;
            }
            let request_id = requests.request_batch_id[pipeline_index];
            requests.batched_frame_index[pipeline_index] += 1;

            let staging = requests.staging.get_or_insert_with(|| CaptureRequest {
                sync_id: 0,
                pipeline_requests: Vec::new(),
            });
            match staging
                .pipeline_requests
                .iter_mut()
                .find(|pr| pr.pipeline_index == pipeline_index)
            {
                Some(pr) => pr.frames.push(frame),
                None => staging.pipeline_requests.push(PipelineCaptureRequest {
                    pipeline_index,
                    request_id,
                    frames: vec![frame],
                }),
            }
        }

        let complete = requests.staging.as_ref().is_some_and(|staging| {
            staging
                .pipeline_requests
                .iter()
                .all(|pr| requests.batched_frame_index[pr.pipeline_index] >= batch_size)
        });

        if complete {
            if let Some(mut batch) = requests.reset_batch() {
                batch.sync_id = requests.next_sync_id;
                requests.next_sync_id += 1;

                if let Err(e) = self.request_queue.enqueue(batch.clone()) {
                    error!("Session {}: {}; failing request", self.id, e);
                    let _worker = self.result_lock.lock();
                    self.insert_cancelled_holders(&batch);
                    drop(_worker);
                    self.schedule_rerun();
                }
            }
        }

        Ok(sequence_id)
    }
}
