//! Core session - construction, lifecycle and the worker job
//!
//! **Responsibilities:**
//! - Session and SessionInner definitions
//! - Public API surface (delegates to the concern-specific impl blocks)
//! - Stream on/off, device error, destroy
//! - Posting and running the serialized worker job
//!
//! Lock order (outermost first): flush serial, request, result (worker),
//! result list. The list lock is always innermost; admission and metabuffer
//! locks are never held across any of the others.

use super::flush::FlushInfo;
use super::notify::ResultsData;
use crate::config::SessionConfig;
use crate::context::AppContext;
use crate::error::{Error, Result};
use crate::pipeline::{Pipeline, PipelineHandle, StreamOffMode};
use crate::session::admission::{AdmissionController, AdmissionSnapshot};
use crate::session::metabuffer::PendingMetaBufferDoneQueue;
use crate::session::request_queue::{CaptureRequest, RequestQueue};
use crate::session::result_holder::InjectedResult;
use crate::session::result_list::ResultHolderList;
use crate::session::state::StateMachine;
use crate::session::timing::{RequestTiming, RequestTimingLog};
use crate::sink::ResultSink;
use crate::types::{RequestId, SequenceId, SessionRequest, MAX_PIPELINES_PER_SESSION};
use camrt_common::{SessionEvent, SessionState};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Sequencing and batching state, guarded by the request lock
pub(super) struct RequestState {
    pub(super) next_sequence_id: SequenceId,
    /// Frames accumulated into the current batch, per pipeline
    pub(super) batched_frame_index: Vec<u32>,
    /// Current batch (request) id, per pipeline
    pub(super) request_batch_id: Vec<RequestId>,
    /// Batch being accumulated, enqueued once complete
    pub(super) staging: Option<CaptureRequest>,
    pub(super) batching_on: bool,
    pub(super) next_sync_id: u64,
}

impl RequestState {
    fn new(num_pipelines: usize) -> Self {
        Self {
            next_sequence_id: 0,
            batched_frame_index: vec![0; num_pipelines],
            request_batch_id: vec![0; num_pipelines],
            staging: None,
            batching_on: false,
            next_sync_id: 1,
        }
    }

    /// Frames staged but not yet forming a complete batch
    pub(super) fn reset_batch(&mut self) -> Option<CaptureRequest> {
        self.batched_frame_index.iter_mut().for_each(|i| *i = 0);
        self.staging.take()
    }
}

/// Flush bookkeeping, guarded by the flush lock
#[derive(Default)]
pub(super) struct FlushState {
    pub(super) in_progress: bool,
    pub(super) session_scope: bool,
    pub(super) targets: Vec<usize>,
    /// Requests turned away while the flush ran, answered with errors afterwards
    pub(super) rejected: Vec<SessionRequest>,
    /// Bumped each time a flush completes
    pub(super) generation: u64,
}

pub(crate) struct SessionInner {
    pub(super) id: Uuid,
    pub(super) name: String,
    pub(super) context: Arc<AppContext>,
    pub(super) config: SessionConfig,
    pub(super) pipelines: Vec<PipelineHandle>,
    pub(super) sink: Arc<dyn ResultSink>,
    pub(super) state: StateMachine,
    pub(super) admission: AdmissionController,

    /// Request lock
    pub(super) requests: Mutex<RequestState>,
    pub(super) request_queue: RequestQueue,

    /// Result list lock (innermost)
    pub(super) results: Mutex<ResultHolderList>,

    /// Count of completed holders; waiters for drain use `completion_cv`
    pub(super) completion: Mutex<u64>,
    pub(super) completion_cv: Condvar,

    /// Serializes dispatch and result processing
    pub(super) result_lock: Mutex<()>,
    pub(super) check_results: AtomicBool,
    pub(super) rerun: AtomicBool,
    pub(super) job_scheduled: AtomicBool,
    pub(super) accepting_jobs: AtomicBool,
    pub(super) device_error_notify: AtomicBool,

    pub(super) flush_serial: Mutex<()>,
    pub(super) flush: Mutex<FlushState>,
    pub(super) flush_done: Condvar,
    pub(super) recovery_pending: AtomicBool,

    pub(super) metabuffers: Mutex<PendingMetaBufferDoneQueue>,
    pub(super) timing: Mutex<RequestTimingLog>,

    pub(super) dump_lock: Mutex<()>,
    pub(super) dump_complete: AtomicBool,
    pub(super) last_shutter_sequence_id: AtomicI64,
    pub(super) last_sof_timestamp: AtomicU64,

    self_ref: Weak<SessionInner>,
}

/// Client-facing session
///
/// Dropping a session destroys it: outstanding requests are returned as
/// errors through the sink.
pub struct Session {
    inner: Arc<SessionInner>,
}

/// Weak handle given to pipelines for reporting results
#[derive(Clone)]
pub struct SessionHandle {
    inner: Weak<SessionInner>,
}

impl SessionHandle {
    fn upgrade(&self) -> Result<Arc<SessionInner>> {
        self.inner
            .upgrade()
            .ok_or_else(|| Error::InvalidState("session no longer exists".to_string()))
    }

    /// Deliver a pipeline callback
    pub fn notify_result(&self, data: ResultsData) -> Result<()> {
        self.upgrade()?.notify_result(data)
    }

    pub fn inject_result(
        &self,
        sequence_id: SequenceId,
        pipeline_index: usize,
        result: InjectedResult,
    ) -> Result<()> {
        self.upgrade()?
            .inject_result(sequence_id, pipeline_index, result)
    }

    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl Session {
    /// Create a session using the context's session configuration
    pub fn new(
        context: Arc<AppContext>,
        pipelines: Vec<Arc<dyn Pipeline>>,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Self> {
        let config = context.config().session.clone();
        Self::with_config(context, config, pipelines, sink)
    }

    pub fn with_config(
        context: Arc<AppContext>,
        config: SessionConfig,
        pipelines: Vec<Arc<dyn Pipeline>>,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Self> {
        config.validate()?;
        if pipelines.is_empty() || pipelines.len() > MAX_PIPELINES_PER_SESSION {
            return Err(Error::InvalidArg(format!(
                "session needs 1..={} pipelines (got {})",
                MAX_PIPELINES_PER_SESSION,
                pipelines.len()
            )));
        }

        let num_pipelines = pipelines.len();
        let max_queue_depth = config.max_queue_depth();
        let max_live = config.max_live_pending(false);
        let name = pipelines
            .iter()
            .map(|p| p.name())
            .collect::<Vec<_>>()
            .join("+");

        let inner = Arc::new_cyclic(|weak| SessionInner {
            id: Uuid::new_v4(),
            name,
            context: Arc::clone(&context),
            admission: AdmissionController::new(
                max_live,
                config.admission_timeout(),
                Duration::from_millis(config.admission_cold_start_ms_per_request),
                config.wait_poll_interval(),
            ),
            pipelines: pipelines
                .into_iter()
                .enumerate()
                .map(|(index, pipeline)| PipelineHandle::new(index, pipeline))
                .collect(),
            sink,
            state: StateMachine::new(),
            requests: Mutex::new(RequestState::new(num_pipelines)),
            request_queue: RequestQueue::new(max_live as usize),
            results: Mutex::new(ResultHolderList::new(max_queue_depth)),
            completion: Mutex::new(0),
            completion_cv: Condvar::new(),
            result_lock: Mutex::new(()),
            check_results: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            job_scheduled: AtomicBool::new(false),
            accepting_jobs: AtomicBool::new(true),
            device_error_notify: AtomicBool::new(false),
            flush_serial: Mutex::new(()),
            flush: Mutex::new(FlushState::default()),
            flush_done: Condvar::new(),
            recovery_pending: AtomicBool::new(false),
            metabuffers: Mutex::new(PendingMetaBufferDoneQueue::new(
                max_queue_depth,
                num_pipelines,
                config.metabuffer_release_delay,
            )),
            timing: Mutex::new(RequestTimingLog::default()),
            dump_lock: Mutex::new(()),
            dump_complete: AtomicBool::new(false),
            last_shutter_sequence_id: AtomicI64::new(-1),
            last_sof_timestamp: AtomicU64::new(0),
            config,
            self_ref: weak.clone(),
        });

        for handle in &inner.pipelines {
            handle.pipeline.bind_session(SessionHandle {
                inner: Arc::downgrade(&inner),
            });
        }

        info!(
            "Session {} created ({}, {} pipelines, queue depth {})",
            inner.id,
            inner.name,
            num_pipelines,
            inner.config.request_queue_depth
        );
        context.broadcast_event(SessionEvent::SessionCreated {
            session_id: inner.id,
            name: inner.name.clone(),
            num_pipelines,
            timestamp: chrono::Utc::now(),
        });

        Ok(Self { inner })
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Handle for pipelines created after the session
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.current()
    }

    /// Submit a capture request
    pub fn process_capture_request(&self, request: SessionRequest) -> Result<()> {
        self.inner.process_capture_request(request)
    }

    /// Deliver a pipeline callback
    pub fn notify_result(&self, data: ResultsData) -> Result<()> {
        self.inner.notify_result(data)
    }

    pub fn inject_result(
        &self,
        sequence_id: SequenceId,
        pipeline_index: usize,
        result: InjectedResult,
    ) -> Result<()> {
        self.inner.inject_result(sequence_id, pipeline_index, result)
    }

    pub fn flush(&self, info: FlushInfo) -> Result<()> {
        self.inner.flush(info)
    }

    /// Flush out of the recovering state
    pub fn recover(&self) -> Result<()> {
        self.inner.recover()
    }

    pub fn trigger_recovery(&self, reason: &str) {
        self.inner.trigger_recovery(reason)
    }

    pub fn stream_on(&self) -> Result<()> {
        self.inner.stream_on()
    }

    pub fn stream_off(&self, mode: StreamOffMode) -> Result<()> {
        self.inner.stream_off(mode)
    }

    pub fn set_device_in_error(&self, reason: &str) {
        self.inner.set_device_in_error(reason)
    }

    pub fn get_device_in_error(&self) -> bool {
        self.inner.state.is_device_error()
    }

    /// Render (and log) the full session state
    pub fn dump_state(&self) -> String {
        self.inner.dump_state()
    }

    pub fn live_pending_requests(&self) -> u32 {
        self.inner.admission.live_pending()
    }

    pub fn admission_snapshot(&self) -> AdmissionSnapshot {
        self.inner.admission.snapshot()
    }

    /// Batched requests waiting for dispatch
    pub fn request_queue_len(&self) -> usize {
        self.inner.request_queue.len()
    }

    /// Sequence ids whose results are still outstanding
    pub fn pending_results(&self) -> usize {
        self.inner.results.lock().len()
    }

    pub fn pipeline_live_pending(&self, pipeline_index: usize) -> Option<u32> {
        self.inner
            .pipelines
            .get(pipeline_index)
            .map(PipelineHandle::get_live_pending_request)
    }

    pub fn last_completed_request_id(&self, pipeline_index: usize) -> Option<RequestId> {
        self.inner
            .pipelines
            .get(pipeline_index)
            .map(PipelineHandle::last_completed_request_id)
    }

    pub fn recent_request_timings(&self) -> Vec<RequestTiming> {
        self.inner.timing.lock().recent()
    }

    /// Wait until every accepted request has been fully delivered
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        self.inner.wait_for_idle(timeout)
    }

    /// Tear the session down, returning all outstanding work as errors
    pub fn destroy(&self) -> Result<()> {
        self.inner.destroy()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.inner.state.current() != SessionState::Destroying {
            if let Err(e) = self.inner.destroy() {
                warn!("Session {} destroy on drop failed: {}", self.inner.id, e);
            }
        }
    }
}

impl SessionInner {
    pub(super) fn emit_state_change(&self, from: SessionState, to: SessionState) {
        info!("Session {} state {} -> {}", self.id, from, to);
        self.context.broadcast_event(SessionEvent::StateChanged {
            session_id: self.id,
            from,
            to,
            timestamp: chrono::Utc::now(),
        });
    }

    /// Wake every thread blocked on session progress
    pub(super) fn wake_all_waiters(&self) {
        self.admission.force_wake();
        {
            let _flush = self.flush.lock();
            self.flush_done.notify_all();
        }
        let _completion = self.completion.lock();
        self.completion_cv.notify_all();
    }

    pub(super) fn stream_on(&self) -> Result<()> {
        if self.state.is_closed() {
            return Err(Error::InvalidState(format!(
                "cannot stream on in state {}",
                self.state.current()
            )));
        }
        for handle in &self.pipelines {
            handle.pipeline.stream_on()?;
            debug!(pipeline = handle.index, "Pipeline streamed on");
        }
        Ok(())
    }

    pub(super) fn stream_off(&self, mode: StreamOffMode) -> Result<()> {
        let mut first_error = None;
        for handle in &self.pipelines {
            if let Err(e) = handle.pipeline.stream_off(mode) {
                warn!(pipeline = handle.index, "Stream off failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Enter the sticky device error state
    pub(super) fn set_device_in_error(&self, reason: &str) {
        let Ok(from) = self.state.transition_any(SessionState::DeviceError) else {
            return;
        };

        error!("Session {} device error: {}", self.id, reason);
        self.emit_state_change(from, SessionState::DeviceError);
        self.context.broadcast_event(SessionEvent::DeviceError {
            session_id: self.id,
            reason: reason.to_string(),
            timestamp: chrono::Utc::now(),
        });

        self.device_error_notify.store(true, Ordering::Release);
        self.wake_all_waiters();
        self.dump_once(reason);
        self.post_job();
    }

    pub(super) fn destroy(&self) -> Result<()> {
        let from = match self.state.transition_any(SessionState::Destroying) {
            Ok(from) => from,
            Err(_) => return Ok(()),
        };
        self.emit_state_change(from, SessionState::Destroying);
        self.wake_all_waiters();

        if let Err(e) = self.stream_off(StreamOffMode::Immediate) {
            debug!("Stream off during destroy: {}", e);
        }

        // Wait out a running flush; it aborts early once the state is closed
        let _serial = self.flush_serial.lock();

        let cancelled = {
            let mut requests = self.requests.lock();
            let _worker = self.result_lock.lock();

            let mut cancelled = 0;
            for request in self.request_queue.drain() {
                cancelled += self.insert_cancelled_holders(&request);
            }
            if let Some(partial) = requests.reset_batch() {
                cancelled += self.insert_cancelled_holders(&partial);
            }
            {
                let mut list = self.results.lock();
                let (holders, _) = list.split_mut();
                for holder in holders {
                    if !holder.is_resolved() {
                        holder.cancel();
                        cancelled += 1;
                    }
                }
            }
            self.process_results();

            let leftover = self.results.lock().drain();
            if !leftover.is_empty() {
                warn!("{} result holders could not be drained at destroy", leftover.len());
                for holder in &leftover {
                    self.complete_holder(holder);
                }
            }
            cancelled
        };

        self.answer_rejected_requests();

        let all: Vec<usize> = (0..self.pipelines.len()).collect();
        let released = self.metabuffers.lock().release_all(&all);
        self.invalidate_metabuffers(&released);
        self.timing.lock().clear_in_flight();

        self.accepting_jobs.store(false, Ordering::Release);

        info!(
            "Session {} destroyed ({} outstanding requests cancelled)",
            self.id, cancelled
        );
        self.context.broadcast_event(SessionEvent::SessionDestroyed {
            session_id: self.id,
            cancelled_requests: cancelled,
            timestamp: chrono::Utc::now(),
        });
        Ok(())
    }

    pub(super) fn wait_for_idle(&self, timeout: Duration) -> bool {
        let mut completion = self.completion.lock();
        crate::sync::wait_until_polling(
            &mut completion,
            &self.completion_cv,
            timeout,
            self.config.wait_poll_interval(),
            |_| {
                self.request_queue.is_empty()
                    && self.results.lock().is_empty()
                    && self.admission.live_pending() == 0
            },
        )
    }

    /// Schedule the worker job unless one is already queued
    pub(super) fn post_job(&self) {
        if !self.accepting_jobs.load(Ordering::Acquire) {
            return;
        }
        if self.job_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(inner) = self.self_ref.upgrade() else {
            self.job_scheduled.store(false, Ordering::Release);
            return;
        };

        if let Err(e) = self.context.jobs().post(Box::new(move || inner.run_job())) {
            self.job_scheduled.store(false, Ordering::Release);
            warn!("Session {} could not post worker job: {}", self.id, e);
        }
    }

    /// Worker job body
    ///
    /// Only one thread processes at a time. A job that loses the race for
    /// the result lock leaves `rerun` set; the lock holder sees it after
    /// releasing and runs another pass on its behalf.
    fn run_job(&self) {
        self.job_scheduled.store(false, Ordering::Release);
        self.rerun.store(true, Ordering::SeqCst);

        loop {
            let Some(guard) = self.result_lock.try_lock() else {
                return;
            };
            while self.rerun.swap(false, Ordering::SeqCst) {
                self.process_request();
                if self.check_results.swap(false, Ordering::AcqRel)
                    || self.device_error_notify.load(Ordering::Acquire)
                {
                    self.process_results();
                }
            }
            drop(guard);

            if !self.rerun.load(Ordering::SeqCst) {
                break;
            }
        }
    }

    /// Ask for another worker pass after holding the result lock outside
    /// the worker job
    pub(super) fn schedule_rerun(&self) {
        self.rerun.store(true, Ordering::SeqCst);
        self.check_results.store(true, Ordering::Release);
        self.post_job();
    }
}
