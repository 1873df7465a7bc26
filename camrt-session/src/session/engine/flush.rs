//! Flush and recovery
//!
//! A flush cancels queued work, asks the target pipelines to return
//! everything in flight, and waits until the results have drained. When a
//! pipeline does not answer in time the flush escalates: a fallback wait,
//! then a forced node flush, then cancelling the outstanding holders.

use super::core::SessionInner;
use crate::error::{Error, Result};
use crate::metadata::{tags, MetadataValue};
use crate::session::request_queue::CaptureRequest;
use crate::session::state::Rejected;
use crate::sync::wait_until_polling;
use crate::types::{CaptureResult, ErrorKind, NotifyMessage, SessionResult};
use camrt_common::{SessionEvent, SessionState};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Flush scope
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushInfo {
    pipelines: Option<Vec<usize>>,
}

impl FlushInfo {
    /// Flush every pipeline of the session
    pub fn session() -> Self {
        Self { pipelines: None }
    }

    /// Flush only the given pipelines
    pub fn pipelines(pipelines: impl IntoIterator<Item = usize>) -> Self {
        Self {
            pipelines: Some(pipelines.into_iter().collect()),
        }
    }

    pub fn is_session_scope(&self) -> bool {
        self.pipelines.is_none()
    }
}

/// How far a flush had to escalate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushTier {
    Normal,
    Fallback,
    Forced,
    Failed,
    /// Session closed while flushing
    Aborted,
}

impl FlushTier {
    fn as_str(self) -> &'static str {
        match self {
            FlushTier::Normal => "normal",
            FlushTier::Fallback => "fallback",
            FlushTier::Forced => "forced",
            FlushTier::Failed => "failed",
            FlushTier::Aborted => "aborted",
        }
    }

    fn is_success(self) -> bool {
        matches!(self, FlushTier::Normal | FlushTier::Fallback | FlushTier::Forced)
    }
}

/// Resolved flush scope
struct FlushScope {
    session: bool,
    targets: Vec<usize>,
}

impl FlushScope {
    fn covers(&self, request: &CaptureRequest) -> bool {
        self.session || self.targets.iter().any(|&p| request.targets(p))
    }
}

impl SessionInner {
    pub(super) fn flush(&self, info: FlushInfo) -> Result<()> {
        let _serial = self.flush_serial.lock();
        let start = Instant::now();
        let scope = self.flush_scope(&info)?;

        let started_from = self
            .state
            .transition(
                &[SessionState::Normal, SessionState::Recovering],
                SessionState::Flushing,
            )
            .map_err(|Rejected(state)| {
                Error::InvalidState(format!("cannot flush in state {}", state))
            })?;
        self.emit_state_change(started_from, SessionState::Flushing);

        info!(
            "Session {} flush started ({} scope, pipelines {:?})",
            self.id,
            if scope.session { "session" } else { "pipeline" },
            scope.targets
        );
        self.context.broadcast_event(SessionEvent::FlushStarted {
            session_id: self.id,
            pipelines: scope.targets.clone(),
            session_scope: scope.session,
            timestamp: chrono::Utc::now(),
        });

        self.pre_flush_operations(&scope);
        let tier = self.wait_for_flush(&scope);
        let result = self.post_flush_operations(&scope, started_from, tier);

        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            "Session {} flush finished in {}ms ({})",
            self.id,
            elapsed_ms,
            tier.as_str()
        );
        self.context.broadcast_event(SessionEvent::FlushCompleted {
            session_id: self.id,
            pipelines: scope.targets,
            success: result.is_ok(),
            tier: tier.as_str().to_string(),
            elapsed_ms,
            timestamp: chrono::Utc::now(),
        });
        result
    }

    fn flush_scope(&self, info: &FlushInfo) -> Result<FlushScope> {
        let Some(pipelines) = &info.pipelines else {
            return Ok(FlushScope {
                session: true,
                targets: (0..self.pipelines.len()).collect(),
            });
        };

        if pipelines.is_empty() {
            return Err(Error::InvalidArg("pipeline flush without pipelines".to_string()));
        }
        let mut targets = pipelines.clone();
        targets.sort_unstable();
        targets.dedup();
        if let Some(&bad) = targets.iter().find(|&&p| p >= self.pipelines.len()) {
            return Err(Error::InvalidArg(format!("unknown pipeline index {}", bad)));
        }
        Ok(FlushScope {
            session: false,
            targets,
        })
    }

    fn pre_flush_operations(&self, scope: &FlushScope) {
        {
            let mut requests = self.requests.lock();
            for &p in &scope.targets {
                let handle = &self.pipelines[p];
                handle.set_flushing(true);
                handle.save_last_valid_request_id();
                handle.pipeline.set_flush_in_progress(true);
            }
            {
                let mut flush = self.flush.lock();
                flush.in_progress = true;
                flush.session_scope = scope.session;
                flush.targets = scope.targets.clone();
            }

            // Cancelled holders may only go in front of every kept request,
            // so cancellation stops at the first request that stays queued.
            // Later targeted requests are failed per pipeline at dispatch.
            let _worker = self.result_lock.lock();
            let mut cancel: Vec<CaptureRequest> = Vec::new();
            let mut keep: Vec<CaptureRequest> = Vec::new();
            for request in self.request_queue.drain() {
                if keep.is_empty() && scope.covers(&request) {
                    cancel.push(request);
                } else {
                    keep.push(request);
                }
            }
            // A partial batch behind kept requests stays staged
            let staged_targets_flushed = keep.is_empty()
                && requests
                    .staging
                    .as_ref()
                    .is_some_and(|staging| scope.covers(staging));
            if staged_targets_flushed {
                if let Some(partial) = requests.reset_batch() {
                    cancel.push(partial);
                }
            }

            let mut cancelled = 0;
            for request in &cancel {
                cancelled += self.insert_cancelled_holders(request);
            }
            if cancelled > 0 {
                debug!("Flush cancelled {} queued requests", cancelled);
            }
            if !keep.is_empty() {
                debug!("Flush left {} queued requests for dispatch", keep.len());
            }
            self.request_queue.requeue_front(keep);
        }
        self.schedule_rerun();

        for &p in &scope.targets {
            self.disable_ae_lock(p);
            if let Err(e) = self.pipelines[p].pipeline.flush() {
                warn!(pipeline = p, "Pipeline flush failed: {}", e);
            }
        }
    }

    /// Drop any AE lock range so the pipeline can converge after the flush
    fn disable_ae_lock(&self, pipeline_index: usize) {
        let handle = &self.pipelines[pipeline_index];
        let request_id = handle.last_request_id();
        if request_id == 0 {
            return;
        }
        let pool = handle.pipeline.metadata_pool();
        let result = pool
            .set_metadata_by_tag(request_id, tags::AE_LOCK_RANGE, MetadataValue::Range(0, 0))
            .and_then(|_| pool.publish_metadata(request_id, tags::AE_LOCK_RANGE));
        if let Err(e) = result {
            debug!(pipeline = pipeline_index, request_id, "AE lock not reset: {}", e);
        }
    }

    fn flush_budget(&self, scope: &FlushScope) -> Duration {
        let response = scope
            .targets
            .iter()
            .map(|&p| self.pipelines[p].pipeline.flush_response_time())
            .max()
            .unwrap_or_default();
        let live: u32 = scope
            .targets
            .iter()
            .map(|&p| self.pipelines[p].get_live_pending_request())
            .sum();
        let padding = Duration::from_millis(self.config.flush_padding_ms_per_request * live as u64);
        (response + padding).min(self.config.flush_max_wait())
    }

    fn is_done_processing(&self, scope: &FlushScope) -> bool {
        let nodes_done = scope
            .targets
            .iter()
            .all(|&p| self.pipelines[p].pipeline.all_nodes_done());
        if !nodes_done {
            return false;
        }

        if scope.session {
            self.admission.live_pending() == 0 && self.results.lock().is_empty()
        } else {
            scope.targets.iter().all(|&p| {
                let handle = &self.pipelines[p];
                handle.get_live_pending_request() == 0 && handle.flush_results_available()
            })
        }
    }

    fn wait_till_done(&self, scope: &FlushScope, timeout: Duration) -> bool {
        let mut completion = self.completion.lock();
        wait_until_polling(
            &mut completion,
            &self.completion_cv,
            timeout,
            self.config.wait_poll_interval(),
            |_| self.state.is_closed() || self.is_done_processing(scope),
        )
    }

    fn wait_for_flush(&self, scope: &FlushScope) -> FlushTier {
        let budget = self.flush_budget(scope);
        debug!(budget_ms = budget.as_millis() as u64, "Waiting for flush");

        if self.wait_till_done(scope, budget) {
            return self.tier_unless_closed(FlushTier::Normal);
        }

        if self.config.abort_on_flush_timeout {
            self.dump_state();
            error!("Aborting on flush timeout");
            std::process::abort();
        }

        warn!(
            "Session {} flush not done after {}ms, entering fallback",
            self.id,
            budget.as_millis()
        );
        self.dump_once("flush timeout");

        if self.wait_till_done(scope, self.config.flush_fallback_wait()) {
            return self.tier_unless_closed(FlushTier::Fallback);
        }

        warn!("Session {} forcing node flush", self.id);
        for &p in &scope.targets {
            self.pipelines[p].pipeline.flush_pending_nodes();
        }
        if self.wait_till_done(scope, self.config.flush_fallback_wait()) {
            return self.tier_unless_closed(FlushTier::Forced);
        }

        error!(
            "Session {} flush failed; cancelling outstanding results",
            self.id
        );
        {
            let _worker = self.result_lock.lock();
            let cancelled = {
                let mut list = self.results.lock();
                let (holders, _) = list.split_mut();
                let mut cancelled = 0;
                for holder in holders {
                    if scope.session {
                        if !holder.is_resolved() {
                            holder.cancel();
                            cancelled += 1;
                        }
                    } else {
                        cancelled += holder.cancel_pipelines(&scope.targets);
                    }
                }
                cancelled
            };
            debug!("Cancelled {} outstanding holders", cancelled);
            self.process_results();
        }
        self.schedule_rerun();
        self.tier_unless_closed(FlushTier::Failed)
    }

    fn tier_unless_closed(&self, tier: FlushTier) -> FlushTier {
        if self.state.is_closed() {
            FlushTier::Aborted
        } else {
            tier
        }
    }

    fn post_flush_operations(
        &self,
        scope: &FlushScope,
        started_from: SessionState,
        tier: FlushTier,
    ) -> Result<()> {
        {
            let _requests = self.requests.lock();
            for &p in &scope.targets {
                let handle = &self.pipelines[p];
                handle.set_flushing(false);
                handle.pipeline.set_flush_in_progress(false);
            }
            self.last_shutter_sequence_id.store(-1, Ordering::Release);
            let mut flush = self.flush.lock();
            flush.in_progress = false;
            flush.targets.clear();
        }

        let released = self.metabuffers.lock().release_all(&scope.targets);
        self.invalidate_metabuffers(&released);
        self.admission.rearm_cold_start();

        self.answer_rejected_requests();
        {
            let mut flush = self.flush.lock();
            flush.generation += 1;
            self.flush_done.notify_all();
        }

        let result = self.finish_flush_state(scope, started_from, tier);

        if tier.is_success() {
            self.dump_complete.store(false, Ordering::Release);
        }
        self.admission.force_wake();
        self.schedule_rerun();
        result
    }

    fn finish_flush_state(
        &self,
        scope: &FlushScope,
        started_from: SessionState,
        tier: FlushTier,
    ) -> Result<()> {
        if tier == FlushTier::Aborted {
            return Err(Error::InvalidState(format!(
                "session closed during flush (state {})",
                self.state.current()
            )));
        }

        let recovery_pending = self.recovery_pending.swap(false, Ordering::AcqRel);

        if tier.is_success() {
            let stay_recovering =
                recovery_pending || (started_from == SessionState::Recovering && !scope.session);
            let to = if stay_recovering {
                SessionState::Recovering
            } else {
                SessionState::Normal
            };
            return match self.state.transition(&[SessionState::Flushing], to) {
                Ok(from) => {
                    if to == SessionState::Recovering {
                        self.enter_recovering(from, "recovery requested during flush");
                    } else {
                        self.emit_state_change(from, to);
                    }
                    Ok(())
                }
                Err(Rejected(state)) => Err(Error::InvalidState(format!(
                    "flush finished in state {}",
                    state
                ))),
            };
        }

        if started_from == SessionState::Recovering {
            self.set_device_in_error("recovery flush failed");
            return Err(Error::Failed("recovery flush failed".to_string()));
        }

        let to = if self.config.enable_recovery {
            SessionState::Recovering
        } else {
            SessionState::Normal
        };
        match self.state.transition(&[SessionState::Flushing], to) {
            Ok(from) if to == SessionState::Recovering => {
                self.enter_recovering(from, "flush timeout")
            }
            Ok(from) => self.emit_state_change(from, to),
            Err(Rejected(state)) => debug!("Flush failure left state {}", state),
        }
        Err(Error::Timeout(format!(
            "flush of pipelines {:?} did not complete",
            scope.targets
        )))
    }

    /// Answer requests turned away while a flush ran
    pub(super) fn answer_rejected_requests(&self) {
        let rejected = std::mem::take(&mut self.flush.lock().rejected);
        if rejected.is_empty() {
            return;
        }

        let mut batch = Vec::new();
        for request in &rejected {
            for r in &request.requests {
                batch.push(SessionResult::Notify(NotifyMessage::Error {
                    frame_number: r.frame_number,
                    sequence_id: None,
                    kind: ErrorKind::Request,
                    stream: None,
                }));
                let mut capture = CaptureResult::new(r.frame_number, None, r.pipeline_index);
                capture.output_buffers = r
                    .output_buffers
                    .iter()
                    .map(|b| b.clone().into_error())
                    .collect();
                capture.input_buffers = r.input_buffers.clone();
                batch.push(SessionResult::Capture(capture));
            }
        }

        debug!("Answering {} requests rejected during flush", rejected.len());
        let _worker = self.result_lock.lock();
        self.sink.dispatch(&batch);
    }

    pub(super) fn trigger_recovery(&self, reason: &str) {
        if !self.config.enable_recovery {
            warn!("Session {}: recovery disabled, ignoring '{}'", self.id, reason);
            return;
        }

        match self
            .state
            .transition(&[SessionState::Normal], SessionState::Recovering)
        {
            Ok(from) => self.enter_recovering(from, reason),
            Err(Rejected(SessionState::Flushing)) => {
                info!("Session {}: recovery deferred until flush completes ({})", self.id, reason);
                self.recovery_pending.store(true, Ordering::Release);
            }
            Err(Rejected(state)) => {
                debug!("Session {}: no recovery from state {} ({})", self.id, state, reason);
            }
        }
    }

    fn enter_recovering(&self, from: SessionState, reason: &str) {
        warn!("Session {} entering recovery: {}", self.id, reason);
        self.emit_state_change(from, SessionState::Recovering);
        for handle in &self.pipelines {
            handle.pipeline.notify_triggering_recovery(true);
        }
        self.context.broadcast_event(SessionEvent::RecoveryTriggered {
            session_id: self.id,
            reason: reason.to_string(),
            timestamp: chrono::Utc::now(),
        });
        self.admission.force_wake();
        self.dump_once(reason);
    }

    /// Flush the whole session out of the recovering state
    pub(super) fn recover(&self) -> Result<()> {
        let state = self.state.current();
        if state != SessionState::Recovering {
            return Err(Error::InvalidState(format!(
                "recover called in state {}",
                state
            )));
        }

        self.flush(FlushInfo::session())?;

        if self.state.current() == SessionState::Normal {
            for handle in &self.pipelines {
                handle.pipeline.notify_triggering_recovery(false);
            }
            info!("Session {} recovered", self.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_info_scope() {
        assert!(FlushInfo::session().is_session_scope());
        let info = FlushInfo::pipelines([1, 0]);
        assert!(!info.is_session_scope());
        assert_eq!(info.pipelines, Some(vec![1, 0]));
    }

    #[test]
    fn test_tier_success() {
        assert!(FlushTier::Forced.is_success());
        assert!(!FlushTier::Failed.is_success());
        assert!(!FlushTier::Aborted.is_success());
        assert_eq!(FlushTier::Fallback.as_str(), "fallback");
    }
}
