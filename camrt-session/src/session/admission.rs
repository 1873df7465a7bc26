//! Admission control
//!
//! Bounds the number of live pending requests. A request is admitted only
//! while `live_pending < max_live_pending - 1`; the slot is returned when
//! its results have been fully delivered.

use crate::error::{Error, Result};
use crate::sync::wait_until_polling;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, trace};

#[derive(Debug)]
struct AdmissionState {
    live_pending: u32,
    max_live_pending: u32,
    /// Admissions left before the cold-start allowance expires
    cold_start_remaining: u32,
    total_admitted: u64,
    total_released: u64,
}

/// Point-in-time view for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionSnapshot {
    pub live_pending: u32,
    pub max_live_pending: u32,
    pub cold_start_remaining: u32,
    pub long_exposure_ms: u64,
    pub total_admitted: u64,
    pub total_released: u64,
}

pub(crate) struct AdmissionController {
    state: Mutex<AdmissionState>,
    condvar: Condvar,
    /// Outstanding long-exposure time added to the wait budget
    long_exposure_ms: AtomicU64,
    base_timeout: Duration,
    cold_start_per_request: Duration,
    poll: Duration,
}

impl AdmissionController {
    pub fn new(
        max_live_pending: u32,
        base_timeout: Duration,
        cold_start_per_request: Duration,
        poll: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(AdmissionState {
                live_pending: 0,
                max_live_pending,
                cold_start_remaining: max_live_pending,
                total_admitted: 0,
                total_released: 0,
            }),
            condvar: Condvar::new(),
            long_exposure_ms: AtomicU64::new(0),
            base_timeout,
            cold_start_per_request,
            poll,
        }
    }

    fn wait_budget(&self, state: &AdmissionState) -> Duration {
        let mut budget = self.base_timeout;
        if state.cold_start_remaining > 0 {
            budget += self.cold_start_per_request * state.max_live_pending;
        }
        budget + Duration::from_millis(self.long_exposure_ms.load(Ordering::Acquire))
    }

    /// Current wait budget for a blocked admission
    pub fn current_budget(&self) -> Duration {
        let state = self.state.lock();
        self.wait_budget(&state)
    }

    /// Block until a live slot is free
    ///
    /// `gate` is re-evaluated while waiting; returning an error from it
    /// aborts the wait with that error. Timeout yields `Error::Timeout`.
    pub fn acquire<G>(&self, mut gate: G) -> Result<()>
    where
        G: FnMut() -> Option<Error>,
    {
        let mut state = self.state.lock();
        let budget = self.wait_budget(&state);
        let mut blocked = None;

        let admitted = wait_until_polling(&mut state, &self.condvar, budget, self.poll, |st| {
            if let Some(e) = gate() {
                blocked = Some(e);
                return true;
            }
            st.live_pending + 1 < st.max_live_pending
        });

        if let Some(e) = blocked {
            debug!("Admission aborted: {}", e);
            return Err(e);
        }
        if !admitted {
            return Err(Error::Timeout(format!(
                "no live pending slot within {}ms (live={}, max={})",
                budget.as_millis(),
                state.live_pending,
                state.max_live_pending
            )));
        }

        state.live_pending += 1;
        state.total_admitted += 1;
        state.cold_start_remaining = state.cold_start_remaining.saturating_sub(1);
        trace!(live_pending = state.live_pending, "Request admitted");
        Ok(())
    }

    /// Return one live slot
    pub fn release(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.live_pending == 0 {
            error!("Admission release without a matching admission");
            return Err(Error::InvalidState(
                "live pending count already zero".to_string(),
            ));
        }
        state.live_pending -= 1;
        state.total_released += 1;
        trace!(live_pending = state.live_pending, "Live slot released");
        drop(state);
        self.condvar.notify_all();
        Ok(())
    }

    pub fn live_pending(&self) -> u32 {
        self.state.lock().live_pending
    }

    pub fn max_live_pending(&self) -> u32 {
        self.state.lock().max_live_pending
    }

    pub fn set_max_live_pending(&self, max_live_pending: u32) {
        let mut state = self.state.lock();
        debug!(
            "Max live pending {} -> {}",
            state.max_live_pending, max_live_pending
        );
        state.max_live_pending = max_live_pending;
        drop(state);
        self.condvar.notify_all();
    }

    /// Grant the cold-start allowance for the next `max_live_pending` admissions
    pub fn rearm_cold_start(&self) {
        let mut state = self.state.lock();
        state.cold_start_remaining = state.max_live_pending;
    }

    pub fn add_long_exposure(&self, ms: u64) {
        self.long_exposure_ms.fetch_add(ms, Ordering::AcqRel);
    }

    pub fn remove_long_exposure(&self, ms: u64) {
        let _ = self
            .long_exposure_ms
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(ms)));
    }

    pub fn long_exposure_ms(&self) -> u64 {
        self.long_exposure_ms.load(Ordering::Acquire)
    }

    /// Wake blocked admissions so they re-check their gate
    pub fn force_wake(&self) {
        self.condvar.notify_all();
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        let state = self.state.lock();
        AdmissionSnapshot {
            live_pending: state.live_pending,
            max_live_pending: state.max_live_pending,
            cold_start_remaining: state.cold_start_remaining,
            long_exposure_ms: self.long_exposure_ms(),
            total_admitted: state.total_admitted,
            total_released: state.total_released,
        }
    }
}
