//! Session state machine

use camrt_common::SessionState;
use parking_lot::Mutex;

/// Holds the session state; every change is a checked transition
pub(crate) struct StateMachine {
    state: Mutex<SessionState>,
}

/// Transition rejected; carries the state actually observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Rejected(pub SessionState);

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::Normal),
        }
    }

    pub fn current(&self) -> SessionState {
        *self.state.lock()
    }

    /// Legal edges of the state graph
    pub fn is_legal(from: SessionState, to: SessionState) -> bool {
        use SessionState::*;
        match (from, to) {
            (Destroying, _) => false,
            (DeviceError, Destroying) => true,
            (DeviceError, _) => false,
            (_, Destroying) => true,
            (_, DeviceError) => true,
            (Normal, Flushing) | (Normal, Recovering) => true,
            (Flushing, Normal) | (Flushing, Recovering) => true,
            (Recovering, Flushing) => true,
            _ => false,
        }
    }

    /// Compare-and-swap: move to `to` only from one of `allowed_from`
    ///
    /// Returns the previous state on success.
    pub fn transition(
        &self,
        allowed_from: &[SessionState],
        to: SessionState,
    ) -> Result<SessionState, Rejected> {
        let mut state = self.state.lock();
        let from = *state;
        if !allowed_from.contains(&from) || !Self::is_legal(from, to) {
            return Err(Rejected(from));
        }
        *state = to;
        Ok(from)
    }

    /// Move to `to` from whatever state is legal for it
    pub fn transition_any(&self, to: SessionState) -> Result<SessionState, Rejected> {
        let mut state = self.state.lock();
        let from = *state;
        if !Self::is_legal(from, to) {
            return Err(Rejected(from));
        }
        *state = to;
        Ok(from)
    }

    pub fn is_device_error(&self) -> bool {
        self.current() == SessionState::DeviceError
    }

    /// Device error or teardown: nothing new may enter
    pub fn is_closed(&self) -> bool {
        matches!(
            self.current(),
            SessionState::DeviceError | SessionState::Destroying
        )
    }
}
