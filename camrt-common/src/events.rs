//! Event types for the camrt session event bus

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session lifecycle events
///
/// Broadcast by sessions so that monitoring and tests can follow state changes
/// without polling. High-rate per-frame activity is logged, not broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    /// Session constructed and ready to accept requests
    SessionCreated {
        session_id: Uuid,
        name: String,
        num_pipelines: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Session state machine transition
    StateChanged {
        session_id: Uuid,
        from: SessionState,
        to: SessionState,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Admission wait expired before a live pending slot was freed
    AdmissionTimeout {
        session_id: Uuid,
        sequence_id: u32,
        live_pending: u32,
        waited_ms: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Session entered recovery mode
    RecoveryTriggered {
        session_id: Uuid,
        reason: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Flush started
    FlushStarted {
        session_id: Uuid,
        /// Pipeline indexes being flushed (all pipelines for a session flush)
        pipelines: Vec<usize>,
        session_scope: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Flush finished (successfully or after fallback escalation)
    FlushCompleted {
        session_id: Uuid,
        pipelines: Vec<usize>,
        success: bool,
        /// Escalation tier that completed the flush: "normal", "fallback", "forced" or "failed"
        tier: String,
        elapsed_ms: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Session entered the sticky device error state
    DeviceError {
        session_id: Uuid,
        reason: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Session destroyed
    SessionDestroyed {
        session_id: Uuid,
        /// Requests that were still outstanding and returned as errors
        cancelled_requests: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

/// Session state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Accepting and processing requests
    Normal,
    /// A flush is draining in-flight work
    Flushing,
    /// Recovery pending; admissions are rejected until a recovery flush completes
    Recovering,
    /// Sticky fatal state; only destroy is possible
    DeviceError,
    /// Teardown in progress or finished
    Destroying,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Normal => write!(f, "normal"),
            SessionState::Flushing => write!(f, "flushing"),
            SessionState::Recovering => write!(f, "recovering"),
            SessionState::DeviceError => write!(f, "device_error"),
            SessionState::Destroying => write!(f, "destroying"),
        }
    }
}

impl SessionEvent {
    /// Get event type as string for filtering
    pub fn event_type(&self) -> &str {
        match self {
            SessionEvent::SessionCreated { .. } => "SessionCreated",
            SessionEvent::StateChanged { .. } => "StateChanged",
            SessionEvent::AdmissionTimeout { .. } => "AdmissionTimeout",
            SessionEvent::RecoveryTriggered { .. } => "RecoveryTriggered",
            SessionEvent::FlushStarted { .. } => "FlushStarted",
            SessionEvent::FlushCompleted { .. } => "FlushCompleted",
            SessionEvent::DeviceError { .. } => "DeviceError",
            SessionEvent::SessionDestroyed { .. } => "SessionDestroyed",
        }
    }

    /// Session that emitted this event
    pub fn session_id(&self) -> Uuid {
        match self {
            SessionEvent::SessionCreated { session_id, .. }
            | SessionEvent::StateChanged { session_id, .. }
            | SessionEvent::AdmissionTimeout { session_id, .. }
            | SessionEvent::RecoveryTriggered { session_id, .. }
            | SessionEvent::FlushStarted { session_id, .. }
            | SessionEvent::FlushCompleted { session_id, .. }
            | SessionEvent::DeviceError { session_id, .. }
            | SessionEvent::SessionDestroyed { session_id, .. } => *session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = SessionEvent::StateChanged {
            session_id: Uuid::new_v4(),
            from: SessionState::Normal,
            to: SessionState::Flushing,
            timestamp: chrono::Utc::now(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "StateChanged");
        assert_eq!(json["from"], "normal");
        assert_eq!(json["to"], "flushing");
    }

    #[test]
    fn test_event_round_trip_keeps_session_id() {
        let session_id = Uuid::new_v4();
        let event = SessionEvent::FlushCompleted {
            session_id,
            pipelines: vec![0, 1],
            success: false,
            tier: "forced".to_string(),
            elapsed_ms: 1250,
            timestamp: chrono::Utc::now(),
        };

        let json = serde_json::to_string(&event).unwrap();
        let parsed: SessionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.session_id(), session_id);
        assert_eq!(parsed.event_type(), "FlushCompleted");
    }

    #[test]
    fn test_session_state_display() {
        assert_eq!(SessionState::DeviceError.to_string(), "device_error");
        assert_eq!(SessionState::Recovering.to_string(), "recovering");
    }
}
