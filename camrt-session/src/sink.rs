//! Client result surface

use crate::types::{CaptureResult, NotifyMessage, SequenceId, SessionResult};
use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// Receiver of ordered result batches
///
/// Called from the session's worker job, never concurrently for one
/// session. Implementations must not call back into the session.
pub trait ResultSink: Send + Sync {
    fn dispatch(&self, batch: &[SessionResult]);
}

/// Sink that records everything it receives
#[derive(Default)]
pub struct CollectingSink {
    results: Mutex<Vec<SessionResult>>,
    batches: Mutex<usize>,
    condvar: Condvar,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything received so far, in delivery order
    pub fn results(&self) -> Vec<SessionResult> {
        self.results.lock().clone()
    }

    pub fn captures(&self) -> Vec<CaptureResult> {
        self.results
            .lock()
            .iter()
            .filter_map(|r| match r {
                SessionResult::Capture(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn notifications(&self) -> Vec<NotifyMessage> {
        self.results
            .lock()
            .iter()
            .filter_map(|r| match r {
                SessionResult::Notify(n) => Some(n.clone()),
                _ => None,
            })
            .collect()
    }

    /// Sequence ids in the order their first result was delivered
    pub fn sequence_order(&self) -> Vec<SequenceId> {
        let mut order: Vec<SequenceId> = Vec::new();
        for id in self.results.lock().iter().filter_map(|r| r.sequence_id()) {
            if !order.contains(&id) {
                order.push(id);
            }
        }
        order
    }

    pub fn len(&self) -> usize {
        self.results.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.lock().is_empty()
    }

    pub fn batch_count(&self) -> usize {
        *self.batches.lock()
    }

    pub fn clear(&self) {
        self.results.lock().clear();
    }

    /// Wait until `predicate` holds over the received results
    pub fn wait_for<F>(&self, timeout: Duration, mut predicate: F) -> bool
    where
        F: FnMut(&[SessionResult]) -> bool,
    {
        let mut results = self.results.lock();
        crate::sync::wait_until(&mut results, &self.condvar, timeout, |r| predicate(r))
    }
}

impl ResultSink for CollectingSink {
    fn dispatch(&self, batch: &[SessionResult]) {
        self.results.lock().extend_from_slice(batch);
        *self.batches.lock() += 1;
        self.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CaptureResult, ErrorKind};

    #[test]
    fn test_collecting_sink_orders_sequence_ids() {
        let sink = CollectingSink::new();
        sink.dispatch(&[
            SessionResult::Capture(CaptureResult::new(10, Some(0), 0)),
            SessionResult::Notify(NotifyMessage::Error {
                frame_number: 11,
                sequence_id: Some(1),
                kind: ErrorKind::Result,
                stream: None,
            }),
        ]);
        sink.dispatch(&[SessionResult::Capture(CaptureResult::new(10, Some(0), 0))]);

        assert_eq!(sink.sequence_order(), vec![0, 1]);
        assert_eq!(sink.captures().len(), 2);
        assert_eq!(sink.notifications().len(), 1);
        assert_eq!(sink.batch_count(), 2);
        assert!(sink.wait_for(Duration::from_millis(1), |r| r.len() == 3));
    }
}
