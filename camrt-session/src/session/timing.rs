//! Request timing log for diagnostics

use crate::types::{RequestId, SequenceId};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Completed requests retained for state dumps
pub const TIMING_LOG_CAPACITY: usize = 50;

#[derive(Debug, Clone)]
pub struct RequestTiming {
    pub sequence_id: SequenceId,
    /// (pipeline index, request id) pairs
    pub request_ids: Vec<(usize, RequestId)>,
    pub started: Instant,
    pub elapsed: Duration,
}

#[derive(Default)]
pub(crate) struct RequestTimingLog {
    in_flight: HashMap<SequenceId, (Vec<(usize, RequestId)>, Instant)>,
    completed: VecDeque<RequestTiming>,
}

impl RequestTimingLog {
    pub fn start(&mut self, sequence_id: SequenceId, request_ids: Vec<(usize, RequestId)>) {
        self.in_flight
            .insert(sequence_id, (request_ids, Instant::now()));
    }

    pub fn finish(&mut self, sequence_id: SequenceId) -> Option<Duration> {
        let (request_ids, started) = self.in_flight.remove(&sequence_id)?;
        let elapsed = started.elapsed();
        if self.completed.len() == TIMING_LOG_CAPACITY {
            self.completed.pop_front();
        }
        self.completed.push_back(RequestTiming {
            sequence_id,
            request_ids,
            started,
            elapsed,
        });
        Some(elapsed)
    }

    pub fn recent(&self) -> Vec<RequestTiming> {
        self.completed.iter().cloned().collect()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn average(&self) -> Option<Duration> {
        if self.completed.is_empty() {
            return None;
        }
        let total: Duration = self.completed.iter().map(|t| t.elapsed).sum();
        Some(total / self.completed.len() as u32)
    }

    /// Completion rate over the retained window, once two requests finished
    pub fn result_fps(&self) -> Option<f64> {
        if self.completed.len() < 2 {
            return None;
        }
        let first = self.completed.front()?;
        let last = self.completed.back()?;
        let span = (last.started + last.elapsed)
            .saturating_duration_since(first.started + first.elapsed);
        if span.is_zero() {
            return None;
        }
        Some((self.completed.len() - 1) as f64 / span.as_secs_f64())
    }

    /// Oldest request still in flight and how long it has been running
    pub fn oldest_in_flight(&self) -> Option<(SequenceId, Duration)> {
        self.in_flight
            .iter()
            .min_by_key(|(seq, _)| **seq)
            .map(|(seq, (_, started))| (*seq, started.elapsed()))
    }

    pub fn clear_in_flight(&mut self) {
        self.in_flight.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_keeps_last_fifty() {
        let mut log = RequestTimingLog::default();
        for seq in 0..60 {
            log.start(seq, vec![(0, seq as RequestId)]);
            assert!(log.finish(seq).is_some());
        }
        let recent = log.recent();
        assert_eq!(recent.len(), TIMING_LOG_CAPACITY);
        assert_eq!(recent[0].sequence_id, 10);
        assert!(log.average().is_some());
    }

    #[test]
    fn test_finish_unknown_sequence() {
        let mut log = RequestTimingLog::default();
        log.start(3, vec![]);
        assert!(log.finish(4).is_none());
        assert_eq!(log.oldest_in_flight().map(|(s, _)| s), Some(3));
    }

    #[test]
    fn test_result_fps_over_window() {
        let mut log = RequestTimingLog::default();
        assert!(log.result_fps().is_none());

        let base = Instant::now();
        for seq in 0..5u32 {
            log.completed.push_back(RequestTiming {
                sequence_id: seq,
                request_ids: vec![(0, seq as RequestId)],
                started: base + Duration::from_millis(100 * seq as u64),
                elapsed: Duration::from_millis(30),
            });
        }
        // Four intervals of 100ms
        let fps = log.result_fps().unwrap();
        assert!((fps - 10.0).abs() < 1e-6, "fps {}", fps);
    }
}
