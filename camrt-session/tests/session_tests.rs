//! Session integration tests
//!
//! Drive a session through manual pipelines and check what reaches the
//! client: ordering, admission, error delivery, flush escalation, device
//! error and teardown.

mod helpers;

use camrt_common::SessionState;
use camrt_session::config::SessionConfig;
use camrt_session::error::Error;
use camrt_session::session::{CallbackPayload, InjectedResult};
use camrt_session::types::{
    ErrorKind, NotifyMessage, SequenceId, SessionRequest, SessionResult, StreamBuffer, StreamId,
};
use camrt_session::FlushInfo;
use helpers::{fast_config, request, request_for, NodeBehaviour, TestSession};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(2);

fn errors_of(results: &[SessionResult], kind: ErrorKind) -> Vec<Option<SequenceId>> {
    results
        .iter()
        .filter_map(|r| match r {
            SessionResult::Notify(NotifyMessage::Error {
                kind: k,
                sequence_id,
                ..
            }) if *k == kind => Some(*sequence_id),
            _ => None,
        })
        .collect()
}

fn position(results: &[SessionResult], predicate: impl Fn(&SessionResult) -> bool) -> Option<usize> {
    results.iter().position(predicate)
}

fn is_metadata_for(result: &SessionResult, sequence_id: SequenceId) -> bool {
    matches!(result, SessionResult::Capture(c) if c.sequence_id == Some(sequence_id) && c.metadata.is_some())
}

#[test]
fn test_results_leave_in_sequence_order() {
    let t = TestSession::new(fast_config());
    t.session.process_capture_request(request(10, &[0])).unwrap();
    t.session.process_capture_request(request(11, &[0])).unwrap();
    assert!(t.pipeline().wait_for_frames(2, WAIT));

    // Second frame finishes first; nothing may leave before the first
    t.pipeline().complete(1).unwrap();
    thread::sleep(Duration::from_millis(30));
    assert!(t.sink.is_empty());

    t.pipeline().complete(0).unwrap();
    assert!(t.session.wait_for_idle(WAIT));

    assert_eq!(t.sink.sequence_order(), vec![0, 1]);
    let frames: Vec<u64> = t.sink.captures().iter().map(|c| c.frame_number).collect();
    assert!(frames.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(frames.first(), Some(&10));

    let results = t.sink.results();
    assert!(matches!(
        results[0],
        SessionResult::Notify(NotifyMessage::Shutter { frame_number: 10, .. })
    ));
}

#[test]
fn test_results_carry_client_frame_numbers() {
    let t = TestSession::new(fast_config());
    for frame in [100, 205, 310] {
        t.session.process_capture_request(request(frame, &[0])).unwrap();
    }
    assert!(t.pipeline().wait_for_frames(3, WAIT));
    for seq in [2, 1, 0] {
        t.pipeline().complete(seq).unwrap();
    }
    assert!(t.session.wait_for_idle(WAIT));

    let mut pairs: Vec<(Option<SequenceId>, u64)> = t
        .sink
        .captures()
        .iter()
        .map(|c| (c.sequence_id, c.frame_number))
        .collect();
    pairs.dedup();
    assert_eq!(pairs, vec![(Some(0), 100), (Some(1), 205), (Some(2), 310)]);

    let shutters: Vec<u64> = t
        .sink
        .notifications()
        .iter()
        .filter_map(|n| match n {
            NotifyMessage::Shutter { frame_number, .. } => Some(*frame_number),
            _ => None,
        })
        .collect();
    assert_eq!(shutters, vec![100, 205, 310]);
}

#[test]
fn test_admission_blocks_at_capacity_and_unblocks_on_release() {
    let t = Arc::new(TestSession::new(fast_config()));

    // Depth 4 admits three live requests
    for frame in 0..3 {
        t.session.process_capture_request(request(frame, &[0])).unwrap();
    }
    assert_eq!(t.session.live_pending_requests(), 3);

    let blocked = {
        let t = Arc::clone(&t);
        thread::spawn(move || t.session.process_capture_request(request(3, &[0])))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!blocked.is_finished());

    assert!(t.pipeline().wait_for_frames(3, WAIT));
    t.pipeline().complete(0).unwrap();

    let result = blocked.join().unwrap();
    assert!(result.is_ok());
    assert_eq!(t.session.live_pending_requests(), 3);
}

#[test]
fn test_admission_timeout_without_recovery() {
    let config = SessionConfig {
        admission_timeout_ms: 50,
        enable_recovery: false,
        ..fast_config()
    };
    let t = TestSession::new(config);
    for frame in 0..3 {
        t.session.process_capture_request(request(frame, &[0])).unwrap();
    }

    let start = Instant::now();
    let err = t.session.process_capture_request(request(3, &[0])).unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(t.session.state(), SessionState::Normal);
}

#[test]
fn test_admission_timeout_triggers_recovery() {
    let config = SessionConfig {
        admission_timeout_ms: 50,
        ..fast_config()
    };
    let t = TestSession::new(config);
    for frame in 0..3 {
        t.session.process_capture_request(request(frame, &[0])).unwrap();
    }

    let err = t.session.process_capture_request(request(3, &[0])).unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert_eq!(t.session.state(), SessionState::Recovering);
    assert!(t.pipeline().is_recovering());

    // Recovering sessions turn requests away
    let err = t.session.process_capture_request(request(4, &[0])).unwrap_err();
    assert!(err.is_cancelled());

    // Recovery flush returns the stuck work and restores normal operation
    t.session.recover().unwrap();
    assert_eq!(t.session.state(), SessionState::Normal);
    assert!(!t.pipeline().is_recovering());
    assert_eq!(t.session.live_pending_requests(), 0);
    assert_eq!(errors_of(&t.sink.results(), ErrorKind::Result).len(), 3);
}

#[test]
fn test_slots_released_exactly_once() {
    let t = TestSession::new(fast_config());
    for frame in 0..3 {
        t.session.process_capture_request(request(frame, &[0, 1])).unwrap();
    }
    assert!(t.pipeline().wait_for_frames(3, WAIT));

    // A duplicate buffer is rejected, not counted twice
    t.pipeline().send_buffers(0).unwrap();
    let duplicate = t.pipeline().send(CallbackPayload::Buffer {
        sequence_id: 0,
        buffer: StreamBuffer::new(StreamId(0), 0),
    });
    assert!(matches!(duplicate, Err(Error::InvalidArg(_))));

    for seq in 0..3 {
        t.pipeline().complete(seq).unwrap_or(());
    }
    assert!(t.session.wait_for_idle(WAIT));

    let snapshot = t.session.admission_snapshot();
    assert_eq!(snapshot.live_pending, 0);
    assert_eq!(snapshot.total_admitted, 3);
    assert_eq!(snapshot.total_released, 3);
    assert_eq!(t.session.pipeline_live_pending(0), Some(0));
}

#[test]
fn test_metadata_error_for_earlier_sequence_leaves_first() {
    let config = SessionConfig {
        request_queue_depth: 16,
        ..fast_config()
    };
    let t = TestSession::new(config);
    for frame in 0..9 {
        t.session.process_capture_request(request(frame, &[0])).unwrap();
    }
    assert!(t.pipeline().wait_for_frames(9, WAIT));

    for seq in 0..7 {
        t.pipeline().complete(seq).unwrap();
    }
    t.pipeline().complete(8).unwrap();
    thread::sleep(Duration::from_millis(20));
    assert!(!t.sink.results().iter().any(|r| is_metadata_for(r, 8)));

    // Second error for the same sequence is ignored
    t.pipeline().send_metadata_error(7).unwrap();
    t.pipeline().send_metadata_error(7).unwrap();
    t.pipeline().send_buffers(7).unwrap();
    assert!(t.session.wait_for_idle(WAIT));

    let results = t.sink.results();
    assert_eq!(errors_of(&results, ErrorKind::Result), vec![Some(7)]);

    let error_7 = position(&results, |r| {
        matches!(
            r,
            SessionResult::Notify(NotifyMessage::Error {
                kind: ErrorKind::Result,
                sequence_id: Some(7),
                ..
            })
        )
    })
    .unwrap();
    let metadata_8 = position(&results, |r| is_metadata_for(r, 8)).unwrap();
    assert!(error_7 < metadata_8);
}

#[test]
fn test_metadata_error_with_partials_settles_both_components() {
    let config = SessionConfig {
        request_queue_depth: 16,
        partial_metadata_count: 1,
        ..fast_config()
    };
    let t = TestSession::new(config);
    for frame in 0..9 {
        t.session.process_capture_request(request(frame, &[0])).unwrap();
    }
    assert!(t.pipeline().wait_for_frames(9, WAIT));

    for seq in 0..7 {
        t.pipeline().complete(seq).unwrap();
    }
    t.pipeline().complete(8).unwrap();
    thread::sleep(Duration::from_millis(20));
    assert!(!t.sink.results().iter().any(|r| is_metadata_for(r, 8)));

    // Sequence 7 owes two metadata components; one error settles both
    t.pipeline().send_metadata_error(7).unwrap();
    t.pipeline().send_metadata_error(7).unwrap();
    t.pipeline().send_buffers(7).unwrap();
    assert!(t.session.wait_for_idle(WAIT));

    let results = t.sink.results();
    assert_eq!(errors_of(&results, ErrorKind::Result), vec![Some(7)]);

    assert!(!results.iter().any(|r| is_metadata_for(r, 7)));
    let error_7 = position(&results, |r| {
        matches!(
            r,
            SessionResult::Notify(NotifyMessage::Error {
                kind: ErrorKind::Result,
                sequence_id: Some(7),
                ..
            })
        )
    })
    .unwrap();
    let metadata_8 = position(&results, |r| is_metadata_for(r, 8)).unwrap();
    assert!(error_7 < metadata_8);
    assert!(matches!(
        &results[metadata_8],
        SessionResult::Capture(c) if c.num_partial_metadata == 2
    ));
}

#[test]
fn test_partial_batch_is_never_enqueued() {
    let config = SessionConfig {
        num_batched_frames: 4,
        ..fast_config()
    };
    let t = TestSession::new(config);
    let batched = |frame| {
        let mut r = request_for(0, frame, &[0]);
        r.batching = true;
        SessionRequest::single(r)
    };

    for frame in 0..3 {
        t.session.process_capture_request(batched(frame)).unwrap();
    }
    thread::sleep(Duration::from_millis(20));
    assert_eq!(t.session.request_queue_len(), 0);
    assert_eq!(t.pipeline().submitted_frames(), 0);

    t.session.process_capture_request(batched(3)).unwrap();
    assert!(t.pipeline().wait_for_frames(4, WAIT));

    let submitted = t.pipeline().submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].frames.len(), 4);
    let sequence_ids: Vec<SequenceId> = submitted[0].frames.iter().map(|f| f.sequence_id).collect();
    assert_eq!(sequence_ids, vec![0, 1, 2, 3]);
}

#[test]
fn test_stalled_flush_escalates_and_fails() {
    let t = TestSession::new(fast_config());
    t.pipeline().set_behaviour(NodeBehaviour::Stalled);
    t.session.process_capture_request(request(0, &[0])).unwrap();
    t.session.process_capture_request(request(1, &[0])).unwrap();
    assert!(t.pipeline().wait_for_frames(2, WAIT));

    let err = t.session.flush(FlushInfo::session()).unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert_eq!(t.pipeline().flush_calls(), 1);
    assert_eq!(t.pipeline().forced_flush_calls(), 1);
    assert_eq!(t.session.state(), SessionState::Recovering);

    // Outstanding work was cancelled and delivered as request errors
    assert!(t.sink.wait_for(WAIT, |r| errors_of(r, ErrorKind::Request).len() == 2));
    assert_eq!(t.session.live_pending_requests(), 0);

    // Once the nodes let go, a recovery flush brings the session back
    assert_eq!(t.pipeline().outstanding(), vec![0, 1]);
    t.pipeline().clear_outstanding();
    t.pipeline().set_behaviour(NodeBehaviour::Responsive);
    t.session.recover().unwrap();
    assert_eq!(t.session.state(), SessionState::Normal);

    t.session.process_capture_request(request(2, &[0])).unwrap();
    assert!(t.pipeline().wait_for_frames(3, WAIT));
    t.pipeline().complete(2).unwrap();
    assert!(t.session.wait_for_idle(WAIT));
}

#[test]
fn test_forced_node_flush_completes_flush() {
    let t = TestSession::new(fast_config());
    t.pipeline().set_behaviour(NodeBehaviour::NeedsForce);
    t.session.process_capture_request(request(0, &[0])).unwrap();
    assert!(t.pipeline().wait_for_frames(1, WAIT));

    t.session.flush(FlushInfo::session()).unwrap();
    assert_eq!(t.pipeline().forced_flush_calls(), 1);
    assert_eq!(t.session.state(), SessionState::Normal);

    let results = t.sink.results();
    assert_eq!(errors_of(&results, ErrorKind::Result), vec![Some(0)]);
    assert_eq!(errors_of(&results, ErrorKind::Buffer), vec![Some(0)]);
}

#[test]
fn test_failed_recovery_flush_is_device_error() {
    let t = TestSession::new(fast_config());
    t.pipeline().set_behaviour(NodeBehaviour::Stalled);
    t.session.process_capture_request(request(0, &[0])).unwrap();
    assert!(t.pipeline().wait_for_frames(1, WAIT));

    t.session.trigger_recovery("test");
    assert_eq!(t.session.state(), SessionState::Recovering);

    // The pipeline still holds work nobody will return
    assert!(t.session.recover().is_err());
    assert!(t.session.get_device_in_error());
}

#[test]
fn test_request_during_flush_gets_request_error() {
    let config = SessionConfig {
        flush_max_wait_ms: 1000,
        ..fast_config()
    };
    let t = Arc::new(TestSession::new(config));
    t.pipeline().set_behaviour(NodeBehaviour::Stalled);
    t.session.process_capture_request(request(0, &[0])).unwrap();
    assert!(t.pipeline().wait_for_frames(1, WAIT));

    let flusher = {
        let t = Arc::clone(&t);
        thread::spawn(move || t.session.flush(FlushInfo::session()))
    };
    let deadline = Instant::now() + WAIT;
    while t.session.state() != SessionState::Flushing && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }

    let submitter = {
        let t = Arc::clone(&t);
        thread::spawn(move || t.session.process_capture_request(request(42, &[0])))
    };
    thread::sleep(Duration::from_millis(20));
    t.pipeline().complete(0).unwrap();

    assert!(flusher.join().unwrap().is_ok());
    assert!(submitter.join().unwrap().is_ok());

    let rejected = t.sink.results().into_iter().any(|r| {
        matches!(
            r,
            SessionResult::Notify(NotifyMessage::Error {
                frame_number: 42,
                sequence_id: None,
                kind: ErrorKind::Request,
                ..
            })
        )
    });
    assert!(rejected);
    assert_eq!(t.session.state(), SessionState::Normal);
}

#[test]
fn test_pipeline_flush_leaves_other_pipelines_running() {
    let t = TestSession::with_pipelines(fast_config(), 2);
    t.session
        .process_capture_request(SessionRequest::single(request_for(1, 5, &[7])))
        .unwrap();
    assert!(t.pipelines[1].wait_for_frames(1, WAIT));

    t.session.flush(FlushInfo::pipelines([0])).unwrap();
    assert_eq!(t.session.state(), SessionState::Normal);
    assert_eq!(t.pipelines[0].flush_calls(), 1);
    assert_eq!(t.pipelines[1].flush_calls(), 0);
    assert_eq!(t.session.pipeline_live_pending(1), Some(1));

    t.pipelines[1].complete(0).unwrap();
    assert!(t.session.wait_for_idle(WAIT));
}

#[test]
fn test_pipeline_flush_keeps_earlier_queued_requests_of_other_pipelines() {
    let config = SessionConfig {
        flush_max_wait_ms: 2000,
        flush_padding_ms_per_request: 1000,
        ..fast_config()
    };
    let t = Arc::new(TestSession::with_pipelines(config, 2));

    // Occupy every job worker so both requests stay queued
    let workers = t.context.config().jobs.worker_threads.max(1);
    let started = Arc::new(Barrier::new(workers + 1));
    let release = Arc::new(Barrier::new(workers + 1));
    for _ in 0..workers {
        let started = Arc::clone(&started);
        let release = Arc::clone(&release);
        t.context
            .jobs()
            .post(Box::new(move || {
                started.wait();
                release.wait();
            }))
            .unwrap();
    }
    started.wait();

    t.session
        .process_capture_request(SessionRequest::single(request_for(0, 0, &[0])))
        .unwrap();
    t.session
        .process_capture_request(SessionRequest::single(request_for(1, 1, &[1])))
        .unwrap();
    assert_eq!(t.session.request_queue_len(), 2);

    let flusher = {
        let t = Arc::clone(&t);
        thread::spawn(move || t.session.flush(FlushInfo::pipelines([1])))
    };
    let deadline = Instant::now() + WAIT;
    while t.pipelines[1].flush_calls() == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(t.pipelines[1].flush_calls(), 1);
    release.wait();

    // The unflushed pipeline still gets its frame
    assert!(t.pipelines[0].wait_for_frames(1, WAIT));
    t.pipelines[0].complete(0).unwrap();

    assert!(flusher.join().unwrap().is_ok());
    assert!(t.session.wait_for_idle(WAIT));
    assert_eq!(t.session.state(), SessionState::Normal);
    assert_eq!(t.pipelines[1].submitted_frames(), 0);

    let results = t.sink.results();
    assert_eq!(errors_of(&results, ErrorKind::Request), vec![Some(1)]);
    let metadata = position(&results, |r| is_metadata_for(r, 0)).unwrap();
    let request_error = position(&results, |r| {
        matches!(
            r,
            SessionResult::Notify(NotifyMessage::Error {
                kind: ErrorKind::Request,
                sequence_id: Some(1),
                ..
            })
        )
    })
    .unwrap();
    assert!(metadata < request_error);
}

#[test]
fn test_metadata_slot_released_once_delivered_behind_blocked_head() {
    let config = SessionConfig {
        metabuffer_release_delay: 0,
        ..fast_config()
    };
    let t = TestSession::with_pipelines(config, 2);
    t.session
        .process_capture_request(SessionRequest::single(request_for(0, 0, &[0])))
        .unwrap();
    t.session
        .process_capture_request(SessionRequest::single(request_for(1, 1, &[1])))
        .unwrap();
    assert!(t.pipelines[0].wait_for_frames(1, WAIT));
    assert!(t.pipelines[1].wait_for_frames(1, WAIT));
    assert_eq!(t.pipelines[1].metadata_slots_in_use(), 1);

    // Sequence 0 keeps its buffer, so it stays at the head of the list
    t.pipelines[0].send_metadata(0).unwrap();
    t.pipelines[1].complete(1).unwrap();

    let deadline = Instant::now() + WAIT;
    while t.pipelines[1].metadata_slots_in_use() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(t.pipelines[1].metadata_slots_in_use(), 0);
    assert_eq!(t.pipelines[0].metadata_slots_in_use(), 1);
    assert_eq!(t.session.pending_results(), 2);

    t.pipelines[0].send_buffers(0).unwrap();
    assert!(t.session.wait_for_idle(WAIT));
    assert_eq!(t.pipelines[0].metadata_slots_in_use(), 0);
}

#[test]
fn test_state_dump_reports_stream_backlog_and_result_rate() {
    let t = TestSession::new(fast_config());
    for frame in 0..3 {
        t.session.process_capture_request(request(frame, &[0])).unwrap();
    }
    assert!(t.pipeline().wait_for_frames(3, WAIT));

    t.pipeline().complete(0).unwrap();
    assert!(t.sink.wait_for(WAIT, |r| r.iter().any(|r| is_metadata_for(r, 0))));
    thread::sleep(Duration::from_millis(5));
    t.pipeline().complete(1).unwrap();
    let deadline = Instant::now() + WAIT;
    while t.session.pending_results() > 1 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(2));
    }

    let dump = t.session.dump_state();
    assert!(dump.contains("stream0: next sequence Some(2) pending 1"), "{}", dump);
    assert!(dump.contains("result fps "), "{}", dump);
    assert!(!dump.contains("result fps n/a"), "{}", dump);

    t.pipeline().complete(2).unwrap();
    assert!(t.session.wait_for_idle(WAIT));
}

#[test]
fn test_flush_rejects_unknown_pipeline() {
    let t = TestSession::new(fast_config());
    assert!(matches!(
        t.session.flush(FlushInfo::pipelines([3])),
        Err(Error::InvalidArg(_))
    ));
    assert!(matches!(
        t.session.flush(FlushInfo::pipelines(Vec::new())),
        Err(Error::InvalidArg(_))
    ));
    assert_eq!(t.session.state(), SessionState::Normal);
}

#[test]
fn test_device_error_short_circuits() {
    let t = TestSession::new(fast_config());
    t.session.process_capture_request(request(0, &[0])).unwrap();
    assert!(t.pipeline().wait_for_frames(1, WAIT));

    t.pipeline().send_device_error().unwrap();
    assert!(t.session.get_device_in_error());

    let err = t.session.process_capture_request(request(1, &[0])).unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));

    let err = t
        .session
        .inject_result(0, 0, InjectedResult::MetadataError)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));

    assert!(t.sink.wait_for(WAIT, |r| !errors_of(r, ErrorKind::Device).is_empty()));
    assert!(t.session.flush(FlushInfo::session()).is_err());
}

#[test]
fn test_destroy_returns_outstanding_requests() {
    let t = TestSession::new(fast_config());
    t.session.process_capture_request(request(0, &[0, 1])).unwrap();
    t.session.process_capture_request(request(1, &[0])).unwrap();
    assert!(t.pipeline().wait_for_frames(2, WAIT));

    t.session.destroy().unwrap();
    assert_eq!(t.session.state(), SessionState::Destroying);

    let results = t.sink.results();
    assert_eq!(errors_of(&results, ErrorKind::Request), vec![Some(0), Some(1)]);
    let error_buffers: usize = t
        .sink
        .captures()
        .iter()
        .flat_map(|c| c.output_buffers.iter())
        .filter(|b| b.is_error())
        .count();
    assert_eq!(error_buffers, 3);
    assert_eq!(t.session.live_pending_requests(), 0);

    let err = t.session.process_capture_request(request(2, &[0])).unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
}

#[test]
fn test_rejected_submission_becomes_request_error() {
    let t = TestSession::new(fast_config());
    t.pipeline()
        .reject_next(Error::Failed("node allocation failed".to_string()));
    t.session.process_capture_request(request(0, &[0])).unwrap();

    assert!(t.session.wait_for_idle(WAIT));
    assert_eq!(errors_of(&t.sink.results(), ErrorKind::Request), vec![Some(0)]);
}

#[test]
fn test_invalid_requests_are_rejected() {
    let t = TestSession::new(fast_config());

    let empty = SessionRequest { requests: Vec::new() };
    assert!(matches!(
        t.session.process_capture_request(empty),
        Err(Error::InvalidArg(_))
    ));

    let mut missing = request_for(0, 1, &[0]);
    missing.output_metadata = None;
    assert!(matches!(
        t.session.process_capture_request(SessionRequest::single(missing)),
        Err(Error::InvalidPointer(_))
    ));

    let mut shared = request_for(0, 2, &[0]);
    shared.output_metadata = shared.input_metadata.clone();
    assert!(matches!(
        t.session.process_capture_request(SessionRequest::single(shared)),
        Err(Error::InvalidArg(_))
    ));

    assert!(matches!(
        t.session.process_capture_request(request(3, &[])),
        Err(Error::InvalidArg(_))
    ));
    assert!(matches!(
        t.session.process_capture_request(request(4, &[0, 0])),
        Err(Error::InvalidArg(_))
    ));
    assert!(matches!(
        t.session
            .process_capture_request(SessionRequest::single(request_for(5, 5, &[0]))),
        Err(Error::InvalidArg(_))
    ));

    assert_eq!(t.session.live_pending_requests(), 0);
}
