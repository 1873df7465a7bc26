//! End-to-end runs against the simulated pipeline
//!
//! Jittered results arrive out of order; the client must still see every
//! frame exactly once, in order, with early metadata ahead of the final
//! result.

use camrt_session::config::{SessionConfig, TomlConfig};
use camrt_session::pipeline::Pipeline;
use camrt_session::sim::{SimConfig, SimulatedPipeline, StallMode};
use camrt_session::sink::CollectingSink;
use camrt_session::types::{
    NotifyMessage, PipelineRequest, SessionRequest, SessionResult, StreamBuffer, StreamId,
};
use camrt_session::{AppContext, FlushInfo, Session};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const FRAMES: u64 = 24;

fn session_config() -> SessionConfig {
    SessionConfig {
        request_queue_depth: 6,
        partial_metadata_count: 1,
        admission_cold_start_ms_per_request: 0,
        flush_max_wait_ms: 200,
        flush_fallback_wait_ms: 100,
        wait_poll_interval_ms: 2,
        ..SessionConfig::default()
    }
}

fn sim_config(seed: u64) -> SimConfig {
    SimConfig {
        base_latency: Duration::from_millis(1),
        jitter: Duration::from_millis(6),
        flush_response_time: Duration::from_millis(30),
        seed,
        ..SimConfig::default()
    }
}

struct SimSession {
    context: Arc<AppContext>,
    session: Session,
    pipelines: Vec<Arc<SimulatedPipeline>>,
    sink: Arc<CollectingSink>,
}

impl SimSession {
    fn new(num_pipelines: usize) -> Self {
        let config = session_config();
        let context = AppContext::new(TomlConfig {
            session: config.clone(),
            ..TomlConfig::default()
        });
        let pipelines: Vec<Arc<SimulatedPipeline>> = (0..num_pipelines)
            .map(|i| SimulatedPipeline::new(format!("sim{}", i), i, sim_config(7 + i as u64)).unwrap())
            .collect();
        let sink = Arc::new(CollectingSink::new());
        let session = Session::with_config(
            Arc::clone(&context),
            config,
            pipelines
                .iter()
                .map(|p| Arc::clone(p) as Arc<dyn Pipeline>)
                .collect(),
            sink.clone(),
        )
        .unwrap();
        session.stream_on().unwrap();
        Self {
            context,
            session,
            pipelines,
            sink,
        }
    }

    fn submit(&self, frame_number: u64) {
        let requests = (0..self.pipelines.len())
            .map(|p| {
                let base = p as u32 * 2;
                PipelineRequest::new(p, frame_number)
                    .with_output(StreamBuffer::new(StreamId(base), frame_number))
                    .with_output(StreamBuffer::new(StreamId(base + 1), frame_number))
            })
            .collect();
        self.session
            .process_capture_request(SessionRequest { requests })
            .unwrap();
    }
}

impl Drop for SimSession {
    fn drop(&mut self) {
        let _ = self.session.destroy();
        self.context.shutdown();
    }
}

#[test]
fn test_jittered_results_delivered_in_order() {
    let s = SimSession::new(2);
    for frame in 0..FRAMES {
        s.submit(frame);
    }
    assert!(s.session.wait_for_idle(Duration::from_secs(5)));

    let results = s.sink.results();

    // One shutter per pipeline per frame, in frame order
    let shutters: Vec<u64> = results
        .iter()
        .filter_map(|r| match r {
            SessionResult::Notify(NotifyMessage::Shutter { frame_number, .. }) => Some(*frame_number),
            _ => None,
        })
        .collect();
    assert_eq!(shutters.len(), (FRAMES * 2) as usize);
    assert!(shutters.windows(2).all(|w| w[0] <= w[1]));

    // Per pipeline and stream, buffers leave in frame order
    let mut last: BTreeMap<(usize, StreamId), u64> = BTreeMap::new();
    let mut buffers = 0;
    for capture in s.sink.captures() {
        for buffer in &capture.output_buffers {
            assert!(!buffer.is_error());
            let key = (capture.pipeline_index, buffer.stream);
            if let Some(&previous) = last.get(&key) {
                assert!(previous < capture.frame_number);
            }
            last.insert(key, capture.frame_number);
            buffers += 1;
        }
    }
    assert_eq!(buffers, (FRAMES * 2 * 2) as usize);

    // Early partial result precedes the final one for every frame
    for pipeline in 0..2 {
        let partials: Vec<u32> = s
            .sink
            .captures()
            .into_iter()
            .filter(|c| c.pipeline_index == pipeline && c.frame_number == 3 && c.metadata.is_some())
            .map(|c| c.num_partial_metadata)
            .collect();
        assert_eq!(partials, vec![1, 2]);
    }

    assert!(s.pipelines.iter().all(|p| p.delivered() > 0));
    assert_eq!(s.session.admission_snapshot().total_released, FRAMES);
}

#[test]
fn test_flush_with_stalled_device_needs_forced_nodes() {
    let s = SimSession::new(1);
    s.pipelines[0].set_stall_mode(StallMode::UntilForced);
    for frame in 0..3 {
        s.submit(frame);
    }
    std::thread::sleep(Duration::from_millis(30));

    s.session.flush(FlushInfo::session()).unwrap();
    assert_eq!(s.session.live_pending_requests(), 0);

    // Flushed work comes back as errors, still in order
    let order = s.sink.sequence_order();
    assert!(order.windows(2).all(|w| w[0] <= w[1]));

    s.pipelines[0].set_stall_mode(StallMode::None);
    s.submit(10);
    assert!(s.session.wait_for_idle(Duration::from_secs(2)));
    assert!(s
        .sink
        .captures()
        .iter()
        .any(|c| c.frame_number == 10 && c.output_buffers.iter().all(|b| !b.is_error())));
}

#[test]
fn test_device_error_from_simulated_pipeline() {
    let s = SimSession::new(1);
    s.submit(0);
    s.pipelines[0].inject_device_error();

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while !s.session.get_device_in_error() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(s.session.get_device_in_error());
    assert!(s.session.flush(FlushInfo::session()).is_err());
}
