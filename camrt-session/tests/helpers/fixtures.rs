//! Session fixtures

use super::manual_pipeline::ManualPipeline;
use camrt_session::config::{SessionConfig, TomlConfig};
use camrt_session::metadata::MetaBuffer;
use camrt_session::pipeline::Pipeline;
use camrt_session::sink::CollectingSink;
use camrt_session::types::{
    FrameNumber, PipelineRequest, SessionRequest, StreamBuffer, StreamId,
};
use camrt_session::{AppContext, Session};
use std::sync::Arc;

/// Session configuration with short waits
pub fn fast_config() -> SessionConfig {
    SessionConfig {
        request_queue_depth: 4,
        partial_metadata_count: 0,
        admission_timeout_ms: 2000,
        admission_cold_start_ms_per_request: 0,
        flush_max_wait_ms: 100,
        flush_fallback_wait_ms: 50,
        fence_wait_timeout_ms: 50,
        batch_switch_wait_ms: 200,
        wait_poll_interval_ms: 2,
        ..SessionConfig::default()
    }
}

/// Request for pipeline 0 with one buffer per stream
pub fn request(frame_number: FrameNumber, streams: &[u32]) -> SessionRequest {
    SessionRequest::single(request_for(0, frame_number, streams))
}

pub fn request_for(pipeline_index: usize, frame_number: FrameNumber, streams: &[u32]) -> PipelineRequest {
    let mut request = PipelineRequest::new(pipeline_index, frame_number);
    for &stream in streams {
        request = request.with_output(StreamBuffer::new(StreamId(stream), frame_number * 10 + stream as u64));
    }
    request.input_metadata = Some(MetaBuffer::new());
    request.output_metadata = Some(MetaBuffer::new());
    request
}

/// Session over manual pipelines with a collecting sink
pub struct TestSession {
    pub context: Arc<AppContext>,
    pub session: Session,
    pub pipelines: Vec<Arc<ManualPipeline>>,
    pub sink: Arc<CollectingSink>,
}

impl TestSession {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_pipelines(config, 1)
    }

    pub fn with_pipelines(config: SessionConfig, count: usize) -> Self {
        let context = AppContext::new(TomlConfig {
            session: config.clone(),
            ..TomlConfig::default()
        });
        let pipelines: Vec<Arc<ManualPipeline>> = (0..count).map(ManualPipeline::new).collect();
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
        .expect("session creation");
        session.stream_on().expect("stream on");

        Self {
            context,
            session,
            pipelines,
            sink,
        }
    }

    pub fn pipeline(&self) -> &ManualPipeline {
        &self.pipelines[0]
    }
}

impl Drop for TestSession {
    fn drop(&mut self) {
        let _ = self.session.destroy();
        self.context.shutdown();
    }
}
