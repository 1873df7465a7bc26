//! camrt-sim - drive a session with simulated pipelines
//!
//! Builds an application context from the TOML configuration, attaches
//! simulated pipelines to one session, submits frames and reports what came
//! back. Useful for exercising admission, ordering and flush behaviour
//! without hardware.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use camrt_session::metadata::{tags, MetaBuffer, MetadataValue};
use camrt_session::pipeline::StreamOffMode;
use camrt_session::sim::{SimConfig, SimulatedPipeline};
use camrt_session::sink::CollectingSink;
use camrt_session::types::{
    ErrorKind, NotifyMessage, PipelineRequest, SessionRequest, SessionResult, StreamBuffer,
    StreamId,
};
use camrt_session::{AppContext, FlushInfo, Pipeline, Session, TomlConfig};
use clap::Parser;
use serde::Serialize;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for camrt-sim
#[derive(Parser, Debug)]
#[command(name = "camrt-sim")]
#[command(about = "Run a camera session against simulated pipelines")]
#[command(version)]
struct Args {
    /// Configuration file (overrides CAMRT_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Frames to submit
    #[arg(short, long, default_value = "120")]
    frames: u64,

    /// Pipelines in the session's sync group
    #[arg(short, long, default_value = "1")]
    pipelines: usize,

    /// Output streams per pipeline
    #[arg(short, long, default_value = "2")]
    streams: u32,

    /// Maximum random delay per simulated result
    #[arg(long, default_value = "15")]
    jitter_ms: u64,

    /// Flush the session after every N frames (0 disables)
    #[arg(long, default_value = "0")]
    flush_every: u64,

    /// Random seed for the simulated pipelines
    #[arg(long, default_value = "1")]
    seed: u64,

    /// Print the run summary as JSON on stdout
    #[arg(long)]
    json: bool,
}

/// Totals of one run
#[derive(Debug, Serialize)]
struct RunSummary {
    batches: usize,
    shutters: usize,
    captures: usize,
    buffers: usize,
    /// Request and result errors; buffer errors are counted with buffers
    errors: usize,
    ordered: bool,
    elapsed_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let (config, source) =
        TomlConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("camrt_session={}", config.logging.level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "camrt-sim {} (git {}, built {}, {})",
        env!("CARGO_PKG_VERSION"),
        env!("CAMRT_GIT_HASH"),
        env!("CAMRT_BUILD_TIMESTAMP"),
        env!("CAMRT_BUILD_PROFILE")
    );
    info!("Configuration: {:?}", source);

    let context = AppContext::new(config);
    let sink = Arc::new(CollectingSink::new());

    let mut pipelines: Vec<Arc<dyn Pipeline>> = Vec::with_capacity(args.pipelines);
    for index in 0..args.pipelines {
        let sim = SimulatedPipeline::new(
            format!("sim{}", index),
            index,
            SimConfig {
                jitter: Duration::from_millis(args.jitter_ms),
                seed: args.seed,
                ..SimConfig::default()
            },
        )
        .context("Failed to create simulated pipeline")?;
        pipelines.push(sim);
    }

    let session = Arc::new(
        Session::new(Arc::clone(&context), pipelines, sink.clone())
            .context("Failed to create session")?,
    );
    session.stream_on().context("Failed to stream on")?;

    let stop = Arc::new(AtomicBool::new(false));
    let submitter = {
        let session = Arc::clone(&session);
        let stop = Arc::clone(&stop);
        let args = SubmitArgs {
            frames: args.frames,
            pipelines: args.pipelines,
            streams: args.streams,
            flush_every: args.flush_every,
        };
        tokio::task::spawn_blocking(move || submit_frames(&session, &args, &stop))
    };

    let started = Instant::now();
    tokio::select! {
        result = submitter => {
            let submitted = result.context("Submitter task failed")?;
            info!("Submitted {} frames", submitted);
        }
        _ = shutdown_signal() => {
            stop.store(true, Ordering::Release);
        }
    }

    if !session.wait_for_idle(Duration::from_secs(5)) {
        warn!("Session did not drain; dumping state");
        session.dump_state();
    }
    let elapsed = started.elapsed();

    if let Err(e) = session.stream_off(StreamOffMode::Default) {
        warn!("Stream off failed: {}", e);
    }
    if let Err(e) = session.destroy() {
        error!("Destroy failed: {}", e);
    }
    report(&sink, elapsed, args.json);

    drop(session);
    context.shutdown();
    info!("camrt-sim finished");
    Ok(())
}

struct SubmitArgs {
    frames: u64,
    pipelines: usize,
    streams: u32,
    flush_every: u64,
}

fn build_request(frame_number: u64, args: &SubmitArgs) -> SessionRequest {
    let requests = (0..args.pipelines)
        .map(|pipeline_index| {
            let mut request = PipelineRequest::new(pipeline_index, frame_number);
            for s in 0..args.streams {
                let stream = StreamId(pipeline_index as u32 * args.streams + s);
                request = request.with_output(StreamBuffer::new(stream, frame_number));
            }
            request.input_metadata = Some(MetaBuffer::with_entries([(
                tags::SENSOR_EXPOSURE_TIME,
                MetadataValue::Int(10_000_000),
            )]));
            request.output_metadata = Some(MetaBuffer::new());
            request
        })
        .collect();
    SessionRequest { requests }
}

fn submit_frames(session: &Session, args: &SubmitArgs, stop: &AtomicBool) -> u64 {
    let mut submitted = 0;
    for frame_number in 0..args.frames {
        if stop.load(Ordering::Acquire) {
            info!("Stopping submission at frame {}", frame_number);
            break;
        }

        match session.process_capture_request(build_request(frame_number, args)) {
            Ok(()) => submitted += 1,
            Err(e) if e.is_cancelled() => {
                warn!("Frame {} cancelled ({}), recovering", frame_number, e);
                if let Err(e) = session.recover() {
                    error!("Recovery failed: {}", e);
                    break;
                }
            }
            Err(e) => {
                error!("Frame {} rejected: {}", frame_number, e);
                if session.get_device_in_error() {
                    break;
                }
            }
        }

        if args.flush_every > 0 && (frame_number + 1) % args.flush_every == 0 {
            if let Err(e) = session.flush(FlushInfo::session()) {
                warn!("Flush after frame {} failed: {}", frame_number, e);
            }
        }
    }
    submitted
}

fn report(sink: &CollectingSink, elapsed: Duration, json: bool) {
    let results = sink.results();
    let mut shutters = 0;
    let mut errors = 0;
    for result in &results {
        match result {
            SessionResult::Notify(NotifyMessage::Shutter { .. }) => shutters += 1,
            SessionResult::Notify(NotifyMessage::Error { kind, .. }) if *kind != ErrorKind::Buffer => {
                errors += 1
            }
            _ => {}
        }
    }
    let captures = sink.captures();
    let order = sink.sequence_order();

    let summary = RunSummary {
        batches: sink.batch_count(),
        shutters,
        captures: captures.len(),
        buffers: captures.iter().map(|c| c.output_buffers.len()).sum(),
        errors,
        ordered: order.windows(2).all(|w| w[0] <= w[1]),
        elapsed_ms: elapsed.as_millis() as u64,
    };

    info!(
        "Summary: {} batches, {} shutters, {} captures, {} buffers, {} request/result errors, ordered: {}, {:.1}s",
        summary.batches,
        summary.shutters,
        summary.captures,
        summary.buffers,
        summary.errors,
        summary.ordered,
        elapsed.as_secs_f64()
    );

    if json {
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => error!("Failed to serialize summary: {}", e),
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
