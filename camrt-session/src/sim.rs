//! Simulated pipeline
//!
//! Stands in for a real processing graph in the `camrt-sim` binary and in
//! tests. Each submitted frame produces early metadata, a shutter, final
//! metadata and one buffer per output stream, each at its own jittered
//! time so that results arrive out of order across requests.
//!
//! Callbacks run on the pipeline's scheduler thread (or the flushing
//! thread) with no pipeline lock held.

use crate::error::{Error, Result};
use crate::metadata::{tags, MetaBuffer, MetadataPool, MetadataValue, SlotMetadataPool};
use crate::pipeline::{Pipeline, PipelineStatus, StreamOffMode};
use crate::session::{CallbackPayload, PipelineErrorKind, ResultsData, SessionHandle};
use crate::types::{PipelineProcessRequestData, RequestId, SequenceId, StreamBuffer};
use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// How a simulated device misbehaves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StallMode {
    #[default]
    None,
    /// Work is held until `flush_pending_nodes`
    UntilForced,
    /// Work is never returned
    Forever,
}

/// Simulated pipeline parameters
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Time from submission to the first result
    pub base_latency: Duration,
    /// Upper bound of the random delay added to each result
    pub jitter: Duration,
    /// Emit early metadata before the final metadata
    pub early_metadata: bool,
    pub flush_response_time: Duration,
    /// Metadata pool depth
    pub metadata_depth: usize,
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            base_latency: Duration::from_millis(5),
            jitter: Duration::from_millis(10),
            early_metadata: true,
            flush_response_time: Duration::from_millis(100),
            metadata_depth: 64,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone)]
enum SimEventKind {
    EarlyMetadata(Arc<MetaBuffer>),
    Shutter(u64),
    Metadata(Arc<MetaBuffer>),
    Buffer(StreamBuffer),
}

#[derive(Debug, Clone)]
struct SimEvent {
    request_id: RequestId,
    sequence_id: SequenceId,
    kind: SimEventKind,
}

impl SimEvent {
    /// Error callback returning this event's work, if it carries any
    fn into_error(self, pipeline_index: usize) -> Option<ResultsData> {
        let payload = match self.kind {
            SimEventKind::EarlyMetadata(_) | SimEventKind::Shutter(_) => return None,
            SimEventKind::Metadata(_) => CallbackPayload::Error {
                sequence_id: Some(self.sequence_id),
                kind: PipelineErrorKind::Metadata,
                stream: None,
            },
            SimEventKind::Buffer(buffer) => CallbackPayload::Buffer {
                sequence_id: self.sequence_id,
                buffer: buffer.into_error(),
            },
        };
        Some(ResultsData::new(pipeline_index, payload))
    }

    fn into_result(self, pipeline_index: usize) -> ResultsData {
        let sequence_id = self.sequence_id;
        let payload = match self.kind {
            SimEventKind::EarlyMetadata(metadata) => CallbackPayload::EarlyMetadata {
                sequence_id,
                metadata,
            },
            SimEventKind::Shutter(timestamp) => CallbackPayload::Async {
                sequence_id,
                timestamp,
            },
            SimEventKind::Metadata(metadata) => CallbackPayload::Metadata {
                sequence_id,
                metadata,
            },
            SimEventKind::Buffer(buffer) => CallbackPayload::Buffer {
                sequence_id,
                buffer,
            },
        };
        ResultsData::new(pipeline_index, payload)
    }

    fn carries_work(&self) -> bool {
        matches!(self.kind, SimEventKind::Metadata(_) | SimEventKind::Buffer(_))
    }
}

#[derive(Default)]
struct SimQueue {
    /// Keyed by (due time, insertion order)
    scheduled: BTreeMap<(Instant, u64), SimEvent>,
    /// Work withheld by a stalled device
    held: Vec<SimEvent>,
    /// Work events still to deliver, per request
    outstanding: HashMap<RequestId, usize>,
    next_order: u64,
}

impl SimQueue {
    fn schedule(&mut self, due: Instant, event: SimEvent) {
        if event.carries_work() {
            *self.outstanding.entry(event.request_id).or_default() += 1;
        }
        self.scheduled.insert((due, self.next_order), event);
        self.next_order += 1;
    }

    /// Returns the request id once its last work event was taken
    fn complete(&mut self, event: &SimEvent) -> Option<RequestId> {
        if !event.carries_work() {
            return None;
        }
        let remaining = self.outstanding.get_mut(&event.request_id)?;
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.outstanding.remove(&event.request_id);
            Some(event.request_id)
        } else {
            None
        }
    }

    fn take_all(&mut self) -> Vec<SimEvent> {
        let mut events: Vec<SimEvent> = std::mem::take(&mut self.scheduled).into_values().collect();
        events.append(&mut self.held);
        events
    }

    fn is_idle(&self) -> bool {
        self.scheduled.is_empty() && self.held.is_empty()
    }
}

struct SimShared {
    name: String,
    index: usize,
    config: SimConfig,
    session: Mutex<Option<SessionHandle>>,
    queue: Mutex<SimQueue>,
    condvar: Condvar,
    rng: Mutex<StdRng>,
    pool: Arc<SlotMetadataPool>,
    status: Mutex<PipelineStatus>,
    stall: Mutex<StallMode>,
    flushing: AtomicBool,
    recovering: AtomicBool,
    stop: AtomicBool,
    epoch: Instant,
    delivered: AtomicU64,
}

impl SimShared {
    fn session(&self) -> Option<SessionHandle> {
        self.session.lock().clone()
    }

    /// Deliver callbacks; no lock of this pipeline is held
    fn deliver(&self, callbacks: Vec<ResultsData>) {
        let Some(session) = self.session() else {
            return;
        };
        for data in callbacks {
            if let Err(e) = session.notify_result(data) {
                debug!(pipeline = self.index, "Callback rejected: {}", e);
            }
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn jitter(&self) -> Duration {
        let max = self.config.jitter.as_micros() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.rng.lock().gen_range(0..=max))
    }

    fn scheduler_loop(self: Arc<Self>) {
        debug!("Simulated pipeline {} scheduler started", self.name);

        loop {
            let due = {
                let mut queue = self.queue.lock();
                loop {
                    if self.stop.load(Ordering::Acquire) {
                        debug!("Simulated pipeline {} scheduler exiting", self.name);
                        return;
                    }
                    let now = Instant::now();
                    match queue.scheduled.keys().next().copied() {
                        Some(key) if key.0 <= now => break,
                        Some(key) => {
                            self.condvar.wait_until(&mut queue, key.0);
                        }
                        None => self.condvar.wait(&mut queue),
                    }
                }

                let now = Instant::now();
                let mut due = Vec::new();
                while let Some(entry) = queue.scheduled.first_entry() {
                    if entry.key().0 > now {
                        break;
                    }
                    due.push(entry.remove());
                }
                due.into_iter()
                    .map(|event| {
                        let done = queue.complete(&event);
                        (event, done)
                    })
                    .collect::<Vec<_>>()
            };

            let mut callbacks = Vec::with_capacity(due.len());
            for (event, done) in due {
                trace!(
                    pipeline = self.index,
                    sequence_id = event.sequence_id,
                    "Delivering simulated result"
                );
                callbacks.push(event.into_result(self.index));
                if let Some(request_id) = done {
                    callbacks.push(ResultsData::new(
                        self.index,
                        CallbackPayload::MetaBufferDone { request_id },
                    ));
                }
            }
            self.deliver(callbacks);
        }
    }

    /// Convert withheld or scheduled work into error callbacks
    fn return_as_errors(&self, events: Vec<SimEvent>) -> Vec<ResultsData> {
        let mut queue = self.queue.lock();
        let mut callbacks = Vec::new();
        for event in events {
            let done = queue.complete(&event);
            if let Some(callback) = event.into_error(self.index) {
                callbacks.push(callback);
            }
            if let Some(request_id) = done {
                callbacks.push(ResultsData::new(
                    self.index,
                    CallbackPayload::MetaBufferDone { request_id },
                ));
            }
        }
        callbacks
    }
}

/// Pipeline that fabricates results on its own scheduler thread
pub struct SimulatedPipeline {
    shared: Arc<SimShared>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedPipeline {
    /// `index` is the pipeline's position in the session's pipeline list
    pub fn new(name: impl Into<String>, index: usize, config: SimConfig) -> Result<Arc<Self>> {
        let shared = Arc::new(SimShared {
            name: name.into(),
            index,
            pool: Arc::new(SlotMetadataPool::new(config.metadata_depth)),
            rng: Mutex::new(StdRng::seed_from_u64(config.seed.wrapping_add(index as u64))),
            config,
            session: Mutex::new(None),
            queue: Mutex::new(SimQueue::default()),
            condvar: Condvar::new(),
            status: Mutex::new(PipelineStatus::Initialized),
            stall: Mutex::new(StallMode::None),
            flushing: AtomicBool::new(false),
            recovering: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            epoch: Instant::now(),
            delivered: AtomicU64::new(0),
        });

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("camrt-sim-{}", index))
            .spawn(move || worker.scheduler_loop())
            .map_err(|e| Error::Failed(format!("failed to spawn simulator thread: {}", e)))?;

        info!("Simulated pipeline {} ready", shared.name);
        Ok(Arc::new(Self {
            shared,
            scheduler: Mutex::new(Some(handle)),
        }))
    }

    pub fn set_stall_mode(&self, mode: StallMode) {
        info!("Simulated pipeline {} stall mode {:?}", self.shared.name, mode);
        *self.shared.stall.lock() = mode;
    }

    /// Report a device error to the session
    pub fn inject_device_error(&self) {
        self.shared.deliver(vec![ResultsData::new(
            self.shared.index,
            CallbackPayload::Error {
                sequence_id: None,
                kind: PipelineErrorKind::Device,
                stream: None,
            },
        )]);
    }

    /// Callbacks delivered so far
    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::Relaxed)
    }

    pub fn is_recovering(&self) -> bool {
        self.shared.recovering.load(Ordering::Acquire)
    }

    pub fn pool(&self) -> &SlotMetadataPool {
        &self.shared.pool
    }

    fn timestamp_now(&self) -> u64 {
        self.shared.epoch.elapsed().as_nanos() as u64
    }
}

impl Pipeline for SimulatedPipeline {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn bind_session(&self, session: SessionHandle) {
        *self.shared.session.lock() = Some(session);
    }

    fn open_request(
        &self,
        request_id: RequestId,
        sync_id: u64,
        _is_sync_mode: bool,
        expected_exposure_time_ms: u32,
    ) -> Result<()> {
        if self.shared.flushing.load(Ordering::Acquire) {
            return Err(Error::CancelledRequest(format!(
                "{} is flushing",
                self.shared.name
            )));
        }
        trace!(
            pipeline = self.shared.index,
            request_id,
            sync_id,
            expected_exposure_time_ms,
            "Request opened"
        );
        Ok(())
    }

    fn process_request(&self, data: PipelineProcessRequestData) -> Result<()> {
        if self.shared.flushing.load(Ordering::Acquire) {
            return Err(Error::CancelledRequest(format!(
                "{} is flushing",
                self.shared.name
            )));
        }

        let request_id = data.request_id;
        if let Err(e) = self.shared.pool.set_metadata_by_tag(
            request_id,
            tags::SENSOR_FRAME_DURATION,
            MetadataValue::Int(33_333_333),
        ) {
            debug!(request_id, "Metadata slot not assigned: {}", e);
        }

        let stall = *self.shared.stall.lock();
        let start = Instant::now() + self.shared.config.base_latency;
        let mut events = Vec::new();

        for frame in data.frames {
            let sequence_id = frame.sequence_id;
            let timestamp = self.timestamp_now();
            let exposure = frame
                .input_metadata
                .get_int(tags::SENSOR_EXPOSURE_TIME)
                .unwrap_or(10_000_000);

            let shutter_at = start + self.shared.jitter();
            if self.shared.config.early_metadata {
                let early = MetaBuffer::with_entries([(
                    tags::SENSOR_EXPOSURE_TIME,
                    MetadataValue::Int(exposure),
                )]);
                events.push((
                    shutter_at,
                    SimEvent {
                        request_id,
                        sequence_id,
                        kind: SimEventKind::EarlyMetadata(early),
                    },
                ));
            }
            events.push((
                shutter_at,
                SimEvent {
                    request_id,
                    sequence_id,
                    kind: SimEventKind::Shutter(timestamp),
                },
            ));

            let metadata = MetaBuffer::with_entries([
                (tags::SENSOR_TIMESTAMP, MetadataValue::Int(timestamp as i64)),
                (tags::SENSOR_EXPOSURE_TIME, MetadataValue::Int(exposure)),
            ]);
            events.push((
                shutter_at + self.shared.jitter(),
                SimEvent {
                    request_id,
                    sequence_id,
                    kind: SimEventKind::Metadata(metadata),
                },
            ));

            for buffer in frame.output_buffers {
                events.push((
                    shutter_at + self.shared.jitter(),
                    SimEvent {
                        request_id,
                        sequence_id,
                        kind: SimEventKind::Buffer(buffer),
                    },
                ));
            }
        }

        let mut queue = self.shared.queue.lock();
        for (due, event) in events {
            if stall != StallMode::None && event.carries_work() {
                *queue.outstanding.entry(event.request_id).or_default() += 1;
                queue.held.push(event);
            } else {
                queue.schedule(due, event);
            }
        }
        drop(queue);
        self.shared.condvar.notify_one();
        Ok(())
    }

    fn stream_on(&self) -> Result<()> {
        *self.shared.status.lock() = PipelineStatus::StreamedOn;
        Ok(())
    }

    fn stream_off(&self, mode: StreamOffMode) -> Result<()> {
        *self.shared.status.lock() = PipelineStatus::StreamedOff;
        if mode == StreamOffMode::Immediate {
            let mut queue = self.shared.queue.lock();
            let dropped = queue.take_all().len();
            queue.outstanding.clear();
            if dropped > 0 {
                debug!("{} discarded {} events on stream off", self.shared.name, dropped);
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.shared.flushing.store(true, Ordering::Release);
        let stall = *self.shared.stall.lock();

        let events = {
            let mut queue = self.shared.queue.lock();
            let mut events: Vec<SimEvent> =
                std::mem::take(&mut queue.scheduled).into_values().collect();
            if stall == StallMode::None {
                events.append(&mut queue.held);
            }
            events
        };

        let callbacks = self.shared.return_as_errors(events);
        debug!(
            "{} flushed, returning {} results as errors",
            self.shared.name,
            callbacks.len()
        );
        self.shared.deliver(callbacks);
        Ok(())
    }

    fn flush_pending_nodes(&self) {
        let stall = *self.shared.stall.lock();
        if stall == StallMode::Forever {
            warn!("{} ignores forced node flush", self.shared.name);
            return;
        }
        let events = std::mem::take(&mut self.shared.queue.lock().held);
        let callbacks = self.shared.return_as_errors(events);
        self.shared.deliver(callbacks);
    }

    fn status(&self) -> PipelineStatus {
        *self.shared.status.lock()
    }

    fn all_nodes_done(&self) -> bool {
        self.shared.queue.lock().is_idle()
    }

    fn flush_response_time(&self) -> Duration {
        self.shared.config.flush_response_time
    }

    fn set_flush_in_progress(&self, flushing: bool) {
        self.shared.flushing.store(flushing, Ordering::Release);
    }

    fn notify_triggering_recovery(&self, recovering: bool) {
        self.shared.recovering.store(recovering, Ordering::Release);
    }

    fn metadata_pool(&self) -> Arc<dyn MetadataPool> {
        self.shared.pool.clone()
    }
}

impl Drop for SimulatedPipeline {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        {
            let _queue = self.shared.queue.lock();
            self.shared.condvar.notify_all();
        }
        if let Some(handle) = self.scheduler.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("Simulated pipeline {} scheduler panicked", self.shared.name);
            }
        }
    }
}
