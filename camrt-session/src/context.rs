//! Application context
//!
//! Owns the process-wide services a session needs: the shared job pool and
//! the session event bus. Constructed once by the binary (or per test) and
//! handed to sessions by `Arc`.

use crate::config::TomlConfig;
use crate::worker::JobPool;
use camrt_common::SessionEvent;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Shared services for all sessions in the process
pub struct AppContext {
    config: TomlConfig,

    /// Worker pool running session jobs
    jobs: JobPool,

    /// Event broadcaster for lifecycle events
    event_tx: broadcast::Sender<SessionEvent>,
}

impl AppContext {
    /// Create context with its job pool started
    pub fn new(config: TomlConfig) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let jobs = JobPool::new(config.jobs.worker_threads);

        Arc::new(Self {
            config,
            jobs,
            event_tx,
        })
    }

    /// Loaded configuration
    pub fn config(&self) -> &TomlConfig {
        &self.config
    }

    /// Shared job pool
    pub fn jobs(&self) -> &JobPool {
        &self.jobs
    }

    /// Broadcast an event to all subscribers
    ///
    /// Having no subscribers is not an error.
    pub fn broadcast_event(&self, event: SessionEvent) {
        trace!("Broadcasting event: {}", event.event_type());
        let _ = self.event_tx.send(event);
    }

    /// Subscribe to session events
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Stop the job pool and join its threads
    pub fn shutdown(&self) {
        self.jobs.shutdown();
    }
}
