//! Configuration for the session runtime
//!
//! Loaded from a TOML file resolved by `camrt_common::config`:
//!
//! ```toml
//! [logging]
//! level = "info"
//!
//! [jobs]
//! worker_threads = 2
//!
//! [session]
//! request_queue_depth = 8
//! num_batched_frames = 1
//! ```
//!
//! Every key is optional; missing keys take the built-in defaults below.

use crate::error::{Error, Result};
use camrt_common::config::{load_or_default, resolve_config_path, ConfigSource, LoggingConfig};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Multiplier from request queue depth to the size of the sequence-id rings
pub const QUEUE_DEPTH_MULTIPLIER: u32 = 8;

/// Top-level configuration file
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    /// Logging configuration (optional)
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Shared job pool configuration
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Default session parameters
    #[serde(default)]
    pub session: SessionConfig,
}

/// Job pool configuration
#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    /// Number of worker threads shared by all sessions
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
        }
    }
}

fn default_worker_threads() -> usize {
    2
}

/// Per-session tunables
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum live pending requests in non-batched mode
    pub request_queue_depth: u32,

    /// Frames per batch when a request enables batching
    pub num_batched_frames: u32,

    /// Early (partial) metadata deliveries per request, 0 or 1
    pub partial_metadata_count: u32,

    /// Base admission wait
    pub admission_timeout_ms: u64,

    /// Extra admission wait per live request while cold starting
    pub admission_cold_start_ms_per_request: u64,

    /// Exposures longer than this extend the admission wait
    pub long_exposure_threshold_ms: u64,

    /// Abort the process when admission times out
    pub abort_on_admission_timeout: bool,

    /// Enter recovery when admission times out
    pub enable_recovery: bool,

    /// Flush wait padding per live request
    pub flush_padding_ms_per_request: u64,

    /// Upper bound on the normal flush wait
    pub flush_max_wait_ms: u64,

    /// Extra wait before forcing pending nodes to flush
    pub flush_fallback_wait_ms: u64,

    /// Abort the process when a flush times out
    pub abort_on_flush_timeout: bool,

    /// Bound on each input acquire-fence wait
    pub fence_wait_timeout_ms: u64,

    /// Bound on draining in-flight work when switching batch mode
    pub batch_switch_wait_ms: u64,

    /// Requests to keep a completed metadata slot before releasing it
    pub metabuffer_release_delay: u32,

    /// Re-evaluation slice for waits that depend on external state
    pub wait_poll_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_queue_depth: 8,
            num_batched_frames: 1,
            partial_metadata_count: 1,
            admission_timeout_ms: 300,
            admission_cold_start_ms_per_request: 100,
            long_exposure_threshold_ms: 200,
            abort_on_admission_timeout: false,
            enable_recovery: true,
            flush_padding_ms_per_request: 20,
            flush_max_wait_ms: 2000,
            flush_fallback_wait_ms: 500,
            abort_on_flush_timeout: false,
            fence_wait_timeout_ms: 100,
            batch_switch_wait_ms: 1000,
            metabuffer_release_delay: 2,
            wait_poll_interval_ms: 5,
        }
    }
}

impl SessionConfig {
    /// Reject values the session cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.request_queue_depth < 2 {
            return Err(Error::Config(format!(
                "session.request_queue_depth must be >= 2 (got {})",
                self.request_queue_depth
            )));
        }
        if self.num_batched_frames == 0 {
            return Err(Error::Config(
                "session.num_batched_frames must be >= 1".to_string(),
            ));
        }
        if self.partial_metadata_count > 1 {
            return Err(Error::Config(format!(
                "session.partial_metadata_count must be 0 or 1 (got {})",
                self.partial_metadata_count
            )));
        }
        if self.flush_max_wait_ms == 0 {
            return Err(Error::Config(
                "session.flush_max_wait_ms must be > 0".to_string(),
            ));
        }
        if self.wait_poll_interval_ms == 0 {
            return Err(Error::Config(
                "session.wait_poll_interval_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Capacity of the result list and sequence-indexed rings
    pub fn max_queue_depth(&self) -> usize {
        (self.request_queue_depth * self.num_batched_frames.max(1) * QUEUE_DEPTH_MULTIPLIER)
            as usize
    }

    /// Live pending limit for the given batching mode
    pub fn max_live_pending(&self, batching: bool) -> u32 {
        if batching {
            self.request_queue_depth * self.num_batched_frames
        } else {
            self.request_queue_depth
        }
    }

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }

    pub fn fence_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_wait_timeout_ms)
    }

    pub fn batch_switch_wait(&self) -> Duration {
        Duration::from_millis(self.batch_switch_wait_ms)
    }

    pub fn flush_max_wait(&self) -> Duration {
        Duration::from_millis(self.flush_max_wait_ms)
    }

    pub fn flush_fallback_wait(&self) -> Duration {
        Duration::from_millis(self.flush_fallback_wait_ms)
    }

    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }
}

impl TomlConfig {
    /// Resolve, load and validate the configuration file
    ///
    /// Resolution order: `cli_path`, then `CAMRT_CONFIG`, then the user
    /// config directory, then built-in defaults.
    pub fn load(cli_path: Option<&Path>) -> Result<(Self, ConfigSource)> {
        let source = resolve_config_path(cli_path, camrt_common::config::CONFIG_ENV_VAR);
        let config: TomlConfig = load_or_default(&source)?;
        config.session.validate()?;

        match source.path() {
            Some(path) => info!("Configuration loaded from {}", path.display()),
            None => info!("Using built-in default configuration"),
        }

        Ok((config, source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_queue_depth(), 64);
        assert_eq!(config.max_live_pending(false), 8);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: TomlConfig = toml::from_str(
            r#"
            [session]
            request_queue_depth = 4
            num_batched_frames = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.session.request_queue_depth, 4);
        assert_eq!(config.session.max_live_pending(true), 16);
        assert_eq!(config.session.admission_timeout_ms, 300);
        assert_eq!(config.jobs.worker_threads, 2);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = SessionConfig {
            request_queue_depth: 1,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = SessionConfig {
            partial_metadata_count: 3,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
