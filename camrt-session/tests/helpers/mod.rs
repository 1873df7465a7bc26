//! Test helper modules for camrt-session integration tests
//!
//! Provides reusable test infrastructure components:
//! - ManualPipeline: pipeline whose results the test delivers by hand
//! - fixtures: fast session configuration, request builders, session setup

pub mod fixtures;
pub mod manual_pipeline;

// Re-export commonly used types
pub use fixtures::{fast_config, request, request_for, TestSession};
pub use manual_pipeline::{ManualPipeline, NodeBehaviour};
