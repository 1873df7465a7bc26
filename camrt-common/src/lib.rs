//! # camrt Common Library
//!
//! Shared code for the camera runtime crates including:
//! - Error types
//! - Session lifecycle events and the session state enum
//! - Configuration file resolution
//! - Time utilities

pub mod config;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
pub use events::{SessionEvent, SessionState};
