//! # camrt Session Library (camrt-session)
//!
//! Request/result orchestration core of the camera pipeline runtime.
//!
//! **Purpose:** Accept capture requests from a client, bound the number of
//! in-flight requests, dispatch them to processing pipelines from a worker
//! job, and reassemble the asynchronous per-frame results (metadata, buffers,
//! shutter and error notifications) into strictly ordered results.
//!
//! **Architecture:** One [`Session`] per client. Pipelines and metadata pools
//! are external collaborators behind the [`Pipeline`] and [`MetadataPool`]
//! traits; results leave through a [`ResultSink`].

pub mod config;
pub mod context;
pub mod error;
pub mod fence;
pub mod metadata;
pub mod pipeline;
pub mod session;
pub mod sim;
pub mod sink;
pub mod sync;
pub mod types;
pub mod worker;

pub use config::{SessionConfig, TomlConfig};
pub use context::AppContext;
pub use error::{Error, Result, ResultCode};
pub use metadata::{MetaBuffer, MetadataPool};
pub use pipeline::Pipeline;
pub use session::{FlushInfo, Session, SessionHandle};
pub use sink::ResultSink;
