//! Session engine
//!
//! **Module Structure:**
//! - `core.rs`: Session struct, construction, lifecycle, worker job
//! - `submission.rs`: client request intake (validation, admission, batching)
//! - `dispatch.rs`: handing queued requests to pipelines
//! - `aggregation.rs`: result injection and ordered delivery
//! - `notify.rs`: pipeline callback routing
//! - `flush.rs`: flush, fallback escalation and recovery
//! - `diagnostics.rs`: state dumps

mod aggregation;
mod core;
mod diagnostics;
mod dispatch;
mod flush;
mod notify;
mod submission;

pub use self::core::{Session, SessionHandle};
pub use flush::FlushInfo;
pub use notify::{CallbackPayload, PipelineErrorKind, ResultsData};
