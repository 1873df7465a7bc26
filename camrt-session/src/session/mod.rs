//! Session orchestration
//!
//! **Module Structure:**
//! - `engine/`: the [`Session`] itself, split by concern
//! - `admission.rs`: live pending request bound and adaptive wait
//! - `request_queue.rs`: accepted, batched requests awaiting dispatch
//! - `result_holder.rs` / `result_list.rs`: per-sequence result tracking
//! - `metabuffer.rs`: metadata slot release tracking
//! - `state.rs`: session state machine
//! - `timing.rs`: recent request latencies for dumps

mod admission;
mod engine;
mod metabuffer;
mod request_queue;
mod result_holder;
mod result_list;
mod state;
mod timing;

pub use admission::AdmissionSnapshot;
pub use engine::{
    CallbackPayload, FlushInfo, PipelineErrorKind, ResultsData, Session, SessionHandle,
};
pub use result_holder::InjectedResult;
pub use timing::RequestTiming;
