//! Collector event protocol
//!
//! A stateful, resumable, deduplicating wire protocol that lets remote
//! agents stream the conversation shape via sequenced event batches
//! instead of files. The transport layer (HTTP framing, header
//! validation) lives outside this crate; this module owns the wire
//! shapes and the full server-side semantics.

mod events;
mod service;

pub use events::{
    compute_event_hash, CollectorEvent, EventBatchRequest, EventBatchResponse, EventKind, GapInfo,
    RegisterRequest, RegisterResponse, SessionCompleteRequest, SessionCompleteResponse,
    SessionStatusResponse,
};
pub use service::{CollectorService, TAGGING_JOB_KIND};
