//! Per-world event families (`message`, `sse`, `world`, `status`, `crud`) and
//! the sequencing envelope used for replay.
//!
//! This crate has no knowledge of storage or the LLM pipeline; `world-runtime`
//! and `gateway` build on top of [`EventBus`].

pub mod bus;
pub mod envelope;
pub mod event;

pub use bus::{EventBus, Published};
pub use envelope::{to_json, Envelope, SeqCounter};
pub use event::{
    CrudOperation, CrudPayload, MessagePayload, QueueStatus, SsePayload, StatusPayload,
    WorldEvent, WorldPayload,
};
