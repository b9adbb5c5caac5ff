//! The per-world message queue (C3) and its polling processor (C7).

pub mod error;
pub mod processor;
pub mod queue;

pub use error::QueueError;
pub use processor::{
    QueueProcessor, RuntimeRegistry, StaticRegistry, DEFAULT_HEARTBEAT_INTERVAL,
    DEFAULT_LEASE_TIMEOUT_SECS, DEFAULT_MAX_CONCURRENT, DEFAULT_POLL_INTERVAL,
    DEFAULT_WORLD_IDLE_TIMEOUT,
};
pub use queue::Queue;
