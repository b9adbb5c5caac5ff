//! Storage contract (C1), approval cache (C6), and export/replay (C9).
//!
//! `world-runtime` and `queue` build on top of the [`Storage`] trait; neither
//! cares which backend (`storage_memory` or `storage_sqlite`) is in use.

pub mod approval;
pub mod error;
pub mod export;
pub mod model;
pub mod storage;
pub mod storage_memory;
pub mod storage_sqlite;

pub use approval::{ApprovalCache, ApprovalDecision, ApprovalScope};
pub use error::{StorageError, StorageResult};
pub use export::{export_chat, message_ids_in_transcript};
pub use model::{
    Agent, AgentStatus, Chat, MessageRole, QueueEntry, QueueState, StoredMessage, World,
    SENDER_HUMAN, SENDER_SYSTEM,
};
pub use storage::{AgentBatchLoad, AgentBatchSave, QueueStats, Storage};
pub use storage_memory::InMemoryStorage;
pub use storage_sqlite::SqliteStorage;
