//! Storage contract (§4.1): a capability interface, not a schema. Two
//! backends ship in this crate — [`crate::storage_memory::InMemoryStorage`]
//! for tests and [`crate::storage_sqlite::SqliteStorage`] for the embedded
//! local backend.

use async_trait::async_trait;

use crate::error::{StorageError, StorageResult};
use crate::model::{Agent, Chat, QueueEntry, StoredMessage, World};

/// Aggregate counts reported by the queue for the processor's poll loop.
#[derive(Clone, Debug, Default)]
pub struct QueueStats {
    pub worlds_with_pending: Vec<String>,
}

/// Result of `save_agents_batch`: ids that saved, and which failed with why.
/// A batch never aborts partway — every agent is attempted.
#[derive(Debug, Default)]
pub struct AgentBatchSave {
    pub saved_ids: Vec<String>,
    pub failed: Vec<(String, StorageError)>,
}

/// Result of `load_agents_batch`: the agents that loaded, and which ids
/// failed (including "not found") and why.
#[derive(Debug, Default)]
pub struct AgentBatchLoad {
    pub agents: Vec<Agent>,
    pub failed: Vec<(String, StorageError)>,
}

#[async_trait]
pub trait Storage: Send + Sync {
    // -- worlds --
    async fn save_world(&self, world: &World) -> StorageResult<()>;
    async fn load_world(&self, world_id: &str) -> StorageResult<Option<World>>;
    async fn delete_world(&self, world_id: &str) -> StorageResult<()>;
    async fn list_worlds(&self) -> StorageResult<Vec<World>>;
    async fn world_exists(&self, world_id: &str) -> StorageResult<bool>;

    // -- agents --
    async fn save_agent(&self, agent: &Agent) -> StorageResult<()>;
    async fn load_agent(&self, world_id: &str, agent_id: &str) -> StorageResult<Option<Agent>>;
    async fn delete_agent(&self, world_id: &str, agent_id: &str) -> StorageResult<()>;
    async fn list_agents(&self, world_id: &str) -> StorageResult<Vec<Agent>>;

    /// Saves every agent in `agents`, attempting each independently so one
    /// failure doesn't block the rest. Default implementation calls
    /// `save_agent` per item; backends may override for a single transaction.
    async fn save_agents_batch(&self, agents: &[Agent]) -> StorageResult<AgentBatchSave> {
        let mut outcome = AgentBatchSave::default();
        for agent in agents {
            match self.save_agent(agent).await {
                Ok(()) => outcome.saved_ids.push(agent.id.clone()),
                Err(err) => outcome.failed.push((agent.id.clone(), err)),
            }
        }
        Ok(outcome)
    }

    /// Loads each of `agent_ids` within `world_id`, reporting ids that are
    /// missing or errored alongside the ids that loaded.
    async fn load_agents_batch(
        &self,
        world_id: &str,
        agent_ids: &[String],
    ) -> StorageResult<AgentBatchLoad> {
        let mut outcome = AgentBatchLoad::default();
        for agent_id in agent_ids {
            match self.load_agent(world_id, agent_id).await {
                Ok(Some(agent)) => outcome.agents.push(agent),
                Ok(None) => outcome
                    .failed
                    .push((agent_id.clone(), StorageError::NotFound(agent_id.clone()))),
                Err(err) => outcome.failed.push((agent_id.clone(), err)),
            }
        }
        Ok(outcome)
    }

    /// Replaces an agent's memory list wholesale (memory is append-only at the
    /// pipeline layer; storage itself just persists the current snapshot).
    async fn save_agent_memory(
        &self,
        world_id: &str,
        agent_id: &str,
        memory: Vec<StoredMessage>,
    ) -> StorageResult<()>;
    async fn load_agent_memory(
        &self,
        world_id: &str,
        agent_id: &str,
    ) -> StorageResult<Vec<StoredMessage>>;
    /// Drops an agent's memory entries scoped to one chat (command `/clear`).
    async fn delete_memory_by_chat_id(
        &self,
        world_id: &str,
        agent_id: &str,
        chat_id: &str,
    ) -> StorageResult<()>;
    /// Archives the current memory under a timestamped label before it is cleared.
    async fn archive_memory(
        &self,
        world_id: &str,
        agent_id: &str,
        label: &str,
    ) -> StorageResult<()>;

    // -- chats --
    async fn save_chat(&self, chat: &Chat) -> StorageResult<()>;
    async fn load_chat(&self, world_id: &str, chat_id: &str) -> StorageResult<Option<Chat>>;
    async fn delete_chat(&self, world_id: &str, chat_id: &str) -> StorageResult<()>;
    async fn list_chats(&self, world_id: &str) -> StorageResult<Vec<Chat>>;
    /// Updates an existing chat's mutable fields (name, description, current
    /// message count). Default implementation is an upsert via `save_chat`;
    /// distinct from it in intent (command-driven rename vs. initial creation).
    async fn update_chat(&self, chat: &Chat) -> StorageResult<()> {
        self.save_chat(chat).await
    }

    /// Union of every agent's memory matching `chat_id` (empty string means
    /// "no chat filter"), sorted by timestamp. Used by export and by agents
    /// rebuilding context after a restart.
    async fn get_memory(
        &self,
        world_id: &str,
        chat_id: &str,
    ) -> StorageResult<Vec<StoredMessage>>;

    /// Persists one canonical message (independent of any agent's private
    /// memory view) so export/replay has a ground truth.
    async fn save_message(&self, message: &StoredMessage) -> StorageResult<()>;
    async fn list_messages(
        &self,
        world_id: &str,
        chat_id: &str,
    ) -> StorageResult<Vec<StoredMessage>>;

    // -- queue --
    async fn enqueue(&self, entry: QueueEntry) -> StorageResult<QueueEntry>;
    /// Atomically claims the oldest eligible entry for `world_id`, iff none of
    /// that world's entries are currently leased with a live heartbeat.
    async fn dequeue(&self, world_id: &str) -> StorageResult<Option<QueueEntry>>;
    async fn update_heartbeat(&self, queue_id: &str) -> StorageResult<()>;
    async fn mark_completed(&self, queue_id: &str) -> StorageResult<()>;
    async fn mark_failed(&self, queue_id: &str, error: &str) -> StorageResult<()>;
    async fn get_queue_stats(&self) -> StorageResult<QueueStats>;
    /// Flips `leased` entries whose heartbeat is older than `max_age_secs`
    /// back to `pending`. Run once at processor startup.
    async fn reclaim_stale(&self, max_age_secs: i64) -> StorageResult<u64>;
}
