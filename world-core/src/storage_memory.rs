//! In-memory `Storage`. Not persistent; used for tests and as the default
//! backend when `AGENT_WORLD_STORAGE_TYPE` is unset.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::{StorageError, StorageResult};
use crate::model::{Agent, Chat, QueueEntry, QueueState, StoredMessage, World};
use crate::storage::{QueueStats, Storage};

fn agent_key(world_id: &str, agent_id: &str) -> String {
    format!("{world_id}\0{agent_id}")
}

fn chat_key(world_id: &str, chat_id: &str) -> String {
    format!("{world_id}\0{chat_id}")
}

#[derive(Default)]
struct Inner {
    worlds: HashMap<String, World>,
    agents: HashMap<String, Agent>,
    agent_memory: HashMap<String, Vec<StoredMessage>>,
    chats: HashMap<String, Chat>,
    messages: HashMap<String, Vec<StoredMessage>>,
    queue: HashMap<String, QueueEntry>,
}

/// In-memory store backed by a single `RwLock`-guarded map set, mirroring the
/// teacher's namespaced-key `InMemoryStore`.
pub struct InMemoryStorage {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn save_world(&self, world: &World) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        inner.worlds.insert(world.id.clone(), world.clone());
        Ok(())
    }

    async fn load_world(&self, world_id: &str) -> StorageResult<Option<World>> {
        Ok(self.inner.read().await.worlds.get(world_id).cloned())
    }

    async fn delete_world(&self, world_id: &str) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let Some(world) = inner.worlds.remove(world_id) else {
            return Ok(());
        };
        for agent_id in &world.agent_ids {
            inner.agents.remove(&agent_key(world_id, agent_id));
            inner.agent_memory.remove(&agent_key(world_id, agent_id));
        }
        for chat_id in &world.chat_ids {
            inner.chats.remove(&chat_key(world_id, chat_id));
            inner.messages.remove(&chat_key(world_id, chat_id));
        }
        inner.queue.retain(|_, e| e.world_id != world_id);
        Ok(())
    }

    async fn list_worlds(&self) -> StorageResult<Vec<World>> {
        Ok(self.inner.read().await.worlds.values().cloned().collect())
    }

    async fn world_exists(&self, world_id: &str) -> StorageResult<bool> {
        Ok(self.inner.read().await.worlds.contains_key(world_id))
    }

    async fn save_agent(&self, agent: &Agent) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .agents
            .insert(agent_key(&agent.world_id, &agent.id), agent.clone());
        Ok(())
    }

    async fn load_agent(&self, world_id: &str, agent_id: &str) -> StorageResult<Option<Agent>> {
        Ok(self
            .inner
            .read()
            .await
            .agents
            .get(&agent_key(world_id, agent_id))
            .cloned())
    }

    async fn delete_agent(&self, world_id: &str, agent_id: &str) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        inner.agents.remove(&agent_key(world_id, agent_id));
        inner.agent_memory.remove(&agent_key(world_id, agent_id));
        Ok(())
    }

    async fn list_agents(&self, world_id: &str) -> StorageResult<Vec<Agent>> {
        Ok(self
            .inner
            .read()
            .await
            .agents
            .values()
            .filter(|a| a.world_id == world_id)
            .cloned()
            .collect())
    }

    async fn save_agent_memory(
        &self,
        world_id: &str,
        agent_id: &str,
        memory: Vec<StoredMessage>,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        inner.agent_memory.insert(agent_key(world_id, agent_id), memory);
        Ok(())
    }

    async fn load_agent_memory(
        &self,
        world_id: &str,
        agent_id: &str,
    ) -> StorageResult<Vec<StoredMessage>> {
        Ok(self
            .inner
            .read()
            .await
            .agent_memory
            .get(&agent_key(world_id, agent_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_memory_by_chat_id(
        &self,
        world_id: &str,
        agent_id: &str,
        chat_id: &str,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(mem) = inner.agent_memory.get_mut(&agent_key(world_id, agent_id)) {
            mem.retain(|m| m.chat_id != chat_id);
        }
        Ok(())
    }

    async fn archive_memory(
        &self,
        world_id: &str,
        agent_id: &str,
        label: &str,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let key = agent_key(world_id, agent_id);
        let current = inner.agent_memory.remove(&key).unwrap_or_default();
        inner
            .agent_memory
            .insert(format!("{key}\0archive\0{label}"), current);
        inner.agent_memory.insert(key, Vec::new());
        Ok(())
    }

    async fn save_chat(&self, chat: &Chat) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .chats
            .insert(chat_key(&chat.world_id, &chat.id), chat.clone());
        Ok(())
    }

    async fn load_chat(&self, world_id: &str, chat_id: &str) -> StorageResult<Option<Chat>> {
        Ok(self
            .inner
            .read()
            .await
            .chats
            .get(&chat_key(world_id, chat_id))
            .cloned())
    }

    async fn delete_chat(&self, world_id: &str, chat_id: &str) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        inner.chats.remove(&chat_key(world_id, chat_id));
        inner.messages.remove(&chat_key(world_id, chat_id));
        Ok(())
    }

    async fn list_chats(&self, world_id: &str) -> StorageResult<Vec<Chat>> {
        Ok(self
            .inner
            .read()
            .await
            .chats
            .values()
            .filter(|c| c.world_id == world_id)
            .cloned()
            .collect())
    }

    async fn get_memory(&self, world_id: &str, chat_id: &str) -> StorageResult<Vec<StoredMessage>> {
        let inner = self.inner.read().await;
        let mut out: Vec<StoredMessage> = inner
            .agent_memory
            .iter()
            .filter(|(k, _)| k.starts_with(&format!("{world_id}\0")) && !k.contains("\0archive\0"))
            .flat_map(|(_, v)| v.clone())
            .filter(|m| chat_id.is_empty() || m.chat_id == chat_id)
            .collect();
        out.sort_by_key(|m| m.timestamp);
        out.dedup_by_key(|m| m.message_id.clone());
        Ok(out)
    }

    async fn save_message(&self, message: &StoredMessage) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let key = chat_key(&message.world_id, &message.chat_id);
        let list = inner.messages.entry(key).or_default();
        list.push(message.clone());
        if let Some(chat) = inner
            .chats
            .get_mut(&chat_key(&message.world_id, &message.chat_id))
        {
            chat.message_count += 1;
            chat.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_messages(
        &self,
        world_id: &str,
        chat_id: &str,
    ) -> StorageResult<Vec<StoredMessage>> {
        let mut out = self
            .inner
            .read()
            .await
            .messages
            .get(&chat_key(world_id, chat_id))
            .cloned()
            .unwrap_or_default();
        out.sort_by_key(|m| m.timestamp);
        Ok(out)
    }

    async fn enqueue(&self, entry: QueueEntry) -> StorageResult<QueueEntry> {
        let mut inner = self.inner.write().await;
        inner.queue.insert(entry.queue_id.clone(), entry.clone());
        Ok(entry)
    }

    async fn dequeue(&self, world_id: &str) -> StorageResult<Option<QueueEntry>> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();

        let already_leased_live = inner.queue.values().any(|e| {
            e.world_id == world_id
                && e.state == QueueState::Leased
                && e.last_heartbeat_at
                    .map(|hb| (now - hb).num_seconds() < 15)
                    .unwrap_or(true)
        });
        if already_leased_live {
            return Ok(None);
        }

        let mut candidates: Vec<&mut QueueEntry> = inner
            .queue
            .values_mut()
            .filter(|e| {
                e.world_id == world_id
                    && e.state == QueueState::Pending
                    && e.next_eligible_at.map(|t| t <= now).unwrap_or(true)
            })
            .collect();
        candidates.sort_by_key(|e| e.enqueued_at);
        let Some(entry) = candidates.into_iter().next() else {
            return Ok(None);
        };
        entry.state = QueueState::Leased;
        entry.last_heartbeat_at = Some(now);
        Ok(Some(entry.clone()))
    }

    async fn update_heartbeat(&self, queue_id: &str) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(e) = inner.queue.get_mut(queue_id) {
            e.last_heartbeat_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_completed(&self, queue_id: &str) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let Some(e) = inner.queue.get_mut(queue_id) else {
            return Err(StorageError::NotFound(queue_id.to_string()));
        };
        e.state = QueueState::Completed;
        Ok(())
    }

    async fn mark_failed(&self, queue_id: &str, error: &str) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let Some(e) = inner.queue.get_mut(queue_id) else {
            return Err(StorageError::NotFound(queue_id.to_string()));
        };
        e.attempt_count += 1;
        e.last_error = Some(error.to_string());
        const MAX_ATTEMPTS: u32 = 3;
        if e.attempt_count < MAX_ATTEMPTS {
            e.state = QueueState::Pending;
            let backoff_secs = (2_i64.pow(e.attempt_count)).min(30);
            e.next_eligible_at = Some(Utc::now() + chrono::Duration::seconds(backoff_secs));
        } else {
            e.state = QueueState::Failed;
        }
        Ok(())
    }

    async fn get_queue_stats(&self) -> StorageResult<QueueStats> {
        let inner = self.inner.read().await;
        let mut worlds: Vec<String> = inner
            .queue
            .values()
            .filter(|e| e.state == QueueState::Pending)
            .map(|e| e.world_id.clone())
            .collect();
        worlds.sort();
        worlds.dedup();
        Ok(QueueStats {
            worlds_with_pending: worlds,
        })
    }

    async fn reclaim_stale(&self, max_age_secs: i64) -> StorageResult<u64> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let mut count = 0;
        for e in inner.queue.values_mut() {
            if e.state == QueueState::Leased {
                let stale = e
                    .last_heartbeat_at
                    .map(|hb| (now - hb).num_seconds() >= max_age_secs)
                    .unwrap_or(true);
                if stale {
                    e.state = QueueState::Pending;
                    count += 1;
                }
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageRole;

    fn msg(world: &str, chat: &str, id: &str) -> StoredMessage {
        StoredMessage {
            message_id: id.into(),
            world_id: world.into(),
            chat_id: chat.into(),
            role: MessageRole::User,
            sender: "HUMAN".into(),
            content: "hi".into(),
            tool_calls: None,
            tool_call_id: None,
            reply_to_message_id: None,
            timestamp: Utc::now(),
        }
    }

    /// **Scenario**: saving and loading a world round-trips its fields.
    #[tokio::test]
    async fn save_and_load_world() {
        let store = InMemoryStorage::new();
        let w = World::new("w1", "World One");
        store.save_world(&w).await.unwrap();
        let loaded = store.load_world("w1").await.unwrap().unwrap();
        assert_eq!(loaded.name, "World One");
        assert_eq!(loaded.turn_limit, 5);
    }

    /// **Scenario**: dequeue claims at most one in-flight entry per world.
    #[tokio::test]
    async fn dequeue_enforces_mutual_exclusion() {
        let store = InMemoryStorage::new();
        let e1 = QueueEntry {
            queue_id: "q1".into(),
            world_id: "w1".into(),
            message_id: "m1".into(),
            chat_id: Some("c1".into()),
            content: "a".into(),
            sender: "HUMAN".into(),
            enqueued_at: Utc::now(),
            state: QueueState::Pending,
            attempt_count: 0,
            last_heartbeat_at: None,
            last_error: None,
            next_eligible_at: None,
        };
        let mut e2 = e1.clone();
        e2.queue_id = "q2".into();
        e2.message_id = "m2".into();
        e2.enqueued_at = Utc::now() + chrono::Duration::milliseconds(10);

        store.enqueue(e1).await.unwrap();
        store.enqueue(e2).await.unwrap();

        let first = store.dequeue("w1").await.unwrap().unwrap();
        assert_eq!(first.queue_id, "q1");
        // Second dequeue attempt must return None: q1 is still leased.
        assert!(store.dequeue("w1").await.unwrap().is_none());

        store.mark_completed("q1").await.unwrap();
        let second = store.dequeue("w1").await.unwrap().unwrap();
        assert_eq!(second.queue_id, "q2");
    }

    /// **Scenario**: agent ids are unique only within a world; two worlds holding
    /// the same agent id must not collide.
    #[tokio::test]
    async fn same_agent_id_in_different_worlds_does_not_collide() {
        let store = InMemoryStorage::new();
        let mut a1 = Agent::new("w1", "a1", "World One Agent");
        a1.provider = "p1".into();
        let mut a2 = Agent::new("w2", "a1", "World Two Agent");
        a2.provider = "p2".into();
        store.save_agent(&a1).await.unwrap();
        store.save_agent(&a2).await.unwrap();

        let loaded1 = store.load_agent("w1", "a1").await.unwrap().unwrap();
        let loaded2 = store.load_agent("w2", "a1").await.unwrap().unwrap();
        assert_eq!(loaded1.name, "World One Agent");
        assert_eq!(loaded2.name, "World Two Agent");

        store.delete_agent("w1", "a1").await.unwrap();
        assert!(store.load_agent("w1", "a1").await.unwrap().is_none());
        assert!(store.load_agent("w2", "a1").await.unwrap().is_some());
    }

    /// **Scenario**: get_memory aggregates across agents, sorted by time, de-duplicated.
    #[tokio::test]
    async fn get_memory_aggregates_and_sorts() {
        let store = InMemoryStorage::new();
        let mut m1 = msg("w1", "c1", "1");
        m1.timestamp = Utc::now();
        let mut m2 = msg("w1", "c1", "2");
        m2.timestamp = m1.timestamp + chrono::Duration::seconds(1);
        store
            .save_agent_memory("w1", "a1", vec![m1.clone()])
            .await
            .unwrap();
        store
            .save_agent_memory("w1", "a2", vec![m1.clone(), m2.clone()])
            .await
            .unwrap();
        let mem = store.get_memory("w1", "c1").await.unwrap();
        assert_eq!(mem.len(), 2);
        assert_eq!(mem[0].message_id, "1");
        assert_eq!(mem[1].message_id, "2");
    }

    /// **Scenario**: saving a batch of agents reports every id as saved.
    #[tokio::test]
    async fn save_agents_batch_reports_all_saved() {
        let store = InMemoryStorage::new();
        let agents = vec![Agent::new("w1", "a1", "One"), Agent::new("w1", "a2", "Two")];
        let outcome = store.save_agents_batch(&agents).await.unwrap();
        assert_eq!(outcome.saved_ids, vec!["a1".to_string(), "a2".to_string()]);
        assert!(outcome.failed.is_empty());
    }

    /// **Scenario**: loading a batch with one missing id reports the rest as
    /// loaded and the missing one as failed, rather than failing the whole batch.
    #[tokio::test]
    async fn load_agents_batch_reports_partial_success() {
        let store = InMemoryStorage::new();
        store.save_agent(&Agent::new("w1", "a1", "One")).await.unwrap();
        let outcome = store
            .load_agents_batch("w1", &["a1".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(outcome.agents.len(), 1);
        assert_eq!(outcome.agents[0].id, "a1");
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, "missing");
    }

    /// **Scenario**: update_chat persists changes to an already-saved chat.
    #[tokio::test]
    async fn update_chat_persists_rename() {
        let store = InMemoryStorage::new();
        let mut chat = Chat::new("w1", "c1");
        store.save_chat(&chat).await.unwrap();
        chat.name = "Renamed".into();
        store.update_chat(&chat).await.unwrap();
        let loaded = store.load_chat("w1", "c1").await.unwrap().unwrap();
        assert_eq!(loaded.name, "Renamed");
    }
}
