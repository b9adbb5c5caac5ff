//! SQLite-backed `Storage`. One connection behind `Arc<Mutex<Connection>>`,
//! blocking rusqlite calls bridged into async via `block_in_place`, matching
//! the workspace store's idiom. World/Agent/Chat rows are stored as JSON text
//! columns (as the in-crate `SqliteStore` does for its values); the queue
//! table uses real columns since `dequeue` needs to `ORDER BY` and filter on
//! them.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{StorageError, StorageResult};
use crate::model::{Agent, Chat, QueueEntry, QueueState, StoredMessage, World};
use crate::storage::{QueueStats, Storage};

fn to_backend_err(e: rusqlite::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn queue_state_str(s: QueueState) -> &'static str {
    match s {
        QueueState::Pending => "pending",
        QueueState::Leased => "leased",
        QueueState::Completed => "completed",
        QueueState::Failed => "failed",
    }
}

fn queue_state_from_str(s: &str) -> QueueState {
    match s {
        "leased" => QueueState::Leased,
        "completed" => QueueState::Completed,
        "failed" => QueueState::Failed,
        _ => QueueState::Pending,
    }
}

fn dt_to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn millis_to_dt(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

pub struct SqliteStorage {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    pub fn new(path: impl AsRef<Path>) -> StorageResult<Self> {
        let conn = Connection::open(path.as_ref()).map_err(to_backend_err)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS worlds (id TEXT PRIMARY KEY, json TEXT NOT NULL);
            CREATE TABLE IF NOT EXISTS agents (world_id TEXT NOT NULL, id TEXT NOT NULL, json TEXT NOT NULL, PRIMARY KEY (world_id, id));
            CREATE TABLE IF NOT EXISTS agent_memory (world_id TEXT NOT NULL, agent_id TEXT NOT NULL, json TEXT NOT NULL, PRIMARY KEY (world_id, agent_id));
            CREATE TABLE IF NOT EXISTS agent_memory_archive (world_id TEXT NOT NULL, agent_id TEXT NOT NULL, label TEXT NOT NULL, json TEXT NOT NULL, PRIMARY KEY (world_id, agent_id, label));
            CREATE TABLE IF NOT EXISTS chats (world_id TEXT NOT NULL, id TEXT NOT NULL, json TEXT NOT NULL, PRIMARY KEY (world_id, id));
            CREATE TABLE IF NOT EXISTS messages (world_id TEXT NOT NULL, chat_id TEXT NOT NULL, message_id TEXT NOT NULL, timestamp_ms INTEGER NOT NULL, json TEXT NOT NULL, PRIMARY KEY (world_id, chat_id, message_id));
            CREATE TABLE IF NOT EXISTS queue (
                queue_id TEXT PRIMARY KEY,
                world_id TEXT NOT NULL,
                state TEXT NOT NULL,
                enqueued_at_ms INTEGER NOT NULL,
                next_eligible_at_ms INTEGER,
                last_heartbeat_at_ms INTEGER,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_queue_world_state ON queue(world_id, state);
            CREATE INDEX IF NOT EXISTS idx_messages_world_chat ON messages(world_id, chat_id);
            "#,
        )
        .map_err(to_backend_err)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn queue_entry_from_row(json: &str) -> StorageResult<QueueEntry> {
    serde_json::from_str(json).map_err(|e| StorageError::Backend(e.to_string()))
}

/// Overlays the queryable `queue` columns onto a json-deserialized entry. The
/// columns, not the embedded json, are what `dequeue`/`mark_failed` filter
/// and order on, so they're treated as the authoritative source for these
/// fields when the two could in principle drift.
fn apply_queue_columns(
    mut entry: QueueEntry,
    state: &str,
    attempt_count: u32,
    last_heartbeat_at_ms: Option<i64>,
    next_eligible_at_ms: Option<i64>,
    last_error: Option<String>,
) -> QueueEntry {
    entry.state = queue_state_from_str(state);
    entry.attempt_count = attempt_count;
    entry.last_heartbeat_at = last_heartbeat_at_ms.map(millis_to_dt);
    entry.next_eligible_at = next_eligible_at_ms.map(millis_to_dt);
    entry.last_error = last_error;
    entry
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn save_world(&self, world: &World) -> StorageResult<()> {
        let db = self.db.clone();
        let world = world.clone();
        tokio::task::block_in_place(move || {
            let conn = db.lock().unwrap_or_else(|p| p.into_inner());
            let json = serde_json::to_string(&world).map_err(|e| StorageError::Backend(e.to_string()))?;
            conn.execute(
                "INSERT INTO worlds (id, json) VALUES (?1, ?2) ON CONFLICT(id) DO UPDATE SET json = excluded.json",
                params![world.id, json],
            )
            .map_err(to_backend_err)?;
            Ok(())
        })
    }

    async fn load_world(&self, world_id: &str) -> StorageResult<Option<World>> {
        let db = self.db.clone();
        let world_id = world_id.to_string();
        tokio::task::block_in_place(move || {
            let conn = db.lock().unwrap_or_else(|p| p.into_inner());
            let json: Option<String> = conn
                .query_row("SELECT json FROM worlds WHERE id = ?1", params![world_id], |r| r.get(0))
                .optional()
                .map_err(to_backend_err)?;
            json.map(|j| serde_json::from_str(&j).map_err(|e| StorageError::Backend(e.to_string())))
                .transpose()
        })
    }

    async fn delete_world(&self, world_id: &str) -> StorageResult<()> {
        let db = self.db.clone();
        let world_id = world_id.to_string();
        tokio::task::block_in_place(move || {
            let conn = db.lock().unwrap_or_else(|p| p.into_inner());
            conn.execute("DELETE FROM worlds WHERE id = ?1", params![world_id]).map_err(to_backend_err)?;
            conn.execute("DELETE FROM agents WHERE world_id = ?1", params![world_id]).map_err(to_backend_err)?;
            conn.execute("DELETE FROM agent_memory WHERE world_id = ?1", params![world_id]).map_err(to_backend_err)?;
            conn.execute("DELETE FROM chats WHERE world_id = ?1", params![world_id]).map_err(to_backend_err)?;
            conn.execute("DELETE FROM messages WHERE world_id = ?1", params![world_id]).map_err(to_backend_err)?;
            conn.execute("DELETE FROM queue WHERE world_id = ?1", params![world_id]).map_err(to_backend_err)?;
            Ok(())
        })
    }

    async fn list_worlds(&self) -> StorageResult<Vec<World>> {
        let db = self.db.clone();
        tokio::task::block_in_place(move || {
            let conn = db.lock().unwrap_or_else(|p| p.into_inner());
            let mut stmt = conn.prepare("SELECT json FROM worlds").map_err(to_backend_err)?;
            let rows = stmt
                .query_map([], |r| r.get::<_, String>(0))
                .map_err(to_backend_err)?;
            let mut out = Vec::new();
            for row in rows {
                let json = row.map_err(to_backend_err)?;
                out.push(serde_json::from_str(&json).map_err(|e| StorageError::Backend(e.to_string()))?);
            }
            Ok(out)
        })
    }

    async fn world_exists(&self, world_id: &str) -> StorageResult<bool> {
        Ok(self.load_world(world_id).await?.is_some())
    }

    async fn save_agent(&self, agent: &Agent) -> StorageResult<()> {
        let db = self.db.clone();
        let agent = agent.clone();
        tokio::task::block_in_place(move || {
            let conn = db.lock().unwrap_or_else(|p| p.into_inner());
            let json = serde_json::to_string(&agent).map_err(|e| StorageError::Backend(e.to_string()))?;
            conn.execute(
                "INSERT INTO agents (world_id, id, json) VALUES (?1, ?2, ?3) ON CONFLICT(world_id, id) DO UPDATE SET json = excluded.json",
                params![agent.world_id, agent.id, json],
            )
            .map_err(to_backend_err)?;
            Ok(())
        })
    }

    async fn load_agent(&self, world_id: &str, agent_id: &str) -> StorageResult<Option<Agent>> {
        let db = self.db.clone();
        let (world_id, agent_id) = (world_id.to_string(), agent_id.to_string());
        tokio::task::block_in_place(move || {
            let conn = db.lock().unwrap_or_else(|p| p.into_inner());
            let json: Option<String> = conn
                .query_row(
                    "SELECT json FROM agents WHERE world_id = ?1 AND id = ?2",
                    params![world_id, agent_id],
                    |r| r.get(0),
                )
                .optional()
                .map_err(to_backend_err)?;
            json.map(|j| serde_json::from_str(&j).map_err(|e| StorageError::Backend(e.to_string())))
                .transpose()
        })
    }

    async fn delete_agent(&self, world_id: &str, agent_id: &str) -> StorageResult<()> {
        let db = self.db.clone();
        let (world_id, agent_id) = (world_id.to_string(), agent_id.to_string());
        tokio::task::block_in_place(move || {
            let conn = db.lock().unwrap_or_else(|p| p.into_inner());
            conn.execute(
                "DELETE FROM agents WHERE world_id = ?1 AND id = ?2",
                params![world_id, agent_id],
            )
            .map_err(to_backend_err)?;
            conn.execute(
                "DELETE FROM agent_memory WHERE world_id = ?1 AND agent_id = ?2",
                params![world_id, agent_id],
            )
            .map_err(to_backend_err)?;
            Ok(())
        })
    }

    async fn list_agents(&self, world_id: &str) -> StorageResult<Vec<Agent>> {
        let db = self.db.clone();
        let world_id = world_id.to_string();
        tokio::task::block_in_place(move || {
            let conn = db.lock().unwrap_or_else(|p| p.into_inner());
            let mut stmt = conn
                .prepare("SELECT json FROM agents WHERE world_id = ?1")
                .map_err(to_backend_err)?;
            let rows = stmt
                .query_map(params![world_id], |r| r.get::<_, String>(0))
                .map_err(to_backend_err)?;
            let mut out = Vec::new();
            for row in rows {
                let json = row.map_err(to_backend_err)?;
                out.push(serde_json::from_str(&json).map_err(|e| StorageError::Backend(e.to_string()))?);
            }
            Ok(out)
        })
    }

    async fn save_agent_memory(
        &self,
        world_id: &str,
        agent_id: &str,
        memory: Vec<StoredMessage>,
    ) -> StorageResult<()> {
        let db = self.db.clone();
        let (world_id, agent_id) = (world_id.to_string(), agent_id.to_string());
        tokio::task::block_in_place(move || {
            let conn = db.lock().unwrap_or_else(|p| p.into_inner());
            let json = serde_json::to_string(&memory).map_err(|e| StorageError::Backend(e.to_string()))?;
            conn.execute(
                "INSERT INTO agent_memory (world_id, agent_id, json) VALUES (?1, ?2, ?3) ON CONFLICT(world_id, agent_id) DO UPDATE SET json = excluded.json",
                params![world_id, agent_id, json],
            )
            .map_err(to_backend_err)?;
            Ok(())
        })
    }

    async fn load_agent_memory(
        &self,
        world_id: &str,
        agent_id: &str,
    ) -> StorageResult<Vec<StoredMessage>> {
        let db = self.db.clone();
        let (world_id, agent_id) = (world_id.to_string(), agent_id.to_string());
        tokio::task::block_in_place(move || {
            let conn = db.lock().unwrap_or_else(|p| p.into_inner());
            let json: Option<String> = conn
                .query_row(
                    "SELECT json FROM agent_memory WHERE world_id = ?1 AND agent_id = ?2",
                    params![world_id, agent_id],
                    |r| r.get(0),
                )
                .optional()
                .map_err(to_backend_err)?;
            match json {
                Some(j) => serde_json::from_str(&j).map_err(|e| StorageError::Backend(e.to_string())),
                None => Ok(Vec::new()),
            }
        })
    }

    async fn delete_memory_by_chat_id(
        &self,
        world_id: &str,
        agent_id: &str,
        chat_id: &str,
    ) -> StorageResult<()> {
        let mut memory = self.load_agent_memory(world_id, agent_id).await?;
        memory.retain(|m| m.chat_id != chat_id);
        self.save_agent_memory(world_id, agent_id, memory).await
    }

    async fn archive_memory(&self, world_id: &str, agent_id: &str, label: &str) -> StorageResult<()> {
        let current = self.load_agent_memory(world_id, agent_id).await?;
        let db = self.db.clone();
        let (world_id_s, agent_id_s, label_s) =
            (world_id.to_string(), agent_id.to_string(), label.to_string());
        tokio::task::block_in_place(move || {
            let conn = db.lock().unwrap_or_else(|p| p.into_inner());
            let json = serde_json::to_string(&current).map_err(|e| StorageError::Backend(e.to_string()))?;
            conn.execute(
                "INSERT INTO agent_memory_archive (world_id, agent_id, label, json) VALUES (?1, ?2, ?3, ?4)",
                params![world_id_s, agent_id_s, label_s, json],
            )
            .map_err(to_backend_err)?;
            Ok(())
        })?;
        self.save_agent_memory(world_id, agent_id, Vec::new()).await
    }

    async fn save_chat(&self, chat: &Chat) -> StorageResult<()> {
        let db = self.db.clone();
        let chat = chat.clone();
        tokio::task::block_in_place(move || {
            let conn = db.lock().unwrap_or_else(|p| p.into_inner());
            let json = serde_json::to_string(&chat).map_err(|e| StorageError::Backend(e.to_string()))?;
            conn.execute(
                "INSERT INTO chats (world_id, id, json) VALUES (?1, ?2, ?3) ON CONFLICT(world_id, id) DO UPDATE SET json = excluded.json",
                params![chat.world_id, chat.id, json],
            )
            .map_err(to_backend_err)?;
            Ok(())
        })
    }

    async fn load_chat(&self, world_id: &str, chat_id: &str) -> StorageResult<Option<Chat>> {
        let db = self.db.clone();
        let (world_id, chat_id) = (world_id.to_string(), chat_id.to_string());
        tokio::task::block_in_place(move || {
            let conn = db.lock().unwrap_or_else(|p| p.into_inner());
            let json: Option<String> = conn
                .query_row(
                    "SELECT json FROM chats WHERE world_id = ?1 AND id = ?2",
                    params![world_id, chat_id],
                    |r| r.get(0),
                )
                .optional()
                .map_err(to_backend_err)?;
            json.map(|j| serde_json::from_str(&j).map_err(|e| StorageError::Backend(e.to_string())))
                .transpose()
        })
    }

    async fn delete_chat(&self, world_id: &str, chat_id: &str) -> StorageResult<()> {
        let db = self.db.clone();
        let (world_id, chat_id) = (world_id.to_string(), chat_id.to_string());
        tokio::task::block_in_place(move || {
            let conn = db.lock().unwrap_or_else(|p| p.into_inner());
            conn.execute(
                "DELETE FROM chats WHERE world_id = ?1 AND id = ?2",
                params![world_id, chat_id],
            )
            .map_err(to_backend_err)?;
            conn.execute(
                "DELETE FROM messages WHERE world_id = ?1 AND chat_id = ?2",
                params![world_id, chat_id],
            )
            .map_err(to_backend_err)?;
            Ok(())
        })
    }

    async fn list_chats(&self, world_id: &str) -> StorageResult<Vec<Chat>> {
        let db = self.db.clone();
        let world_id = world_id.to_string();
        tokio::task::block_in_place(move || {
            let conn = db.lock().unwrap_or_else(|p| p.into_inner());
            let mut stmt = conn
                .prepare("SELECT json FROM chats WHERE world_id = ?1")
                .map_err(to_backend_err)?;
            let rows = stmt
                .query_map(params![world_id], |r| r.get::<_, String>(0))
                .map_err(to_backend_err)?;
            let mut out = Vec::new();
            for row in rows {
                let json = row.map_err(to_backend_err)?;
                out.push(serde_json::from_str(&json).map_err(|e| StorageError::Backend(e.to_string()))?);
            }
            Ok(out)
        })
    }

    async fn get_memory(&self, world_id: &str, chat_id: &str) -> StorageResult<Vec<StoredMessage>> {
        let db = self.db.clone();
        let (world_id, chat_id) = (world_id.to_string(), chat_id.to_string());
        let mut out = tokio::task::block_in_place(move || {
            let conn = db.lock().unwrap_or_else(|p| p.into_inner());
            let mut stmt = conn
                .prepare("SELECT json FROM agent_memory WHERE world_id = ?1")
                .map_err(to_backend_err)?;
            let rows = stmt
                .query_map(params![world_id], |r| r.get::<_, String>(0))
                .map_err(to_backend_err)?;
            let mut all: Vec<StoredMessage> = Vec::new();
            for row in rows {
                let json = row.map_err(to_backend_err)?;
                let mem: Vec<StoredMessage> =
                    serde_json::from_str(&json).map_err(|e| StorageError::Backend(e.to_string()))?;
                all.extend(mem);
            }
            if !chat_id.is_empty() {
                all.retain(|m| m.chat_id == chat_id);
            }
            StorageResult::Ok(all)
        })?;
        out.sort_by_key(|m| m.timestamp);
        out.dedup_by_key(|m| m.message_id.clone());
        Ok(out)
    }

    async fn save_message(&self, message: &StoredMessage) -> StorageResult<()> {
        let db = self.db.clone();
        let message = message.clone();
        tokio::task::block_in_place(move || {
            let conn = db.lock().unwrap_or_else(|p| p.into_inner());
            let json = serde_json::to_string(&message).map_err(|e| StorageError::Backend(e.to_string()))?;
            conn.execute(
                "INSERT INTO messages (world_id, chat_id, message_id, timestamp_ms, json) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(world_id, chat_id, message_id) DO UPDATE SET json = excluded.json",
                params![
                    message.world_id,
                    message.chat_id,
                    message.message_id,
                    dt_to_millis(message.timestamp),
                    json
                ],
            )
            .map_err(to_backend_err)?;
            conn.execute(
                "UPDATE chats SET json = json_set(json, '$.message_count', (SELECT COUNT(*) FROM messages WHERE world_id = ?1 AND chat_id = ?2)) WHERE world_id = ?1 AND id = ?2",
                params![message.world_id, message.chat_id],
            )
            .ok();
            Ok(())
        })
    }

    async fn list_messages(&self, world_id: &str, chat_id: &str) -> StorageResult<Vec<StoredMessage>> {
        let db = self.db.clone();
        let (world_id, chat_id) = (world_id.to_string(), chat_id.to_string());
        tokio::task::block_in_place(move || {
            let conn = db.lock().unwrap_or_else(|p| p.into_inner());
            let mut stmt = conn
                .prepare(
                    "SELECT json FROM messages WHERE world_id = ?1 AND chat_id = ?2 ORDER BY timestamp_ms ASC",
                )
                .map_err(to_backend_err)?;
            let rows = stmt
                .query_map(params![world_id, chat_id], |r| r.get::<_, String>(0))
                .map_err(to_backend_err)?;
            let mut out = Vec::new();
            for row in rows {
                let json = row.map_err(to_backend_err)?;
                out.push(serde_json::from_str(&json).map_err(|e| StorageError::Backend(e.to_string()))?);
            }
            Ok(out)
        })
    }

    async fn enqueue(&self, entry: QueueEntry) -> StorageResult<QueueEntry> {
        let db = self.db.clone();
        let entry2 = entry.clone();
        tokio::task::block_in_place(move || {
            let conn = db.lock().unwrap_or_else(|p| p.into_inner());
            let json = serde_json::to_string(&entry2).map_err(|e| StorageError::Backend(e.to_string()))?;
            conn.execute(
                "INSERT INTO queue (queue_id, world_id, state, enqueued_at_ms, next_eligible_at_ms, last_heartbeat_at_ms, attempt_count, last_error, json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    entry2.queue_id,
                    entry2.world_id,
                    queue_state_str(entry2.state),
                    dt_to_millis(entry2.enqueued_at),
                    entry2.next_eligible_at.map(dt_to_millis),
                    entry2.last_heartbeat_at.map(dt_to_millis),
                    entry2.attempt_count,
                    entry2.last_error,
                    json,
                ],
            )
            .map_err(to_backend_err)?;
            Ok(())
        })?;
        Ok(entry)
    }

    async fn dequeue(&self, world_id: &str) -> StorageResult<Option<QueueEntry>> {
        let db = self.db.clone();
        let world_id = world_id.to_string();
        tokio::task::block_in_place(move || {
            let conn = db.lock().unwrap_or_else(|p| p.into_inner());
            let now = Utc::now();
            let now_ms = dt_to_millis(now);

            let leased_live: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM queue WHERE world_id = ?1 AND state = 'leased' AND (last_heartbeat_at_ms IS NULL OR ?2 - last_heartbeat_at_ms < 15000)",
                    params![world_id, now_ms],
                    |r| r.get(0),
                )
                .map_err(to_backend_err)?;
            if leased_live > 0 {
                return Ok(None);
            }

            let row: Option<(String, String, u32, Option<i64>, Option<i64>, Option<String>, String)> = conn
                .query_row(
                    "SELECT queue_id, state, attempt_count, last_heartbeat_at_ms, next_eligible_at_ms, last_error, json
                     FROM queue WHERE world_id = ?1 AND state = 'pending' AND (next_eligible_at_ms IS NULL OR next_eligible_at_ms <= ?2)
                     ORDER BY enqueued_at_ms ASC LIMIT 1",
                    params![world_id, now_ms],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?, r.get(6)?)),
                )
                .optional()
                .map_err(to_backend_err)?;

            let Some((queue_id, state, attempt_count, last_heartbeat_at_ms, next_eligible_at_ms, last_error, json)) =
                row
            else {
                return Ok(None);
            };
            let base = queue_entry_from_row(&json)?;
            let mut entry = apply_queue_columns(
                base,
                &state,
                attempt_count,
                last_heartbeat_at_ms,
                next_eligible_at_ms,
                last_error,
            );
            entry.state = QueueState::Leased;
            entry.last_heartbeat_at = Some(now);
            let new_json = serde_json::to_string(&entry).map_err(|e| StorageError::Backend(e.to_string()))?;
            conn.execute(
                "UPDATE queue SET state = 'leased', last_heartbeat_at_ms = ?1, json = ?2 WHERE queue_id = ?3",
                params![now_ms, new_json, queue_id],
            )
            .map_err(to_backend_err)?;
            Ok(Some(entry))
        })
    }

    async fn update_heartbeat(&self, queue_id: &str) -> StorageResult<()> {
        let db = self.db.clone();
        let queue_id = queue_id.to_string();
        tokio::task::block_in_place(move || {
            let conn = db.lock().unwrap_or_else(|p| p.into_inner());
            conn.execute(
                "UPDATE queue SET last_heartbeat_at_ms = ?1 WHERE queue_id = ?2",
                params![dt_to_millis(Utc::now()), queue_id],
            )
            .map_err(to_backend_err)?;
            Ok(())
        })
    }

    async fn mark_completed(&self, queue_id: &str) -> StorageResult<()> {
        let db = self.db.clone();
        let queue_id = queue_id.to_string();
        tokio::task::block_in_place(move || {
            let conn = db.lock().unwrap_or_else(|p| p.into_inner());
            let n = conn
                .execute("UPDATE queue SET state = 'completed' WHERE queue_id = ?1", params![queue_id])
                .map_err(to_backend_err)?;
            if n == 0 {
                return Err(StorageError::NotFound(queue_id));
            }
            Ok(())
        })
    }

    async fn mark_failed(&self, queue_id: &str, error: &str) -> StorageResult<()> {
        let db = self.db.clone();
        let (queue_id, error) = (queue_id.to_string(), error.to_string());
        tokio::task::block_in_place(move || {
            let conn = db.lock().unwrap_or_else(|p| p.into_inner());
            let row: Option<(String, u32, Option<i64>, Option<i64>, Option<String>, String)> = conn
                .query_row(
                    "SELECT state, attempt_count, last_heartbeat_at_ms, next_eligible_at_ms, last_error, json FROM queue WHERE queue_id = ?1",
                    params![queue_id],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?)),
                )
                .optional()
                .map_err(to_backend_err)?;
            let Some((state, attempt_count, last_heartbeat_at_ms, next_eligible_at_ms, last_error, json)) = row
            else {
                return Err(StorageError::NotFound(queue_id));
            };
            let base = queue_entry_from_row(&json)?;
            let mut entry = apply_queue_columns(
                base,
                &state,
                attempt_count,
                last_heartbeat_at_ms,
                next_eligible_at_ms,
                last_error,
            );
            entry.attempt_count += 1;
            entry.last_error = Some(error.clone());
            const MAX_ATTEMPTS: u32 = 3;
            let next_eligible = if entry.attempt_count < MAX_ATTEMPTS {
                entry.state = QueueState::Pending;
                let backoff_secs = (2_i64.pow(entry.attempt_count)).min(30);
                let t = Utc::now() + chrono::Duration::seconds(backoff_secs);
                entry.next_eligible_at = Some(t);
                Some(dt_to_millis(t))
            } else {
                entry.state = QueueState::Failed;
                None
            };
            let new_json = serde_json::to_string(&entry).map_err(|e| StorageError::Backend(e.to_string()))?;
            conn.execute(
                "UPDATE queue SET state = ?1, attempt_count = ?2, last_error = ?3, next_eligible_at_ms = ?4, json = ?5 WHERE queue_id = ?6",
                params![
                    queue_state_str(entry.state),
                    entry.attempt_count,
                    error,
                    next_eligible,
                    new_json,
                    entry.queue_id,
                ],
            )
            .map_err(to_backend_err)?;
            Ok(())
        })
    }

    async fn get_queue_stats(&self) -> StorageResult<QueueStats> {
        let db = self.db.clone();
        tokio::task::block_in_place(move || {
            let conn = db.lock().unwrap_or_else(|p| p.into_inner());
            let mut stmt = conn
                .prepare("SELECT DISTINCT world_id FROM queue WHERE state = 'pending'")
                .map_err(to_backend_err)?;
            let rows = stmt
                .query_map([], |r| r.get::<_, String>(0))
                .map_err(to_backend_err)?;
            let mut worlds = Vec::new();
            for row in rows {
                worlds.push(row.map_err(to_backend_err)?);
            }
            Ok(QueueStats {
                worlds_with_pending: worlds,
            })
        })
    }

    async fn reclaim_stale(&self, max_age_secs: i64) -> StorageResult<u64> {
        let db = self.db.clone();
        tokio::task::block_in_place(move || {
            let conn = db.lock().unwrap_or_else(|p| p.into_inner());
            let now_ms = dt_to_millis(Utc::now());
            let threshold_ms = now_ms - max_age_secs * 1000;
            let n = conn
                .execute(
                    "UPDATE queue SET state = 'pending' WHERE state = 'leased' AND (last_heartbeat_at_ms IS NULL OR last_heartbeat_at_ms < ?1)",
                    params![threshold_ms],
                )
                .map_err(to_backend_err)?;
            Ok(n as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: a world saved to a sqlite-backed store survives a fresh connection.
    #[tokio::test]
    async fn save_and_reload_world_from_fresh_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world.db");
        {
            let store = SqliteStorage::new(&path).unwrap();
            store.save_world(&World::new("w1", "World One")).await.unwrap();
        }
        let store = SqliteStorage::new(&path).unwrap();
        let loaded = store.load_world("w1").await.unwrap().unwrap();
        assert_eq!(loaded.name, "World One");
    }

    /// **Scenario**: reclaim_stale flips an orphaned lease back to pending.
    #[tokio::test]
    async fn reclaim_stale_requeues_dead_lease() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStorage::new(dir.path().join("world.db")).unwrap();
        let mut entry = QueueEntry {
            queue_id: "q1".into(),
            world_id: "w1".into(),
            message_id: "m1".into(),
            chat_id: None,
            content: "hi".into(),
            sender: "HUMAN".into(),
            enqueued_at: Utc::now(),
            state: QueueState::Leased,
            attempt_count: 0,
            last_heartbeat_at: Some(Utc::now() - chrono::Duration::seconds(60)),
            last_error: None,
            next_eligible_at: None,
        };
        store.enqueue(entry.clone()).await.unwrap();
        entry.state = QueueState::Pending;
        let reclaimed = store.reclaim_stale(15).await.unwrap();
        assert_eq!(reclaimed, 1);
    }
}
