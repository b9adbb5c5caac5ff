//! Persisted shapes: World, Agent, Chat, Message, QueueEntry, ApprovalEntry.

use serde::{Deserialize, Serialize};

pub const SENDER_HUMAN: &str = "HUMAN";
pub const SENDER_SYSTEM: &str = "SYSTEM";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Inactive,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct World {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub turn_limit: u32,
    pub current_chat_id: Option<String>,
    pub agent_ids: Vec<String>,
    pub chat_ids: Vec<String>,
}

impl World {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            turn_limit: 5,
            current_chat_id: None,
            agent_ids: Vec::new(),
            chat_ids: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub world_id: String,
    pub name: String,
    pub provider: String,
    pub model: String,
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub status: AgentStatus,
    /// Calls made against `currentChatId` since it was last reset.
    pub llm_call_count: u32,
    pub last_active_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Agent {
    pub fn new(world_id: impl Into<String>, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            world_id: world_id.into(),
            name: name.into(),
            provider: "mock".into(),
            model: "mock".into(),
            system_prompt: String::new(),
            temperature: 0.7,
            max_tokens: None,
            status: AgentStatus::Active,
            llm_call_count: 0,
            last_active_at: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub world_id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub message_count: u64,
}

impl Chat {
    pub fn new(world_id: impl Into<String>, id: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: id.into(),
            world_id: world_id.into(),
            name: "New Chat".into(),
            description: None,
            created_at: now,
            updated_at: now,
            message_count: 0,
        }
    }

    /// A chat may be reused by `newChat` if it still has its default name and
    /// has never received a message (Design Notes: optimization, not invariant).
    pub fn is_reusable(&self) -> bool {
        self.name == "New Chat" && self.message_count == 0
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message_id: String,
    pub world_id: String,
    pub chat_id: String,
    pub role: MessageRole,
    pub sender: String,
    pub content: String,
    pub tool_calls: Option<serde_json::Value>,
    pub tool_call_id: Option<String>,
    pub reply_to_message_id: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Pending,
    Leased,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueEntry {
    pub queue_id: String,
    pub world_id: String,
    pub message_id: String,
    pub chat_id: Option<String>,
    pub content: String,
    pub sender: String,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub state: QueueState,
    pub attempt_count: u32,
    pub last_heartbeat_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_error: Option<String>,
    pub next_eligible_at: Option<chrono::DateTime<chrono::Utc>>,
}
