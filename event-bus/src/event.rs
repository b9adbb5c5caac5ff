//! Wire shape of the four event families a world publishes: `message`, `sse`,
//! `world`, `crud`. Each carries its own `payload`; `sse` and `world` payloads
//! are themselves tagged on a nested `type` field.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A chat message fan-out: the full persisted message, already assigned its
/// final `message_id`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: String,
    pub chat_id: String,
    pub sender: String,
    pub role: String,
    pub content: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,
}

/// Streaming fragments of one agent turn.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SsePayload {
    Start {
        agent_name: String,
        message_id: String,
    },
    Chunk {
        agent_name: String,
        message_id: String,
        content: String,
    },
    End {
        agent_name: String,
        message_id: String,
    },
    Error {
        agent_name: String,
        message_id: String,
        error: String,
    },
}

/// Tool execution and runtime lifecycle signals.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorldPayload {
    ToolStart {
        agent_name: String,
        tool_name: String,
        call_id: String,
    },
    ToolProgress {
        agent_name: String,
        tool_name: String,
        call_id: String,
        detail: String,
    },
    ToolResult {
        agent_name: String,
        tool_name: String,
        call_id: String,
        result: Value,
    },
    ToolError {
        agent_name: String,
        tool_name: String,
        call_id: String,
        error: String,
    },
    TurnLimit {
        agent_name: String,
    },
    Idle,
}

/// Queue/processing lifecycle for one enqueued message.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusPayload {
    pub world_id: String,
    pub message_id: String,
    pub status: QueueStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Config mutation broadcast (world/agent/chat CRUD).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrudOperation {
    Create,
    Update,
    Delete,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CrudPayload {
    pub operation: CrudOperation,
    pub entity: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// One event as published on a world's bus. The `type` tag names the family;
/// `payload` carries the family's own shape.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorldEvent {
    Message { payload: MessagePayload },
    Sse { payload: SsePayload },
    World { payload: WorldPayload },
    Status { payload: StatusPayload },
    Crud { payload: CrudPayload },
}

impl WorldEvent {
    /// Serializes this event to a JSON object (type + payload only; no envelope).
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_event_serializes_with_tag() {
        let ev = WorldEvent::Message {
            payload: MessagePayload {
                message_id: "m1".into(),
                chat_id: "c1".into(),
                sender: "HUMAN".into(),
                role: "user".into(),
                content: "hi".into(),
                timestamp: "2026-01-01T00:00:00Z".into(),
                tool_calls: None,
                tool_call_id: None,
                reply_to_message_id: None,
            },
        };
        let v = ev.to_value().unwrap();
        assert_eq!(v["type"], "message");
        assert_eq!(v["payload"]["message_id"], "m1");
    }

    #[test]
    fn sse_payload_tags_subtype() {
        let ev = WorldEvent::Sse {
            payload: SsePayload::Chunk {
                agent_name: "a1".into(),
                message_id: "m1".into(),
                content: "tok".into(),
            },
        };
        let v = ev.to_value().unwrap();
        assert_eq!(v["type"], "sse");
        assert_eq!(v["payload"]["type"], "chunk");
        assert_eq!(v["payload"]["content"], "tok");
    }
}
