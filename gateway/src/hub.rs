//! Subscription hub (§4.8): one task per connection, replay-on-subscribe,
//! live fan-out from the event bus, and user-echo suppression.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use event_bus::{EventBus, MessagePayload, WorldEvent};
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::warn;
use world_core::{MessageRole, Storage, SENDER_HUMAN};

use queue::Queue;

use crate::commands::handle_command;
use crate::protocol::{ClientRequest, ProtocolError, ReplayFrom};

pub struct SubscriptionHub {
    storage: Arc<dyn Storage>,
    bus: EventBus,
    queue: Queue,
}

impl SubscriptionHub {
    pub fn new(storage: Arc<dyn Storage>, bus: EventBus, queue: Queue) -> Self {
        Self { storage, bus, queue }
    }

    pub async fn handle_connection(self: Arc<Self>, socket: WebSocket) {
        let (mut ws_tx, mut ws_rx) = socket.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        let client_identity = SENDER_HUMAN.to_string();

        let send_task: JoinHandle<()> = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_tx.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let mut subscriptions: HashMap<String, JoinHandle<()>> = HashMap::new();

        while let Some(res) = ws_rx.next().await {
            let msg = match res {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "websocket read error");
                    break;
                }
            };
            let text = match msg {
                Message::Text(t) => t,
                Message::Close(_) => break,
                _ => continue,
            };

            let req: ClientRequest = match serde_json::from_str(&text) {
                Ok(r) => r,
                Err(e) => {
                    let err = ProtocolError::ParseError { error: e.to_string() };
                    let _ = send_json(&out_tx, &err).await;
                    continue;
                }
            };

            match req {
                ClientRequest::Subscribe {
                    world_id,
                    chat_id,
                    replay_from,
                } => {
                    self.replay(&world_id, chat_id.as_deref(), &replay_from, &out_tx).await;
                    subscriptions.entry(world_id.clone()).or_insert_with(|| {
                        self.spawn_forwarder(world_id, client_identity.clone(), out_tx.clone())
                    });
                }
                ClientRequest::Unsubscribe { world_id } => {
                    if let Some(handle) = subscriptions.remove(&world_id) {
                        handle.abort();
                    }
                }
                ClientRequest::Enqueue {
                    world_id,
                    chat_id,
                    content,
                    sender,
                } => {
                    if let Err(e) = self.queue.enqueue(&world_id, content, sender, chat_id, None).await {
                        warn!(%world_id, error = %e, "enqueue failed");
                    }
                }
                ClientRequest::Command { world_id, text } => {
                    match handle_command(self.storage.as_ref(), &self.bus, &world_id, &text).await {
                        Ok(result) => {
                            let ack = serde_json::json!({"type": "command_result", "ok": true, "result": result});
                            let _ = out_tx.send(Message::Text(ack.to_string())).await;
                        }
                        Err(e) => {
                            let err = serde_json::json!({"type": "command_result", "ok": false, "error": e.to_string()});
                            let _ = out_tx.send(Message::Text(err.to_string())).await;
                        }
                    }
                }
            }
        }

        for (_, handle) in subscriptions {
            handle.abort();
        }
        send_task.abort();
    }

    /// Replays stored messages for `"beginning"`. Numeric `replayFrom` cursors
    /// rely on the live forwarder attached immediately after this call — the
    /// bus itself keeps no history older than its broadcast buffer, so a
    /// cursor pointing further back than that buffer only resumes from "now".
    async fn replay(
        &self,
        world_id: &str,
        chat_id: Option<&str>,
        replay_from: &ReplayFrom,
        out_tx: &mpsc::Sender<Message>,
    ) {
        if !matches!(replay_from, ReplayFrom::Beginning(_)) {
            return;
        }
        let chat_id = chat_id.unwrap_or("");
        let messages = match self.storage.list_messages(world_id, chat_id).await {
            Ok(m) => m,
            Err(e) => {
                warn!(%world_id, error = %e, "replay list_messages failed");
                return;
            }
        };
        for message in messages {
            let event = WorldEvent::Message {
                payload: MessagePayload {
                    message_id: message.message_id,
                    chat_id: message.chat_id,
                    sender: message.sender,
                    role: role_str(message.role).to_string(),
                    content: message.content,
                    timestamp: message.timestamp.to_rfc3339(),
                    tool_calls: message.tool_calls,
                    tool_call_id: message.tool_call_id,
                    reply_to_message_id: message.reply_to_message_id,
                },
            };
            let _ = send_json(out_tx, &event).await;
        }
    }

    fn spawn_forwarder(
        &self,
        world_id: String,
        client_identity: String,
        out_tx: mpsc::Sender<Message>,
    ) -> JoinHandle<()> {
        let mut rx = self.bus.subscribe(&world_id);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(published) => {
                        if suppress_for(&published.event, &client_identity) {
                            continue;
                        }
                        if out_tx.send(Message::Text(published.value.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// User-echo suppression (§4.8): a message authored by this connection's own
/// outgoing identity is not re-delivered to it.
fn suppress_for(event: &WorldEvent, client_identity: &str) -> bool {
    matches!(event, WorldEvent::Message { payload } if payload.sender == client_identity)
}

fn role_str(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::System => "system",
        MessageRole::Tool => "tool",
    }
}

async fn send_json<T: serde::Serialize>(tx: &mpsc::Sender<Message>, value: &T) -> Result<(), ()> {
    let text = serde_json::to_string(value).map_err(|_| ())?;
    tx.send(Message::Text(text)).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_bus::SsePayload;

    /// **Scenario**: a message event from this connection's own identity is suppressed.
    #[test]
    fn suppresses_own_identity_message() {
        let event = WorldEvent::Message {
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
        assert!(suppress_for(&event, "HUMAN"));
        assert!(!suppress_for(&event, "some-agent"));
    }

    /// **Scenario**: non-message events are never suppressed.
    #[test]
    fn never_suppresses_sse_events() {
        let event = WorldEvent::Sse {
            payload: SsePayload::Chunk {
                agent_name: "a1".into(),
                message_id: "m1".into(),
                content: "tok".into(),
            },
        };
        assert!(!suppress_for(&event, "HUMAN"));
    }
}
