//! Agent responder pipeline (§4.5): decides whether an agent responds to a
//! world message, then drives the
//! `Preparing -> Calling -> Streaming -> ToolPhase -> Finalizing` state
//! machine for one turn.

use async_trait::async_trait;
use event_bus::{EventBus, MessagePayload, SsePayload, WorldEvent, WorldPayload};
use tokio::sync::mpsc;
use world_core::{
    Agent, ApprovalCache, ApprovalDecision, MessageRole, Storage, StoredMessage, SENDER_HUMAN,
    SENDER_SYSTEM,
};

use crate::addressing::{should_respond, with_auto_mention};
use crate::error::ResponderError;
use crate::provider::{
    CompletionOutcome, CompletionRequest, ModelProvider, ProviderMessage, ResponseEvent,
    ToolCallRequest,
};

const PASS_MARKER: &str = "<world>pass</world>";
const HISTORY_WINDOW: usize = 10;

/// Pipeline states (§4.5.3), tracked for tracing/observability. The actual
/// control flow is a straight-line async function; this enum exists so spans
/// and logs can name where in the turn a fault occurred.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Receiving,
    Preparing,
    Calling,
    Streaming,
    ToolPhase,
    Approving,
    Finalizing,
    Error,
}

/// External tool execution. Real tool implementations are out of scope; the
/// responder only needs something that can run a named tool with JSON
/// arguments and report success/failure.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, arguments: &serde_json::Value) -> Result<serde_json::Value, String>;
    /// Tools in this set require an approval decision before they run.
    fn requires_approval(&self, _name: &str) -> bool {
        false
    }
}

/// Executes every call and never requires approval; useful for tests and for
/// agents with no tool configuration.
pub struct NoopToolExecutor;

#[async_trait]
impl ToolExecutor for NoopToolExecutor {
    async fn execute(&self, _name: &str, _arguments: &serde_json::Value) -> Result<serde_json::Value, String> {
        Ok(serde_json::json!({}))
    }
}

/// Outcome of dispatching one incoming message to one agent.
#[derive(Debug, Default)]
pub struct TurnOutcome {
    pub responded: bool,
    pub suppressed_by_pass: bool,
    pub awaiting_approval: bool,
    pub final_state: Option<PipelineState>,
    /// The assistant message this turn produced, when one was both generated
    /// and actually emitted (i.e. not withheld by the pass directive). The
    /// runtime feeds this back through dispatch so a reply that `@mentions`
    /// another agent reaches it, cascading until no agent is addressed or the
    /// turn limit stops each agent from answering further.
    pub outgoing_message: Option<StoredMessage>,
}

pub struct AgentResponder<P: ModelProvider, T: ToolExecutor> {
    pub provider: P,
    pub tool_executor: T,
    pub approvals: ApprovalCache,
    pub bus: EventBus,
}

impl<P: ModelProvider, T: ToolExecutor> AgentResponder<P, T> {
    pub fn new(provider: P, tool_executor: T, approvals: ApprovalCache, bus: EventBus) -> Self {
        Self {
            provider,
            tool_executor,
            approvals,
            bus,
        }
    }

    /// Handles one incoming world message for one agent: always appends it to
    /// memory (unless self-sent), then runs the full pipeline when addressed.
    pub async fn handle(
        &self,
        storage: &dyn Storage,
        agent: &mut Agent,
        message: &StoredMessage,
        turn_limit: u32,
    ) -> Result<TurnOutcome, ResponderError> {
        let _state = PipelineState::Receiving;
        if message.sender == agent.id {
            return Ok(TurnOutcome::default());
        }

        self.remember(storage, agent, message).await?;

        if !should_respond(&agent.id, &message.sender, &message.content) {
            return Ok(TurnOutcome::default());
        }

        if agent.llm_call_count >= turn_limit {
            self.bus.publish(
                &agent.world_id,
                WorldEvent::World {
                    payload: WorldPayload::TurnLimit {
                        agent_name: agent.name.clone(),
                    },
                },
            );
            return Ok(TurnOutcome {
                final_state: Some(PipelineState::Idle),
                ..Default::default()
            });
        }

        self.run_turn(storage, agent, message).await
    }

    async fn remember(
        &self,
        storage: &dyn Storage,
        agent: &Agent,
        message: &StoredMessage,
    ) -> Result<(), ResponderError> {
        let mut memory = storage.load_agent_memory(&agent.world_id, &agent.id).await?;
        memory.push(message.clone());
        storage
            .save_agent_memory(&agent.world_id, &agent.id, memory)
            .await?;
        Ok(())
    }

    async fn run_turn(
        &self,
        storage: &dyn Storage,
        agent: &mut Agent,
        incoming: &StoredMessage,
    ) -> Result<TurnOutcome, ResponderError> {
        let chat_id = incoming.chat_id.clone();
        let message_id = uuid::Uuid::new_v4().to_string();

        self.bus.publish(
            &agent.world_id,
            WorldEvent::Sse {
                payload: SsePayload::Start {
                    agent_name: agent.name.clone(),
                    message_id: message_id.clone(),
                },
            },
        );

        let mut history = self.build_history(storage, agent, &chat_id).await?;
        let mut tool_call_results: Vec<ProviderMessage> = Vec::new();
        let mut final_content = String::new();
        let mut rounds = 0usize;
        const MAX_TOOL_ROUNDS: usize = 8;

        loop {
            rounds += 1;
            let request = CompletionRequest {
                system_prompt: agent.system_prompt.clone(),
                history: {
                    let mut h = history.clone();
                    h.extend(tool_call_results.clone());
                    h
                },
                temperature: agent.temperature,
                max_tokens: agent.max_tokens,
            };

            let (tx, mut rx) = mpsc::channel(64);
            let agent_name = agent.name.clone();
            let world_id = agent.world_id.clone();
            let bus = self.bus.clone();
            let message_id_for_stream = message_id.clone();
            let forward = tokio::spawn(async move {
                while let Some(ev) = rx.recv().await {
                    if let ResponseEvent::TextDelta(content) = ev {
                        bus.publish(
                            &world_id,
                            WorldEvent::Sse {
                                payload: SsePayload::Chunk {
                                    agent_name: agent_name.clone(),
                                    message_id: message_id_for_stream.clone(),
                                    content,
                                },
                            },
                        );
                    }
                }
            });

            let outcome = match self.provider.complete(request, Some(tx)).await {
                Ok(o) => o,
                Err(e) => {
                    let _ = forward.await;
                    self.bus.publish(
                        &agent.world_id,
                        WorldEvent::Sse {
                            payload: SsePayload::Error {
                                agent_name: agent.name.clone(),
                                message_id: message_id.clone(),
                                error: e.to_string(),
                            },
                        },
                    );
                    return Ok(TurnOutcome {
                        final_state: Some(PipelineState::Error),
                        ..Default::default()
                    });
                }
            };
            let _ = forward.await;

            final_content = outcome.content.clone();

            if outcome.tool_calls.is_empty() || rounds > MAX_TOOL_ROUNDS {
                break;
            }

            let awaiting = self
                .run_tool_phase(agent, &chat_id, &outcome, &mut tool_call_results)
                .await;
            if awaiting {
                self.bus.publish(
                    &agent.world_id,
                    WorldEvent::Sse {
                        payload: SsePayload::End {
                            agent_name: agent.name.clone(),
                            message_id: message_id.clone(),
                        },
                    },
                );
                return Ok(TurnOutcome {
                    responded: false,
                    awaiting_approval: true,
                    final_state: Some(PipelineState::Approving),
                    ..Default::default()
                });
            }
        }

        self.bus.publish(
            &agent.world_id,
            WorldEvent::Sse {
                payload: SsePayload::End {
                    agent_name: agent.name.clone(),
                    message_id: message_id.clone(),
                },
            },
        );

        agent.llm_call_count += 1;
        agent.last_active_at = Some(chrono::Utc::now());

        let suppressed = final_content.to_lowercase().contains(&PASS_MARKER.to_lowercase());
        let outgoing_content = if suppressed {
            final_content.clone()
        } else if incoming.sender != SENDER_HUMAN && incoming.sender != SENDER_SYSTEM {
            with_auto_mention(&final_content, &incoming.sender)
        } else {
            final_content.clone()
        };

        let assistant_message = StoredMessage {
            message_id: message_id.clone(),
            world_id: agent.world_id.clone(),
            chat_id: chat_id.clone(),
            role: MessageRole::Assistant,
            sender: agent.id.clone(),
            content: outgoing_content,
            tool_calls: None,
            tool_call_id: None,
            reply_to_message_id: Some(incoming.message_id.clone()),
            timestamp: chrono::Utc::now(),
        };

        let mut memory = storage.load_agent_memory(&agent.world_id, &agent.id).await?;
        memory.push(assistant_message.clone());
        storage
            .save_agent_memory(&agent.world_id, &agent.id, memory)
            .await?;
        storage.save_message(&assistant_message).await?;
        storage.save_agent(agent).await?;

        if !suppressed {
            self.bus.publish(
                &agent.world_id,
                WorldEvent::Message {
                    payload: MessagePayload {
                        message_id: assistant_message.message_id.clone(),
                        chat_id: assistant_message.chat_id.clone(),
                        sender: assistant_message.sender.clone(),
                        role: "assistant".into(),
                        content: assistant_message.content.clone(),
                        timestamp: assistant_message.timestamp.to_rfc3339(),
                        tool_calls: None,
                        tool_call_id: None,
                        reply_to_message_id: assistant_message.reply_to_message_id.clone(),
                    },
                },
            );
        }

        Ok(TurnOutcome {
            responded: true,
            suppressed_by_pass: suppressed,
            final_state: Some(PipelineState::Finalizing),
            outgoing_message: if suppressed { None } else { Some(assistant_message) },
            ..Default::default()
        })
    }

    /// Runs one round of tool calls. Returns `true` if the turn must pause
    /// because a tool requires an approval decision not yet in the cache.
    async fn run_tool_phase(
        &self,
        agent: &Agent,
        chat_id: &str,
        outcome: &CompletionOutcome,
        tool_results: &mut Vec<ProviderMessage>,
    ) -> bool {
        for call in &outcome.tool_calls {
            if call.name.trim().is_empty() {
                self.bus.publish(
                    &agent.world_id,
                    WorldEvent::World {
                        payload: WorldPayload::ToolError {
                            agent_name: agent.name.clone(),
                            tool_name: String::new(),
                            call_id: call.id.clone(),
                            error: "malformed tool call: missing name".into(),
                        },
                    },
                );
                tool_results.push(tool_result_message(
                    &call.id,
                    serde_json::json!({"error": "malformed tool call: missing name"}),
                ));
                continue;
            }

            self.bus.publish(
                &agent.world_id,
                WorldEvent::World {
                    payload: WorldPayload::ToolStart {
                        agent_name: agent.name.clone(),
                        tool_name: call.name.clone(),
                        call_id: call.id.clone(),
                    },
                },
            );

            if self.tool_executor.requires_approval(&call.name) {
                match self.approvals.get(chat_id, &call.name) {
                    Some(ApprovalDecision::Approve) => {}
                    Some(ApprovalDecision::Deny) => {
                        self.bus.publish(
                            &agent.world_id,
                            WorldEvent::World {
                                payload: WorldPayload::ToolResult {
                                    agent_name: agent.name.clone(),
                                    tool_name: call.name.clone(),
                                    call_id: call.id.clone(),
                                    result: serde_json::json!({"decision": "deny"}),
                                },
                            },
                        );
                        tool_results.push(tool_result_message(
                            &call.id,
                            serde_json::json!({"decision": "deny"}),
                        ));
                        continue;
                    }
                    None => return true,
                }
            }

            match self.tool_executor.execute(&call.name, &call.arguments).await {
                Ok(result) => {
                    self.bus.publish(
                        &agent.world_id,
                        WorldEvent::World {
                            payload: WorldPayload::ToolResult {
                                agent_name: agent.name.clone(),
                                tool_name: call.name.clone(),
                                call_id: call.id.clone(),
                                result: result.clone(),
                            },
                        },
                    );
                    tool_results.push(tool_result_message(&call.id, result));
                }
                Err(error) => {
                    self.bus.publish(
                        &agent.world_id,
                        WorldEvent::World {
                            payload: WorldPayload::ToolError {
                                agent_name: agent.name.clone(),
                                tool_name: call.name.clone(),
                                call_id: call.id.clone(),
                                error: error.clone(),
                            },
                        },
                    );
                    tool_results.push(tool_result_message(
                        &call.id,
                        serde_json::json!({"error": error}),
                    ));
                }
            }
        }
        false
    }

    async fn build_history(
        &self,
        storage: &dyn Storage,
        agent: &Agent,
        chat_id: &str,
    ) -> Result<Vec<ProviderMessage>, ResponderError> {
        let memory = storage.load_agent_memory(&agent.world_id, &agent.id).await?;
        let mut scoped: Vec<&StoredMessage> =
            memory.iter().filter(|m| m.chat_id == chat_id).collect();

        // Never orphan a tool response: if truncation would cut the window
        // right after a tool-call-bearing assistant message, extend it left
        // until the corresponding tool message is included too.
        if scoped.len() > HISTORY_WINDOW {
            let mut start = scoped.len() - HISTORY_WINDOW;
            while start > 0 && scoped[start].role == MessageRole::Tool {
                start -= 1;
            }
            scoped = scoped.split_off(start);
        }

        Ok(scoped
            .into_iter()
            .map(|m| ProviderMessage {
                role: role_str(m.role).to_string(),
                content: m.content.clone(),
                tool_call_id: m.tool_call_id.clone(),
                tool_calls: m.tool_calls.clone(),
            })
            .collect())
    }
}

fn role_str(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::System => "system",
        MessageRole::Tool => "tool",
    }
}

fn tool_result_message(call_id: &str, result: serde_json::Value) -> ProviderMessage {
    ProviderMessage {
        role: "tool".to_string(),
        content: result.to_string(),
        tool_call_id: Some(call_id.to_string()),
        tool_calls: None,
    }
}

/// Parses an inbound message's content for the `__type: "tool_result"`
/// envelope (§4.5.4). Returns `None` for plain user text.
pub fn parse_tool_result_envelope(content: &str) -> Option<(String, Option<String>, String)> {
    let value: serde_json::Value = serde_json::from_str(content).ok()?;
    if value.get("__type")?.as_str()? != "tool_result" {
        return None;
    }
    let tool_call_id = value.get("tool_call_id")?.as_str()?.to_string();
    let agent_id = value.get("agentId").and_then(|v| v.as_str()).map(String::from);
    let inner_content = value.get("content")?.as_str()?.to_string();
    Some((tool_call_id, agent_id, inner_content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProvider;
    use world_core::{InMemoryStorage, World};

    fn incoming(world_id: &str, chat_id: &str, sender: &str, content: &str) -> StoredMessage {
        StoredMessage {
            message_id: uuid::Uuid::new_v4().to_string(),
            world_id: world_id.into(),
            chat_id: chat_id.into(),
            role: MessageRole::User,
            sender: sender.into(),
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            reply_to_message_id: None,
            timestamp: chrono::Utc::now(),
        }
    }

    /// **Scenario**: broadcast elicits a response and increments the call count.
    #[tokio::test]
    async fn broadcast_message_produces_assistant_reply() {
        let storage = InMemoryStorage::new();
        storage.save_world(&World::new("w1", "W")).await.unwrap();
        let mut agent = Agent::new("w1", "a1", "Agent One");
        let responder = AgentResponder::new(
            MockProvider::text("hello there"),
            NoopToolExecutor,
            ApprovalCache::new(),
            EventBus::new(),
        );
        let msg = incoming("w1", "c1", SENDER_HUMAN, "Hello team!");
        let outcome = responder.handle(&storage, &mut agent, &msg, 5).await.unwrap();
        assert!(outcome.responded);
        assert_eq!(agent.llm_call_count, 1);
        let mem = storage.load_agent_memory("w1", "a1").await.unwrap();
        assert_eq!(mem.len(), 2);
        assert_eq!(mem[1].role, MessageRole::Assistant);
    }

    /// **Scenario**: a message addressed to a different agent is remembered but not answered.
    #[tokio::test]
    async fn unaddressed_direct_mention_is_remembered_only() {
        let storage = InMemoryStorage::new();
        let mut agent = Agent::new("w1", "a2", "Agent Two");
        let responder = AgentResponder::new(
            MockProvider::text("should not be used"),
            NoopToolExecutor,
            ApprovalCache::new(),
            EventBus::new(),
        );
        let msg = incoming("w1", "c1", SENDER_HUMAN, "@a1 please summarize.");
        let outcome = responder.handle(&storage, &mut agent, &msg, 5).await.unwrap();
        assert!(!outcome.responded);
        assert_eq!(agent.llm_call_count, 0);
        let mem = storage.load_agent_memory("w1", "a2").await.unwrap();
        assert_eq!(mem.len(), 1);
    }

    /// **Scenario**: a pass directive is stored but suppresses the outgoing event.
    #[tokio::test]
    async fn pass_directive_suppresses_message_but_not_memory() {
        let storage = InMemoryStorage::new();
        let mut agent = Agent::new("w1", "a1", "Agent One");
        let responder = AgentResponder::new(
            MockProvider::text("<world>pass</world>"),
            NoopToolExecutor,
            ApprovalCache::new(),
            EventBus::new(),
        );
        let msg = incoming("w1", "c1", SENDER_HUMAN, "anything");
        let outcome = responder.handle(&storage, &mut agent, &msg, 5).await.unwrap();
        assert!(outcome.responded);
        assert!(outcome.suppressed_by_pass);
    }

    /// **Scenario**: hitting the turn limit stops the agent from calling the provider again.
    #[tokio::test]
    async fn turn_limit_blocks_further_calls() {
        let storage = InMemoryStorage::new();
        let mut agent = Agent::new("w1", "a1", "Agent One");
        agent.llm_call_count = 5;
        let responder = AgentResponder::new(
            MockProvider::text("should not run"),
            NoopToolExecutor,
            ApprovalCache::new(),
            EventBus::new(),
        );
        let msg = incoming("w1", "c1", SENDER_HUMAN, "keep going");
        let outcome = responder.handle(&storage, &mut agent, &msg, 5).await.unwrap();
        assert!(!outcome.responded);
        assert_eq!(agent.llm_call_count, 5);
    }

    /// **Scenario**: a tool requiring approval with no cached decision pauses the turn.
    #[tokio::test]
    async fn tool_requiring_uncached_approval_pauses_turn() {
        struct GatedExecutor;
        #[async_trait]
        impl ToolExecutor for GatedExecutor {
            async fn execute(&self, _n: &str, _a: &serde_json::Value) -> Result<serde_json::Value, String> {
                Ok(serde_json::json!({}))
            }
            fn requires_approval(&self, name: &str) -> bool {
                name == "shell"
            }
        }
        let storage = InMemoryStorage::new();
        let mut agent = Agent::new("w1", "a1", "Agent One");
        let call = ToolCallRequest {
            id: "call-1".into(),
            name: "shell".into(),
            arguments: serde_json::json!({}),
        };
        let responder = AgentResponder::new(
            MockProvider::with_tool_call("running a command", call),
            GatedExecutor,
            ApprovalCache::new(),
            EventBus::new(),
        );
        let msg = incoming("w1", "c1", SENDER_HUMAN, "run it");
        let outcome = responder.handle(&storage, &mut agent, &msg, 5).await.unwrap();
        assert!(outcome.awaiting_approval);
        assert!(!outcome.responded);
    }

    #[test]
    fn parses_tool_result_envelope() {
        let content = r#"{"__type":"tool_result","tool_call_id":"c1","content":"ok"}"#;
        let (id, agent_id, inner) = parse_tool_result_envelope(content).unwrap();
        assert_eq!(id, "c1");
        assert!(agent_id.is_none());
        assert_eq!(inner, "ok");
    }

    #[test]
    fn plain_text_is_not_a_tool_result_envelope() {
        assert!(parse_tool_result_envelope("just chatting").is_none());
    }
}
