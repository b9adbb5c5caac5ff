//! World runtime (§4.4): hydrates a world's agents, fans an incoming message
//! out to every agent's responder, resets turn counters on human/system
//! input, and emits `world.idle` once every in-flight pipeline has settled.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use event_bus::{EventBus, WorldEvent, WorldPayload};
use tracing::warn;
use world_core::{Agent, Storage, StoredMessage, SENDER_HUMAN, SENDER_SYSTEM};

use crate::error::RuntimeError;
use crate::provider::ModelProvider;
use crate::responder::{AgentResponder, ToolExecutor, TurnOutcome};

/// Type-erased dispatch entry point so the queue processor (which hosts many
/// worlds, potentially with different provider/tool-executor types) can hold
/// a `WorldRuntime<P, T>` behind one object-safe trait.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, message: &StoredMessage) -> Result<Vec<TurnOutcome>, RuntimeError>;
}

/// Tracks in-flight pipelines for one world so the runtime knows when to
/// announce idleness (§4.4: idle means zero agents mid-turn).
#[derive(Default)]
struct InFlight(AtomicU32);

impl InFlight {
    fn enter(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
    fn exit(&self) -> u32 {
        self.0.fetch_sub(1, Ordering::SeqCst) - 1
    }
}

pub struct WorldRuntime<P: ModelProvider, T: ToolExecutor> {
    world_id: String,
    storage: Arc<dyn Storage>,
    bus: EventBus,
    responder: Arc<AgentResponder<P, T>>,
    in_flight: Arc<InFlight>,
}

impl<P: ModelProvider + 'static, T: ToolExecutor + 'static> WorldRuntime<P, T> {
    pub fn new(
        world_id: impl Into<String>,
        storage: Arc<dyn Storage>,
        bus: EventBus,
        responder: AgentResponder<P, T>,
    ) -> Self {
        Self {
            world_id: world_id.into(),
            storage,
            bus,
            responder: Arc::new(responder),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Loads every agent registered to this world (hydration after a restart
    /// or before the first dispatch).
    pub async fn hydrate(&self) -> Result<Vec<Agent>, RuntimeError> {
        let world = self
            .storage
            .load_world(&self.world_id)
            .await?
            .ok_or_else(|| RuntimeError::WorldNotFound(self.world_id.clone()))?;
        let mut agents = Vec::with_capacity(world.agent_ids.len());
        for agent_id in &world.agent_ids {
            match self.storage.load_agent(&self.world_id, agent_id).await? {
                Some(agent) => agents.push(agent),
                None => warn!(world_id = %self.world_id, %agent_id, "agent listed but missing"),
            }
        }
        Ok(agents)
    }

    /// Dispatches one incoming message to every hydrated agent, then feeds
    /// each agent's own reply back through the same fan-out (§4.5.2): a reply
    /// that `@mentions` another agent reaches that agent as a new message,
    /// cascading hand-off-style conversations. Human/system senders reset
    /// every agent's turn counter once, at the start of the cascade; agent-to-
    /// agent messages never reset it, so each agent's own `turn_limit` is what
    /// eventually drains the queue.
    pub async fn dispatch(&self, message: &StoredMessage) -> Result<Vec<TurnOutcome>, RuntimeError> {
        let world = self
            .storage
            .load_world(&self.world_id)
            .await?
            .ok_or_else(|| RuntimeError::WorldNotFound(self.world_id.clone()))?;

        let reset_turns = message.sender == SENDER_HUMAN || message.sender == SENDER_SYSTEM;

        let mut outcomes = Vec::new();
        let mut queue: std::collections::VecDeque<StoredMessage> = std::collections::VecDeque::new();
        queue.push_back(message.clone());
        let mut is_first_message = true;

        while let Some(current) = queue.pop_front() {
            let reset_this_round = is_first_message && reset_turns;
            is_first_message = false;

            for agent_id in &world.agent_ids {
                let Some(mut agent) = self.storage.load_agent(&self.world_id, agent_id).await? else {
                    continue;
                };
                if reset_this_round {
                    agent.llm_call_count = 0;
                }

                self.in_flight.enter();
                let outcome = self
                    .responder
                    .handle(self.storage.as_ref(), &mut agent, &current, world.turn_limit)
                    .await;
                if self.in_flight.exit() == 0 {
                    self.bus.publish(
                        &self.world_id,
                        WorldEvent::World {
                            payload: WorldPayload::Idle,
                        },
                    );
                }

                let outcome = outcome?;
                if !outcome.responded && reset_this_round {
                    self.storage.save_agent(&agent).await?;
                }
                if let Some(reply) = &outcome.outgoing_message {
                    queue.push_back(reply.clone());
                }
                outcomes.push(outcome);
            }
        }
        Ok(outcomes)
    }
}

#[async_trait]
impl<P: ModelProvider + 'static, T: ToolExecutor + 'static> Dispatcher for WorldRuntime<P, T> {
    async fn dispatch(&self, message: &StoredMessage) -> Result<Vec<TurnOutcome>, RuntimeError> {
        WorldRuntime::dispatch(self, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProvider;
    use crate::responder::NoopToolExecutor;
    use world_core::{ApprovalCache, InMemoryStorage, MessageRole, World};

    fn mk_message(world_id: &str, chat_id: &str, sender: &str, content: &str) -> StoredMessage {
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

    /// **Scenario**: a human broadcast reaches both hydrated agents and the
    /// world goes idle once both turns finish.
    #[tokio::test]
    async fn dispatch_reaches_all_agents_and_publishes_idle() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let mut world = World::new("w1", "World One");
        world.agent_ids = vec!["a1".into(), "a2".into()];
        storage.save_world(&world).await.unwrap();
        storage.save_agent(&Agent::new("w1", "a1", "Agent One")).await.unwrap();
        storage.save_agent(&Agent::new("w1", "a2", "Agent Two")).await.unwrap();

        let bus = EventBus::new();
        let mut rx = bus.subscribe("w1");
        let responder = AgentResponder::new(
            MockProvider::text("ack"),
            NoopToolExecutor,
            ApprovalCache::new(),
            bus.clone(),
        );
        let runtime = WorldRuntime::new("w1", storage, bus, responder);

        let msg = mk_message("w1", "c1", SENDER_HUMAN, "Hello team!");
        let outcomes = runtime.dispatch(&msg).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.responded));

        let mut saw_idle = false;
        while let Ok(published) = rx.try_recv() {
            if matches!(
                published.event,
                WorldEvent::World { payload: WorldPayload::Idle }
            ) {
                saw_idle = true;
            }
        }
        assert!(saw_idle);
    }

    /// **Scenario**: a human message resets an agent's turn counter even when
    /// that agent does not respond (it was addressed to someone else).
    #[tokio::test]
    async fn human_message_resets_turn_count_for_unaddressed_agents() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let mut world = World::new("w1", "World One");
        world.agent_ids = vec!["a1".into(), "a2".into()];
        storage.save_world(&world).await.unwrap();
        let mut maxed = Agent::new("w1", "a2", "Agent Two");
        maxed.llm_call_count = 5;
        storage.save_agent(&Agent::new("w1", "a1", "Agent One")).await.unwrap();
        storage.save_agent(&maxed).await.unwrap();

        let bus = EventBus::new();
        let responder = AgentResponder::new(
            MockProvider::text("ack"),
            NoopToolExecutor,
            ApprovalCache::new(),
            bus.clone(),
        );
        let runtime = WorldRuntime::new("w1", storage.clone(), bus, responder);

        let msg = mk_message("w1", "c1", SENDER_HUMAN, "@a1 only you please");
        runtime.dispatch(&msg).await.unwrap();

        let reloaded = storage.load_agent("w1", "a2").await.unwrap().unwrap();
        assert_eq!(reloaded.llm_call_count, 0);
    }

    /// **Scenario**: an agent's own reply `@mentions` another agent, and that
    /// mention reaches the second agent through the same dispatch call — the
    /// hand-off cascades instead of stopping after the first pass. With
    /// `turn_limit` set to 1, the mentioned agent has already spent its one
    /// turn answering the broadcast, so the cascaded mention is refused and
    /// emits `turn-limit` within the very same human turn.
    #[tokio::test]
    async fn agent_reply_mention_cascades_to_the_mentioned_agent() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let mut world = World::new("w1", "World One");
        world.turn_limit = 1;
        world.agent_ids = vec!["a1".into(), "a2".into()];
        storage.save_world(&world).await.unwrap();
        storage.save_agent(&Agent::new("w1", "a1", "Agent One")).await.unwrap();
        storage.save_agent(&Agent::new("w1", "a2", "Agent Two")).await.unwrap();

        let bus = EventBus::new();
        let mut rx = bus.subscribe("w1");
        let responder = AgentResponder::new(
            MockProvider::text("@a2 keep going"),
            NoopToolExecutor,
            ApprovalCache::new(),
            bus.clone(),
        );
        let runtime = WorldRuntime::new("w1", storage.clone(), bus, responder);

        let msg = mk_message("w1", "c1", SENDER_HUMAN, "Hello team!");
        let outcomes = runtime.dispatch(&msg).await.unwrap();

        // Both agents answer the broadcast; a1's reply then mentions a2,
        // which is dispatched again and refused for having hit turn_limit.
        assert!(outcomes.len() > 2, "cascade must produce more than the two broadcast outcomes");
        let a1 = storage.load_agent("w1", "a1").await.unwrap().unwrap();
        let a2 = storage.load_agent("w1", "a2").await.unwrap().unwrap();
        assert_eq!(a1.llm_call_count, 1);
        assert_eq!(a2.llm_call_count, 1);

        let mut saw_turn_limit = false;
        while let Ok(published) = rx.try_recv() {
            if let WorldEvent::World { payload: WorldPayload::TurnLimit { agent_name } } = published.event {
                assert_eq!(agent_name, "Agent Two");
                saw_turn_limit = true;
            }
        }
        assert!(saw_turn_limit, "cascaded mention past turn_limit must emit turn-limit");
    }
}
