//! Text commands sent via the `command` client message (§6).

use event_bus::{CrudOperation, CrudPayload, EventBus, WorldEvent};
use world_core::{Agent, Storage};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error(transparent)]
    Storage(#[from] world_core::StorageError),
}

/// Executes one `command` text against a world, broadcasting a `crud` event
/// on any mutation (§4.8's refresh-after-mutation contract).
pub async fn handle_command(
    storage: &dyn Storage,
    bus: &EventBus,
    world_id: &str,
    text: &str,
) -> Result<serde_json::Value, CommandError> {
    let trimmed = text.trim();

    if trimmed == "/clear" {
        let world = storage
            .load_world(world_id)
            .await?
            .ok_or_else(|| world_core::StorageError::NotFound(world_id.to_string()))?;
        let label = archive_label();
        for agent_id in &world.agent_ids {
            storage.archive_memory(world_id, agent_id, &label).await?;
        }
        bus.publish(
            world_id,
            WorldEvent::Crud {
                payload: CrudPayload {
                    operation: CrudOperation::Update,
                    entity: "memory".into(),
                    id: world_id.to_string(),
                    payload: None,
                },
            },
        );
        return Ok(serde_json::json!({"ok": true, "cleared": world.agent_ids}));
    }

    if let Some(agent_id) = trimmed.strip_prefix("/clear ") {
        let agent_id = agent_id.trim();
        storage.archive_memory(world_id, agent_id, &archive_label()).await?;
        bus.publish(
            world_id,
            WorldEvent::Crud {
                payload: CrudPayload {
                    operation: CrudOperation::Update,
                    entity: "memory".into(),
                    id: agent_id.to_string(),
                    payload: None,
                },
            },
        );
        return Ok(serde_json::json!({"ok": true, "cleared": agent_id}));
    }

    if trimmed == "/getworld" {
        let world = storage
            .load_world(world_id)
            .await?
            .ok_or_else(|| world_core::StorageError::NotFound(world_id.to_string()))?;
        let agents = storage.list_agents(world_id).await?;
        let chats = storage.list_chats(world_id).await?;
        return Ok(serde_json::json!({"world": world, "agents": agents, "chats": chats}));
    }

    if let Some(rest) = trimmed.strip_prefix("/addagent ") {
        let mut parts = rest.splitn(2, ' ');
        let name = parts.next().unwrap_or("agent").trim().to_string();
        let description = parts.next().unwrap_or("").trim().to_string();
        let agent_id = uuid::Uuid::new_v4().to_string();
        let mut agent = Agent::new(world_id, agent_id.clone(), name);
        agent.system_prompt = description;
        storage.save_agent(&agent).await?;

        let mut world = storage
            .load_world(world_id)
            .await?
            .ok_or_else(|| world_core::StorageError::NotFound(world_id.to_string()))?;
        world.agent_ids.push(agent_id.clone());
        storage.save_world(&world).await?;

        bus.publish(
            world_id,
            WorldEvent::Crud {
                payload: CrudPayload {
                    operation: CrudOperation::Create,
                    entity: "agent".into(),
                    id: agent_id.clone(),
                    payload: None,
                },
            },
        );
        return Ok(serde_json::json!({"agent_id": agent_id}));
    }

    Err(CommandError::Unknown(trimmed.to_string()))
}

fn archive_label() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use world_core::{InMemoryStorage, World};

    /// **Scenario**: `/clear` archives every agent's memory and broadcasts a crud event.
    #[tokio::test]
    async fn clear_archives_all_agents_and_broadcasts() {
        let storage = InMemoryStorage::new();
        let mut world = World::new("w1", "World One");
        world.agent_ids = vec!["a1".into(), "a2".into()];
        storage.save_world(&world).await.unwrap();
        let bus = EventBus::new();
        let mut rx = bus.subscribe("w1");

        let result = handle_command(&storage, &bus, "w1", "/clear").await.unwrap();
        assert_eq!(result["ok"], true);
        let published = rx.recv().await.unwrap();
        assert!(matches!(published.event, WorldEvent::Crud { .. }));
    }

    /// **Scenario**: `/addagent` creates an agent and registers it on the world.
    #[tokio::test]
    async fn addagent_creates_and_registers() {
        let storage = InMemoryStorage::new();
        storage.save_world(&World::new("w1", "World One")).await.unwrap();
        let bus = EventBus::new();

        let result = handle_command(&storage, &bus, "w1", "/addagent Scout a lookout agent")
            .await
            .unwrap();
        let agent_id = result["agent_id"].as_str().unwrap().to_string();
        let world = storage.load_world("w1").await.unwrap().unwrap();
        assert!(world.agent_ids.contains(&agent_id));
    }

    /// **Scenario**: an unrecognized command is rejected without mutating storage.
    #[tokio::test]
    async fn unknown_command_is_rejected() {
        let storage = InMemoryStorage::new();
        storage.save_world(&World::new("w1", "World One")).await.unwrap();
        let bus = EventBus::new();
        let result = handle_command(&storage, &bus, "w1", "/bogus").await;
        assert!(matches!(result, Err(CommandError::Unknown(_))));
    }
}
