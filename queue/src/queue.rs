//! Thin facade over [`world_core::Storage`]'s queue methods (§4.3): owns
//! queue-id/message-id generation so callers never construct a `QueueEntry`
//! by hand.

use std::sync::Arc;

use world_core::{QueueEntry, QueueState, Storage, StorageResult};

#[derive(Clone)]
pub struct Queue {
    storage: Arc<dyn Storage>,
}

impl Queue {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Enqueues one message for a world. `message_id` is pre-generated when
    /// absent so it can double as the idempotency key a caller already knows
    /// about (e.g. a client-supplied id) or a fresh one otherwise.
    pub async fn enqueue(
        &self,
        world_id: &str,
        content: impl Into<String>,
        sender: impl Into<String>,
        chat_id: Option<String>,
        message_id: Option<String>,
    ) -> StorageResult<QueueEntry> {
        let entry = QueueEntry {
            queue_id: uuid::Uuid::new_v4().to_string(),
            world_id: world_id.to_string(),
            message_id: message_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            chat_id,
            content: content.into(),
            sender: sender.into(),
            enqueued_at: chrono::Utc::now(),
            state: QueueState::Pending,
            attempt_count: 0,
            last_heartbeat_at: None,
            last_error: None,
            next_eligible_at: None,
        };
        self.storage.enqueue(entry).await
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        self.storage.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use world_core::InMemoryStorage;

    /// **Scenario**: enqueue generates distinct ids and the entry starts pending.
    #[tokio::test]
    async fn enqueue_assigns_ids_and_pending_state() {
        let queue = Queue::new(Arc::new(InMemoryStorage::new()));
        let a = queue
            .enqueue("w1", "hello", "HUMAN", None, None)
            .await
            .unwrap();
        let b = queue
            .enqueue("w1", "again", "HUMAN", None, None)
            .await
            .unwrap();
        assert_eq!(a.state, QueueState::Pending);
        assert_ne!(a.queue_id, b.queue_id);
        assert_ne!(a.message_id, b.message_id);
    }
}
