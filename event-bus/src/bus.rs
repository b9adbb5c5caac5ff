//! Per-world typed pub/sub. Each world gets its own `broadcast` channel and
//! sequence counter; emission is synchronous with respect to the caller
//! (handlers have a chance to see the event before `publish` returns because
//! `broadcast::Sender::send` only buffers, but the sequence number is
//! assigned, and the value serialized, before the call returns).

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::envelope::SeqCounter;
use crate::event::WorldEvent;

/// A sequenced, envelope-stamped event as delivered to subscribers.
#[derive(Clone, Debug)]
pub struct Published {
    pub world_id: String,
    pub seq: u64,
    pub event: WorldEvent,
    pub value: Value,
}

struct WorldChannel {
    tx: broadcast::Sender<Published>,
    seq: Mutex<SeqCounter>,
}

/// Process-wide registry of per-world broadcast channels.
///
/// `subscribe` returns a live receiver; `teardown` is the disposer a world
/// runtime calls when it unloads a world, dropping the channel so no
/// subscriber can be handed a stale sender.
#[derive(Clone, Default)]
pub struct EventBus {
    channels: Arc<DashMap<String, Arc<WorldChannel>>>,
}

const CHANNEL_CAPACITY: usize = 1024;

impl EventBus {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
        }
    }

    fn channel_for(&self, world_id: &str) -> Arc<WorldChannel> {
        self.channels
            .entry(world_id.to_string())
            .or_insert_with(|| {
                let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
                Arc::new(WorldChannel {
                    tx,
                    seq: Mutex::new(SeqCounter::new()),
                })
            })
            .clone()
    }

    /// Publishes an event to a world's subscribers, assigning the next
    /// sequence number. Returns the sequence number assigned, even if there
    /// are currently no subscribers.
    pub fn publish(&self, world_id: &str, event: WorldEvent) -> u64 {
        let channel = self.channel_for(world_id);
        let seq = channel.seq.lock().next();
        let value = crate::envelope::to_json(&event, world_id, seq)
            .unwrap_or_else(|_| serde_json::json!({"type": "error", "error": "serialize"}));
        let published = Published {
            world_id: world_id.to_string(),
            seq,
            event,
            value,
        };
        // No subscribers is not an error; broadcast::send only fails in that case.
        let _ = channel.tx.send(published);
        seq
    }

    /// Subscribes to a world's event stream from now on. Combine with replay
    /// from storage for `replayFrom` semantics (the bus itself holds no
    /// history beyond in-flight broadcast capacity).
    pub fn subscribe(&self, world_id: &str) -> broadcast::Receiver<Published> {
        self.channel_for(world_id).tx.subscribe()
    }

    /// Current sequence number for a world, or 0 if it has never published.
    pub fn current_seq(&self, world_id: &str) -> u64 {
        self.channels
            .get(world_id)
            .map(|c| c.seq.lock().current())
            .unwrap_or(0)
    }

    /// Disposer: drops a world's channel and all its subscribers' ability to
    /// receive further events. Called on world teardown.
    pub fn teardown(&self, world_id: &str) {
        self.channels.remove(world_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::WorldPayload;

    #[tokio::test]
    async fn publish_delivers_to_subscriber_with_increasing_seq() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("w1");
        let seq1 = bus.publish("w1", WorldEvent::World { payload: WorldPayload::Idle });
        let seq2 = bus.publish("w1", WorldEvent::World { payload: WorldPayload::Idle });
        assert_eq!(seq1, 1);
        assert_eq!(seq2, 2);
        let first = rx.recv().await.unwrap();
        assert_eq!(first.seq, 1);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.seq, 2);
    }

    #[test]
    fn teardown_drops_channel_state() {
        let bus = EventBus::new();
        bus.publish("w1", WorldEvent::World { payload: WorldPayload::Idle });
        assert_eq!(bus.current_seq("w1"), 1);
        bus.teardown("w1");
        assert_eq!(bus.current_seq("w1"), 0);
    }

    #[test]
    fn worlds_sequence_independently() {
        let bus = EventBus::new();
        bus.publish("a", WorldEvent::World { payload: WorldPayload::Idle });
        bus.publish("a", WorldEvent::World { payload: WorldPayload::Idle });
        bus.publish("b", WorldEvent::World { payload: WorldPayload::Idle });
        assert_eq!(bus.current_seq("a"), 2);
        assert_eq!(bus.current_seq("b"), 1);
    }
}
