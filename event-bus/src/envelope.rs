//! Per-world sequencing envelope: `world_id` + monotonically increasing `seq`.
//! This is what a subscriber's numeric `replayFrom` cursor is measured against.

use serde_json::Value;

/// Envelope fields merged onto every emitted event.
#[derive(Clone, Debug, Default)]
pub struct Envelope {
    pub world_id: Option<String>,
    pub seq: Option<u64>,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_world_id(mut self, id: impl Into<String>) -> Self {
        self.world_id = Some(id.into());
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    /// Merges envelope fields into the given JSON object. Does not overwrite
    /// existing keys.
    pub fn inject_into(&self, obj: &mut Value) {
        let Some(obj) = obj.as_object_mut() else {
            return;
        };
        if let Some(ref id) = self.world_id {
            obj.entry("world_id")
                .or_insert_with(|| Value::String(id.clone()));
        }
        if let Some(seq) = self.seq {
            obj.entry("seq")
                .or_insert_with(|| Value::Number(serde_json::Number::from(seq)));
        }
    }
}

/// Per-world sequence counter. One instance lives behind each world's bus
/// entry; `next()` is the only way to mint a `seq`, so gaps never appear.
#[derive(Debug, Default)]
pub struct SeqCounter(u64);

impl SeqCounter {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn next(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }

    pub fn current(&self) -> u64 {
        self.0
    }
}

/// Converts an event to JSON and injects the envelope for the given world and
/// sequence number.
pub fn to_json<E: serde::Serialize>(
    event: &E,
    world_id: &str,
    seq: u64,
) -> Result<Value, serde_json::Error> {
    let mut value = serde_json::to_value(event)?;
    Envelope::new()
        .with_world_id(world_id)
        .with_seq(seq)
        .inject_into(&mut value);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{MessagePayload, WorldEvent};

    #[test]
    fn envelope_inject_does_not_overwrite() {
        let mut obj = serde_json::json!({"type":"message","world_id":"kept"});
        let env = Envelope::new().with_world_id("w1").with_seq(3);
        env.inject_into(&mut obj);
        assert_eq!(obj["world_id"], "kept");
        assert_eq!(obj["seq"], 3);
    }

    #[test]
    fn to_json_injects_world_and_seq() {
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
        let value = to_json(&ev, "w1", 1).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["world_id"], "w1");
        assert_eq!(value["seq"], 1);
    }

    #[test]
    fn seq_counter_is_monotonic() {
        let mut c = SeqCounter::new();
        assert_eq!(c.next(), 1);
        assert_eq!(c.next(), 2);
        assert_eq!(c.current(), 2);
    }
}
