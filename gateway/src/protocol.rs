//! Client-bound wire protocol (§6, §4.8). Server-bound traffic is the raw
//! event-bus envelope (already tagged and sequenced by [`event_bus`]) — this
//! module only shapes what a client sends in.

use serde::{Deserialize, Serialize};

/// `replayFrom`: either the literal `"beginning"` or a numeric sequence cursor.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplayFrom {
    Beginning(ReplayBeginning),
    Seq(u64),
}

/// Marker so `"beginning"` round-trips through the untagged enum above
/// instead of being swallowed by the numeric variant.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplayBeginning {
    Beginning,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    Subscribe {
        world_id: String,
        chat_id: Option<String>,
        #[serde(default = "default_replay_from")]
        replay_from: ReplayFrom,
    },
    Unsubscribe {
        world_id: String,
    },
    Enqueue {
        world_id: String,
        chat_id: Option<String>,
        content: String,
        sender: String,
    },
    Command {
        world_id: String,
        text: String,
    },
}

fn default_replay_from() -> ReplayFrom {
    ReplayFrom::Seq(u64::MAX)
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolError {
    ParseError { error: String },
    NotSubscribed { world_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_parses_beginning_replay() {
        let json = r#"{"type":"subscribe","world_id":"w1","replay_from":"beginning"}"#;
        let req: ClientRequest = serde_json::from_str(json).unwrap();
        match req {
            ClientRequest::Subscribe { world_id, replay_from, .. } => {
                assert_eq!(world_id, "w1");
                assert!(matches!(replay_from, ReplayFrom::Beginning(ReplayBeginning::Beginning)));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn subscribe_parses_numeric_replay() {
        let json = r#"{"type":"subscribe","world_id":"w1","replay_from":42}"#;
        let req: ClientRequest = serde_json::from_str(json).unwrap();
        match req {
            ClientRequest::Subscribe { replay_from, .. } => {
                assert!(matches!(replay_from, ReplayFrom::Seq(42)));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn enqueue_parses() {
        let json = r#"{"type":"enqueue","world_id":"w1","content":"hi","sender":"HUMAN"}"#;
        let req: ClientRequest = serde_json::from_str(json).unwrap();
        assert!(matches!(req, ClientRequest::Enqueue { .. }));
    }
}
