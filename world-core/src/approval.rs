//! Process-wide, chat-scoped tool-approval cache (§4.6).

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Deny,
}

/// Lifetime of a tool-use decision: `once` never reaches the cache (the
/// caller should not call `set` for it); `session` is cached here until the
/// chat's lifecycle ends (`clear`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalScope {
    Once,
    Session,
}

#[derive(Clone, Debug)]
struct Entry {
    decision: ApprovalDecision,
    timestamp: chrono::DateTime<chrono::Utc>,
}

fn cache_key(chat_id: &str, tool: &str) -> String {
    format!("{chat_id}\0{tool}")
}

/// Process-wide approval cache, keyed by `(chat_id, tool_name)`.
#[derive(Clone, Default)]
pub struct ApprovalCache {
    entries: std::sync::Arc<DashMap<String, Entry>>,
}

impl ApprovalCache {
    pub fn new() -> Self {
        Self {
            entries: std::sync::Arc::new(DashMap::new()),
        }
    }

    /// Records a `session`-scoped decision. Rejects an empty `chat_id` or
    /// `tool` rather than silently caching a useless key.
    pub fn set(&self, chat_id: &str, tool: &str, decision: ApprovalDecision) -> bool {
        if chat_id.is_empty() || tool.is_empty() {
            return false;
        }
        self.entries.insert(
            cache_key(chat_id, tool),
            Entry {
                decision,
                timestamp: chrono::Utc::now(),
            },
        );
        true
    }

    pub fn get(&self, chat_id: &str, tool: &str) -> Option<ApprovalDecision> {
        if chat_id.is_empty() || tool.is_empty() {
            return None;
        }
        self.entries.get(&cache_key(chat_id, tool)).map(|e| e.decision)
    }

    /// Clears every decision scoped to one chat. Called when a chat ends.
    pub fn clear(&self, chat_id: &str) {
        let prefix = format!("{chat_id}\0");
        self.entries.retain(|k, _| !k.starts_with(&prefix));
    }

    pub fn clear_all(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: a session-scoped approval is cleared by chat and never
    /// leaks into a sibling chat.
    #[test]
    fn session_scope_is_cleared_by_chat_and_isolated() {
        let cache = ApprovalCache::new();
        assert!(cache.set("chat-1", "shell", ApprovalDecision::Approve));
        cache.set("chat-2", "shell", ApprovalDecision::Deny);

        assert_eq!(cache.get("chat-1", "shell"), Some(ApprovalDecision::Approve));
        assert_eq!(cache.get("chat-2", "shell"), Some(ApprovalDecision::Deny));

        cache.clear("chat-1");
        assert_eq!(cache.get("chat-1", "shell"), None);
        assert_eq!(cache.get("chat-2", "shell"), Some(ApprovalDecision::Deny));
    }

    #[test]
    fn empty_chat_or_tool_is_rejected() {
        let cache = ApprovalCache::new();
        assert!(!cache.set("", "shell", ApprovalDecision::Approve));
        assert!(!cache.set("chat-1", "", ApprovalDecision::Approve));
        assert_eq!(cache.get("", "shell"), None);
    }
}
