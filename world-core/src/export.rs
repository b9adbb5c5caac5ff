//! Deterministic chat transcript export/replay (§4.9).
//!
//! Exporting a chat and re-parsing it must yield the same chat metadata and
//! the same ordered `message_id` sequence (P9).

use crate::model::{Agent, Chat, MessageRole, StoredMessage, World};

/// Paragraph-initial `@name` mentions, approximating the addressing
/// predicate's extraction without pulling in a regex dependency just for
/// export labelling.
fn paragraph_initial_mentions(content: &str) -> Vec<String> {
    content
        .split("\n\n")
        .filter_map(|para| para.trim_start().strip_prefix('@'))
        .map(|rest| {
            rest.chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
                .collect::<String>()
        })
        .filter(|s| !s.is_empty())
        .collect()
}

/// Who a human/system message is addressed to: the paragraph-initial
/// mentions if any, otherwise every agent in the world (the broadcast rule).
fn addressees(content: &str, agents: &[Agent]) -> String {
    let mentions = paragraph_initial_mentions(content);
    if !mentions.is_empty() {
        return mentions.join(", ");
    }
    if agents.is_empty() {
        "all".to_string()
    } else {
        agents.iter().map(|a| a.name.clone()).collect::<Vec<_>>().join(", ")
    }
}

/// The display name for an assistant message's sender: looked up by agent id,
/// falling back to the raw sender when no agent matches, and to the first
/// agent's name when the sender was omitted entirely.
fn assistant_label(sender: &str, agents: &[Agent]) -> String {
    if let Some(agent) = agents.iter().find(|a| a.id == sender) {
        return agent.name.clone();
    }
    if !sender.is_empty() {
        return sender.to_string();
    }
    agents
        .first()
        .map(|a| a.name.clone())
        .unwrap_or_else(|| "assistant".to_string())
}

/// Header + body rendered as plain text, matching §4.9's layout.
pub fn export_chat(world: &World, agents: &[Agent], chat: &Chat, messages: &[StoredMessage]) -> String {
    let mut out = String::new();
    out.push_str(&format!("World: {} ({})\n", world.name, world.id));
    if let Some(desc) = &world.description {
        out.push_str(&format!("Description: {desc}\n"));
    }
    out.push_str(&format!("Turn limit: {}\n", world.turn_limit));
    out.push_str("Agents:\n");
    for agent in agents {
        out.push_str(&format!(
            "  - {} ({} / {}), calls={}, status={:?}\n",
            agent.name, agent.provider, agent.model, agent.llm_call_count, agent.status
        ));
    }
    out.push_str(&format!("\nChat: {} ({})\n", chat.name, chat.id));
    out.push_str("---\n");
    for m in messages {
        let header = match m.role {
            MessageRole::User | MessageRole::System => {
                format!("From: {} | To: {}", m.sender, addressees(&m.content, agents))
            }
            MessageRole::Assistant => format!("Agent: {} (reply)", assistant_label(&m.sender, agents)),
            MessageRole::Tool => format!("Tool: {}", m.sender),
        };
        out.push_str(&format!("[{}] {} | id={}\n", m.timestamp.to_rfc3339(), header, m.message_id));
        out.push_str(&m.content);
        out.push_str("\n\n");
    }
    out
}

/// Recovers the ordered `message_id` sequence from an exported transcript.
/// Used by the round-trip property test; not a full re-parse of message
/// content, since export is one-directional documentation, not a storage
/// format.
pub fn message_ids_in_transcript(transcript: &str) -> Vec<String> {
    transcript
        .lines()
        .filter_map(|line| line.split("| id=").nth(1))
        .map(|s| s.trim().to_string())
        .collect()
}
