//! Mention-based addressing (§4.5.1) and auto-mention on agent hand-off (§4.5.2).

use once_cell::sync::Lazy;
use regex::Regex;
use world_core::SENDER_HUMAN;

/// Matches `@name` at the start of a paragraph (message start, or right after
/// a blank line). Names are `[a-zA-Z0-9_-]+`.
static PARAGRAPH_MENTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)(?:\A|\n\s*\n)\s*@([a-zA-Z0-9_\-]+)").unwrap());

/// Extracts every paragraph-initial `@name` mention from `content`, lowercased.
pub fn extract_mentions(content: &str) -> Vec<String> {
    PARAGRAPH_MENTION
        .captures_iter(content)
        .map(|c| c[1].to_lowercase())
        .collect()
}

/// The addressing predicate (§4.5.1): does `agent_id` respond to a message
/// from `sender` with this `content`?
pub fn should_respond(agent_id: &str, sender: &str, content: &str) -> bool {
    if sender.eq_ignore_ascii_case(agent_id) {
        return false;
    }
    let mentions = extract_mentions(content);
    let mentions_someone_else: Vec<&String> = mentions
        .iter()
        .filter(|m| !m.eq_ignore_ascii_case(agent_id))
        .collect();

    if mentions.is_empty() {
        return sender == SENDER_HUMAN || sender == "SYSTEM";
    }
    if mentions.iter().any(|m| m.eq_ignore_ascii_case(agent_id)) {
        return true;
    }
    // Mentions exist but none of them are this agent: never respond, even if
    // the sender is HUMAN/SYSTEM.
    let _ = mentions_someone_else;
    false
}

/// Prefixes `content` with `@sender` on hand-off, unless it already begins
/// (paragraph-initially) with that mention.
pub fn with_auto_mention(content: &str, replying_to_agent: &str) -> String {
    let already = extract_mentions(content)
        .first()
        .map(|m| m.eq_ignore_ascii_case(replying_to_agent))
        .unwrap_or(false);
    if already {
        content.to_string()
    } else {
        format!("@{replying_to_agent} {content}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: broadcast from HUMAN with no mentions elicits every agent.
    #[test]
    fn broadcast_with_no_mentions_is_addressed_to_everyone() {
        assert!(should_respond("a1", "HUMAN", "Hello team!"));
        assert!(should_respond("a2", "HUMAN", "Hello team!"));
    }

    /// **Scenario**: a paragraph-initial mention addresses only that agent.
    #[test]
    fn paragraph_initial_mention_addresses_only_that_agent() {
        assert!(should_respond("a1", "HUMAN", "@a1 Please summarize."));
        assert!(!should_respond("a2", "HUMAN", "@a1 Please summarize."));
    }

    /// **Scenario**: a mid-paragraph mention addresses no one.
    #[test]
    fn mid_paragraph_mention_addresses_no_one() {
        let content = "Great work -- let's loop in @a3 later.";
        assert!(!should_respond("a3", "HUMAN", content));
        assert!(!should_respond("a1", "HUMAN", content));
    }

    /// **Scenario**: a second paragraph starting with a mention addresses that agent.
    #[test]
    fn mention_in_second_paragraph_is_paragraph_initial() {
        let content = "Status update.\n\n@a2 React please.";
        assert!(should_respond("a2", "HUMAN", content));
        assert!(!should_respond("a1", "HUMAN", content));
    }

    /// **Scenario**: an agent never responds to its own message.
    #[test]
    fn self_sender_never_responds() {
        assert!(!should_respond("a1", "a1", "@a1 talking to myself"));
    }

    /// **Scenario**: auto-mention is added on hand-off unless already present.
    #[test]
    fn auto_mention_added_unless_already_present() {
        assert_eq!(with_auto_mention("thanks!", "a1"), "@a1 thanks!");
        assert_eq!(
            with_auto_mention("@a1 got it, thanks", "a1"),
            "@a1 got it, thanks"
        );
    }
}
